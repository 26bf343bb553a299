use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tun device error: {0}")]
    Io(#[from] io::Error),

    #[error("port {0} already in use")]
    PortInUse(u16),
}
