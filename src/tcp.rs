use std::io;

pub mod connection;
pub mod sequence;
pub mod state;

/// Sink for outbound IPv4 frames. Every segment the stack emits goes
/// through this; the packet loop hands it the real TUN device.
pub trait Nic {
    fn send_frame(&self, frame: &[u8]) -> io::Result<usize>;
}

impl Nic for tun_tap::Iface {
    fn send_frame(&self, frame: &[u8]) -> io::Result<usize> {
        self.send(frame)
    }
}
