use std::io::{Read, Write};
use std::thread;

use log::{error, info};

fn serve(stream: &mut tcptun::TcpStream) -> std::io::Result<()> {
    stream.write_all(b"hello from tcptun!\n")?;
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            info!("peer closed the connection");
            return Ok(());
        }
        // echo whatever came in
        stream.write_all(&buf[..n])?;
    }
}

fn main() -> Result<(), tcptun::Error> {
    env_logger::init();

    let ifname = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tun0".to_string());
    let mut iface = tcptun::Interface::new(&ifname)?;
    info!("serving on {}, port 9000", ifname);

    let mut listener = iface.bind(9000)?;
    loop {
        match listener.accept() {
            Ok(mut stream) => {
                thread::spawn(move || {
                    if let Err(e) = serve(&mut stream) {
                        error!("stream error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("accept failed: {}", e);
                return Ok(());
            }
        }
    }
}
