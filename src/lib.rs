//! A user-space TCP implementation served over a TUN device.
//!
//! One thread per interface owns the device and terminates the protocol;
//! application threads get a blocking listen/accept/read/write surface
//! and meet the packet loop on a single manager mutex.

use std::collections::{hash_map, HashMap, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use etherparse::{IpNumber, Ipv4HeaderSlice, TcpHeaderSlice};
use log::{debug, error, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

mod err;
mod tcp;

pub use err::Error;

use tcp::connection::{Connection, Quad};
use tcp::state::{Available, State};

/// Upper bound on one frame read off the TUN device.
const BUFFER_SIZE: usize = 1024;
/// Poll budget for the TUN fd; a timeout drives every connection's tick.
const TICK_MS: u8 = 10;

type InterfaceHandle = Arc<InterfaceManager>;

#[derive(Default)]
struct InterfaceManager {
    manager: Mutex<ConnectionManager>,
    pending_var: Condvar,
    receive_var: Condvar,
    /// One-way shutdown flag; set on interface drop, checked by the
    /// packet loop and by every blocked waiter.
    done: AtomicBool,
}

/// The demux tables shared by the packet loop and the façade, always
/// accessed under the interface mutex.
#[derive(Default)]
pub struct ConnectionManager {
    /// Listener backlog: one FIFO of quads per bound port.
    pending: HashMap<u16, VecDeque<Quad>>,
    /// Active flows keyed by their four-tuple.
    connections: HashMap<Quad, Connection>,
}

fn packet_loop(nic: tun_tap::Iface, ih: InterfaceHandle) -> io::Result<()> {
    let mut buf = [0u8; BUFFER_SIZE];

    while !ih.done.load(Ordering::Acquire) {
        let fd = unsafe { BorrowedFd::borrow_raw(nic.as_raw_fd()) };
        let mut pfd = [PollFd::new(fd, PollFlags::POLLIN)];
        let n = poll(&mut pfd[..], PollTimeout::from(TICK_MS)).map_err(io::Error::from)?;
        if n == 0 {
            // quiet interface: give every connection its timer tick
            let mut cm_guard = ih.manager.lock().unwrap();
            let cm = &mut *cm_guard;
            for (quad, conn) in cm.connections.iter_mut() {
                if let Err(e) = conn.on_tick(&nic) {
                    warn!("tick failed for {:?}: {}", quad, e);
                }
            }
            continue;
        }

        let nbytes = nic.recv(&mut buf[..])?;
        let version = buf[0] >> 4;
        if version != 4 {
            continue; // ignore non-ipv4
        }
        let ip = match Ipv4HeaderSlice::from_slice(&buf[..nbytes]) {
            Ok(ip) => ip,
            Err(e) => {
                debug!("ignoring malformed ip frame, len {}: {}", nbytes, e);
                continue;
            }
        };
        if ip.protocol() != IpNumber::TCP {
            continue; // ignore non-tcp
        }
        let ip_len = ip.slice().len();
        let tcp = match TcpHeaderSlice::from_slice(&buf[ip_len..nbytes]) {
            Ok(tcp) => tcp,
            Err(e) => {
                debug!("ignoring malformed tcp segment, len {}: {}", nbytes, e);
                continue;
            }
        };
        let data_off = ip_len + tcp.slice().len();
        let data = &buf[data_off..nbytes];

        let quad = Quad {
            src: (ip.source_addr(), tcp.source_port()),
            dst: (ip.destination_addr(), tcp.destination_port()),
        };

        let mut cm_guard = ih.manager.lock().unwrap();
        // borrow the manager itself, not the guard, so both tables split
        let cm = &mut *cm_guard;

        match cm.connections.entry(quad) {
            hash_map::Entry::Occupied(mut entry) => {
                match entry.get_mut().on_packet(&nic, ip, tcp, data) {
                    Ok(avail) => {
                        drop(cm_guard);
                        if avail.contains(Available::READ) {
                            ih.receive_var.notify_all();
                        }
                    }
                    Err(e) => {
                        warn!("error processing segment for {:?}: {}", quad, e);
                    }
                }
            }
            hash_map::Entry::Vacant(entry) => {
                if let Some(backlog) = cm.pending.get_mut(&quad.dst.1) {
                    match Connection::accept(&nic, ip, tcp, data) {
                        Ok(c) => {
                            entry.insert(c);
                            backlog.push_back(quad);
                            // release so the woken thread can take the lock
                            drop(cm_guard);
                            ih.pending_var.notify_all();
                        }
                        Err(e) => debug!("dropping segment for {:?}: {}", quad, e),
                    }
                }
            }
        }
    }

    Ok(())
}

/// Handle on one TUN-backed interface: owns the packet-loop thread and
/// hands out listeners.
pub struct Interface {
    ih: Option<InterfaceHandle>,
    jh: Option<thread::JoinHandle<io::Result<()>>>,
}

impl Interface {
    /// Open the named TUN device (IFF_TUN | IFF_NO_PI) and start serving
    /// it.
    pub fn new(ifname: &str) -> Result<Self, Error> {
        let nic = tun_tap::Iface::without_packet_info(ifname, tun_tap::Mode::Tun)?;
        let ih: InterfaceHandle = Arc::default();

        let jh = {
            let ih = ih.clone();
            Some(thread::spawn(move || packet_loop(nic, ih)))
        };

        Ok(Interface { ih: Some(ih), jh })
    }

    /// Start accepting connections on `port`.
    pub fn bind(&mut self, port: u16) -> Result<TcpListener, Error> {
        let ih = self.ih.as_mut().unwrap();
        let mut cm = ih.manager.lock().unwrap();
        match cm.pending.entry(port) {
            hash_map::Entry::Vacant(v) => {
                v.insert(VecDeque::new());
            }
            hash_map::Entry::Occupied(_) => {
                return Err(Error::PortInUse(port));
            }
        }
        drop(cm);
        Ok(TcpListener {
            ih: ih.clone(),
            port,
        })
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        if let Some(ih) = self.ih.take() {
            ih.done.store(true, Ordering::Release);
            // wake everyone blocked in accept or read so they can see it
            ih.pending_var.notify_all();
            ih.receive_var.notify_all();
        }
        if let Some(jh) = self.jh.take() {
            match jh.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("packet loop died: {}", e),
                Err(_) => error!("packet loop panicked"),
            }
        }
    }
}

pub struct TcpListener {
    ih: InterfaceHandle,
    port: u16,
}

impl TcpListener {
    /// Block until a handshake has been initiated on our port.
    pub fn accept(&mut self) -> io::Result<TcpStream> {
        let mut cm = self.ih.manager.lock().unwrap();
        loop {
            if self.ih.done.load(Ordering::Acquire) {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "interface shut down",
                ));
            }
            if let Some(quad) = cm
                .pending
                .get_mut(&self.port)
                .expect("port closed while listener is active")
                .pop_front()
            {
                return Ok(TcpStream {
                    ih: self.ih.clone(),
                    quad,
                });
            }
            cm = self.ih.pending_var.wait(cm).unwrap();
        }
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let mut cm = self.ih.manager.lock().unwrap();
        if let Some(backlog) = cm.pending.remove(&self.port) {
            for quad in backlog {
                warn!("dropping pending connection {:?}", quad);
            }
        }
    }
}

pub struct TcpStream {
    ih: InterfaceHandle,
    quad: Quad,
}

impl io::Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut cm = self.ih.manager.lock().unwrap();
        loop {
            if self.ih.done.load(Ordering::Acquire) {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "interface shut down",
                ));
            }
            let conn = cm
                .connections
                .get_mut(&self.quad)
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))?;

            if conn.is_recv_closed() && conn.incoming.is_empty() {
                // orderly close, nothing more is coming
                return Ok(0);
            }

            if !conn.incoming.is_empty() {
                let (head, tail) = conn.incoming.as_slices();
                let hread = std::cmp::min(buf.len(), head.len());
                buf[..hread].copy_from_slice(&head[..hread]);
                let tread = std::cmp::min(buf.len() - hread, tail.len());
                buf[hread..hread + tread].copy_from_slice(&tail[..tread]);
                let nread = hread + tread;
                drop(conn.incoming.drain(..nread));
                return Ok(nread);
            }

            cm = self.ih.receive_var.wait(cm).unwrap();
        }
    }
}

impl io::Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut cm = self.ih.manager.lock().unwrap();

        let conn = cm
            .connections
            .get_mut(&self.quad)
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))?;

        // queue everything; the next tick pushes it out
        conn.unacked.extend(buf.iter());
        if let State::Established | State::Write = conn.state {
            conn.state = State::Write;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut cm = self.ih.manager.lock().unwrap();

        let conn = cm
            .connections
            .get_mut(&self.quad)
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))?;

        if conn.unacked.is_empty() {
            Ok(())
        } else {
            // there is no flush condvar; callers must retry
            Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "unacknowledged bytes outstanding",
            ))
        }
    }
}

impl TcpStream {
    /// Shut down the write side; a FIN is folded into a later tick.
    pub fn shutdown(&self, _how: std::net::Shutdown) -> io::Result<()> {
        let mut cm = self.ih.manager.lock().unwrap();
        let conn = cm
            .connections
            .get_mut(&self.quad)
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))?;
        conn.close()
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        let mut cm = self.ih.manager.lock().unwrap();
        if let Some(conn) = cm.connections.get_mut(&self.quad) {
            let _ = conn.close();
        }
    }
}
