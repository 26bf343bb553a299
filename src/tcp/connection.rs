use etherparse::{IpNumber, Ipv4Header, Ipv4HeaderSlice, TcpHeader, TcpHeaderSlice};
use log::debug;
use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use std::{io, io::Write, time};

use super::sequence::{is_between_wrapped, segment_acceptable, wrapping_lt};
use super::sequence::{ReceiveSequenceSpace, SendSequenceSpace};
use super::state::{Available, State};
use super::Nic;

/// Scratch space for one outgoing frame.
const MTU: usize = 1500;
const TTL: u8 = 64;
/// Deterministic initial send sequence number. Predictable on purpose:
/// this stack only ever talks across a local TUN device.
const ISS: u32 = 0;
/// Fixed advertised receive window.
const WINDOW_SIZE: u16 = 1024;
/// Identification carried by every emitted IPv4 header.
const IP_ID: u16 = 12345;
/// Capacity of the in-order receive ring; overflow bytes are dropped and
/// left to the peer's retransmission.
const INCOMING_CAPACITY: usize = 1024;
/// Capacity hint for the retransmit ring.
const UNACKED_CAPACITY: usize = 1024;

/// The four-tuple identifying a flow, ports in host byte order. `src` is
/// the remote end as it appears in an inbound segment.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct Quad {
    pub src: (Ipv4Addr, u16),
    pub dst: (Ipv4Addr, u16),
}

#[derive(Debug)]
struct Timers {
    /// segment sequence number and when it was sent
    send_times: BTreeMap<u32, time::Instant>,
    /// smoothed round trip time, in seconds
    srtt: f64,
}

impl Timers {
    fn new() -> Self {
        Self {
            send_times: BTreeMap::default(),
            srtt: time::Duration::from_secs(60).as_secs_f64(),
        }
    }
}

/// One active flow: the RFC 793 state machine, its two sequence spaces,
/// the buffered octets in both directions, and the header templates every
/// emitted segment is stamped from.
#[derive(Debug)]
pub struct Connection {
    pub(crate) state: State,
    send: SendSequenceSpace,
    receive: ReceiveSequenceSpace,
    timers: Timers,
    ip: Ipv4Header,
    tcp: TcpHeader,
    /// In-order received payload awaiting an application `read`.
    pub(crate) incoming: VecDeque<u8>,
    /// Sent-or-pending bytes not yet acknowledged; the front corresponds
    /// to sequence number `send.una`.
    pub(crate) unacked: VecDeque<u8>,
    closed: bool,
    closed_at: Option<u32>,
}

impl Connection {
    /// Any state after the peer's FIN has been taken.
    pub(crate) fn is_recv_closed(&self) -> bool {
        matches!(self.state, State::TimeWait)
    }

    /// What this connection currently offers to blocked callers; the
    /// packet loop converts it into condvar signals.
    fn availability(&self) -> Available {
        let mut avail = Available::empty();
        if self.is_recv_closed() || !self.incoming.is_empty() {
            avail |= Available::READ;
        }
        avail
    }

    /// Passive open: react to a SYN on a bound port with a SYN|ACK and a
    /// fresh connection in SynReceived.
    pub fn accept(
        nic: &impl Nic,
        ip: Ipv4HeaderSlice,
        tcp: TcpHeaderSlice,
        _data: &[u8],
    ) -> io::Result<Self> {
        if !tcp.syn() {
            // only a SYN may open a passive connection
            return Err(io::Error::new(io::ErrorKind::InvalidData, "expected SYN"));
        }
        debug!(
            "accepting {}:{} -> {}:{}",
            ip.source_addr(),
            tcp.source_port(),
            ip.destination_addr(),
            tcp.destination_port(),
        );

        let receive = ReceiveSequenceSpace {
            irs: tcp.sequence_number(),
            nxt: tcp.sequence_number().wrapping_add(1),
            wnd: tcp.window_size(),
            urgent: 0,
        };
        let send = SendSequenceSpace {
            iss: ISS,
            una: ISS,
            nxt: ISS,
            wnd: WINDOW_SIZE,
            urgent: 0,
            wl1: 0,
            wl2: 0,
        };

        // response templates: ports flipped, our address as the source
        let mut resp_tcp = TcpHeader::new(
            tcp.destination_port(),
            tcp.source_port(),
            send.iss,
            send.wnd,
        );
        resp_tcp.syn = true;
        resp_tcp.ack = true;

        let mut resp_ip = Ipv4Header::new(
            resp_tcp.header_len() as u16,
            TTL,
            IpNumber::TCP,
            ip.destination_addr().octets(),
            ip.source_addr().octets(),
        )
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        resp_ip.identification = IP_ID;
        resp_ip.dont_fragment = true;

        let mut conn = Connection {
            state: State::SynReceived,
            send,
            receive,
            timers: Timers::new(),
            ip: resp_ip,
            tcp: resp_tcp,
            incoming: VecDeque::with_capacity(INCOMING_CAPACITY),
            unacked: VecDeque::with_capacity(UNACKED_CAPACITY),
            closed: false,
            closed_at: None,
        };
        conn.write(nic, conn.send.nxt, 0)?;
        Ok(conn)
    }

    /// Build and emit one segment carrying at most `limit` payload bytes
    /// drawn from the retransmit ring starting at sequence number `seq`.
    fn write(&mut self, nic: &impl Nic, seq: u32, mut limit: usize) -> io::Result<usize> {
        let mut buf = [0u8; MTU];
        self.tcp.sequence_number = seq;
        self.tcp.acknowledgment_number = self.receive.nxt;

        let mut offset = seq.wrapping_sub(self.send.una) as usize;
        // the virtual SYN and FIN bytes are not in the ring; asked to send
        // from beyond our FIN there is nothing left to read
        if let Some(closed_at) = self.closed_at {
            if seq == closed_at.wrapping_add(1) {
                offset = 0;
                limit = 0;
            }
        }

        let (mut head, mut tail) = self.unacked.as_slices();
        if head.len() >= offset {
            head = &head[offset..];
        } else {
            let skipped = head.len();
            head = &[];
            tail = &tail[(offset - skipped)..];
        }
        let max_data = std::cmp::min(limit, head.len() + tail.len());

        self.ip
            .set_payload_len(self.tcp.header_len() as usize + max_data)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        let buf_len = buf.len();
        let mut unwritten = &mut buf[..];
        self.ip.write(&mut unwritten)?;
        let ip_header_ends_at = buf_len - unwritten.len();

        // the TCP header is laid down last; its checksum needs the payload
        // already in place
        let tcp_header_ends_at = ip_header_ends_at + self.tcp.header_len() as usize;

        let payload_bytes = {
            let mut written = 0;
            let mut limit = max_data;
            let mut payload = &mut buf[tcp_header_ends_at..];

            // write as much as we can from the ring's head slice
            let p1 = std::cmp::min(limit, head.len());
            written += payload.write(&head[..p1])?;
            limit -= p1;

            // then more from the tail slice
            let p2 = std::cmp::min(limit, tail.len());
            written += payload.write(&tail[..p2])?;
            written
        };
        let payload_ends_at = tcp_header_ends_at + payload_bytes;

        self.tcp.checksum = self
            .tcp
            .calc_checksum_ipv4(&self.ip, &buf[tcp_header_ends_at..payload_ends_at])
            .expect("failed to compute checksum");

        let mut tcp_header_buf = &mut buf[ip_header_ends_at..tcp_header_ends_at];
        self.tcp.write(&mut tcp_header_buf)?;

        // advance the send space over payload plus any virtual bytes; the
        // one-shot flags come off the template once counted
        let mut next_seq = seq.wrapping_add(payload_bytes as u32);
        if self.tcp.syn {
            next_seq = next_seq.wrapping_add(1);
            self.tcp.syn = false;
        }
        if self.tcp.fin {
            next_seq = next_seq.wrapping_add(1);
            self.tcp.fin = false;
        }
        self.tcp.psh = false;
        if wrapping_lt(self.send.nxt, next_seq) {
            self.send.nxt = next_seq;
        }
        self.timers.send_times.insert(seq, time::Instant::now());

        nic.send_frame(&buf[..payload_ends_at])?;
        Ok(payload_bytes)
    }

    pub fn on_packet(
        &mut self,
        nic: &impl Nic,
        _ip: Ipv4HeaderSlice,
        tcp: TcpHeaderSlice,
        data: &[u8],
    ) -> io::Result<Available> {
        let seqn = tcp.sequence_number();
        let mut slen = data.len() as u32;
        if tcp.syn() {
            slen += 1;
        }
        if tcp.fin() {
            slen += 1;
        }

        // RFC 793 S3.3: the segment must overlap the receive window;
        // anything else is answered with <SEQ=SND.NXT><ACK=RCV.NXT><CTL=ACK>
        if !segment_acceptable(self.receive.nxt, self.receive.wnd, seqn, slen) {
            debug!("dropping out-of-window segment seq={} slen={}", seqn, slen);
            self.write(nic, self.send.nxt, 0)?;
            return Ok(self.availability());
        }

        if !tcp.ack() {
            if tcp.syn() {
                // SYN as part of the initial handshake
                self.receive.nxt = seqn.wrapping_add(1);
            }
            return Ok(self.availability());
        }
        let ackn = tcp.acknowledgment_number();

        if let State::SynReceived = self.state {
            // the peer must have ACKed our SYN, since we detected at least
            // one acked byte and the SYN is the only byte we have sent
            if is_between_wrapped(
                self.send.una.wrapping_sub(1),
                ackn,
                self.send.nxt.wrapping_add(1),
            ) {
                self.state = State::Established;
            }
        }

        if let State::Established | State::Write | State::FinWait1 | State::FinWait2 = self.state {
            // Acceptable ACK: SND.UNA < SEG.ACK =< SND.NXT
            if is_between_wrapped(self.send.una, ackn, self.send.nxt.wrapping_add(1)) {
                // retire everything the ACK covers from the retransmit ring
                if !self.unacked.is_empty() {
                    let data_start = if self.send.una == self.send.iss {
                        // send.una has not yet been moved past our SYN, so
                        // ring data starts one past it
                        self.send.una.wrapping_add(1)
                    } else {
                        self.send.una
                    };
                    let acked_data_end =
                        std::cmp::min(ackn.wrapping_sub(data_start) as usize, self.unacked.len());
                    self.unacked.drain(..acked_data_end);

                    let una = self.send.una;
                    let Timers { send_times, srtt } = &mut self.timers;
                    send_times.retain(|seq, sent| {
                        if is_between_wrapped(una, *seq, ackn) {
                            *srtt = 0.8 * *srtt + (1.0 - 0.8) * sent.elapsed().as_secs_f64();
                            false
                        } else {
                            true
                        }
                    });
                }

                self.send.una = ackn;
            }
        }

        if let State::FinWait1 = self.state {
            if let Some(closed_at) = self.closed_at {
                if self.send.una == closed_at.wrapping_add(1) {
                    // our FIN has been acknowledged
                    self.state = State::FinWait2;
                }
            }
        }

        if !data.is_empty() {
            if let State::Established | State::Write | State::FinWait1 | State::FinWait2 =
                self.state
            {
                let mut unread_data_at = self.receive.nxt.wrapping_sub(seqn) as usize;
                if unread_data_at > data.len() {
                    // we must have received a re-transmitted FIN that we
                    // have already seen: nxt points one past it, but the
                    // FIN is not in data
                    debug_assert_eq!(unread_data_at, data.len() + 1);
                    unread_data_at = 0;
                }
                let room = INCOMING_CAPACITY.saturating_sub(self.incoming.len());
                let fresh = data.len() - unread_data_at;
                if room < fresh {
                    debug!("receive ring full, dropping {} bytes", fresh - room);
                }
                self.incoming.extend(data[unread_data_at..].iter().take(room));

                // Once the TCP takes responsibility for the data it
                // advances RCV.NXT over the data accepted.
                self.receive.nxt = seqn.wrapping_add(data.len() as u32);

                // <SEQ=SND.NXT><ACK=RCV.NXT><CTL=ACK>
                self.write(nic, self.send.nxt, 0)?;
            }
        }

        if tcp.fin() {
            // a peer FIN is honoured in any post-handshake state
            self.tcp.fin = true;
            self.receive.nxt = self.receive.nxt.wrapping_add(1);
            self.write(nic, self.send.nxt, 0)?;
            self.state = State::TimeWait;
        }

        Ok(self.availability())
    }

    /// Per-tick transmission decision: keep the peer acknowledged after
    /// shutdown, retransmit when the oldest in-flight segment has aged
    /// out, or push freshly queued application bytes.
    pub fn on_tick(&mut self, nic: &impl Nic) -> io::Result<()> {
        if let State::FinWait2 | State::TimeWait = self.state {
            // our write side is shut down and acknowledged; nothing to
            // (re)transmit, just keep the peer's view of RCV.NXT current
            self.write(nic, self.send.una, 0)?;
            return Ok(());
        }

        // in-flight sequence distance, and ring bytes never sent at all;
        // the virtual SYN can make the former outrun the ring
        let nunacked_data = self
            .closed_at
            .unwrap_or(self.send.nxt)
            .wrapping_sub(self.send.una);
        let nunsent_data = (self.unacked.len() as u32).saturating_sub(nunacked_data);

        let waited_for = self
            .timers
            .send_times
            .range(self.send.una..)
            .next()
            .map(|t| t.1.elapsed());

        let should_retransmit = if let Some(waited_for) = waited_for {
            waited_for > time::Duration::from_secs(1)
                && waited_for.as_secs_f64() > 1.5 * self.timers.srtt
        } else {
            false
        };

        if should_retransmit {
            let resend = std::cmp::min(self.unacked.len() as u32, self.send.wnd as u32);
            if resend < self.send.wnd as u32 && self.closed {
                // the window leaves room for our FIN to ride along
                self.tcp.fin = true;
                self.closed_at = Some(self.send.una.wrapping_add(self.unacked.len() as u32));
            }
            self.write(nic, self.send.una, resend as usize)?;
        } else if let State::Write = self.state {
            // application bytes queued since the last tick
            self.tcp.psh = true;
            self.write(nic, self.send.nxt, nunsent_data as usize)?;
            self.state = State::Established;
        }

        Ok(())
    }

    /// Local shutdown of the write side; the FIN itself is folded into a
    /// later tick's emission.
    pub fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        match self.state {
            State::SynReceived | State::Established | State::Write => {
                self.state = State::FinWait1;
            }
            State::FinWait1 | State::FinWait2 => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "already closing",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::RefCell;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const LOCAL_PORT: u16 = 9000;
    const PEER_PORT: u16 = 43000;
    const PEER_WND: u16 = 64240;

    #[derive(Default)]
    struct FrameLog {
        frames: RefCell<Vec<Vec<u8>>>,
    }

    impl FrameLog {
        fn take(&self) -> Vec<Vec<u8>> {
            self.frames.borrow_mut().drain(..).collect()
        }
    }

    impl Nic for FrameLog {
        fn send_frame(&self, frame: &[u8]) -> io::Result<usize> {
            self.frames.borrow_mut().push(frame.to_vec());
            Ok(frame.len())
        }
    }

    /// Wire up a peer-to-us frame.
    fn peer_frame(seq: u32, ack: Option<u32>, syn: bool, fin: bool, payload: &[u8]) -> Vec<u8> {
        let mut tcph = TcpHeader::new(PEER_PORT, LOCAL_PORT, seq, PEER_WND);
        tcph.syn = syn;
        tcph.fin = fin;
        if let Some(ackn) = ack {
            tcph.ack = true;
            tcph.acknowledgment_number = ackn;
        }
        let iph = Ipv4Header::new(
            tcph.header_len() as u16 + payload.len() as u16,
            TTL,
            IpNumber::TCP,
            PEER.octets(),
            LOCAL.octets(),
        )
        .unwrap();
        tcph.checksum = tcph.calc_checksum_ipv4(&iph, payload).unwrap();
        let mut out = Vec::new();
        iph.write(&mut out).unwrap();
        tcph.write(&mut out).unwrap();
        out.extend_from_slice(payload);
        out
    }

    fn deliver(conn: &mut Connection, nic: &FrameLog, frame: &[u8]) -> Available {
        let iph = Ipv4HeaderSlice::from_slice(frame).unwrap();
        let tcph = TcpHeaderSlice::from_slice(&frame[iph.slice().len()..]).unwrap();
        let data_at = iph.slice().len() + tcph.slice().len();
        conn.on_packet(nic, iph, tcph, &frame[data_at..]).unwrap()
    }

    fn split(frame: &[u8]) -> (Ipv4HeaderSlice<'_>, TcpHeaderSlice<'_>, &[u8]) {
        let iph = Ipv4HeaderSlice::from_slice(frame).unwrap();
        let tcph = TcpHeaderSlice::from_slice(&frame[iph.slice().len()..]).unwrap();
        let data_at = iph.slice().len() + tcph.slice().len();
        (iph, tcph, &frame[data_at..])
    }

    /// One's-complement fold over pseudo-header plus TCP segment with the
    /// checksum field left in place; a correctly checksummed segment
    /// folds to zero.
    fn checksum_residue(frame: &[u8]) -> u16 {
        let iph = Ipv4HeaderSlice::from_slice(frame).unwrap();
        let segment = &frame[iph.slice().len()..];
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&iph.source());
        bytes.extend_from_slice(&iph.destination());
        bytes.push(0);
        bytes.push(6);
        bytes.extend_from_slice(&(segment.len() as u16).to_be_bytes());
        bytes.extend_from_slice(segment);
        if bytes.len() % 2 == 1 {
            bytes.push(0);
        }
        let mut sum: u32 = 0;
        for pair in bytes.chunks(2) {
            sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
        }
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }

    fn accept_syn(nic: &FrameLog) -> Connection {
        let syn = peer_frame(1000, None, true, false, b"");
        let (iph, tcph, data) = split(&syn);
        Connection::accept(nic, iph, tcph, data).unwrap()
    }

    fn established(nic: &FrameLog) -> Connection {
        let mut conn = accept_syn(nic);
        nic.take();
        deliver(&mut conn, nic, &peer_frame(1001, Some(1), false, false, b""));
        assert_eq!(conn.state, State::Established);
        conn
    }

    #[test]
    fn syn_gets_syn_ack() {
        let nic = FrameLog::default();
        let conn = accept_syn(&nic);
        assert_eq!(conn.state, State::SynReceived);

        let frames = nic.take();
        assert_eq!(frames.len(), 1);
        let (iph, tcph, data) = split(&frames[0]);
        assert_eq!(iph.source_addr(), LOCAL);
        assert_eq!(iph.destination_addr(), PEER);
        assert_eq!(iph.identification(), IP_ID);
        assert!(iph.dont_fragment());
        assert!(tcph.syn() && tcph.ack());
        assert_eq!(tcph.source_port(), LOCAL_PORT);
        assert_eq!(tcph.destination_port(), PEER_PORT);
        assert_eq!(tcph.sequence_number(), 0);
        assert_eq!(tcph.acknowledgment_number(), 1001);
        assert_eq!(tcph.window_size(), WINDOW_SIZE);
        assert!(data.is_empty());
        assert_eq!(checksum_residue(&frames[0]), 0);
    }

    #[test]
    fn handshake_ack_establishes() {
        let nic = FrameLog::default();
        let mut conn = accept_syn(&nic);
        nic.take();

        deliver(&mut conn, &nic, &peer_frame(1001, Some(1), false, false, b""));
        assert_eq!(conn.state, State::Established);
        assert_eq!(conn.send.una, 1);
        // a plain handshake ACK is not answered
        assert!(nic.take().is_empty());
    }

    #[test]
    fn in_order_payload_is_delivered_and_acked() {
        let nic = FrameLog::default();
        let mut conn = established(&nic);

        let avail = deliver(&mut conn, &nic, &peer_frame(1001, Some(1), false, false, b"hello"));
        assert!(avail.contains(Available::READ));
        assert_eq!(conn.incoming.iter().copied().collect::<Vec<_>>(), b"hello");
        assert_eq!(conn.receive.nxt, 1006);

        let frames = nic.take();
        assert_eq!(frames.len(), 1);
        let (_, tcph, data) = split(&frames[0]);
        assert!(tcph.ack() && !tcph.syn() && !tcph.fin());
        assert_eq!(tcph.sequence_number(), 1);
        assert_eq!(tcph.acknowledgment_number(), 1006);
        assert!(data.is_empty());
        assert_eq!(checksum_residue(&frames[0]), 0);
    }

    #[test]
    fn queued_bytes_flush_on_tick() {
        let nic = FrameLog::default();
        let mut conn = established(&nic);

        conn.unacked.extend(b"HI\n");
        conn.state = State::Write;
        conn.on_tick(&nic).unwrap();

        assert_eq!(conn.state, State::Established);
        assert_eq!(conn.send.nxt, 4);

        let frames = nic.take();
        assert_eq!(frames.len(), 1);
        let (_, tcph, data) = split(&frames[0]);
        assert!(tcph.psh() && tcph.ack());
        assert_eq!(tcph.sequence_number(), 1);
        assert_eq!(data, b"HI\n");
        assert_eq!(checksum_residue(&frames[0]), 0);

        // the bytes stay in the ring until the peer acknowledges them
        assert_eq!(conn.unacked.len(), 3);
    }

    #[test]
    fn ack_retires_unacked_and_updates_srtt() {
        let nic = FrameLog::default();
        let mut conn = established(&nic);

        conn.unacked.extend(b"HI\n");
        conn.state = State::Write;
        conn.on_tick(&nic).unwrap();
        conn.unacked.extend(b"YO\n");
        conn.state = State::Write;
        conn.on_tick(&nic).unwrap();
        nic.take();
        assert_eq!(conn.send.nxt, 7);

        deliver(&mut conn, &nic, &peer_frame(1001, Some(7), false, false, b""));
        assert_eq!(conn.send.una, 7);
        assert!(conn.unacked.is_empty());
        // the second segment (strictly past the old send.una) contributed
        // a sample far below the initial 60 s estimate
        assert!(conn.timers.srtt < 60.0);
        // quiescent: everything sent has been acknowledged
        assert_eq!(conn.send.nxt.wrapping_sub(conn.send.una) as usize, conn.unacked.len());
    }

    #[test]
    fn peer_fin_enters_time_wait() {
        let nic = FrameLog::default();
        let mut conn = established(&nic);
        deliver(&mut conn, &nic, &peer_frame(1001, Some(1), false, false, b"hello"));
        nic.take();

        let avail = deliver(&mut conn, &nic, &peer_frame(1006, Some(1), false, true, b""));
        assert_eq!(conn.state, State::TimeWait);
        assert!(conn.is_recv_closed());
        assert!(avail.contains(Available::READ));

        let frames = nic.take();
        assert_eq!(frames.len(), 1);
        let (_, tcph, _) = split(&frames[0]);
        assert!(tcph.fin() && tcph.ack());
        assert_eq!(tcph.sequence_number(), 1);
        assert_eq!(tcph.acknowledgment_number(), 1007);
        assert_eq!(checksum_residue(&frames[0]), 0);

        // ticks in TimeWait keep acknowledging without raising FIN again
        conn.on_tick(&nic).unwrap();
        let frames = nic.take();
        assert_eq!(frames.len(), 1);
        let (_, tcph, _) = split(&frames[0]);
        assert!(tcph.ack() && !tcph.fin());
        assert_eq!(tcph.sequence_number(), conn.send.una);
    }

    #[test]
    fn out_of_window_segment_gets_bare_ack() {
        let nic = FrameLog::default();
        let mut conn = established(&nic);
        deliver(&mut conn, &nic, &peer_frame(1001, Some(1), false, false, b"hello"));
        nic.take();

        deliver(&mut conn, &nic, &peer_frame(99999, Some(1), false, false, b""));
        assert_eq!(conn.state, State::Established);
        assert_eq!(conn.receive.nxt, 1006);

        let frames = nic.take();
        assert_eq!(frames.len(), 1);
        let (_, tcph, data) = split(&frames[0]);
        assert!(tcph.ack() && !tcph.syn() && !tcph.fin());
        assert_eq!(tcph.sequence_number(), 1);
        assert_eq!(tcph.acknowledgment_number(), 1006);
        assert!(data.is_empty());
    }

    #[test]
    fn duplicate_segment_is_not_redelivered() {
        let nic = FrameLog::default();
        let mut conn = established(&nic);
        deliver(&mut conn, &nic, &peer_frame(1001, Some(1), false, false, b"hello"));
        nic.take();

        // an exact duplicate falls entirely left of the window
        deliver(&mut conn, &nic, &peer_frame(1001, Some(1), false, false, b"hello"));
        assert_eq!(conn.incoming.len(), 5);
        assert_eq!(conn.receive.nxt, 1006);
        // but it is still acknowledged
        assert_eq!(nic.take().len(), 1);
    }

    #[test]
    fn overlapping_segment_delivers_only_new_bytes() {
        let nic = FrameLog::default();
        let mut conn = established(&nic);
        deliver(&mut conn, &nic, &peer_frame(1001, Some(1), false, false, b"hello"));
        nic.take();

        // first five bytes already taken, the rest is new
        deliver(&mut conn, &nic, &peer_frame(1001, Some(1), false, false, b"helloworld"));
        assert_eq!(
            conn.incoming.iter().copied().collect::<Vec<_>>(),
            b"helloworld"
        );
        assert_eq!(conn.receive.nxt, 1011);
    }

    #[test]
    fn receive_ring_caps_at_capacity() {
        let nic = FrameLog::default();
        let mut conn = established(&nic);

        let chunk = [0x5au8; 500];
        for i in 0..3u32 {
            let seq = 1001 + i * 500;
            deliver(&mut conn, &nic, &peer_frame(seq, Some(1), false, false, &chunk));
        }

        // the window keeps advancing even though the ring dropped overflow
        assert_eq!(conn.receive.nxt.wrapping_sub(conn.receive.irs), 1501);
        assert_eq!(conn.incoming.len(), INCOMING_CAPACITY);
    }

    #[test]
    fn aged_segment_is_retransmitted() {
        let nic = FrameLog::default();
        let mut conn = established(&nic);

        conn.unacked.extend(b"HI\n");
        conn.state = State::Write;
        conn.on_tick(&nic).unwrap();
        nic.take();

        // pretend the segment has been in flight well past the timeout
        conn.timers.srtt = 0.1;
        conn.timers
            .send_times
            .insert(1, time::Instant::now() - time::Duration::from_secs(5));
        conn.on_tick(&nic).unwrap();

        let frames = nic.take();
        assert_eq!(frames.len(), 1);
        let (_, tcph, data) = split(&frames[0]);
        assert_eq!(tcph.sequence_number(), 1);
        assert_eq!(data, b"HI\n");
    }

    #[test]
    fn local_close_sends_fin_and_ack_completes_it() {
        let nic = FrameLog::default();
        let mut conn = established(&nic);

        conn.close().unwrap();
        assert_eq!(conn.state, State::FinWait1);

        // the FIN rides on the retransmit path once the timer is due
        conn.timers.srtt = 0.1;
        conn.timers
            .send_times
            .insert(1, time::Instant::now() - time::Duration::from_secs(5));
        conn.on_tick(&nic).unwrap();

        let frames = nic.take();
        assert_eq!(frames.len(), 1);
        let (_, tcph, _) = split(&frames[0]);
        assert!(tcph.fin() && tcph.ack());
        assert_eq!(tcph.sequence_number(), 1);
        assert_eq!(conn.send.nxt, 2);

        deliver(&mut conn, &nic, &peer_frame(1001, Some(2), false, false, b""));
        assert_eq!(conn.state, State::FinWait2);
    }

    proptest! {
        // Encode, decode, re-encode: byte-identical headers.
        #[test]
        fn header_roundtrip(
            sport in any::<u16>(),
            dport in any::<u16>(),
            seq in any::<u32>(),
            ackn in any::<u32>(),
            wnd in any::<u16>(),
            flags in any::<[bool; 3]>(),
            payload in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut tcph = TcpHeader::new(sport, dport, seq, wnd);
            let [syn, fin, psh] = flags;
            tcph.syn = syn;
            tcph.fin = fin;
            tcph.psh = psh;
            tcph.ack = true;
            tcph.acknowledgment_number = ackn;
            let iph = Ipv4Header::new(
                tcph.header_len() as u16 + payload.len() as u16,
                TTL,
                IpNumber::TCP,
                PEER.octets(),
                LOCAL.octets(),
            )
            .unwrap();
            tcph.checksum = tcph.calc_checksum_ipv4(&iph, &payload).unwrap();

            let mut first = Vec::new();
            iph.write(&mut first).unwrap();
            tcph.write(&mut first).unwrap();
            first.extend_from_slice(&payload);

            prop_assert_eq!(checksum_residue(&first), 0);

            let (riph, rtcph, rdata) = split(&first);
            let mut second = Vec::new();
            riph.to_header().write(&mut second).unwrap();
            rtcph.to_header().write(&mut second).unwrap();
            second.extend_from_slice(rdata);
            prop_assert_eq!(first, second);
        }
    }
}
