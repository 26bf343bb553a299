/// Send Sequence Space RFC 793 Section 3.2
///
/// Represents the sequence space for sending data.
///
/// Fields:
/// - `iss`: Initial send sequence number.
/// - `una`: The oldest unacknowledged sequence number.
/// - `nxt`: The next sequence number to be sent.
/// - `wnd`: The window size.
/// - `urgent`: Indicates whether urgent data is present.
/// - `wl1`: Sequence number used for the last window update.
/// - `wl2`: Acknowledgment number used for the last window update.
#[derive(Debug, Default)]
pub struct SendSequenceSpace {
    pub iss: u32,
    pub una: u32,
    pub nxt: u32,
    pub wnd: u16,
    pub urgent: u16,
    pub wl1: u32,
    pub wl2: u32,
}

/// Receive Sequence Space RFC 793 Section 3.2
///
/// Represents the sequence space for receiving data.
///
/// Fields:
/// - `irs`: Initial receive sequence number.
/// - `nxt`: The next expected sequence number to receive.
/// - `wnd`: The window size.
/// - `urgent`: Indicates whether urgent data is present.
#[derive(Debug, Default)]
pub struct ReceiveSequenceSpace {
    pub irs: u32,
    pub nxt: u32,
    pub wnd: u16,
    pub urgent: u16,
}

/// TCP half-domain comparison.
///
/// From RFC 1323:
///     TCP determines if a data segment is "old" or "new" by testing
///     whether its sequence number is within 2**31 bytes of the left edge
///     of the window, and if it is not, discarding the data as "old".  To
///     insure that new data is never mistakenly considered old and vice-
///     versa, the left edge of the sender's window has to be at most
///     2**31 away from the right edge of the receiver's window.
pub fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    lhs.wrapping_sub(rhs) > (1 << 31)
}

/// True iff `x` lies strictly between `start` and `end` on the sequence
/// ring, all arithmetic modulo 2**32.
pub fn is_between_wrapped(start: u32, x: u32, end: u32) -> bool {
    wrapping_lt(start, x) && wrapping_lt(x, end)
}

/// RFC 793 Section 3.3 acceptance test for an incoming segment.
///
/// `slen` is the segment's occupancy of the sequence space: payload length
/// plus one for SYN and one for FIN.
///
/// ```text
/// Segment Length  Receive Window  Test
/// 0               0               SEG.SEQ = RCV.NXT
/// 0               >0              RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
/// >0              0               not acceptable
/// >0              >0              RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
///                                 or RCV.NXT =< SEG.SEQ+SEG.LEN-1 < RCV.NXT+RCV.WND
/// ```
pub fn segment_acceptable(rcv_nxt: u32, rcv_wnd: u16, seqn: u32, slen: u32) -> bool {
    let wend = rcv_nxt.wrapping_add(rcv_wnd as u32);
    if slen == 0 {
        if rcv_wnd == 0 {
            seqn == rcv_nxt
        } else {
            is_between_wrapped(rcv_nxt.wrapping_sub(1), seqn, wend)
        }
    } else if rcv_wnd == 0 {
        false
    } else {
        is_between_wrapped(rcv_nxt.wrapping_sub(1), seqn, wend)
            || is_between_wrapped(
                rcv_nxt.wrapping_sub(1),
                seqn.wrapping_add(slen - 1),
                wend,
            )
    }
}
