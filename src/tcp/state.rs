use bitflags::bitflags;

bitflags! {
    /// What a processed segment made available to blocked callers; the
    /// packet loop translates these into condition-variable signals.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Available: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// A connection progresses through a series of states during its lifetime.
/// This stack serves passive opens only, so the set is the server-side
/// slice of the RFC 793 diagram. Briefly, the meanings of the states are:
///
/// - `SynReceived`: Represents waiting for a confirming connection
///   request acknowledgment after having both received and sent a
///   connection request.
///
/// - `Established`: Represents an open connection, data received can be
///   delivered to the user. The normal state for the data transfer phase
///   of the connection.
///
/// - `Write`: Established with bytes queued by the application; the next
///   tick pushes them out and falls back to `Established`.
///
/// - `FinWait1`: Represents waiting for an acknowledgment of the
///   connection termination request previously sent.
///
/// - `FinWait2`: Represents waiting for a connection termination request
///   from the remote TCP.
///
/// - `TimeWait`: The remote side has terminated; the connection lingers
///   only to acknowledge what the peer may retransmit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum State {
    #[default]
    SynReceived,
    Established,
    Write,
    FinWait1,
    FinWait2,
    TimeWait,
}
