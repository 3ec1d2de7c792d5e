//      1         2          3          4
// ----------|----------|----------|----------
//        SND.UNA    SND.NXT    SND.LAST
//
// 1 - old sequence numbers which have been acknowledged
// 2 - sequence numbers of data sent but not yet acknowledged
// 3 - sequence numbers of data buffered but not yet sent
// 4 - future sequence numbers, not yet handed to the engine
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct SendSpace {
    /// Initial send sequence number
    pub iss: u32,
    /// Oldest unacknowledged sequence number
    pub una: u32,
    /// Next sequence number to be sent
    pub nxt: u32,
    /// One past the last sequence number handed to the engine, counting a
    /// pending FIN
    pub last: u32,
    /// The peer-advertised window. Advisory; never enforced.
    pub wnd: u32,
    /// Congestion window in bytes. Grows by one MTU per accepted
    /// acknowledgement, capped at the send buffer limit.
    pub cwnd: u32,
}
