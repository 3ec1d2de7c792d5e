//     1          2          3
// ----------|----------|----------
//        RCV.NXT    RCV.NXT
//                  +RCV.WND
//
// 1 - old sequence numbers which have been acknowledged
// 2 - sequence numbers allowed for new reception
// 3 - future sequence numbers which are not yet allowed
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct RecvSpace {
    /// Initial receive sequence number
    pub irs: u32,
    /// Next sequence number expected on an incoming segment. With the
    /// strict in-order receiver this is also the only acceptable one.
    pub nxt: u32,
    /// The local receive window advertised at open.
    pub wnd: u32,
}
