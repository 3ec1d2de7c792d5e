/// The state of a connection. Semantics are standard TCP.
///
/// `Listen` never appears on a live connection: listening is a property of
/// the instance (an installed accept callback), and a passive open creates
/// its connection directly in `SynReceived`. The state machine is described
/// by the diagram below.
///
/// ```text
///                             +---------+ ---------\      active OPEN
///                             |  CLOSED |            \    -----------
///                             +---------+<---------\   \   create TCB
///                               |     ^              \   \  snd SYN
///                  passive OPEN |     |   CLOSE        \   \
///                  ------------ |     | ----------       \   \
///                   create TCB  |     | delete TCB         \   \
///                               V     |                      \   \
///                             +---------+            CLOSE    |    \
///                             |  LISTEN |          ---------- |     |
///                             +---------+          delete TCB |     |
///                  rcv SYN      |     |     SEND              |     |
///                 -----------   |     |    -------            |     V
/// +--------+      snd SYN,ACK  /       \   snd SYN          +--------+
/// |        |<-----------------           ------------------>|        |
/// |  SYN   |                    rcv SYN                     |  SYN   |
/// |  RCVD  |<-----------------------------------------------|  SENT  |
/// |        |                  snd SYN,ACK                   |        |
/// |        |------------------           -------------------|        |
/// +--------+   rcv ACK of SYN  \       /  rcv SYN,ACK       +--------+
///    |         --------------   |     |   -----------
///    |                x         |     |     snd ACK
///    |                          V     V
///    |  CLOSE                 +---------+
///    | -------                |  ESTAB  |
///    | snd FIN                +---------+
///    |                 CLOSE    |     |    rcv FIN
///    V                -------   |     |    -------
/// +---------+         snd FIN  /       \   snd ACK         +---------+
/// |  FIN    |<----------------          ------------------>|  CLOSE  |
/// | WAIT-1  |------------------                            |   WAIT  |
/// +---------+          rcv FIN  \                          +---------+
///   | rcv ACK of FIN   -------   |                          CLOSE  |
///   | --------------   snd ACK   |                         ------- |
///   V        x                   V                         snd FIN V
/// +---------+               +---------+                    +---------+
/// |FINWAIT-2|               | CLOSING |                    | LAST-ACK|
/// +---------+               +---------+                    +---------+
///   |              rcv ACK of FIN |                 rcv ACK of FIN |
///   |  rcv FIN     -------------- |       Timeout   -------------- |
///   |  -------            x       V    ------------        x       V
///    \ snd ACK              +---------+delete TCB          +---------+
///      -------------------->|TIME-WAIT|------------------->| CLOSED  |
///                           +---------+                    +---------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// No connection state at all.
    Closed,
    /// Waiting for a connection request. Unused on live connections; see
    /// the type-level note.
    Listen,
    /// Waiting for a matching connection request after having sent a
    /// connection request.
    SynSent,
    /// Waiting for a confirming connection request acknowledgment after
    /// having both received and sent a connection request.
    SynReceived,
    /// An open connection; the normal state for the data transfer phase.
    Established,
    /// Waiting for a connection termination request from the remote peer,
    /// or an acknowledgment of the termination request previously sent.
    FinWait1,
    /// Waiting for a connection termination request from the remote peer.
    FinWait2,
    /// Waiting for a connection termination request from the local user.
    CloseWait,
    /// Both sides sent a FIN; waiting for the peer to acknowledge ours.
    Closing,
    /// Waiting for an acknowledgment of the connection termination request
    /// previously sent to the remote peer.
    LastAck,
    /// Waiting for enough time to pass to be sure the remote peer received
    /// the acknowledgment of its connection termination request.
    TimeWait,
}

impl State {
    /// Whether the application may still hand us bytes to transmit.
    pub fn writable(self) -> bool {
        matches!(self, State::Established | State::CloseWait)
    }
}
