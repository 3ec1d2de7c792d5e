//! A userspace reliable byte-stream transport for unreliable datagram
//! carriers.
//!
//! `weft` layers TCP-style semantics — ordered, reliable byte streams with
//! a three-way handshake and graceful close — on top of any carrier that
//! can move datagrams which may be lost, duplicated, or reordered but keep
//! their boundaries: a UDP socket, a VPN tunnel, a message bus, a pipe in
//! a test. The library never touches the network itself. The caller feeds
//! inbound datagrams to [`Weft::recv`], drives time with [`Weft::tick`],
//! and receives outbound datagrams and delivered bytes through callbacks.
//! Multiple logical connections share one carrier, multiplexed by 16-bit
//! port pairs.
//!
//! # Organization
//!
//! - [`wire`] defines the 20-byte datagram header and its control bits
//! - [`seq`] provides wraparound-safe sequence-number arithmetic
//! - [`conn`] implements the per-connection state machine, send buffer,
//!   segmenter, and retransmission
//! - [`mux`] implements the instance: the connection table, port
//!   allocation, ingress dispatch, and the timer tick
//!
//! # A connection's life
//!
//! An active open ([`Weft::connect`]) sends a SYN and completes when the
//! peer's SYN|ACK arrives. A passive open happens entirely inside
//! [`Weft::recv`]: a SYN addressed to an instance with an accept callback
//! creates a connection, and once the handshake completes the callback is
//! handed the connection to claim with [`Connection::accept`]. Application
//! bytes go in through [`Connection::send`], come out through the peer's
//! receive callback, and survive datagram loss as long as [`Weft::tick`]
//! runs often enough to drive retransmission. [`Connection::close`] sends
//! a FIN after the buffered data and lets the engine reap the connection
//! when the close handshake finishes; [`Connection::abort`] tears it down
//! with an RST immediately.
//!
//! The library is single-threaded and non-reentrant per instance: all
//! callbacks run synchronously inside the call that triggered them, and
//! the send callback must not call back into the same instance.

pub mod conn;
pub mod mux;
pub mod seq;
pub mod wire;

pub use conn::{Connection, Event, PollCallback, RecvCallback, State};
pub use mux::{AcceptCallback, ConnectionId, PreAcceptCallback, SendCallback, Weft};

/// Everything that can go wrong, at the API or on the wire.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The requested source port is already connected to that destination.
    #[error("address already in use")]
    AddrInUse,
    /// The connection table is full; no ephemeral port can be allocated.
    #[error("out of ports")]
    OutOfMemory,
    /// The operation names a connection the application already closed.
    #[error("connection already closed")]
    Closed,
    /// The connection is not yet in a data-carrying state.
    #[error("not connected")]
    NotConnected,
    /// The local side already shut down its half of the stream.
    #[error("connection is shutting down")]
    BrokenPipe,
    /// The datagram is shorter than a header or carries unknown control
    /// bits.
    #[error("malformed datagram")]
    Malformed,
    /// The peer refused the connection.
    #[error("connection refused")]
    Refused,
    /// The peer reset the connection.
    #[error("connection reset")]
    Reset,
    /// The connection gave up waiting for the peer.
    #[error("timed out")]
    TimedOut,
}
