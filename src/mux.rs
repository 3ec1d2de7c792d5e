//! The multiplexer.
//!
//! A [`Weft`] instance owns a sorted table of connections keyed by
//! `(local port, remote port)`, allocates ephemeral source ports,
//! dispatches inbound datagrams to the right connection, and advances
//! every connection's timers from [`Weft::tick`]. The caller provides all
//! scheduling: nothing here blocks, spawns, or sleeps.

use crate::{
    conn::{Connection, Disposition, RecvCallback, State},
    wire::{Header, HeaderBuilder},
    Error,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    rc::Rc,
    time::{Duration, Instant},
};

/// Emits one datagram on the carrier. Must not call back into the
/// instance that invoked it.
pub type SendCallback = Box<dyn FnMut(&[u8])>;

/// Notification of a completed passive open. Runs when the handshake
/// finishes; the callback normally calls [`Connection::accept`] to claim
/// the connection, and the connection is reset if it does not.
pub type AcceptCallback = Box<dyn FnMut(&mut Connection, u16)>;

/// Filter for passive opens, called with the local port a SYN was
/// addressed to. Returning `false` answers the SYN with an RST.
pub type PreAcceptCallback = Box<dyn FnMut(u16) -> bool>;

/// Default maximum payload bytes per datagram.
const DEFAULT_MTU: u16 = 1000;

/// Default connect timeout.
const DEFAULT_USER_TIMEOUT: Duration = Duration::from_secs(60);

/// Outstanding data is retransmitted when the ticks spread further apart
/// than this.
const RETRANSMIT_INTERVAL: Duration = Duration::from_secs(1);

/// What [`Weft::tick`] returns when no connection has a timer armed.
const IDLE_HORIZON: Duration = Duration::from_secs(3600);

/// Ephemeral source ports carry the high bit.
const EPHEMERAL_BIT: u16 = 0x8000;

/// Refuse new ephemeral allocations once the table holds this many
/// connections; beyond it the linear probe could fail to terminate.
const MAX_CONNECTIONS: usize = 32767;

/// The shared state a connection needs to emit datagrams: the send
/// callback and the instance tunables. Connections hold an `Rc` to this as
/// their non-owning back-reference to the instance.
pub(crate) struct Carrier {
    send: RefCell<SendCallback>,
    mtu: Cell<u16>,
    user_timeout: Cell<Duration>,
}

impl Carrier {
    pub(crate) fn mtu(&self) -> u16 {
        self.mtu.get()
    }

    pub(crate) fn user_timeout(&self) -> Duration {
        self.user_timeout.get()
    }

    /// Assembles and emits one datagram. Re-entry from the send callback
    /// into the transport would corrupt connection state mid-step; the
    /// `RefCell` turns that into a panic at the borrow.
    pub(crate) fn transmit(&self, header: Header, payload: &[u8]) {
        tracing::trace!(
            src = header.src,
            dst = header.dst,
            seq = header.seq,
            ack = header.ack,
            wnd = header.wnd,
            ctl = u16::from(header.ctl),
            len = payload.len(),
            "send"
        );
        let mut datagram = Vec::with_capacity(Header::SIZE + payload.len());
        header.write(&mut datagram);
        datagram.extend_from_slice(payload);
        (self.send.borrow_mut())(&datagram);
    }
}

/// Synthesizes the RST reply for an offending datagram, per the incoming
/// header: echo its acknowledgement as our sequence number when it has
/// one, otherwise acknowledge everything it occupied.
pub(crate) fn reset_for(carrier: &Carrier, hdr: &Header, payload_len: usize) {
    let reply = if hdr.ctl.ack() {
        HeaderBuilder::new(hdr.dst, hdr.src, hdr.ack).rst().build()
    } else {
        let ack = hdr
            .seq
            .wrapping_add(payload_len as u32)
            .wrapping_add(hdr.ctl.seq_len());
        HeaderBuilder::new(hdr.dst, hdr.src, 0).rst().ack(ack).build()
    };
    carrier.transmit(reply, &[]);
}

/// Identifies one connection on an instance: the local and remote ports.
/// Orders lexicographically, which is the table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId {
    pub local: u16,
    pub remote: u16,
}

impl ConnectionId {
    /// The matching id on the remote instance.
    pub const fn reverse(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

/// A transport instance: one multiplexer over one datagram carrier.
pub struct Weft {
    carrier: Rc<Carrier>,
    accept: Option<AcceptCallback>,
    pre_accept: Option<PreAcceptCallback>,
    connections: BTreeMap<ConnectionId, Connection>,
    rng: SmallRng,
}

impl Weft {
    /// Creates an instance that emits datagrams through `send`.
    pub fn new(send: SendCallback) -> Self {
        Self {
            carrier: Rc::new(Carrier {
                send: RefCell::new(send),
                mtu: Cell::new(DEFAULT_MTU),
                user_timeout: Cell::new(DEFAULT_USER_TIMEOUT),
            }),
            accept: None,
            pre_accept: None,
            connections: BTreeMap::new(),
            rng: SmallRng::from_entropy(),
        }
    }

    /// Installs the accept callback. An instance with one installed
    /// answers unmatched SYNs with a handshake instead of an RST.
    pub fn set_accept(&mut self, accept: AcceptCallback) {
        self.accept = Some(accept);
    }

    /// Installs a filter consulted before any passive open.
    pub fn set_pre_accept(&mut self, pre_accept: PreAcceptCallback) {
        self.pre_accept = Some(pre_accept);
    }

    pub fn mtu(&self) -> u16 {
        self.carrier.mtu.get()
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.carrier.mtu.set(mtu);
    }

    pub fn user_timeout(&self) -> Duration {
        self.carrier.user_timeout.get()
    }

    pub fn set_user_timeout(&mut self, timeout: Duration) {
        self.carrier.user_timeout.set(timeout);
    }

    /// Active open to the given remote port from a fresh ephemeral source
    /// port. Emits the SYN before returning.
    pub fn connect(&mut self, dst: u16, recv: RecvCallback) -> Result<ConnectionId, Error> {
        let iss = self.rng.gen();
        self.open(0, dst, iss, recv)
    }

    /// Active open from an explicit source port.
    pub fn connect_from(
        &mut self,
        src: u16,
        dst: u16,
        recv: RecvCallback,
    ) -> Result<ConnectionId, Error> {
        let iss = self.rng.gen();
        self.open(src, dst, iss, recv)
    }

    pub(crate) fn open(
        &mut self,
        src: u16,
        dst: u16,
        iss: u32,
        recv: RecvCallback,
    ) -> Result<ConnectionId, Error> {
        let id = self.allocate(src, dst)?;
        let conn = Connection::open(self.carrier.clone(), id.local, id.remote, iss, recv, Instant::now());
        self.connections.insert(id, conn);
        Ok(id)
    }

    /// Picks the table key for a new connection. A zero source port means
    /// choose an ephemeral one: a random high-bit port, probed linearly
    /// upward past collisions.
    fn allocate(&mut self, src: u16, dst: u16) -> Result<ConnectionId, Error> {
        if src != 0 {
            let id = ConnectionId {
                local: src,
                remote: dst,
            };
            if self.connections.contains_key(&id) {
                return Err(Error::AddrInUse);
            }
            return Ok(id);
        }

        if self.connections.len() >= MAX_CONNECTIONS {
            return Err(Error::OutOfMemory);
        }
        let mut src = self.rng.gen::<u16>() | EPHEMERAL_BIT;
        loop {
            let id = ConnectionId {
                local: src,
                remote: dst,
            };
            if !self.connections.contains_key(&id) {
                return Ok(id);
            }
            src = src.checked_add(1).unwrap_or(EPHEMERAL_BIT);
        }
    }

    /// Looks up a connection by its id.
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Looks up a connection by its id for an application-side operation.
    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Ingress: feed one datagram received from the carrier.
    ///
    /// Datagrams shorter than a header or with unknown control bits are
    /// rejected. Everything else is routed to the connection matching the
    /// header's port pair, opens a new connection passively (first SYN,
    /// accept callback installed), or draws an RST.
    pub fn recv(&mut self, datagram: &[u8]) -> Result<(), Error> {
        let (hdr, payload) = Header::parse(datagram)?;
        tracing::trace!(
            src = hdr.src,
            dst = hdr.dst,
            seq = hdr.seq,
            ack = hdr.ack,
            wnd = hdr.wnd,
            ctl = u16::from(hdr.ctl),
            len = payload.len(),
            "recv"
        );

        let id = ConnectionId {
            local: hdr.dst,
            remote: hdr.src,
        };
        if let Some(conn) = self.connections.get_mut(&id) {
            let disposition =
                conn.segment_arrives(&hdr, payload, Instant::now(), self.accept.as_mut());
            if disposition == Disposition::Free {
                self.connections.remove(&id);
            }
            return Ok(());
        }

        // No matching connection. A stray RST deserves no answer; a fresh
        // SYN may open a connection if anyone is listening; anything else
        // is told to go away.
        if hdr.ctl.rst() {
            return Ok(());
        }
        if hdr.ctl.syn() && !hdr.ctl.ack() && self.accept.is_some() {
            if let Some(pre_accept) = self.pre_accept.as_mut() {
                if !pre_accept(hdr.dst) {
                    reset_for(&self.carrier, &hdr, payload.len());
                    return Ok(());
                }
            }
            let iss = self.rng.gen();
            let conn = Connection::passive_open(self.carrier.clone(), &hdr, iss);
            self.connections.insert(id, conn);
            return Ok(());
        }
        reset_for(&self.carrier, &hdr, payload.len());
        Ok(())
    }

    /// Advances timers across all connections using the current time.
    pub fn tick(&mut self) -> Duration {
        self.tick_at(Instant::now())
    }

    /// Advances timers across all connections, taking the clock as an
    /// argument so deterministic schedulers and tests can drive it.
    ///
    /// Reaps closed connections the application has relinquished, fails
    /// connections whose connect timeout expired, retransmits past-due
    /// outstanding data, fires writable notifications, and re-arms the
    /// retransmission timer wherever data is still in flight. Returns the
    /// time until the earliest armed timer, or an hour when idle.
    pub fn tick_at(&mut self, now: Instant) -> Duration {
        let mut next = now + IDLE_HORIZON;
        let mut reap = Vec::new();

        for (id, conn) in self.connections.iter_mut() {
            if conn.state() == State::Closed {
                if conn.reapable {
                    reap.push(*id);
                }
                continue;
            }

            if conn.conn_timeout.map_or(false, |t| t < now) {
                conn.fail(Error::TimedOut);
                continue;
            }

            if conn.rtrx_timeout.map_or(false, |t| t < now) {
                conn.retransmit();
            }

            conn.maybe_poll();

            if let Some(t) = conn.conn_timeout {
                next = next.min(t);
            }
            conn.rtrx_timeout = if conn.snd.nxt != conn.snd.una {
                Some(now + RETRANSMIT_INTERVAL)
            } else {
                None
            };
            if let Some(t) = conn.rtrx_timeout {
                next = next.min(t);
            }
        }

        for id in reap {
            tracing::debug!(local = id.local, remote = id.remote, "reaping connection");
            self.connections.remove(&id);
        }

        next.saturating_duration_since(now)
    }

    #[cfg(test)]
    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Drop for Weft {
    fn drop(&mut self) {
        for (id, conn) in &self.connections {
            if !conn.reapable {
                tracing::warn!(
                    local = id.local,
                    remote = id.remote,
                    "dropping instance with unclosed connection"
                );
            }
        }
    }
}
