//! The per-connection protocol engine.
//!
//! A [`Connection`] holds the transmission control block (the send and
//! receive sequence spaces), the send buffer, the state machine state, the
//! two timers, and the application callbacks. It is owned by the
//! [`Weft`](crate::Weft) instance that created it and keeps a non-owning
//! reference to the shared carrier state for emitting datagrams.
//!
//! All of the interesting protocol work happens in `segment_arrives` (the
//! ingress pipeline: acceptability, ACK validity, RST, ACK, SYN, handshake
//! completion, data, FIN, emit) and in the segmenter (`push_segments`),
//! which chops the send buffer into MTU-sized datagrams under the
//! congestion window.

use crate::{
    mux::{reset_for, AcceptCallback, Carrier},
    seq::{seq_gt, seq_lt, seqdiff},
    wire::{Header, HeaderBuilder},
    Error,
};
use std::{
    rc::Rc,
    time::{Duration, Instant},
};

mod recv_space;
mod send_buffer;
mod send_space;
mod state;


use recv_space::RecvSpace;
use send_buffer::SendBuffer;
use send_space::SendSpace;

pub use state::State;

/// How long a connection lingers in TIME_WAIT before it is torn down.
const TIME_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Bytes or stream-end events delivered to a connection's receive callback.
#[derive(Debug)]
pub enum Event<'a> {
    /// Application bytes arrived in order. The callback must consume all of
    /// them; the engine keeps no receive buffer.
    Data(&'a [u8]),
    /// The peer closed its half of the stream.
    Eof,
    /// The connection failed and is now closed. Carries
    /// [`Error::Refused`], [`Error::Reset`], or [`Error::TimedOut`].
    Failed(Error),
}

/// Delivers received bytes and stream-end events to the application.
pub type RecvCallback = Box<dyn FnMut(Event<'_>)>;

/// Writable-notification callback, invoked from the tick with the number of
/// free send-buffer bytes.
pub type PollCallback = Box<dyn FnMut(usize)>;

/// What the multiplexer should do with a connection after a segment was
/// processed.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Keep the connection in the table.
    Keep,
    /// Remove and drop the connection immediately.
    Free,
}

/// One logical byte-stream connection multiplexed onto the carrier.
pub struct Connection {
    carrier: Rc<Carrier>,
    /// Local port. Non-zero for as long as the connection is in the table.
    src: u16,
    /// Remote port.
    dst: u16,
    pub(crate) state: State,
    /// Set once the application has relinquished the connection; the next
    /// tick may destroy it once it reaches [`State::Closed`].
    pub(crate) reapable: bool,
    pub(crate) snd: SendSpace,
    rcv: RecvSpace,
    buf: SendBuffer,
    /// Data-free acknowledgements of already-acked data seen in a row.
    dupack: u32,
    /// Connect timeout while opening; TIME_WAIT expiry while closing.
    pub(crate) conn_timeout: Option<Instant>,
    /// When armed and expired, the tick retransmits from `una`.
    pub(crate) rtrx_timeout: Option<Instant>,
    recv: Option<RecvCallback>,
    poll: Option<PollCallback>,
    nodelay: bool,
    keepalive: bool,
}

impl Connection {
    fn new(carrier: Rc<Carrier>, src: u16, dst: u16, iss: u32) -> Self {
        let mtu = u32::from(carrier.mtu());
        Self {
            carrier,
            src,
            dst,
            state: State::Closed,
            reapable: false,
            snd: SendSpace {
                iss,
                una: iss,
                nxt: iss.wrapping_add(1),
                last: iss.wrapping_add(1),
                wnd: 0,
                cwnd: mtu,
            },
            rcv: RecvSpace {
                irs: 0,
                nxt: 0,
                wnd: mtu,
            },
            buf: SendBuffer::default(),
            dupack: 0,
            conn_timeout: None,
            rtrx_timeout: None,
            recv: None,
            poll: None,
            nodelay: false,
            keepalive: false,
        }
    }

    /// Active open: enter SYN_SENT, emit the SYN, arm the connect timeout.
    pub(crate) fn open(
        carrier: Rc<Carrier>,
        src: u16,
        dst: u16,
        iss: u32,
        recv: RecvCallback,
        now: Instant,
    ) -> Self {
        let mut conn = Self::new(carrier, src, dst, iss);
        conn.recv = Some(recv);
        conn.set_state(State::SynSent);
        let syn = conn.header(iss).syn().wnd(conn.rcv.wnd).build();
        conn.carrier.transmit(syn, &[]);
        conn.conn_timeout = Some(now + conn.carrier.user_timeout());
        conn
    }

    /// Passive open from a SYN that matched no connection: enter
    /// SYN_RECEIVED and answer SYN|ACK. The accept callback runs later, on
    /// the acknowledgement that completes the handshake.
    pub(crate) fn passive_open(carrier: Rc<Carrier>, hdr: &Header, iss: u32) -> Self {
        let mut conn = Self::new(carrier, hdr.dst, hdr.src, iss);
        conn.snd.wnd = hdr.wnd;
        conn.rcv.irs = hdr.seq;
        conn.rcv.nxt = hdr.seq.wrapping_add(1);
        conn.set_state(State::SynReceived);
        let syn_ack = conn
            .header(iss)
            .syn()
            .ack(conn.rcv.nxt)
            .wnd(conn.rcv.wnd)
            .build();
        conn.carrier.transmit(syn_ack, &[]);
        conn
    }

    /// The application's acknowledgement of a passively opened connection.
    /// Legal only in SYN_RECEIVED; installs the receive callback and
    /// completes the transition to ESTABLISHED.
    pub fn accept(&mut self, recv: RecvCallback) -> Result<(), Error> {
        if self.reapable {
            return Err(Error::Closed);
        }
        if self.state != State::SynReceived {
            return Err(Error::NotConnected);
        }
        self.recv = Some(recv);
        self.set_state(State::Established);
        Ok(())
    }

    /// Buffers bytes for transmission and sends whatever the congestion
    /// window allows right away. Returns how many bytes were accepted,
    /// which is less than `bytes.len()` when the send buffer cannot grow
    /// further; zero means try again once the poll callback fires.
    pub fn send(&mut self, bytes: &[u8]) -> Result<usize, Error> {
        if self.reapable {
            return Err(Error::Closed);
        }
        match self.state {
            State::Closed | State::Listen | State::SynSent | State::SynReceived => {
                return Err(Error::NotConnected)
            }
            State::Established | State::CloseWait => {}
            State::FinWait1
            | State::FinWait2
            | State::Closing
            | State::LastAck
            | State::TimeWait => return Err(Error::BrokenPipe),
        }

        if bytes.is_empty() {
            return Ok(0);
        }

        let accepted = self.buf.append(bytes);
        self.snd.last = self.snd.last.wrapping_add(accepted as u32);
        self.push_segments(false);
        Ok(accepted)
    }

    /// Sends a FIN after any buffered data and refuses further sends.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        if self.reapable {
            return Err(Error::Closed);
        }
        match self.state {
            State::Closed => return Ok(()),
            State::Listen | State::SynSent => {
                self.set_state(State::Closed);
                return Ok(());
            }
            State::SynReceived | State::Established => self.set_state(State::FinWait1),
            State::CloseWait => self.set_state(State::LastAck),
            State::FinWait1
            | State::FinWait2
            | State::Closing
            | State::LastAck
            | State::TimeWait => return Ok(()),
        }

        // The FIN consumes one sequence number but no buffer byte.
        self.snd.last = self.snd.last.wrapping_add(1);
        self.push_segments(false);
        Ok(())
    }

    /// Graceful close: shutdown, then let the engine reap the connection
    /// once the close handshake finishes.
    pub fn close(&mut self) -> Result<(), Error> {
        self.shutdown()?;
        self.reapable = true;
        Ok(())
    }

    /// Immediate teardown. Tells the peer with an RST when it may still
    /// believe the connection exists.
    pub fn abort(&mut self) -> Result<(), Error> {
        if self.reapable {
            return Err(Error::Closed);
        }
        self.reapable = true;
        match self.state {
            State::Closed => return Ok(()),
            State::Listen
            | State::SynSent
            | State::Closing
            | State::LastAck
            | State::TimeWait => {
                self.set_state(State::Closed);
                return Ok(());
            }
            State::SynReceived
            | State::Established
            | State::FinWait1
            | State::FinWait2
            | State::CloseWait => self.set_state(State::Closed),
        }

        let rst = self.header(self.snd.nxt).rst().wnd(0).build();
        self.carrier.transmit(rst, &[]);
        Ok(())
    }

    /// Processes one inbound segment. Implements the ingress pipeline of
    /// the protocol; the returned disposition tells the multiplexer whether
    /// the connection should be removed from the table outright.
    pub(crate) fn segment_arrives(
        &mut self,
        hdr: &Header,
        payload: &[u8],
        now: Instant,
        accept: Option<&mut AcceptCallback>,
    ) -> Disposition {
        // A closed connection no longer talks. It stays in the table until
        // the application reaps it.
        if self.state == State::Closed {
            return Disposition::Keep;
        }

        // Acceptability: in SYN_SENT the ACK field is validated
        // structurally below; everywhere else only the next in-order
        // sequence number is accepted.
        if self.state != State::SynSent && hdr.seq != self.rcv.nxt {
            tracing::trace!(
                seq = hdr.seq,
                expected = self.rcv.nxt,
                "out-of-order segment"
            );
            if !hdr.ctl.rst() {
                self.push_segments(true);
            }
            return Disposition::Keep;
        }

        self.snd.wnd = hdr.wnd;

        // The acknowledgement must not roll back below una nor claim bytes
        // never sent.
        if hdr.ctl.ack()
            && (seq_gt(hdr.ack, self.snd.nxt) || seq_lt(hdr.ack, self.snd.una))
        {
            tracing::trace!(
                ack = hdr.ack,
                una = self.snd.una,
                nxt = self.snd.nxt,
                "acknowledgement out of range"
            );
            if !hdr.ctl.rst() {
                self.reset_reply(hdr, payload);
            }
            return Disposition::Keep;
        }

        if hdr.ctl.rst() {
            return self.rst_arrives(hdr);
        }

        // In SYN_SENT, honor the acknowledgement only when it arrives on
        // the SYN|ACK itself. A delayed bare ACK (the peer's answer to a
        // retransmitted SYN) would otherwise advance una early and make
        // the real SYN|ACK's acknowledgement look stale, wedging the
        // handshake.
        let ack_usable =
            hdr.ctl.ack() && (self.state != State::SynSent || hdr.ctl.syn());
        let advanced = if ack_usable {
            seqdiff(hdr.ack, self.snd.una)
        } else {
            0
        };
        let prev_rcv_nxt = self.rcv.nxt;

        if advanced > 0 {
            // Leaving SYN_SENT or SYN_RECEIVED, the first acknowledged
            // sequence number is the SYN, not data.
            let mut data_acked = advanced;
            if matches!(self.state, State::SynSent | State::SynReceived) {
                data_acked -= 1;
            }
            debug_assert!(data_acked >= 0);
            debug_assert!(data_acked <= seqdiff(self.snd.last, self.snd.una));

            self.buf.consume(data_acked as usize);
            self.snd.una = hdr.ack;
            self.dupack = 0;
            self.snd.cwnd = self
                .snd
                .cwnd
                .saturating_add(u32::from(self.carrier.mtu()))
                .min(self.buf.max());

            self.conn_timeout = None;
            if self.snd.una == self.snd.nxt {
                self.rtrx_timeout = None;
            }

            // A FIN of ours may now be fully acknowledged.
            match self.state {
                State::FinWait1 if self.snd.una == self.snd.last => {
                    self.set_state(State::FinWait2);
                }
                State::Closing if self.snd.una == self.snd.last => {
                    self.conn_timeout = Some(now + TIME_WAIT_TIMEOUT);
                    self.set_state(State::TimeWait);
                }
                State::LastAck if self.snd.una == self.snd.last => {
                    self.set_state(State::Closed);
                    self.reapable = true;
                }
                _ => {}
            }
        } else if payload.is_empty() && hdr.ctl.ack() {
            self.dupack += 1;
            if self.dupack >= 3 {
                // TODO: fast retransmit and recovery (RFC 6582) once this
                // fires.
                tracing::trace!(dupack = self.dupack, "duplicate acknowledgement");
            }
        }

        if hdr.ctl.syn() {
            match self.state {
                State::SynSent => {
                    // This is a SYN|ACK; it must acknowledge our SYN.
                    if advanced == 0 {
                        self.reset_reply(hdr, payload);
                        return Disposition::Keep;
                    }
                    self.rcv.irs = hdr.seq;
                    self.rcv.nxt = hdr.seq;
                    self.set_state(State::Established);
                }
                _ => {
                    // A second SYN on a synchronized connection.
                    self.reset_reply(hdr, payload);
                    return Disposition::Keep;
                }
            }

            // The SYN consumes one sequence number.
            self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
        }

        if self.state == State::SynReceived {
            // The ACK that completes the handshake; it must acknowledge our
            // SYN|ACK.
            if advanced == 0 {
                self.reset_reply(hdr, payload);
                return Disposition::Keep;
            }

            let src = self.src;
            if let Some(accept) = accept {
                accept(self, src);
            }

            // The application was handed the connection and had to bring it
            // to ESTABLISHED; anything else means it was not wanted.
            if self.state != State::Established {
                self.set_state(State::Closed);
                self.reapable = true;
                self.reset_reply(hdr, payload);
                return Disposition::Keep;
            }
        }

        if !payload.is_empty() {
            match self.state {
                State::Established | State::FinWait1 | State::FinWait2 => {}
                _ => {
                    // Data after a FIN, or on a half-open handshake.
                    self.reset_reply(hdr, payload);
                    return Disposition::Keep;
                }
            }
            self.deliver(Event::Data(payload));
            self.rcv.nxt = self.rcv.nxt.wrapping_add(payload.len() as u32);
        }

        if hdr.ctl.fin() {
            match self.state {
                State::Established => self.set_state(State::CloseWait),
                State::FinWait1 => self.set_state(State::Closing),
                State::FinWait2 => {
                    self.conn_timeout = Some(now + TIME_WAIT_TIMEOUT);
                    self.set_state(State::TimeWait);
                }
                _ => {
                    // A second FIN, or a FIN before the handshake finished.
                    self.reset_reply(hdr, payload);
                    return Disposition::Keep;
                }
            }

            // The FIN consumes one sequence number.
            self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
            self.deliver(Event::Eof);
        }

        // Send something back if receive state advanced (the peer needs an
        // ACK) or if an acknowledgement freed congestion window for more
        // data.
        self.push_segments(self.rcv.nxt != prev_rcv_nxt);
        Disposition::Keep
    }

    /// The RST state table. Only called for acceptable RST segments.
    fn rst_arrives(&mut self, hdr: &Header) -> Disposition {
        match self.state {
            State::SynSent => {
                if hdr.ctl.ack() {
                    // The peer refused our connection.
                    self.fail(Error::Refused);
                }
                Disposition::Keep
            }
            State::SynReceived => {
                if hdr.ctl.ack() {
                    return Disposition::Keep;
                }
                // The application has never heard of this connection;
                // delete it silently.
                Disposition::Free
            }
            State::Established | State::FinWait1 | State::FinWait2 | State::CloseWait => {
                if hdr.ctl.ack() {
                    return Disposition::Keep;
                }
                self.fail(Error::Reset);
                Disposition::Keep
            }
            State::Closing | State::LastAck | State::TimeWait => {
                if hdr.ctl.ack() {
                    return Disposition::Keep;
                }
                // The application already considers the stream finished; if
                // it also closed its handle, the connection can go away now.
                if self.reapable {
                    Disposition::Free
                } else {
                    self.set_state(State::Closed);
                    Disposition::Keep
                }
            }
            State::Closed | State::Listen => Disposition::Keep,
        }
    }

    /// The segmenter. Transmits as much buffered data as the congestion
    /// window allows, at most one MTU per datagram, appending the FIN bit
    /// to the final segment when a shutdown has drained the buffer. With
    /// `send_at_least_one`, an empty ACK goes out even when there is no
    /// data, to carry a receive-state update.
    pub(crate) fn push_segments(&mut self, send_at_least_one: bool) {
        let buffered = seqdiff(self.snd.last, self.snd.nxt);
        debug_assert!(buffered >= 0);
        let cwnd_left = (self.snd.cwnd as i32 - seqdiff(self.snd.nxt, self.snd.una)).max(0);
        let mut left = buffered.min(cwnd_left) as u32;

        if left == 0 && !send_at_least_one {
            return;
        }

        let mtu = u32::from(self.carrier.mtu());
        loop {
            let seglen = left.min(mtu);
            let seq = self.snd.nxt;
            let offset = seqdiff(self.snd.nxt, self.snd.una) as usize;
            self.snd.nxt = self.snd.nxt.wrapping_add(seglen);
            left -= seglen;

            // On the last segment of a drained buffer, a pending FIN rides
            // along as the final sequence number instead of a data byte.
            let fin = seglen != 0
                && left == 0
                && matches!(
                    self.state,
                    State::FinWait1 | State::Closing | State::LastAck
                );

            let mut header = self
                .header(seq)
                .ack(self.rcv.nxt)
                .wnd(self.snd.wnd);
            if fin {
                header = header.fin();
            }
            let payload_len = seglen as usize - fin as usize;
            self.carrier
                .transmit(header.build(), self.buf.window(offset, payload_len));

            if left == 0 || seglen == 0 {
                break;
            }
        }
    }

    /// Resends the oldest unacknowledged state, one datagram's worth.
    /// `nxt` is left alone; the strict in-order receiver discards the tail
    /// and the timer walks `una` forward one segment per firing.
    pub(crate) fn retransmit(&mut self) {
        if self.state == State::Closed || self.snd.nxt == self.snd.una {
            return;
        }

        match self.state {
            State::SynSent => {
                let syn = self.header(self.snd.iss).syn().wnd(self.rcv.wnd).build();
                self.carrier.transmit(syn, &[]);
            }
            State::SynReceived => {
                let syn_ack = self
                    .header(self.snd.iss)
                    .syn()
                    .ack(self.rcv.nxt)
                    .wnd(self.rcv.wnd)
                    .build();
                self.carrier.transmit(syn_ack, &[]);
            }
            State::Established | State::FinWait1 => {
                let outstanding = seqdiff(self.snd.nxt, self.snd.una) as u32;
                // The FIN is among the outstanding sequence numbers only
                // once the segmenter has actually sent it.
                let fin_outstanding =
                    self.state == State::FinWait1 && self.snd.nxt == self.snd.last;
                let mut len = outstanding - u32::from(fin_outstanding);

                let mut header = self
                    .header(self.snd.una)
                    .ack(self.rcv.nxt)
                    .wnd(self.snd.wnd);
                let mtu = u32::from(self.carrier.mtu());
                if len > mtu {
                    len = mtu;
                } else if fin_outstanding {
                    header = header.fin();
                }
                self.carrier
                    .transmit(header.build(), self.buf.window(0, len as usize));
            }
            _ => {}
        }
    }

    /// Fails the connection and tells the application why.
    pub(crate) fn fail(&mut self, error: Error) {
        self.set_state(State::Closed);
        self.deliver(Event::Failed(error));
    }

    /// Invokes the writable-notification callback if the application could
    /// usefully send again.
    pub(crate) fn maybe_poll(&mut self) {
        if !self.state.writable() {
            return;
        }
        let free = self.buf.free();
        if free > self.buf.max() as usize / 2 {
            if let Some(poll) = self.poll.as_mut() {
                poll(free);
            }
        }
    }

    fn deliver(&mut self, event: Event<'_>) {
        if let Some(recv) = self.recv.as_mut() {
            recv(event);
        }
    }

    fn set_state(&mut self, state: State) {
        tracing::debug!(src = self.src, dst = self.dst, ?state, "state change");
        self.state = state;
        // Once the connection is up, the connect timeout no longer applies.
        if state == State::Established {
            self.conn_timeout = None;
        }
    }

    fn header(&self, seq: u32) -> HeaderBuilder {
        HeaderBuilder::new(self.src, self.dst, seq)
    }

    fn reset_reply(&self, hdr: &Header, payload: &[u8]) {
        reset_for(&self.carrier, hdr, payload.len());
    }

    /// Current protocol state.
    pub fn state(&self) -> State {
        self.state
    }

    pub fn local_port(&self) -> u16 {
        self.src
    }

    pub fn remote_port(&self) -> u16 {
        self.dst
    }

    /// Bytes sent but not yet acknowledged.
    pub fn outq(&self) -> usize {
        seqdiff(self.snd.nxt, self.snd.una) as usize
    }

    /// The send buffer size limit.
    pub fn sndbuf(&self) -> usize {
        self.buf.max() as usize
    }

    /// Sets the send buffer size limit.
    pub fn set_sndbuf(&mut self, size: usize) {
        self.buf.set_max(size);
    }

    /// Bytes the application could still enqueue.
    pub fn sndbuf_free(&self) -> usize {
        self.buf.free()
    }

    /// Replaces the receive callback.
    pub fn set_recv(&mut self, recv: RecvCallback) {
        self.recv = Some(recv);
    }

    /// Installs the writable-notification callback.
    pub fn set_poll(&mut self, poll: PollCallback) {
        self.poll = Some(poll);
    }

    /// Stored but not yet honored by the engine.
    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn set_nodelay(&mut self, nodelay: bool) {
        self.nodelay = nodelay;
    }

    /// Stored but not yet honored by the engine.
    pub fn keepalive(&self) -> bool {
        self.keepalive
    }

    pub fn set_keepalive(&mut self, keepalive: bool) {
        self.keepalive = keepalive;
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        assert!(seqdiff(self.snd.nxt, self.snd.una) >= 0);
        assert!(seqdiff(self.snd.last, self.snd.nxt) >= 0);
        assert!(self.snd.cwnd >= u32::from(self.carrier.mtu()));
        assert!(self.snd.cwnd <= self.buf.max());
    }
}
