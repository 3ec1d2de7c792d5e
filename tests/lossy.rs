//! End-to-end laws over a lossy carrier, through the public API only: every
//! byte handed to `send` comes out of the peer's receive callback exactly
//! once and in order, and a graceful close delivers everything before the
//! end of stream.

use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::Rc,
    time::{Duration, Instant},
};
use weft::{Event, State, Weft};

/// Datagrams in flight in one direction.
type Wire = Rc<RefCell<VecDeque<Vec<u8>>>>;

/// Deterministic congruential generator driving the drop pattern, so the
/// test is reproducible.
struct Lcg(u64);

impl Lcg {
    fn roll(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn dropped(&mut self, percent: u64) -> bool {
        self.roll() % 100 < percent
    }
}

/// What the receiving application observed.
#[derive(Default)]
struct Received {
    data: Vec<u8>,
    /// How many bytes had arrived when the end of stream was signalled.
    eof_at: Option<usize>,
}

fn instance(outgoing: Wire) -> Weft {
    let mut weft = Weft::new(Box::new(move |datagram| {
        outgoing.borrow_mut().push_back(datagram.to_vec())
    }));
    // The laws hold "provided the connection does not time out"; park the
    // user timeout well past the simulated horizon.
    weft.set_user_timeout(Duration::from_secs(1_000_000));
    weft
}

fn drain(wire: &Wire, into: &mut Weft, loss: &mut Lcg, drop_percent: u64) -> anyhow::Result<()> {
    loop {
        let datagram = wire.borrow_mut().pop_front();
        let Some(datagram) = datagram else { break };
        if loss.dropped(drop_percent) {
            continue;
        }
        into.recv(&datagram)?;
    }
    Ok(())
}

fn run_transfer(
    payload: &[u8],
    drop_percent: u64,
    close_after_send: bool,
) -> anyhow::Result<Received> {
    let a_to_b: Wire = Default::default();
    let b_to_a: Wire = Default::default();

    let mut a = instance(a_to_b.clone());
    let mut b = instance(b_to_a.clone());

    let received: Rc<RefCell<Received>> = Default::default();
    let sink = received.clone();
    b.set_accept(Box::new(move |conn, _local_port| {
        let sink = sink.clone();
        conn.accept(Box::new(move |event| {
            let mut seen = sink.borrow_mut();
            match event {
                Event::Data(bytes) => seen.data.extend_from_slice(bytes),
                Event::Eof => {
                    let len = seen.data.len();
                    seen.eof_at = Some(len);
                }
                Event::Failed(error) => panic!("connection failed: {error}"),
            }
        }))
        .unwrap();
    }));

    let ca = a.connect(7000, Box::new(|_event| {}))?;

    let mut loss = Lcg(0x5eed);
    let mut now = Instant::now();
    let mut sent = false;

    for _ in 0..5000 {
        drain(&b_to_a, &mut a, &mut loss, drop_percent)?;
        drain(&a_to_b, &mut b, &mut loss, drop_percent)?;

        if !sent && a.connection(ca).unwrap().state() == State::Established {
            let conn = a.connection_mut(ca).unwrap();
            assert_eq!(conn.send(payload)?, payload.len());
            if close_after_send {
                conn.close()?;
            }
            sent = true;
        }

        let done = {
            let seen = received.borrow();
            seen.data.len() == payload.len() && (!close_after_send || seen.eof_at.is_some())
        };
        if done {
            break;
        }

        // Ticks over a second apart drive retransmission on both sides.
        now += Duration::from_secs(2);
        a.tick_at(now);
        b.tick_at(now);
    }

    assert!(sent, "handshake never completed");
    let seen = received.borrow();
    Ok(Received {
        data: seen.data.clone(),
        eof_at: seen.eof_at,
    })
}

#[test]
fn lossless_delivery_over_lossy_carrier() -> anyhow::Result<()> {
    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 241) as u8).collect();
    let received = run_transfer(&payload, 25, false)?;
    assert_eq!(received.data, payload);
    Ok(())
}

#[test]
fn delivery_without_loss_needs_no_retransmission() -> anyhow::Result<()> {
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 199) as u8).collect();
    let received = run_transfer(&payload, 0, false)?;
    assert_eq!(received.data, payload);
    Ok(())
}

#[test]
fn graceful_close_preserves_data() -> anyhow::Result<()> {
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 181) as u8).collect();
    let received = run_transfer(&payload, 25, true)?;
    assert_eq!(received.data, payload);
    // The end of stream arrived only after every byte.
    assert_eq!(received.eof_at, Some(payload.len()));
    Ok(())
}
