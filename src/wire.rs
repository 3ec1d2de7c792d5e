//! The datagram header.
//!
//! Every datagram on the carrier starts with a fixed 20-byte header; the
//! rest is payload. The carrier is opaque to the network, so no network
//! byte order is imposed; fields are serialized little-endian so that both
//! peers agree regardless of host. There are no options and no checksum:
//! the carrier is trusted to hand back the bytes it was given, just not to
//! hand back every datagram, or only once, or in order.

use crate::Error;

/// Control bits carried in [`Header::ctl`]. Any bit outside these four makes
/// the datagram invalid.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Ctl(u16);

impl Ctl {
    const SYN: u16 = 1 << 0;
    const ACK: u16 = 1 << 1;
    const FIN: u16 = 1 << 2;
    const RST: u16 = 1 << 3;

    /// Synchronize sequence numbers
    pub fn syn(self) -> bool {
        self.0 & Self::SYN != 0
    }

    /// Acknowledgement field significant
    pub fn ack(self) -> bool {
        self.0 & Self::ACK != 0
    }

    /// No more data from sender
    pub fn fin(self) -> bool {
        self.0 & Self::FIN != 0
    }

    /// Reset the connection
    pub fn rst(self) -> bool {
        self.0 & Self::RST != 0
    }

    /// Whether only known control bits are set.
    pub fn is_valid(self) -> bool {
        self.0 & !(Self::SYN | Self::ACK | Self::FIN | Self::RST) == 0
    }

    /// The number of sequence numbers the control bits themselves consume.
    pub fn seq_len(self) -> u32 {
        self.syn() as u32 + self.fin() as u32
    }
}

impl From<u16> for Ctl {
    fn from(bits: u16) -> Self {
        Self(bits)
    }
}

impl From<Ctl> for u16 {
    fn from(ctl: Ctl) -> Self {
        ctl.0
    }
}

/// The fixed-layout datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Source port
    pub src: u16,
    /// Destination port
    pub dst: u16,
    /// Sequence number
    pub seq: u32,
    /// Acknowledgement number
    pub ack: u32,
    /// Window size
    pub wnd: u32,
    /// Control bits
    pub ctl: Ctl,
    /// Reserved
    pub aux: u16,
}

impl Header {
    /// Serialized size in bytes.
    pub const SIZE: usize = 20;

    /// Splits a datagram into its header and payload.
    ///
    /// Fails on datagrams shorter than the header and on headers with
    /// unknown control bits set.
    pub fn parse(datagram: &[u8]) -> Result<(Header, &[u8]), Error> {
        if datagram.len() < Self::SIZE {
            return Err(Error::Malformed);
        }
        let (raw, payload) = datagram.split_at(Self::SIZE);
        let field = |i: usize| [raw[i], raw[i + 1]];
        let wide = |i: usize| [raw[i], raw[i + 1], raw[i + 2], raw[i + 3]];
        let header = Header {
            src: u16::from_le_bytes(field(0)),
            dst: u16::from_le_bytes(field(2)),
            seq: u32::from_le_bytes(wide(4)),
            ack: u32::from_le_bytes(wide(8)),
            wnd: u32::from_le_bytes(wide(12)),
            ctl: Ctl(u16::from_le_bytes(field(16))),
            aux: u16::from_le_bytes(field(18)),
        };
        if !header.ctl.is_valid() {
            return Err(Error::Malformed);
        }
        Ok((header, payload))
    }

    /// Appends the serialized header to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.src.to_le_bytes());
        out.extend_from_slice(&self.dst.to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.extend_from_slice(&self.ack.to_le_bytes());
        out.extend_from_slice(&self.wnd.to_le_bytes());
        out.extend_from_slice(&self.ctl.0.to_le_bytes());
        out.extend_from_slice(&self.aux.to_le_bytes());
    }
}

/// Composes outgoing headers.
#[derive(Debug, Clone, Copy)]
pub struct HeaderBuilder {
    header: Header,
}

impl HeaderBuilder {
    pub fn new(src: u16, dst: u16, seq: u32) -> Self {
        Self {
            header: Header {
                src,
                dst,
                seq,
                ack: 0,
                wnd: 0,
                ctl: Ctl::default(),
                aux: 0,
            },
        }
    }

    pub fn syn(mut self) -> Self {
        self.header.ctl.0 |= Ctl::SYN;
        self
    }

    /// Sets the acknowledgement number and the ACK bit.
    pub fn ack(mut self, ack: u32) -> Self {
        self.header.ack = ack;
        self.header.ctl.0 |= Ctl::ACK;
        self
    }

    pub fn fin(mut self) -> Self {
        self.header.ctl.0 |= Ctl::FIN;
        self
    }

    pub fn rst(mut self) -> Self {
        self.header.ctl.0 |= Ctl::RST;
        self
    }

    pub fn wnd(mut self, wnd: u32) -> Self {
        self.header.wnd = wnd;
        self
    }

    pub fn build(self) -> Header {
        self.header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_datagram() {
        let header = HeaderBuilder::new(0xcafe, 0xbabe, 123_456_789)
            .ack(10)
            .syn()
            .wnd(1024)
            .build();
        let mut raw = Vec::new();
        header.write(&mut raw);
        raw.extend_from_slice(b"Hello, world!");

        let (parsed, payload) = Header::parse(&raw).unwrap();
        assert_eq!(parsed.src, 0xcafe);
        assert_eq!(parsed.dst, 0xbabe);
        assert_eq!(parsed.seq, 123_456_789);
        assert_eq!(parsed.ack, 10);
        assert_eq!(parsed.wnd, 1024);
        assert!(parsed.ctl.syn());
        assert!(parsed.ctl.ack());
        assert!(!parsed.ctl.fin());
        assert!(!parsed.ctl.rst());
        assert_eq!(parsed.aux, 0);
        assert_eq!(payload, b"Hello, world!");
    }

    #[test]
    fn rejects_short_datagram() {
        let raw = [0u8; Header::SIZE - 1];
        assert_eq!(Header::parse(&raw), Err(Error::Malformed));
    }

    #[test]
    fn rejects_unknown_control_bits() {
        let header = HeaderBuilder::new(1, 2, 3).ack(4).build();
        let mut raw = Vec::new();
        header.write(&mut raw);
        raw[16] |= 1 << 5;
        assert_eq!(Header::parse(&raw), Err(Error::Malformed));
    }

    #[test]
    fn control_seq_len() {
        assert_eq!(Ctl::default().seq_len(), 0);
        assert_eq!(Ctl::from(1u16).seq_len(), 1); // SYN
        assert_eq!(Ctl::from(4u16).seq_len(), 1); // FIN
        assert_eq!(Ctl::from(5u16).seq_len(), 2);
    }
}
