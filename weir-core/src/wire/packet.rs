//! The typed view over a TCP segment header.
//!
//! [`TcpHeader`] exposes every field in host order; [`TcpHeaderBuilder`]
//! assembles outgoing headers and computes the checksum over the IPv4
//! pseudo-header and segment text. Parsing and serialization are the only
//! places in the crate that touch network byte order.

use super::{
    checksum::Checksum,
    options::{self, OptionError, TcpOption},
};
use crate::{endpoint::Ipv4Address, message::Message};

/// The length of a TCP header without options.
pub const MIN_HEADER_LEN: usize = 20;

/// The longest possible TCP header, with a full option region.
pub const MAX_HEADER_LEN: usize = 60;

/// The IPv4 protocol number for TCP, used in the pseudo-header.
pub const PROTOCOL_TCP: u8 = 6;

/// The TCP control bits. From the least significant bit: FIN, SYN, RST,
/// PSH, ACK, URG, ECE, CWR, NS. On the wire the low eight live in the flags
/// byte and NS sits in bit 0 of the data-offset byte.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Control(u16);

macro_rules! control_bit {
    ($get:ident, $set:ident, $bit:expr) => {
        pub fn $get(&self) -> bool {
            self.0 >> $bit & 1 == 1
        }

        pub fn $set(&mut self, value: bool) {
            self.0 = self.0 & !(1 << $bit) | (value as u16) << $bit;
        }
    };
}

impl Control {
    control_bit!(fin, set_fin, 0);
    control_bit!(syn, set_syn, 1);
    control_bit!(rst, set_rst, 2);
    control_bit!(psh, set_psh, 3);
    control_bit!(ack, set_ack, 4);
    control_bit!(urg, set_urg, 5);
    control_bit!(ece, set_ece, 6);
    control_bit!(cwr, set_cwr, 7);
    control_bit!(ns, set_ns, 8);

    /// The low eight flags as they appear in the header's flags byte.
    pub fn flags_byte(&self) -> u8 {
        self.0 as u8
    }

    fn from_wire(offset_byte: u8, flags_byte: u8) -> Self {
        Self((offset_byte as u16 & 1) << 8 | flags_byte as u16)
    }
}

/// A TCP header with its fields in host order and its options decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub ctl: Control,
    pub wnd: u16,
    pub checksum: u16,
    pub urgent: u16,
    pub options: Vec<TcpOption>,
}

impl TcpHeader {
    /// Parses and validates a header from the front of `message`, which must
    /// hold an entire TCP segment. The addresses are needed for the
    /// pseudo-header part of the checksum. Returns the header and the data
    /// offset in bytes.
    pub fn from_message(
        message: &Message,
        src: Ipv4Address,
        dst: Ipv4Address,
    ) -> Result<(Self, usize), PacketError> {
        let len = message.len();
        if len < MIN_HEADER_LEN {
            return Err(PacketError::HeaderTooShort);
        }

        let mut iter = message.iter();
        let mut fixed = [0u8; MIN_HEADER_LEN];
        for byte in fixed.iter_mut() {
            *byte = iter.next().ok_or(PacketError::HeaderTooShort)?;
        }

        let data_offset = (fixed[12] >> 4) as usize * 4;
        if !(MIN_HEADER_LEN..=MAX_HEADER_LEN).contains(&data_offset) || data_offset > len {
            return Err(PacketError::InvalidOffset(fixed[12] >> 4));
        }

        let mut option_region = vec![0u8; data_offset - MIN_HEADER_LEN];
        for byte in option_region.iter_mut() {
            *byte = iter.next().ok_or(PacketError::HeaderTooShort)?;
        }
        let options = options::parse_options(&option_region)?;

        let expected_checksum = u16::from_be_bytes([fixed[16], fixed[17]]);
        let mut checksum = Checksum::new();
        checksum.add_u32(src.octets());
        checksum.add_u32(dst.octets());
        checksum.add_u8(0, PROTOCOL_TCP);
        checksum.add_u16(len as u16);
        // Sum the whole segment with the checksum field read as zero.
        let mut bytes = message
            .iter()
            .enumerate()
            .map(|(i, byte)| if i == 16 || i == 17 { 0 } else { byte });
        checksum.accumulate_remainder(&mut bytes);
        let actual = checksum.as_u16();
        if actual != expected_checksum {
            return Err(PacketError::InvalidChecksum {
                actual,
                expected: expected_checksum,
            });
        }

        Ok((
            TcpHeader {
                src_port: u16::from_be_bytes([fixed[0], fixed[1]]),
                dst_port: u16::from_be_bytes([fixed[2], fixed[3]]),
                seq: u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]),
                ack: u32::from_be_bytes([fixed[8], fixed[9], fixed[10], fixed[11]]),
                ctl: Control::from_wire(fixed[12], fixed[13]),
                wnd: u16::from_be_bytes([fixed[14], fixed[15]]),
                checksum: expected_checksum,
                urgent: u16::from_be_bytes([fixed[18], fixed[19]]),
                options,
            },
            data_offset,
        ))
    }

    /// Serializes the header, options included, to its wire representation.
    pub fn serialize(&self) -> Vec<u8> {
        let option_region = options::write_options(&self.options);
        let offset_words = ((MIN_HEADER_LEN + option_region.len()) / 4) as u8;
        let mut out = Vec::with_capacity(MIN_HEADER_LEN + option_region.len());
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.push(offset_words << 4 | self.ctl.ns() as u8);
        out.push(self.ctl.flags_byte());
        out.extend_from_slice(&self.wnd.to_be_bytes());
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.extend_from_slice(&self.urgent.to_be_bytes());
        out.extend_from_slice(&option_region);
        out
    }

    /// The header length in bytes, options and padding included.
    pub fn data_offset(&self) -> usize {
        MIN_HEADER_LEN + options::write_options(&self.options).len()
    }

    /// The MSS option value, if present.
    pub fn mss(&self) -> Option<u16> {
        self.options.iter().find_map(|option| match option {
            TcpOption::Mss(mss) => Some(*mss),
            _ => None,
        })
    }

    /// The window scale option value, if present.
    pub fn window_scale(&self) -> Option<u8> {
        self.options.iter().find_map(|option| match option {
            TcpOption::WindowScale(shift) => Some(*shift),
            _ => None,
        })
    }

    /// The timestamp option (TSval, TSecr), if present.
    pub fn timestamps(&self) -> Option<(u32, u32)> {
        self.options.iter().find_map(|option| match option {
            TcpOption::Timestamps { value, echo } => Some((*value, *echo)),
            _ => None,
        })
    }
}

/// Assembles an outgoing [`TcpHeader`].
#[derive(Debug, Clone)]
pub struct TcpHeaderBuilder(TcpHeader);

impl TcpHeaderBuilder {
    pub fn new(src_port: u16, dst_port: u16, seq: u32) -> Self {
        Self(TcpHeader {
            src_port,
            dst_port,
            seq,
            ack: 0,
            ctl: Control::default(),
            wnd: 0,
            checksum: 0,
            urgent: 0,
            options: Vec::new(),
        })
    }

    /// Sets the acknowledgment number and the ACK control bit.
    pub fn ack(mut self, ack: u32) -> Self {
        self.0.ack = ack;
        self.0.ctl.set_ack(true);
        self
    }

    pub fn syn(mut self) -> Self {
        self.0.ctl.set_syn(true);
        self
    }

    pub fn fin(mut self) -> Self {
        self.0.ctl.set_fin(true);
        self
    }

    pub fn rst(mut self) -> Self {
        self.0.ctl.set_rst(true);
        self
    }

    pub fn psh(mut self) -> Self {
        self.0.ctl.set_psh(true);
        self
    }

    pub fn wnd(mut self, wnd: u16) -> Self {
        self.0.wnd = wnd;
        self
    }

    pub fn mss(mut self, mss: u16) -> Self {
        self.0.options.push(TcpOption::Mss(mss));
        self
    }

    pub fn window_scale(mut self, shift: u8) -> Self {
        self.0.options.push(TcpOption::WindowScale(shift));
        self
    }

    pub fn timestamps(mut self, value: u32, echo: u32) -> Self {
        self.0.options.push(TcpOption::Timestamps { value, echo });
        self
    }

    /// Finishes the header, computing the checksum over the pseudo-header,
    /// the header itself, and the segment text.
    pub fn build(
        mut self,
        src: Ipv4Address,
        dst: Ipv4Address,
        mut text: impl Iterator<Item = u8>,
        text_len: usize,
    ) -> Result<TcpHeader, PacketError> {
        let segment_len = self.0.data_offset() + text_len;
        if segment_len > u16::MAX as usize {
            return Err(PacketError::SegmentTooLong(segment_len));
        }

        let mut checksum = Checksum::new();
        checksum.add_u32(src.octets());
        checksum.add_u32(dst.octets());
        checksum.add_u8(0, PROTOCOL_TCP);
        checksum.add_u16(segment_len as u16);
        // The serialized header has the checksum field still zeroed here.
        checksum.add_slice(&self.0.serialize());
        checksum.accumulate_remainder(&mut text);

        self.0.checksum = checksum.as_u16();
        Ok(self.0)
    }
}

/// The segment could not be decoded or assembled. Parse failures are always
/// local: the packet is dropped and no connection state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("The segment is shorter than a TCP header")]
    HeaderTooShort,
    #[error("Bad data offset: {0} words")]
    InvalidOffset(u8),
    #[error("Checksum mismatch: computed {actual:#06x}, segment carries {expected:#06x}")]
    InvalidChecksum { actual: u16, expected: u16 },
    #[error(transparent)]
    BadOption(#[from] OptionError),
    #[error("Segment length {0} overflows the pseudo-header length field")]
    SegmentTooLong(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
    const DST: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);

    fn segment(header: &TcpHeader, text: &[u8]) -> Message {
        let mut message = Message::new(text);
        message.header(header.serialize());
        message
    }

    #[test]
    fn round_trip() -> anyhow::Result<()> {
        let text = b"Hello, world!";
        let header = TcpHeaderBuilder::new(0xcafe, 0xbabe, 123456789)
            .ack(10)
            .psh()
            .wnd(1024)
            .build(SRC, DST, text.iter().cloned(), text.len())?;
        let message = segment(&header, text);
        let (parsed, data_offset) = TcpHeader::from_message(&message, SRC, DST)?;
        assert_eq!(parsed, header);
        assert_eq!(data_offset, 20);
        Ok(())
    }

    #[test]
    fn matches_etherparse() -> anyhow::Result<()> {
        let text = b"Hello, world!";
        let mut expected = etherparse::TcpHeader::new(0xcafe, 0xbabe, 123456789, 1024);
        expected.acknowledgment_number = 10;
        expected.ack = true;
        expected.psh = true;
        let ip_header = etherparse::Ipv4Header::new(
            (expected.header_len() as usize + text.len()) as u16,
            30,
            PROTOCOL_TCP,
            SRC.octets(),
            DST.octets(),
        );
        expected.checksum = expected.calc_checksum_ipv4(&ip_header, text)?;
        let mut serial = vec![];
        expected.write(&mut serial)?;
        serial.extend_from_slice(text);

        let message = Message::new(serial);
        let (parsed, _) = TcpHeader::from_message(&message, SRC, DST)?;
        assert_eq!(parsed.src_port, 0xcafe);
        assert_eq!(parsed.dst_port, 0xbabe);
        assert_eq!(parsed.seq, 123456789);
        assert_eq!(parsed.ack, 10);
        assert!(parsed.ctl.ack());
        assert!(parsed.ctl.psh());
        assert!(!parsed.ctl.syn());
        assert_eq!(parsed.wnd, 1024);
        assert_eq!(parsed.checksum, expected.checksum);

        // And the other direction: our serialization should parse and
        // checksum identically under etherparse.
        let ours = TcpHeaderBuilder::new(0xcafe, 0xbabe, 123456789)
            .ack(10)
            .psh()
            .wnd(1024)
            .build(SRC, DST, text.iter().cloned(), text.len())?;
        assert_eq!(ours.checksum, expected.checksum);
        Ok(())
    }

    #[test]
    fn syn_options_survive_the_wire() -> anyhow::Result<()> {
        let header = TcpHeaderBuilder::new(80, 4000, 42)
            .syn()
            .wnd(4096)
            .mss(1460)
            .window_scale(5)
            .timestamps(100, 0)
            .build(SRC, DST, [].into_iter(), 0)?;
        let message = segment(&header, &[]);
        let (parsed, data_offset) = TcpHeader::from_message(&message, SRC, DST)?;
        assert_eq!(data_offset, 40);
        assert_eq!(parsed.mss(), Some(1460));
        assert_eq!(parsed.window_scale(), Some(5));
        assert_eq!(parsed.timestamps(), Some((100, 0)));
        Ok(())
    }

    #[test]
    fn corrupted_text_fails_the_checksum() -> anyhow::Result<()> {
        let text = b"payload";
        let header = TcpHeaderBuilder::new(1, 2, 3)
            .ack(4)
            .wnd(100)
            .build(SRC, DST, text.iter().cloned(), text.len())?;
        let message = segment(&header, b"paYload");
        assert!(matches!(
            TcpHeader::from_message(&message, SRC, DST),
            Err(PacketError::InvalidChecksum { .. })
        ));
        Ok(())
    }

    #[test]
    fn truncated_header_is_rejected() {
        let message = Message::new(&[0u8; 12]);
        assert_eq!(
            TcpHeader::from_message(&message, SRC, DST),
            Err(PacketError::HeaderTooShort)
        );
    }

    #[test]
    fn bad_offset_is_rejected() {
        // Data offset of 2 words is below the minimum of 5.
        let mut bytes = vec![0u8; 20];
        bytes[12] = 2 << 4;
        let message = Message::new(bytes);
        assert_eq!(
            TcpHeader::from_message(&message, SRC, DST),
            Err(PacketError::InvalidOffset(2))
        );
    }

    #[test]
    fn ns_bit_round_trips() {
        let mut ctl = Control::default();
        ctl.set_ns(true);
        ctl.set_fin(true);
        let header = TcpHeader {
            src_port: 1,
            dst_port: 2,
            seq: 3,
            ack: 0,
            ctl,
            wnd: 0,
            checksum: 0,
            urgent: 0,
            options: Vec::new(),
        };
        let serial = header.serialize();
        assert_eq!(serial[12] & 1, 1);
        assert_eq!(serial[13], 0b0000_0001);
        let restored = Control::from_wire(serial[12], serial[13]);
        assert!(restored.ns());
        assert!(restored.fin());
        assert!(!restored.syn());
    }
}
