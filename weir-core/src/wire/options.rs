//! The TCP option codec.
//!
//! Only the options the connection machine negotiates are represented
//! explicitly. Unknown kinds are skipped by their length octet; a missing,
//! zero, or overlong length fails the whole packet.

/// A single TCP option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOption {
    /// Kind 0. Terminates the option list.
    End,
    /// Kind 1. Padding.
    NoOp,
    /// Kind 2. Maximum segment size, valid on SYN segments only.
    Mss(u16),
    /// Kind 3. Window scale shift count, valid on SYN segments only.
    WindowScale(u8),
    /// Kind 4. Selective acknowledgment permitted. Parsed and ignored.
    SackPermitted,
    /// Kind 8. RFC 7323 timestamps.
    Timestamps { value: u32, echo: u32 },
}

impl TcpOption {
    pub const KIND_END: u8 = 0;
    pub const KIND_NOP: u8 = 1;
    pub const KIND_MSS: u8 = 2;
    pub const KIND_WS: u8 = 3;
    pub const KIND_SACK_PERMITTED: u8 = 4;
    pub const KIND_TS: u8 = 8;

    /// The number of bytes the option occupies on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            TcpOption::End | TcpOption::NoOp => 1,
            TcpOption::Mss(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::SackPermitted => 2,
            TcpOption::Timestamps { .. } => 10,
        }
    }

    /// Appends the option's wire representation.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        match *self {
            TcpOption::End => out.push(Self::KIND_END),
            TcpOption::NoOp => out.push(Self::KIND_NOP),
            TcpOption::Mss(mss) => {
                out.extend_from_slice(&[Self::KIND_MSS, 4]);
                out.extend_from_slice(&mss.to_be_bytes());
            }
            TcpOption::WindowScale(shift) => {
                out.extend_from_slice(&[Self::KIND_WS, 3, shift]);
            }
            TcpOption::SackPermitted => {
                out.extend_from_slice(&[Self::KIND_SACK_PERMITTED, 2]);
            }
            TcpOption::Timestamps { value, echo } => {
                out.extend_from_slice(&[Self::KIND_TS, 10]);
                out.extend_from_slice(&value.to_be_bytes());
                out.extend_from_slice(&echo.to_be_bytes());
            }
        }
    }
}

/// The option region could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OptionError {
    #[error("Option kind {kind} has a zero or overlong length")]
    BadLength { kind: u8 },
    #[error("Option kind {kind} has the wrong length {len}")]
    WrongLength { kind: u8, len: u8 },
}

/// Parses the option region of a TCP header. Unknown options are skipped by
/// their length.
pub fn parse_options(mut region: &[u8]) -> Result<Vec<TcpOption>, OptionError> {
    let mut options = Vec::new();
    while let Some(&kind) = region.first() {
        match kind {
            TcpOption::KIND_END => break,
            TcpOption::KIND_NOP => {
                options.push(TcpOption::NoOp);
                region = &region[1..];
                continue;
            }
            _ => {}
        }

        let len = match region.get(1) {
            Some(&len) if len >= 2 && len as usize <= region.len() => len,
            _ => return Err(OptionError::BadLength { kind }),
        };
        let body = &region[2..len as usize];

        let expect = |want: u8| {
            if len == want {
                Ok(())
            } else {
                Err(OptionError::WrongLength { kind, len })
            }
        };

        match kind {
            TcpOption::KIND_MSS => {
                expect(4)?;
                options.push(TcpOption::Mss(u16::from_be_bytes([body[0], body[1]])));
            }
            TcpOption::KIND_WS => {
                expect(3)?;
                options.push(TcpOption::WindowScale(body[0]));
            }
            TcpOption::KIND_SACK_PERMITTED => {
                expect(2)?;
                options.push(TcpOption::SackPermitted);
            }
            TcpOption::KIND_TS => {
                expect(10)?;
                options.push(TcpOption::Timestamps {
                    value: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                    echo: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
                });
            }
            _ => {
                // Unknown option. The length octet lets us step over it.
            }
        }
        region = &region[len as usize..];
    }
    Ok(options)
}

/// Serializes a list of options, padded with END octets to a multiple of
/// four bytes. Returns the padded region.
pub fn write_options(options: &[TcpOption]) -> Vec<u8> {
    let mut out = Vec::new();
    for option in options {
        option.write_to(&mut out);
    }
    while out.len() % 4 != 0 {
        out.push(TcpOption::KIND_END);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syn_options_round_trip() {
        let options = [
            TcpOption::Mss(1460),
            TcpOption::WindowScale(7),
            TcpOption::Timestamps {
                value: 0xdeadbeef,
                echo: 0,
            },
        ];
        let wire = write_options(&options);
        assert_eq!(wire.len() % 4, 0);
        let parsed = parse_options(&wire).unwrap();
        assert_eq!(parsed, options);
    }

    #[test]
    fn unknown_option_is_skipped() {
        // Kind 30 with length 6, followed by an MSS option.
        let wire = [30, 6, 1, 2, 3, 4, 2, 4, 0x05, 0xb4];
        let parsed = parse_options(&wire).unwrap();
        assert_eq!(parsed, [TcpOption::Mss(1460)]);
    }

    #[test]
    fn nop_padding_is_preserved() {
        let wire = [1, 1, 3, 3, 14];
        let parsed = parse_options(&wire).unwrap();
        assert_eq!(
            parsed,
            [
                TcpOption::NoOp,
                TcpOption::NoOp,
                TcpOption::WindowScale(14)
            ]
        );
    }

    #[test]
    fn zero_length_fails() {
        assert_eq!(
            parse_options(&[2, 0, 5, 5]),
            Err(OptionError::BadLength { kind: 2 })
        );
    }

    #[test]
    fn overlong_length_fails() {
        assert_eq!(
            parse_options(&[8, 10, 1, 2]),
            Err(OptionError::BadLength { kind: 8 })
        );
    }

    #[test]
    fn wrong_fixed_length_fails() {
        assert_eq!(
            parse_options(&[2, 3, 1]),
            Err(OptionError::WrongLength { kind: 2, len: 3 })
        );
    }

    #[test]
    fn end_terminates_parsing() {
        let wire = [0, 2, 4, 0x05, 0xb4];
        assert_eq!(parse_options(&wire).unwrap(), []);
    }
}
