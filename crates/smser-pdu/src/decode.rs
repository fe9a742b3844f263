//! SMS-DELIVER PDU decoding.
//!
//! A PDU read with `AT+CMGR` in PDU mode is laid out as:
//!
//! ```text
//! +------+------+----+-----+-----+---------+-----+-------+
//! | SMSC | type | OA | PID | DCS | SCTS(7) | UDL | UD... |
//! +------+------+----+-----+-----+---------+-----+-------+
//! ```
//!
//! - SMSC: length octet, then that many octets (skipped)
//! - type: message type indicator in bits 0-1 (`00` = SMS-DELIVER),
//!   user data header indicator in bit 6
//! - OA: originating address, length in digits, type of address, digits
//! - SCTS: service centre timestamp, swapped-nibble BCD with zone in quarters
//! - UDL: user data length in septets (GSM 7-bit) or octets (8-bit, UCS-2)

use chrono::{DateTime, FixedOffset, NaiveDate};

use crate::error::{PduError, PduResult};
use crate::gsm7;

/// Message type indicator for SMS-DELIVER.
const MTI_DELIVER: u8 = 0x00;

/// User data header indicator bit of the first octet.
const UDHI_FLAG: u8 = 0x40;

/// Type-of-number bits for international numbers.
const TON_INTERNATIONAL: u8 = 0x10;

/// Type-of-number bits for alphanumeric (GSM 7-bit) senders.
const TON_ALPHANUMERIC: u8 = 0x50;

/// Information element: concatenated message, 8-bit reference.
const IEI_CONCAT_8: u8 = 0x00;

/// Information element: concatenated message, 16-bit reference.
const IEI_CONCAT_16: u8 = 0x08;

/// User data alphabet selected by the data coding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alphabet {
    /// GSM 03.38 7-bit default alphabet.
    Gsm7,
    /// Uninterpreted 8-bit data.
    EightBit,
    /// UCS-2, big-endian.
    Ucs2,
}

impl Alphabet {
    /// Alphabet for a data coding scheme octet.
    pub fn from_dcs(dcs: u8) -> Alphabet {
        let by_bits = |bits: u8| match (bits >> 2) & 0x03 {
            0x01 => Alphabet::EightBit,
            0x02 => Alphabet::Ucs2,
            _ => Alphabet::Gsm7,
        };
        match dcs >> 4 {
            0x0..=0x7 => by_bits(dcs),
            0xE => Alphabet::Ucs2,
            0xF => {
                if dcs & 0x04 != 0 {
                    Alphabet::EightBit
                } else {
                    Alphabet::Gsm7
                }
            }
            _ => Alphabet::Gsm7,
        }
    }
}

/// Position of one part within a concatenated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcatInfo {
    /// Reference shared by all parts of the message.
    pub reference: u16,
    /// Number of parts.
    pub total: u8,
    /// This part's 1-based sequence number.
    pub sequence: u8,
}

/// A decoded SMS-DELIVER message.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliverPdu {
    /// Originating address, `+` prefixed for international numbers.
    pub sender: String,
    /// Service centre timestamp.
    pub timestamp: DateTime<FixedOffset>,
    /// Message text.
    pub body: String,
    /// Set when this is one part of a concatenated message.
    pub partial: Option<ConcatInfo>,
}

impl DeliverPdu {
    /// Whether this is one part of a concatenated message.
    pub fn is_partial(&self) -> bool {
        self.partial.is_some()
    }
}

/// Decode an SMS-DELIVER PDU given as hex text.
pub fn decode_deliver(pdu: &str) -> PduResult<DeliverPdu> {
    let data = hex::decode(pdu.trim()).map_err(|e| PduError::InvalidHex(e.to_string()))?;
    let mut reader = Reader::new(&data);

    let smsc_len = reader.byte()?;
    reader.take(usize::from(smsc_len))?;

    let first = reader.byte()?;
    if first & 0x03 != MTI_DELIVER {
        return Err(PduError::UnsupportedMessageType(first & 0x03));
    }
    let has_header = first & UDHI_FLAG != 0;

    let sender = decode_address(&mut reader)?;
    let _pid = reader.byte()?;
    let alphabet = Alphabet::from_dcs(reader.byte()?);
    let timestamp = decode_timestamp(reader.take(7)?)?;

    let udl = usize::from(reader.byte()?);
    let ud = reader.rest();
    let (body, partial) = decode_user_data(ud, udl, alphabet, has_header)?;

    Ok(DeliverPdu {
        sender,
        timestamp,
        body,
        partial,
    })
}

/// Decode UCS-2 text given as hex, as modems report USSD replies with DCS 72.
pub fn decode_ucs2_hex(text: &str) -> PduResult<String> {
    let data = hex::decode(text.trim()).map_err(|e| PduError::InvalidHex(e.to_string()))?;
    decode_ucs2(&data)
}

// ============================================================================
// Fields
// ============================================================================

fn decode_address(reader: &mut Reader<'_>) -> PduResult<String> {
    let digits = usize::from(reader.byte()?);
    let toa = reader.byte()?;
    let raw = reader.take(digits.div_ceil(2))?;

    if toa & 0x70 == TON_ALPHANUMERIC {
        let count = digits * 4 / 7;
        let mut septets = gsm7::unpack_septets(raw, count)
            .ok_or_else(|| PduError::InvalidAddress(hex::encode_upper(raw)))?;
        // A septet made only of padding bits.
        if count * 7 == raw.len() * 8 && septets.last() == Some(&0) {
            septets.pop();
        }
        return Ok(gsm7::decode_septets(&septets));
    }

    let mut number = String::with_capacity(digits + 1);
    if toa & 0x70 == TON_INTERNATIONAL {
        number.push('+');
    }
    for &octet in raw {
        for nibble in [octet & 0x0F, octet >> 4] {
            match nibble {
                0..=9 => number.push(char::from(b'0' + nibble)),
                0xF => {}
                0xA => number.push('*'),
                0xB => number.push('#'),
                _ => return Err(PduError::InvalidAddress(hex::encode_upper(raw))),
            }
        }
    }
    Ok(number)
}

fn swapped_bcd(octet: u8) -> PduResult<u32> {
    let (low, high) = (octet & 0x0F, octet >> 4);
    if low > 9 || high > 9 {
        return Err(PduError::InvalidTimestamp(format!("{:02X}", octet)));
    }
    Ok(u32::from(low) * 10 + u32::from(high))
}

fn decode_timestamp(raw: &[u8]) -> PduResult<DateTime<FixedOffset>> {
    let mut fields = [0u32; 6];
    for (field, &octet) in fields.iter_mut().zip(raw) {
        *field = swapped_bcd(octet)?;
    }
    let [yy, month, day, hour, minute, second] = fields;
    // Two-digit years: 90-99 are the 1990s, everything else this century.
    let year = if yy >= 90 { 1900 + yy } else { 2000 + yy };

    let zone = raw[6];
    let quarters = i32::from(zone & 0x07) * 10 + i32::from(zone >> 4);
    let signed = if zone & 0x08 != 0 { -quarters } else { quarters };
    let offset_secs = signed * 15 * 60;

    let invalid = || PduError::InvalidTimestamp(hex::encode_upper(raw));
    let offset = FixedOffset::east_opt(offset_secs).ok_or_else(invalid)?;
    let naive = NaiveDate::from_ymd_opt(year as i32, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .ok_or_else(invalid)?;
    naive.and_local_timezone(offset).single().ok_or_else(invalid)
}

fn decode_user_data(
    ud: &[u8],
    udl: usize,
    alphabet: Alphabet,
    has_header: bool,
) -> PduResult<(String, Option<ConcatInfo>)> {
    let header_len = if has_header {
        let udhl = usize::from(*ud.first().ok_or(PduError::Truncated { offset: 0, needed: 1 })?);
        if ud.len() < udhl + 1 {
            return Err(PduError::Truncated {
                offset: 1,
                needed: udhl,
            });
        }
        udhl + 1
    } else {
        0
    };
    let partial = if has_header {
        parse_concat(&ud[1..header_len])
    } else {
        None
    };

    let body = match alphabet {
        Alphabet::Gsm7 => {
            let septets = gsm7::unpack_septets(ud, udl).ok_or(PduError::Truncated {
                offset: 0,
                needed: (udl * 7).div_ceil(8),
            })?;
            // The header is padded out to a septet boundary.
            let skip = (header_len * 8).div_ceil(7).min(septets.len());
            gsm7::decode_septets(&septets[skip..])
        }
        Alphabet::EightBit | Alphabet::Ucs2 => {
            if ud.len() < udl {
                return Err(PduError::Truncated {
                    offset: 0,
                    needed: udl,
                });
            }
            let payload = &ud[header_len.min(udl)..udl];
            if alphabet == Alphabet::Ucs2 {
                decode_ucs2(payload)?
            } else {
                payload.iter().map(|&b| char::from(b)).collect()
            }
        }
    };

    Ok((body, partial))
}

fn parse_concat(mut header: &[u8]) -> Option<ConcatInfo> {
    while header.len() >= 2 {
        let (iei, len) = (header[0], usize::from(header[1]));
        let value = header.get(2..2 + len)?;
        match (iei, value) {
            (IEI_CONCAT_8, &[reference, total, sequence]) => {
                return Some(ConcatInfo {
                    reference: u16::from(reference),
                    total,
                    sequence,
                });
            }
            (IEI_CONCAT_16, &[hi, lo, total, sequence]) => {
                return Some(ConcatInfo {
                    reference: u16::from_be_bytes([hi, lo]),
                    total,
                    sequence,
                });
            }
            _ => header = &header[2 + len..],
        }
    }
    None
}

fn decode_ucs2(data: &[u8]) -> PduResult<String> {
    if data.len() % 2 != 0 {
        return Err(PduError::InvalidUcs2);
    }
    let units = data.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]]));
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|_| PduError::InvalidUcs2)
}

// ============================================================================
// Reader
// ============================================================================

/// Bounds-checked cursor over the PDU octets.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> PduResult<&'a [u8]> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(PduError::Truncated {
                offset: self.pos,
                needed: len,
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> PduResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }
}
