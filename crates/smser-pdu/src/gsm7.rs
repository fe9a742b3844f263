//! GSM 03.38 7-bit default alphabet.

/// Escape septet switching to the extension table for the next septet.
pub const ESCAPE: u8 = 0x1B;

#[rustfmt::skip]
const DEFAULT_ALPHABET: [char; 128] = [
    '@', '£', '$', '¥', 'è', 'é', 'ù', 'ì', 'ò', 'Ç', '\n', 'Ø', 'ø', '\r', 'Å', 'å',
    'Δ', '_', 'Φ', 'Γ', 'Λ', 'Ω', 'Π', 'Ψ', 'Σ', 'Θ', 'Ξ', '\u{1b}', 'Æ', 'æ', 'ß', 'É',
    ' ', '!', '"', '#', '¤', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/',
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?',
    '¡', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O',
    'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'Ä', 'Ö', 'Ñ', 'Ü', '§',
    '¿', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o',
    'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'ä', 'ö', 'ñ', 'ü', 'à',
];

fn extension(septet: u8) -> Option<char> {
    match septet {
        0x0A => Some('\u{0c}'),
        0x14 => Some('^'),
        0x28 => Some('{'),
        0x29 => Some('}'),
        0x2F => Some('\\'),
        0x3C => Some('['),
        0x3D => Some('~'),
        0x3E => Some(']'),
        0x40 => Some('|'),
        0x65 => Some('€'),
        _ => None,
    }
}

/// Unpack `count` septets from packed user data.
///
/// Returns `None` if `data` is too short to hold them.
pub fn unpack_septets(data: &[u8], count: usize) -> Option<Vec<u8>> {
    if data.len() < (count * 7).div_ceil(8) {
        return None;
    }

    let mut septets = Vec::with_capacity(count);
    for i in 0..count {
        let bit = i * 7;
        let byte = bit / 8;
        let shift = bit % 8;

        let mut value = u16::from(data[byte]) >> shift;
        if shift > 1 {
            value |= u16::from(data[byte + 1]) << (8 - shift);
        }
        septets.push((value & 0x7F) as u8);
    }
    Some(septets)
}

/// Map septets to text, resolving extension-table escapes.
///
/// An escape followed by a septet missing from the extension table yields
/// the default-alphabet character of that septet. A trailing escape is dropped.
pub fn decode_septets(septets: &[u8]) -> String {
    let mut text = String::with_capacity(septets.len());
    let mut iter = septets.iter().copied();
    while let Some(septet) = iter.next() {
        if septet == ESCAPE {
            if let Some(next) = iter.next() {
                text.push(extension(next).unwrap_or(DEFAULT_ALPHABET[usize::from(next & 0x7F)]));
            }
        } else {
            text.push(DEFAULT_ALPHABET[usize::from(septet & 0x7F)]);
        }
    }
    text
}
