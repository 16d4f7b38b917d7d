/// Renders a datagram for trace logs. Printable ASCII stays as is, NUL becomes ␀ and every
/// other byte is drawn as the braille cell with the same bit pattern.
pub fn strip(raw: &[u8]) -> String {
    raw.iter().map(|&b| match b {
        0 => '\u{2400}',
        b' '..=b'~' => b as char,
        b => braille(b),
    }).collect()
}

fn braille(byte: u8) -> char {
    char::from_u32(0x2800 + byte as u32).unwrap_or('?')
}
