//! Path splitting and the case-folded name hash used to speed up lookups.

/// Splits a volume path into its components. Both `/` and `\` separate
/// components, repeated separators collapse, and `.` components are dropped.
/// An empty result designates the root directory.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split(|c| c == '/' || c == '\\')
        .filter(|node| !node.is_empty() && *node != ".")
        .collect()
}

/// 16-bit rolling hash over the ASCII-lowercased name: add each byte, then
/// rotate right by three.
pub fn name_hash(name: &[u8]) -> u16 {
    name.iter().fold(0u16, |v, c| {
        v.wrapping_add(u16::from(c.to_ascii_lowercase()))
            .rotate_right(3)
    })
}

/// Compares `wanted` against the NUL-terminated name starting at the head of
/// `stored`, ignoring ASCII case. The stored name must end exactly where
/// `wanted` does.
pub fn name_matches(stored: &[u8], wanted: &[u8]) -> bool {
    match stored.get(wanted.len()) {
        Some(0) => stored[..wanted.len()].eq_ignore_ascii_case(wanted),
        _ => false,
    }
}
