//! Composite row keys.
//!
//! Each component is written as `u16 BE length ‖ bytes`. Prefix scans over
//! the leading components therefore never match a longer component that
//! merely starts with the same text.

/// Encode components into a row key.
pub fn compose(parts: &[&str]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len() + 2).sum());
    for part in parts {
        let len = u16::try_from(part.len()).unwrap_or(u16::MAX);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&part.as_bytes()[..len as usize]);
    }
    out
}

/// Prefix matching every key whose leading components equal `parts`.
pub fn prefix(parts: &[&str]) -> Vec<u8> {
    compose(parts)
}
