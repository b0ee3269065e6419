//! Reversible mapping between arbitrary byte blobs (aliases, process names, user ids) and
//! file-system legal ASCII names.
//!
//! Bytes in `'0'..='~'` pass through. Every other byte `b` becomes the pair
//! `'+' + (b >> 6)`, `'0' + (b & 0x3F)`. The escape introducers `'+'..='.'` sit below `'0'`,
//! so they never collide with a pass-through byte. Finally the characters some file systems
//! refuse (`: < > ? \ |`) are swapped for `# $ % & ( )`, which no earlier step can produce.

use crate::error::{HksError, HksResult};

const UNSAFE_CHARS: [u8; 6] = [b':', b'<', b'>', b'?', b'\\', b'|'];
const SAFE_CHARS: [u8; 6] = [b'#', b'$', b'%', b'&', b'(', b')'];

fn to_safe(c: u8) -> u8 {
    match UNSAFE_CHARS.iter().position(|&u| u == c) {
        Some(idx) => SAFE_CHARS[idx],
        None => c,
    }
}

fn from_safe(c: u8) -> u8 {
    match SAFE_CHARS.iter().position(|&s| s == c) {
        Some(idx) => UNSAFE_CHARS[idx],
        None => c,
    }
}

/// Encode `blob` into a file name. `limit` is the size of the destination buffer in the
/// C sense: at most `limit - 1` characters fit, anything longer is `InsufficientData`.
pub fn encode_name(blob: &[u8], limit: usize) -> HksResult<String> {
    let capacity = limit.saturating_sub(1);
    let mut out = Vec::with_capacity(blob.len().min(capacity));
    for &b in blob {
        match b {
            b'0'..=b'~' => push_checked(&mut out, b, capacity)?,
            _ => {
                push_checked(&mut out, b'+' + (b >> 6), capacity)?;
                push_checked(&mut out, b'0' + (b & 0x3F), capacity)?;
            }
        }
    }
    for c in out.iter_mut() {
        *c = to_safe(*c);
    }
    // every byte is ASCII at this point
    String::from_utf8(out).map_err(HksError::internal)
}

fn push_checked(out: &mut Vec<u8>, c: u8, capacity: usize) -> HksResult<()> {
    if out.len() >= capacity {
        return Err(HksError::InsufficientData {
            required: out.len() + 1,
            available: capacity,
        });
    }
    out.push(c);
    Ok(())
}

/// Reverse [`encode_name`]. Names no encoder could have produced are reported as
/// `InvalidKeyFile`; a result longer than `capacity` bytes is `BufferTooSmall`.
pub fn decode_name(name: &str, capacity: usize) -> HksResult<Vec<u8>> {
    let mut out = Vec::with_capacity(name.len().min(capacity));
    let mut pending: Option<u8> = None;
    for raw in name.bytes() {
        if UNSAFE_CHARS.contains(&raw) {
            return Err(HksError::corrupt(format!(
                "illegal character {:?} in stored name",
                raw as char
            )));
        }
        let c = from_safe(raw);
        let decoded = match (c, pending) {
            (b'0'..=b'o', Some(high)) => {
                pending = None;
                high | (c - b'0')
            }
            (_, Some(_)) => {
                return Err(HksError::corrupt("malformed escape sequence in stored name"));
            }
            (b'+'..=b'.', None) => {
                pending = Some((c - b'+') << 6);
                continue;
            }
            (b'0'..=b'~', None) => c,
            _ => {
                return Err(HksError::corrupt(format!(
                    "illegal character {:?} in stored name",
                    c as char
                )));
            }
        };
        if out.len() >= capacity {
            return Err(HksError::BufferTooSmall {
                required: out.len() + 1,
                available: capacity,
            });
        }
        out.push(decoded);
    }
    if pending.is_some() {
        return Err(HksError::corrupt("truncated escape sequence in stored name"));
    }
    Ok(out)
}
