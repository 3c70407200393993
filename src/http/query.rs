//! Percent codec and `application/x-www-form-urlencoded` pair parsing.

use memchr::memchr;
use std::collections::HashMap;

/// A malformed percent escape (`%` not followed by two hex digits).
///
/// Any occurrence fails the whole request with `400 Bad Request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BadEscape;

#[inline]
fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Percent-decodes `src`; `+` decodes to space when `plus_as_space` is set
/// (query strings and form bodies), and stays literal otherwise (cookies).
pub(crate) fn decode(src: &[u8], plus_as_space: bool) -> Result<String, BadEscape> {
    let mut bytes = Vec::with_capacity(src.len());
    let mut i = 0;

    while i < src.len() {
        match src[i] {
            b'%' => {
                let hi = src.get(i + 1).copied().and_then(hex_value);
                let lo = src.get(i + 2).copied().and_then(hex_value);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => bytes.push(hi << 4 | lo),
                    _ => return Err(BadEscape),
                }
                i += 3;
            }
            b'+' if plus_as_space => {
                bytes.push(b' ');
                i += 1;
            }
            other => {
                bytes.push(other);
                i += 1;
            }
        }
    }

    match simdutf8::basic::from_utf8(&bytes) {
        Ok(s) => Ok(s.to_owned()),
        Err(_) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

/// Percent-encodes a component the way queries are constructed: unreserved
/// characters pass through, space becomes `+`, everything else `%XX`.
pub(crate) fn encode(src: &str) -> String {
    let mut out = String::with_capacity(src.len());

    for &byte in src.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0').to_ascii_uppercase());
                out.push(char::from_digit((byte & 0xF) as u32, 16).unwrap_or('0').to_ascii_uppercase());
            }
        }
    }
    out
}

/// Parses `key[=value]` pairs separated by `&` into `into`, decoding both
/// sides. Later duplicates overwrite earlier ones.
pub(crate) fn parse_pairs(
    query: &[u8],
    into: &mut HashMap<String, String>,
) -> Result<(), BadEscape> {
    let mut rest = query;

    while !rest.is_empty() {
        let (pair, next) = match memchr(b'&', rest) {
            Some(pos) => (&rest[..pos], &rest[pos + 1..]),
            None => (rest, &[][..]),
        };
        rest = next;

        if pair.is_empty() {
            continue;
        }

        let (key, value) = match memchr(b'=', pair) {
            Some(pos) => (&pair[..pos], &pair[pos + 1..]),
            None => (pair, &[][..]),
        };

        into.insert(decode(key, true)?, decode(value, true)?);
    }

    Ok(())
}
