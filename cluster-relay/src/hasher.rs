//! Seedless string hashing shared by every worker.
//!
//! Routing only stays consistent across the cluster if every worker (in any
//! language) computes the same bucket for the same key. The fold matches the
//! reference JavaScript client bit for bit: `hash = ((hash << 5) - hash) + unit`
//! over UTF-16 code units in signed 32-bit arithmetic, seeded with the key
//! itself.
//!
//! The seed is the key read as a JavaScript number. A numeric key such as
//! `"123"` or `"0x1f"` starts the fold at its value. Any other key reads as NaN,
//! which collapses the first step to 0, so its first code unit never reaches
//! the hash (`"a"` and `"x"` both hash to 0).

/// Fold `key` into a signed 32-bit hash.
pub fn string_hash(key: &str) -> i32 {
    let mut units = key.encode_utf16();
    let Some(first) = units.next() else {
        return 0;
    };

    let seed = to_number(key);
    let first_step = f64::from(to_int32(seed).wrapping_shl(5)) - seed + f64::from(first);
    units.fold(to_int32(first_step), |hash, unit| {
        hash.wrapping_mul(31).wrapping_add(i32::from(unit))
    })
}

/// Map `key` to a bucket in `[0, modulo)`.
///
/// Returns `None` when `modulo` is zero.
#[inline]
pub fn hash_to_index(key: &str, modulo: usize) -> Option<usize> {
    if modulo == 0 {
        return None;
    }
    // i64 so that |i32::MIN| does not overflow.
    let magnitude = i64::from(string_hash(key)).unsigned_abs();
    Some((magnitude % modulo as u64) as usize)
}

/// JavaScript `ToInt32`: non-finite values become 0, the rest wrap modulo 2^32.
fn to_int32(value: f64) -> i32 {
    if !value.is_finite() {
        return 0;
    }
    value.trunc().rem_euclid(4_294_967_296.0) as u32 as i32
}

/// JavaScript `ToNumber` applied to a string.
fn to_number(key: &str) -> f64 {
    let text = key.trim_matches(is_js_whitespace);
    if text.is_empty() {
        return 0.0;
    }

    let radix = match text.get(..2) {
        Some("0x" | "0X") => Some(16),
        Some("0o" | "0O") => Some(8),
        Some("0b" | "0B") => Some(2),
        _ => None,
    };
    if let Some(radix) = radix {
        return radix_literal(&text[2..], radix);
    }

    let (negative, body) = match text.as_bytes()[0] {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    if body == "Infinity" {
        return if negative { f64::NEG_INFINITY } else { f64::INFINITY };
    }
    // `f64::from_str` also takes "inf" and "nan", so the literal is checked first.
    if !is_decimal_literal(body) {
        return f64::NAN;
    }
    text.parse().unwrap_or(f64::NAN)
}

fn radix_literal(digits: &str, radix: u32) -> f64 {
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return f64::NAN;
    }
    match u128::from_str_radix(digits, radix) {
        Ok(value) => value as f64,
        Err(_) => digits
            .chars()
            .filter_map(|c| c.to_digit(radix))
            .fold(0.0, |acc, d| acc * f64::from(radix) + f64::from(d)),
    }
}

/// `digits [. digits] [e [sign] digits]` with at least one mantissa digit.
fn is_decimal_literal(body: &str) -> bool {
    let bytes = body.as_bytes();
    let mut pos = 0;
    let skip_digits = |pos: &mut usize| {
        let start = *pos;
        while *pos < bytes.len() && bytes[*pos].is_ascii_digit() {
            *pos += 1;
        }
        *pos - start
    };

    let mut mantissa = skip_digits(&mut pos);
    if pos < bytes.len() && bytes[pos] == b'.' {
        pos += 1;
        mantissa += skip_digits(&mut pos);
    }
    if mantissa == 0 {
        return false;
    }
    if pos < bytes.len() && matches!(bytes[pos], b'e' | b'E') {
        pos += 1;
        if pos < bytes.len() && matches!(bytes[pos], b'+' | b'-') {
            pos += 1;
        }
        if skip_digits(&mut pos) == 0 {
            return false;
        }
    }
    pos == bytes.len()
}

fn is_js_whitespace(c: char) -> bool {
    matches!(
        c,
        '\t' | '\n'
            | '\u{000B}'
            | '\u{000C}'
            | '\r'
            | ' '
            | '\u{00A0}'
            | '\u{1680}'
            | '\u{2000}'..='\u{200A}'
            | '\u{2028}'
            | '\u{2029}'
            | '\u{202F}'
            | '\u{205F}'
            | '\u{3000}'
            | '\u{FEFF}'
    )
}
