//! Fractional position keys.
//!
//! A key is a non-empty string over the 62 symbols `0-9A-Za-z`. The alphabet is
//! listed in byte order, so plain `str` ordering (and SQLite's `BINARY`
//! collation) sorts keys correctly. A new key can be placed between any two
//! neighbors without touching the rest of the collection.
//!
//! Midpoints are always chosen by index inside the alphabet, never by averaging
//! raw byte values: the three symbol ranges are not contiguous in ASCII and an
//! average of, say, `'9'` and `'A'` would land on `'='`.
//!
//! Keys produced here never end with the minimum symbol `0`. A pair such as
//! `("a", "a00")` admits no key in between, and avoiding trailing zeros keeps
//! generated collections away from that shape.

use crate::errors::{OrderError, OrderResult};
use once_cell::sync::Lazy;
use std::cmp::Ordering;

pub const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

const BASE: usize = ALPHABET.len();
const MID_INDEX: usize = BASE / 2;
const INITIAL_KEY: &str = "a0";

static SYMBOL_INDEX: Lazy<[Option<u8>; 256]> = Lazy::new(|| {
    let mut table = [None; 256];
    for (index, symbol) in ALPHABET.iter().enumerate() {
        table[usize::from(*symbol)] = Some(index as u8);
    }
    table
});

/// Key given to the first item placed in an empty scope.
pub fn initial() -> String {
    INITIAL_KEY.to_string()
}

/// A key strictly greater than `key`.
///
/// Bumps the last symbol by one alphabet slot, or appends the middle symbol
/// when the last symbol is already `z`. Repeated calls never plateau.
pub fn after(key: &str) -> OrderResult<String> {
    let mut digits = to_digits(key)?;
    match digits.last_mut() {
        Some(last) if *last + 1 < BASE => *last += 1,
        _ => digits.push(MID_INDEX),
    }
    Ok(encode(&digits))
}

/// A key strictly less than `key`.
pub fn before(key: &str) -> OrderResult<String> {
    let upper = to_digits(key)?;
    if upper.iter().all(|digit| *digit == 0) {
        return Err(OrderError::InvalidOrder(format!(
            "no position key sorts before '{}'",
            key
        )));
    }
    Ok(encode(&midpoint(&[], Some(&upper))))
}

/// A key strictly between `before` and `after`.
///
/// `before` must sort strictly before `after`; anything else is a caller bug
/// and is reported as `InvalidOrder`.
pub fn between(before: &str, after: &str) -> OrderResult<String> {
    let lower = to_digits(before)?;
    let upper = to_digits(after)?;

    if lower >= upper {
        return Err(OrderError::InvalidOrder(format!(
            "before '{}' must sort strictly before after '{}'",
            before, after
        )));
    }
    if upper.len() > lower.len()
        && upper.starts_with(&lower)
        && upper[lower.len()..].iter().all(|digit| *digit == 0)
    {
        return Err(OrderError::InvalidOrder(format!(
            "no position key sorts between '{}' and '{}'",
            before, after
        )));
    }

    Ok(encode(&midpoint(&lower, Some(&upper))))
}

/// Byte-wise ordering of two keys; agrees with SQLite `BINARY` collation.
pub fn compare(a: &str, b: &str) -> Ordering {
    a.cmp(b)
}

/// True when `key` is non-empty and every symbol belongs to the alphabet.
pub fn validate(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|symbol| index_of(symbol).is_some())
}

/// `count` strictly increasing keys spaced evenly over the shortest fixed
/// width that can hold them. Used when a whole list is renumbered at once.
pub fn spread(count: usize) -> Vec<String> {
    if count == 0 {
        return Vec::new();
    }

    let slots = count as u128 + 1;
    let mut width = 1usize;
    let mut capacity = BASE as u128;
    while capacity < slots {
        width += 1;
        capacity *= BASE as u128;
    }

    (1..=count as u128)
        .map(|slot| {
            let mut value = slot * capacity / slots;
            let mut digits = vec![0usize; width];
            for digit in digits.iter_mut().rev() {
                *digit = (value % BASE as u128) as usize;
                value /= BASE as u128;
            }
            while digits.last() == Some(&0) {
                digits.pop();
            }
            encode(&digits)
        })
        .collect()
}

// Digits of the result, walking both keys left to right. `lower` is read as if
// padded with the minimum symbol; a missing `upper` means "no upper bound".
fn midpoint(mut lower: &[usize], mut upper: Option<&[usize]>) -> Vec<usize> {
    let mut key = Vec::with_capacity(lower.len() + 1);
    loop {
        if let Some(high) = upper {
            let shared = high
                .iter()
                .enumerate()
                .take_while(|(index, digit)| lower.get(*index).copied().unwrap_or(0) == **digit)
                .count();
            key.extend_from_slice(&high[..shared]);
            lower = lower.get(shared..).unwrap_or_default();
            upper = Some(&high[shared..]);
        }

        let low_digit = lower.first().copied().unwrap_or(0);
        let high_digit = upper
            .and_then(|high| high.first().copied())
            .unwrap_or(BASE);

        if high_digit.saturating_sub(low_digit) > 1 {
            key.push((low_digit + high_digit) / 2);
            return key;
        }

        // Adjacent symbols: keep the lower one; everything after it only has
        // to sort above the rest of `lower`.
        key.push(low_digit);
        lower = lower.get(1..).unwrap_or_default();
        upper = None;
    }
}

fn to_digits(key: &str) -> OrderResult<Vec<usize>> {
    if key.is_empty() {
        return Err(OrderError::InvalidKey("position key is empty".to_string()));
    }
    key.bytes()
        .map(|symbol| {
            index_of(symbol).ok_or_else(|| {
                OrderError::InvalidKey(format!(
                    "position key '{}' contains a symbol outside 0-9A-Za-z",
                    key.escape_default()
                ))
            })
        })
        .collect()
}

fn encode(digits: &[usize]) -> String {
    digits.iter().map(|digit| char::from(ALPHABET[*digit])).collect()
}

fn index_of(symbol: u8) -> Option<usize> {
    SYMBOL_INDEX[usize::from(symbol)].map(usize::from)
}
