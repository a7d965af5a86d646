//! Parsing of human-authored capacities and latencies.
//!
//! Both accept a decimal number, optionally followed by a unit suffix of which only the first character matters, or
//! the literal `inf`.

use crate::{Error, Result};

/// Parses a size, in bytes.
///
/// Recognized suffixes, case-insensitive: `K`, `M`, `G`, `T`, `P`, as binary multiples. `inf` maps to `u64::MAX`.
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();

    if text == "inf" {
        return Ok(u64::MAX);
    }

    let (number, suffix) = split_number(text)?;

    let shift = match suffix.chars().next().map(|c| c.to_ascii_lowercase()) {
        None | Some('b') => 0,
        Some('k') => 10,
        Some('m') => 20,
        Some('g') => 30,
        Some('t') => 40,
        Some('p') => 50,
        Some(_) => return Err(Error::Parse(format!("could not parse the size: {}", text))),
    };

    scale(number, (1u64 << shift) as f64, text)
}

/// Parses a latency, in nanoseconds.
///
/// Recognized suffixes, case-insensitive: `n`, `u`, `m`, `s`. `inf` maps to `u64::MAX`.
pub fn parse_latency(text: &str) -> Result<u64> {
    let text = text.trim();

    if text == "inf" {
        return Ok(u64::MAX);
    }

    let (number, suffix) = split_number(text)?;

    let factor = match suffix.chars().next().map(|c| c.to_ascii_lowercase()) {
        None | Some('n') => 1.0,
        Some('u') => 1e3,
        Some('m') => 1e6,
        Some('s') => 1e9,
        Some(_) => return Err(Error::Parse(format!("could not parse the latency: {}", text))),
    };

    scale(number, factor, text)
}

//  Splits `text` into its leading decimal number and the remaining suffix.
fn split_number(text: &str) -> Result<(f64, &str)> {
    let end = text.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(text.len());
    let (number, suffix) = text.split_at(end);

    let number = number.parse::<f64>()
        .map_err(|_| Error::Parse(format!("expected a number: {}", text)))?;

    Ok((number, suffix.trim_start()))
}

fn scale(number: f64, factor: f64, text: &str) -> Result<u64> {
    let result = number * factor;

    if result >= u64::MAX as f64 {
        return Err(Error::Parse(format!("value out of range: {}", text)));
    }

    Ok(result as u64)
}

#[cfg(test)]
mod tests {

use super::*;

#[test]
fn size_plain() {
    assert_eq!(0, parse_size("0").unwrap());
    assert_eq!(4096, parse_size("4096").unwrap());
    assert_eq!(12, parse_size(" 12 ").unwrap());
}

#[test]
fn size_suffixes() {
    assert_eq!(1 << 10, parse_size("1K").unwrap());
    assert_eq!(1 << 10, parse_size("1kb").unwrap());
    assert_eq!(100 << 20, parse_size("100M").unwrap());
    assert_eq!(100 << 20, parse_size("100 MB").unwrap());
    assert_eq!(3 << 30, parse_size("3g").unwrap());
    assert_eq!(1 << 40, parse_size("1T").unwrap());
    assert_eq!(2 << 50, parse_size("2p").unwrap());
    assert_eq!(1536, parse_size("1.5k").unwrap());
}

#[test]
fn size_infinite() {
    assert_eq!(u64::MAX, parse_size("inf").unwrap());
}

#[test]
fn size_garbage() {
    assert!(matches!(parse_size(""), Err(Error::Parse(_))));
    assert!(matches!(parse_size("abc"), Err(Error::Parse(_))));
    assert!(matches!(parse_size("12Q"), Err(Error::Parse(_))));
    assert!(matches!(parse_size("100000P"), Err(Error::Parse(_))));
}

#[test]
fn latency_suffixes() {
    assert_eq!(7, parse_latency("7").unwrap());
    assert_eq!(7, parse_latency("7ns").unwrap());
    assert_eq!(5_000, parse_latency("5us").unwrap());
    assert_eq!(2_000_000, parse_latency("2ms").unwrap());
    assert_eq!(3_000_000_000, parse_latency("3s").unwrap());
    assert_eq!(500, parse_latency("0.5u").unwrap());
}

#[test]
fn latency_infinite_and_garbage() {
    assert_eq!(u64::MAX, parse_latency("inf").unwrap());

    assert!(matches!(parse_latency("fast"), Err(Error::Parse(_))));
    assert!(matches!(parse_latency("10h"), Err(Error::Parse(_))));
}

}
