//! Parsing for URL and config parameter values
//!
//! Channel parameters arrive as strings (`block=1kb`, `keepalive=yes`,
//! `delay=10ms`); these helpers give them one parsing rule set across the
//! library.

use std::time::Duration;

use crate::error::{Error, Result};

/// Parse a boolean parameter: `yes`/`no`, `true`/`false`, `1`/`0`.
pub fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(Error::invalid_value("bool", s)),
    }
}

/// Parse a size parameter with optional binary suffix: `512`, `1kb`, `16mb`.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, mult) = match s
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| s.split_at(i))
    {
        None => (s, 1u64),
        Some((d, suffix)) => {
            let mult = match suffix.to_ascii_lowercase().as_str() {
                "b" => 1,
                "kb" => 1024,
                "mb" => 1024 * 1024,
                "gb" => 1024 * 1024 * 1024,
                _ => return Err(Error::invalid_value("size", s)),
            };
            (d, mult)
        }
    };
    if digits.is_empty() {
        return Err(Error::invalid_value("size", s));
    }
    let base: u64 = digits
        .parse()
        .map_err(|_| Error::invalid_value("size", s))?;
    base.checked_mul(mult)
        .ok_or_else(|| Error::invalid_value("size", s))
}

/// Format a byte count with the largest exact binary suffix.
pub fn format_size(size: u64) -> String {
    const UNITS: [(u64, &str); 3] = [
        (1024 * 1024 * 1024, "gb"),
        (1024 * 1024, "mb"),
        (1024, "kb"),
    ];
    for (mult, suffix) in UNITS {
        if size >= mult && size % mult == 0 {
            return format!("{}{}", size / mult, suffix);
        }
    }
    format!("{}b", size)
}

/// Parse a duration parameter: `100ns`, `10us`, `1ms`, `5s`, `2m`, `1h`.
///
/// A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).map(|i| s.split_at(i));
    let (digits, suffix) = match split {
        None => (s, "s"),
        Some((d, u)) => (d, u),
    };
    if digits.is_empty() {
        return Err(Error::invalid_value("duration", s));
    }
    let base: u64 = digits
        .parse()
        .map_err(|_| Error::invalid_value("duration", s))?;
    match suffix {
        "ns" => Ok(Duration::from_nanos(base)),
        "us" => Ok(Duration::from_micros(base)),
        "ms" => Ok(Duration::from_millis(base)),
        "s" => Ok(Duration::from_secs(base)),
        "m" => Ok(Duration::from_secs(base * 60)),
        "h" => Ok(Duration::from_secs(base * 3600)),
        _ => Err(Error::invalid_value("duration", s)),
    }
}
