//! Parsing and formatting of durations and resource quantities.
//!
//! Durations accept `ms`, `s`, `m` and `h` suffixes (a bare number is
//! seconds). CPU follows the Kubernetes notation (`250m`, `0.5`, `2`) and
//! memory accepts binary (`Ki`, `Mi`, `Gi`) and decimal (`K`, `M`, `G`)
//! suffixes or a plain byte count.

use std::time::Duration;

use crate::error::{ScaleError, ScaleResult};

/// Parse a duration string like "500ms", "30s", "5m" or "8h".
pub fn parse_duration(s: &str) -> ScaleResult<Duration> {
    let s = s.trim();
    let invalid = || ScaleError::InvalidQuantity(s.to_string());

    let (number, unit_ms) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        (s, 1_000)
    };

    let value = number.trim().parse::<u64>().map_err(|_| invalid())?;
    value
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

/// Parse a CPU quantity into millicores.
pub fn parse_cpu(s: &str) -> ScaleResult<u64> {
    let s = s.trim();
    let invalid = || ScaleError::InvalidQuantity(s.to_string());

    if let Some(millis) = s.strip_suffix('m') {
        return millis.parse::<u64>().map_err(|_| invalid());
    }
    let cores = s.parse::<f64>().map_err(|_| invalid())?;
    if !cores.is_finite() || cores < 0.0 {
        return Err(invalid());
    }
    Ok((cores * 1000.0).round() as u64)
}

/// Parse a memory quantity into bytes.
pub fn parse_memory(s: &str) -> ScaleResult<u64> {
    const SUFFIXES: [(&str, u64); 6] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
    ];

    let s = s.trim();
    let invalid = || ScaleError::InvalidQuantity(s.to_string());

    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((s, 1));

    let value = number.trim().parse::<u64>().map_err(|_| invalid())?;
    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// Format millicores the way they are written in manifests.
pub fn format_cpu(millis: u64) -> String {
    if millis % 1000 == 0 {
        format!("{}", millis / 1000)
    } else {
        format!("{millis}m")
    }
}

/// Format bytes using the largest exact binary suffix.
pub fn format_memory(bytes: u64) -> String {
    match bytes {
        0 => "0".to_string(),
        b if b % (1 << 30) == 0 => format!("{}Gi", b >> 30),
        b if b % (1 << 20) == 0 => format!("{}Mi", b >> 20),
        b if b % (1 << 10) == 0 => format!("{}Ki", b >> 10),
        b => b.to_string(),
    }
}
