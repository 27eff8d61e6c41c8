use rbdsr_core::{Result, SrError};

const UNITS: [(&str, u64); 5] = [
    ("T", 1 << 40),
    ("G", 1 << 30),
    ("M", 1 << 20),
    ("K", 1 << 10),
    ("B", 1),
];

/// Parse a byte count such as `1073741824`, `512M`, `10G` or `2TiB`.
/// A bare number is taken as bytes.
pub fn parse_bytes(text: &str) -> Result<u64> {
    let invalid = || SrError::ConfigInvalid(format!("invalid byte size '{text}'"));

    let upper = text.trim().to_uppercase();
    let digits_end = upper
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(upper.len());
    let (number, suffix) = upper.split_at(digits_end);
    let value = number.parse::<u64>().map_err(|_| invalid())?;

    let suffix = suffix.trim();
    let suffix = suffix
        .strip_suffix("IB")
        .or_else(|| suffix.strip_suffix('B').filter(|s| !s.is_empty()))
        .unwrap_or(suffix);
    if suffix.is_empty() {
        return Ok(value);
    }

    let multiplier = UNITS
        .iter()
        .find(|(unit, _)| *unit == suffix)
        .map(|(_, m)| *m)
        .ok_or_else(invalid)?;

    value.checked_mul(multiplier).ok_or_else(invalid)
}

pub fn format_bytes(bytes: u64) -> String {
    for (unit, size) in UNITS.iter().take(4) {
        if bytes >= *size {
            return format!("{:.1}{unit}", bytes as f64 / *size as f64);
        }
    }
    format!("{bytes}B")
}
