use rbdsr_core::{Result, SrError};

const KIB: f64 = 1024.0;

/// Parse a human size such as `1024`, `500M`, `10G`, `2T`, `1.5g` or `10GB`.
///
/// Units are binary and case-insensitive, a trailing `B` is optional, and a
/// bare number is taken as MiB. The result is in bytes, rounded up.
pub fn parse_size(text: &str) -> Result<u64> {
    let invalid = || {
        SrError::ConfigInvalid(format!(
            "invalid size '{text}', use forms like 1024, 500M, 10G or 2T"
        ))
    };

    let upper = text.trim().to_ascii_uppercase();
    let body = upper.strip_suffix('B').unwrap_or(&upper);

    let (number, multiplier) = match body.chars().last() {
        Some('K') => (&body[..body.len() - 1], KIB),
        Some('M') => (&body[..body.len() - 1], KIB * KIB),
        Some('G') => (&body[..body.len() - 1], KIB * KIB * KIB),
        Some('T') => (&body[..body.len() - 1], KIB * KIB * KIB * KIB),
        _ => (body, KIB * KIB),
    };
    let number = number.trim_end();

    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (number, None),
    };
    let digits = |part: &str| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit());
    if !digits(whole) || !fraction.is_none_or(digits) {
        return Err(invalid());
    }

    let value: f64 = number.parse().map_err(|_| invalid())?;
    let bytes = (value * multiplier).ceil();
    if bytes < 1.0 || bytes > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}
