//! Duration strings.
//!
//! Policy declarations and controller settings express durations as an
//! unsigned integer followed by a single unit character: `s`, `m`, `h`, or
//! `d`. Remaining token TTLs are always read back from the cluster, so this
//! parser is the only time arithmetic the policy controller needs.

use std::time::Duration;

use crate::error::InvalidDuration;

/// Parse a duration string such as `"3m"` into seconds.
///
/// # Errors
///
/// Returns [`InvalidDuration`] for empty input, a missing or non-numeric
/// prefix, an unknown unit, or a value that overflows `u64` seconds.
pub fn to_seconds(input: &str) -> Result<u64, InvalidDuration> {
    let invalid = |reason: &str| InvalidDuration {
        input: input.to_owned(),
        reason: reason.to_owned(),
    };

    let trimmed = input.trim();
    let Some(unit) = trimmed.chars().last() else {
        return Err(invalid("empty duration"));
    };

    let multiplier: u64 = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3_600,
        'd' => 86_400,
        _ => return Err(invalid("unit must be one of s, m, h, d")),
    };

    let prefix = &trimmed[..trimmed.len() - unit.len_utf8()];
    if prefix.is_empty() {
        return Err(invalid("missing numeric prefix"));
    }
    if !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("prefix must be an unsigned integer"));
    }

    let value: u64 = prefix.parse().map_err(|_| invalid("prefix out of range"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| invalid("duration overflows"))
}

/// Parse a duration string into a [`Duration`].
///
/// # Errors
///
/// Same as [`to_seconds`].
pub fn parse(input: &str) -> Result<Duration, InvalidDuration> {
    to_seconds(input).map(Duration::from_secs)
}
