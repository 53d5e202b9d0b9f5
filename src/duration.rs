//! ISO-8601 duration parsing for `maxKeyAge`.

use chrono::{Duration, Utc};

use crate::error::RotateError;

/// Key age used when `maxKeyAge` is missing or empty.
pub const DEFAULT_MAX_KEY_AGE: &str = "P7D";

/// Parse a `PnYnMnWnDTnHnMnS` duration.
///
/// Years count as 365 days and months as 30 days; only integer components are
/// accepted. Ages too large to subtract from the current time are rejected.
pub fn parse_iso8601_duration(input: &str) -> Result<Duration, RotateError> {
    let invalid = || RotateError::InvalidDuration(input.to_string());

    let rest = input.trim().strip_prefix('P').ok_or_else(invalid)?;
    if rest.is_empty() {
        return Err(invalid());
    }

    let (date_part, time_part) = match rest.split_once('T') {
        Some((_, "")) => return Err(invalid()),
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };

    let mut total = Duration::zero();
    for (value, designator) in components(date_part).ok_or_else(invalid)? {
        let part = match designator {
            'Y' => value.checked_mul(365).and_then(Duration::try_days),
            'M' => value.checked_mul(30).and_then(Duration::try_days),
            'W' => Duration::try_weeks(value),
            'D' => Duration::try_days(value),
            _ => return Err(invalid()),
        };
        total = part
            .and_then(|part| total.checked_add(&part))
            .ok_or_else(invalid)?;
    }

    if let Some(time_part) = time_part {
        for (value, designator) in components(time_part).ok_or_else(invalid)? {
            let part = match designator {
                'H' => Duration::try_hours(value),
                'M' => Duration::try_minutes(value),
                'S' => Duration::try_seconds(value),
                _ => return Err(invalid()),
            };
            total = part
                .and_then(|part| total.checked_add(&part))
                .ok_or_else(invalid)?;
        }
    }

    // Must still be usable as an offset from the current time
    Utc::now().checked_sub_signed(total).ok_or_else(invalid)?;

    Ok(total)
}

/// Resolve an optional configured age, falling back to seven days.
pub fn max_key_age(configured: Option<&str>) -> Result<Duration, RotateError> {
    match configured.map(str::trim) {
        None | Some("") => parse_iso8601_duration(DEFAULT_MAX_KEY_AGE),
        Some(value) => parse_iso8601_duration(value),
    }
}

/// Split `7D12H` style text into `(7, 'D'), (12, 'H')`.
fn components(part: &str) -> Option<Vec<(i64, char)>> {
    let mut out = Vec::new();
    let mut digits = String::new();

    for c in part.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else {
            if digits.is_empty() {
                return None;
            }
            out.push((digits.parse().ok()?, c));
            digits.clear();
        }
    }

    // Trailing number without a designator
    if !digits.is_empty() {
        return None;
    }

    Some(out)
}
