//! Request normalisation and schema validation (spec.md §4.9 step (a)-(b)):
//! UUID shape, permitted venue enum, label length, non-empty credentials,
//! date ordering. Empty string and the literal `"0"` are normalised to
//! absent before anything else runs.

use crate::error::{AppError, AppResult};
use crate::models::{UserId, VenueId};
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

const MAX_LABEL_LEN: usize = 64;

/// Empty string and the literal `"0"` are absent (spec.md §6).
pub fn normalize_optional(raw: &str) -> Option<&str> {
    if raw.is_empty() || raw == "0" {
        None
    } else {
        Some(raw)
    }
}

pub fn require_non_empty(field: &str, raw: &str) -> AppResult<()> {
    if raw.is_empty() {
        return Err(AppError::invalid_input(format!("{field} must not be empty")));
    }
    Ok(())
}

pub fn parse_user_id(raw: &str) -> AppResult<UserId> {
    Uuid::parse_str(raw)
        .map(UserId)
        .map_err(|_| AppError::invalid_input("user_id is not a valid UUID"))
}

/// Validates against the permitted venue enum (spec.md §4.9). An absent
/// (normalised-to-None) venue is valid and means "all venues" wherever the
/// caller permits that.
pub fn parse_optional_venue(raw: &str) -> AppResult<Option<VenueId>> {
    match normalize_optional(raw) {
        None => Ok(None),
        Some(v) => VenueId::from_str(v)
            .map(Some)
            .ok_or_else(|| AppError::invalid_input(format!("unknown venue '{v}'"))),
    }
}

pub fn parse_required_venue(raw: &str) -> AppResult<VenueId> {
    parse_optional_venue(raw)?.ok_or_else(|| AppError::invalid_input("venue is required"))
}

pub fn validate_label(label: &str) -> AppResult<()> {
    if label.is_empty() || label.chars().count() > MAX_LABEL_LEN {
        return Err(AppError::invalid_input(format!(
            "label must be 1..={MAX_LABEL_LEN} characters"
        )));
    }
    Ok(())
}

/// `0` is absent; any other value must parse as a millisecond epoch
/// timestamp and the pair must be correctly ordered (spec.md §4.9).
pub fn parse_optional_range(start_ms: i64, end_ms: i64) -> AppResult<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
    let start = if start_ms == 0 { None } else { Some(epoch_ms(start_ms)?) };
    let end = if end_ms == 0 { None } else { Some(epoch_ms(end_ms)?) };
    if let (Some(s), Some(e)) = (start, end) {
        if s > e {
            return Err(AppError::invalid_input("start must not be after end"));
        }
    }
    Ok((start, end))
}

fn epoch_ms(ms: i64) -> AppResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| AppError::invalid_input("timestamp out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_and_literal_zero_normalise_to_absent() {
        assert_eq!(normalize_optional(""), None);
        assert_eq!(normalize_optional("0"), None);
        assert_eq!(normalize_optional("binance"), Some("binance"));
    }

    #[test]
    fn rejects_unknown_venue() {
        assert!(parse_optional_venue("dogecoin-exchange").is_err());
    }

    #[test]
    fn label_length_bounds_are_enforced() {
        assert!(validate_label("main").is_ok());
        assert!(validate_label("").is_err());
        assert!(validate_label(&"x".repeat(65)).is_err());
        assert!(validate_label(&"x".repeat(64)).is_ok());
    }

    #[test]
    fn range_rejects_start_after_end() {
        assert!(parse_optional_range(2000, 1000).is_err());
        assert!(parse_optional_range(0, 0).is_ok());
        assert!(parse_optional_range(1000, 2000).is_ok());
    }
}
