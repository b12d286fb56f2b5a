use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use crate::error::AppError;

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Query envelope shared by every paginated listing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    pub page_size: Option<i64>,
    pub page_token: Option<String>,
}

pub fn clamp_page_size(requested: Option<i64>) -> i64 {
    match requested {
        Some(size) if size > MAX_PAGE_SIZE => MAX_PAGE_SIZE,
        Some(size) if size >= 1 => size,
        _ => DEFAULT_PAGE_SIZE,
    }
}

/// Parse a newest-first keyset token. Tokens are the RFC3339Nano `createdAt`
/// of the last row on the previous page.
pub fn parse_time_token(token: Option<&str>) -> Result<Option<DateTime<Utc>>, AppError> {
    match token {
        None => Ok(None),
        Some(raw) if raw.is_empty() => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|parsed| Some(parsed.with_timezone(&Utc)))
            .map_err(|_| AppError::BadRequest(format!("invalid page token `{raw}`"))),
    }
}

pub fn time_token(last: DateTime<Utc>) -> String {
    last.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn page_size_clamps_to_bounds() {
        assert_eq!(clamp_page_size(None), 20);
        assert_eq!(clamp_page_size(Some(0)), 20);
        assert_eq!(clamp_page_size(Some(-5)), 20);
        assert_eq!(clamp_page_size(Some(1)), 1);
        assert_eq!(clamp_page_size(Some(100)), 100);
        assert_eq!(clamp_page_size(Some(250)), 100);
    }

    #[test]
    fn tokens_round_trip_at_nanosecond_resolution() {
        let stamp = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let token = time_token(stamp);
        let parsed = parse_time_token(Some(&token)).unwrap().unwrap();
        assert_eq!(parsed, stamp);
    }

    #[test]
    fn malformed_token_is_bad_request() {
        let err = parse_time_token(Some("yesterday")).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn empty_token_means_first_page() {
        assert!(parse_time_token(Some("")).unwrap().is_none());
        assert!(parse_time_token(None).unwrap().is_none());
    }
}
