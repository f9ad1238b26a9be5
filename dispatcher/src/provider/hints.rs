//! Rate-limit metadata carried in provider response headers.

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use shared_types::ServerRateHint;

const RETRY_AFTER_MS: &str = "retry-after-ms";
const RETRY_AFTER: &str = "retry-after";
const LIMIT_HEADERS: [&str; 2] = ["x-ratelimit-limit-requests", "x-ratelimit-limit"];

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Parses `Retry-After` style values: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<u64> {
    if let Ok(seconds) = value.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 {
            return Some((seconds * 1_000.0).ceil() as u64);
        }
        return None;
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).num_milliseconds().max(0) as u64)
}

/// Reads the leading integer of a limit header such as `"60"` or `"60, 60;w=60"`.
fn parse_limit(value: &str) -> Option<u32> {
    let digits: String = value.chars().take_while(char::is_ascii_digit).collect();
    digits.parse::<u32>().ok().filter(|limit| *limit > 0)
}

pub fn parse_rate_hint(headers: &HeaderMap, now: DateTime<Utc>) -> ServerRateHint {
    let retry_after_ms = header_str(headers, RETRY_AFTER_MS)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| ms.ceil() as u64)
        .or_else(|| header_str(headers, RETRY_AFTER).and_then(|v| parse_retry_after(v, now)));

    let limit_per_minute_hint = LIMIT_HEADERS
        .iter()
        .find_map(|name| header_str(headers, name).and_then(parse_limit));

    ServerRateHint {
        retry_after_ms,
        limit_per_minute_hint,
    }
    .clamped()
}
