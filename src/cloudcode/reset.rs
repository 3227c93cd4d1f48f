//! 429 reset-time extraction.
//!
//! Precedence, first match wins:
//! 1. `Retry-After` header (integer seconds or HTTP-date)
//! 2. body `error.details[*].retryDelay` in `"<n>s"` form
//! 3. body `error.details[*].retryInfo.retryDelay`, same form
//! 4. the caller's default cooldown

use std::sync::LazyLock;

/// `"3s"`, `"3.5s"`, `"500ms"` style delay strings.
static DELAY_REGEX: LazyLock<regex_lite::Regex> = LazyLock::new(|| {
    regex_lite::Regex::new(r"^([\d.]+)\s*(ms|s)$").expect("invalid delay regex")
});

/// Milliseconds until the quota resets, given the `Retry-After` header value
/// (if any) and the response body.
pub fn parse_reset_time(retry_after: Option<&str>, body: &str, default_ms: u64) -> u64 {
    if let Some(value) = retry_after
        && let Some(ms) = parse_retry_after(value)
    {
        tracing::debug!(reset_ms = ms, "Parsed Retry-After header");
        return ms;
    }

    if let Some(ms) = parse_body_delay(body) {
        tracing::debug!(reset_ms = ms, "Parsed retryDelay from body");
        return ms;
    }

    default_ms
}

/// `Retry-After`: either whole seconds or an HTTP-date.
fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs * 1000);
    }

    let parsed = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = parsed.signed_duration_since(chrono::Utc::now());
    let ms = delta.num_milliseconds();
    // Past dates mean "retry now-ish"
    Some(ms.max(0) as u64)
}

fn parse_body_delay(body: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let details = value.pointer("/error/details")?.as_array()?;

    for detail in details {
        if let Some(delay) = detail.get("retryDelay").and_then(|d| d.as_str())
            && let Some(ms) = parse_delay_str(delay)
        {
            return Some(ms);
        }
    }

    for detail in details {
        if let Some(delay) = detail
            .pointer("/retryInfo/retryDelay")
            .and_then(|d| d.as_str())
            && let Some(ms) = parse_delay_str(delay)
        {
            return Some(ms);
        }
    }

    None
}

fn parse_delay_str(delay: &str) -> Option<u64> {
    let captures = DELAY_REGEX.captures(delay.trim())?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    let unit = captures.get(2)?.as_str();

    let ms = if unit == "s" {
        (value * 1000.0).ceil()
    } else {
        value.ceil()
    };
    Some(ms as u64)
}

/// Compact human form for log and error messages: `5s`, `1m5s`, `1h1m5s`.
pub fn format_duration(ms: u64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    let mut result = String::new();
    if hours > 0 {
        result.push_str(&hours.to_string());
        result.push('h');
    }
    if hours > 0 || mins > 0 {
        result.push_str(&mins.to_string());
        result.push('m');
    }
    result.push_str(&secs.to_string());
    result.push('s');
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: u64 = 10_000;

    #[test]
    fn test_retry_after_integer_seconds() {
        assert_eq!(parse_reset_time(Some("5"), "", DEFAULT), 5_000);
        assert_eq!(parse_reset_time(Some(" 30 "), "", DEFAULT), 30_000);
    }

    #[test]
    fn test_retry_after_http_date() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(60);
        let value = future.to_rfc2822();

        let ms = parse_reset_time(Some(&value), "", DEFAULT);
        assert!((55_000..=60_000).contains(&ms), "got {ms}");

        // Past dates collapse to zero rather than the default
        let past = chrono::Utc::now() - chrono::Duration::seconds(60);
        assert_eq!(parse_reset_time(Some(&past.to_rfc2822()), "", DEFAULT), 0);
    }

    #[test]
    fn test_header_wins_over_body() {
        let body = r#"{"error":{"details":[{"retryDelay":"99s"}]}}"#;
        assert_eq!(parse_reset_time(Some("5"), body, DEFAULT), 5_000);
    }

    #[test]
    fn test_body_retry_delay() {
        let body = r#"{"error":{"code":429,"details":[
            {"@type":"type.googleapis.com/google.rpc.Help"},
            {"retryDelay":"3s"}
        ]}}"#;
        assert_eq!(parse_reset_time(None, body, DEFAULT), 3_000);
    }

    #[test]
    fn test_body_retry_info_delay() {
        let body = r#"{"error":{"details":[
            {"retryInfo":{"retryDelay":"2.5s"}}
        ]}}"#;
        assert_eq!(parse_reset_time(None, body, DEFAULT), 2_500);
    }

    #[test]
    fn test_plain_retry_delay_preferred_over_retry_info() {
        let body = r#"{"error":{"details":[
            {"retryInfo":{"retryDelay":"60s"}},
            {"retryDelay":"7s"}
        ]}}"#;
        assert_eq!(parse_reset_time(None, body, DEFAULT), 7_000);
    }

    #[test]
    fn test_default_fallback() {
        assert_eq!(parse_reset_time(None, "", DEFAULT), DEFAULT);
        assert_eq!(parse_reset_time(None, "not json", DEFAULT), DEFAULT);
        assert_eq!(
            parse_reset_time(None, r#"{"error":{"details":[]}}"#, DEFAULT),
            DEFAULT
        );
        assert_eq!(parse_reset_time(Some("soon"), "", DEFAULT), DEFAULT);
    }

    #[test]
    fn test_delay_str_forms() {
        assert_eq!(parse_delay_str("3s"), Some(3_000));
        assert_eq!(parse_delay_str("0.5s"), Some(500));
        assert_eq!(parse_delay_str("250ms"), Some(250));
        assert_eq!(parse_delay_str(" 10s "), Some(10_000));
        assert_eq!(parse_delay_str("abc"), None);
        assert_eq!(parse_delay_str("10m"), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(5_000), "5s");
        assert_eq!(format_duration(65_000), "1m5s");
        assert_eq!(format_duration(3_665_000), "1h1m5s");
        assert_eq!(format_duration(3_600_000), "1h0m0s");
    }
}
