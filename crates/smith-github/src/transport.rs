use std::time::Duration;

pub fn is_retryable_github_status(status: u16) -> bool {
    status == 429 || status >= 500
}

pub fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

/// Exponential backoff from a base delay, capped at one minute; an explicit
/// `Retry-After` from the server wins over the computed delay.
pub fn retry_delay(base_delay_ms: u64, attempt: usize, retry_after: Option<Duration>) -> Duration {
    if let Some(retry_after) = retry_after {
        return retry_after.min(Duration::from_secs(60));
    }
    let shift = attempt.saturating_sub(1).min(6) as u32;
    let delay_ms = base_delay_ms.max(1).saturating_mul(1_u64 << shift);
    Duration::from_millis(delay_ms.min(60_000))
}

pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    let seconds = raw.parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}

/// Truncates an error body on a char boundary so diagnostics stay readable.
pub fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncate_at = text
        .char_indices()
        .nth(max_chars)
        .map(|(index, _)| index)
        .unwrap_or(text.len());
    format!("{}…", &text[..truncate_at])
}
