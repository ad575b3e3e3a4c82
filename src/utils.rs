// ABOUTME: Utility functions for startup and configuration
// ABOUTME: Provides retry logic, URL sanitizing for logs, and duration parsing

use anyhow::{bail, Context, Result};
use std::time::Duration;
use url::Url;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Run `operation` until it succeeds, giving up after `max_retries` retries.
///
/// The wait between attempts starts at `initial_delay` and doubles up to 30s.
/// Used for the startup connections, so a MongoDB or Redis that is still
/// coming up does not abort the relay.
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut retries = 0u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if retries >= max_retries => {
                return Err(e.context(format!("gave up after {} attempts", retries + 1)));
            }
            Err(e) => {
                retries += 1;
                tracing::warn!(
                    retry = retries,
                    max_retries,
                    retry_in = ?delay,
                    "Attempt failed: {:#}",
                    e
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2).min(MAX_RETRY_DELAY);
            }
        }
    }
}

/// Connection URL with any password replaced by `***`, for logging.
///
/// ```
/// # use oplog_relay::utils::sanitize_url;
/// assert_eq!(
///     sanitize_url("redis://:secret@localhost:6379/0"),
///     "redis://:***@localhost:6379/0"
/// );
/// ```
pub fn sanitize_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            // Only fails for cannot-be-a-base URLs, which have no password
            let _ = parsed.set_password(Some("***"));
            parsed.into()
        }
        Ok(parsed) => parsed.into(),
        Err(_) => url.to_string(),
    }
}

/// Check that a connection URL parses and uses one of the allowed schemes
pub fn validate_url_scheme(url: &str, allowed: &[&str], what: &str) -> Result<()> {
    if url.trim().is_empty() {
        bail!("{} URL cannot be empty", what);
    }
    let parsed = Url::parse(url).with_context(|| format!("Invalid {} URL", what))?;
    if !allowed.contains(&parsed.scheme()) {
        bail!(
            "Invalid {} URL scheme '{}'.\n\
             Expected one of: {}",
            what,
            parsed.scheme(),
            allowed.join(", ")
        );
    }
    Ok(())
}

/// Parse a compact duration such as `1s`, `250ms`, `2m` or `1h30m`
///
/// Supported units are `h`, `m`, `s` and `ms`; components may be chained. A
/// bare integer is read as seconds.
///
/// # Examples
///
/// ```
/// # use oplog_relay::utils::parse_duration;
/// # use std::time::Duration;
/// assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
/// assert!(parse_duration("ten seconds").is_err());
/// ```
pub fn parse_duration(input: &str) -> Result<Duration> {
    let value = input.trim();
    if value.is_empty() {
        bail!("Duration cannot be empty");
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = value;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits_end == 0 {
            bail!("Invalid duration '{}': expected a number before each unit", input);
        }
        let amount: u64 = rest[..digits_end]
            .parse()
            .with_context(|| format!("Invalid duration '{}'", input))?;
        rest = &rest[digits_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let component = match &rest[..unit_end] {
            "h" => amount.checked_mul(3600).map(Duration::from_secs),
            "m" => amount.checked_mul(60).map(Duration::from_secs),
            "s" => Some(Duration::from_secs(amount)),
            "ms" => Some(Duration::from_millis(amount)),
            "" => bail!("Invalid duration '{}': missing unit", input),
            unit => bail!(
                "Invalid duration '{}': unknown unit '{}' (use h, m, s or ms)",
                input,
                unit
            ),
        };
        total = match component.and_then(|c| total.checked_add(c)) {
            Some(total) => total,
            None => bail!("Invalid duration '{}': value is too large", input),
        };
        rest = &rest[unit_end..];
    }

    Ok(total)
}
