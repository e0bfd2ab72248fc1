//! Parsing for the suite `timeout` string (`[0-9]+[smh]`).

use std::time::Duration;

use super::SuiteError;

/// Timeout applied when a suite does not declare one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Largest timeout a suite may request.
pub const MAX_TIMEOUT: Duration = DEFAULT_TIMEOUT;

/// Parses a timeout such as `45m` into a [`Duration`].
///
/// `None` yields [`DEFAULT_TIMEOUT`]. Values above [`MAX_TIMEOUT`], zero
/// values and anything not matching `[0-9]+[smh]` are rejected.
///
/// # Errors
///
/// Returns [`SuiteError::Timeout`] when the value is malformed or out of
/// range.
pub fn parse_timeout(value: Option<&str>) -> Result<Duration, SuiteError> {
    let Some(raw) = value else {
        return Ok(DEFAULT_TIMEOUT);
    };
    let trimmed = raw.trim();
    let invalid = || SuiteError::Timeout {
        value: raw.to_owned(),
        reason: String::from("expected a number followed by s, m or h"),
    };

    let mut chars = trimmed.chars();
    let unit = chars.next_back().ok_or_else(invalid)?;
    let digits = chars.as_str();
    if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(invalid());
    }

    let multiplier: u64 = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        _ => return Err(invalid()),
    };
    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    let seconds = amount.checked_mul(multiplier).ok_or_else(invalid)?;
    let timeout = Duration::from_secs(seconds);

    if timeout.is_zero() {
        return Err(SuiteError::Timeout {
            value: raw.to_owned(),
            reason: String::from("timeout must be greater than zero"),
        });
    }
    if timeout > MAX_TIMEOUT {
        return Err(SuiteError::Timeout {
            value: raw.to_owned(),
            reason: String::from("timeout may not exceed 2h"),
        });
    }
    Ok(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("30s", 30)]
    #[case("45m", 45 * 60)]
    #[case("2h", 2 * 60 * 60)]
    #[case(" 90m ", 90 * 60)]
    fn parses_valid_timeouts(#[case] raw: &str, #[case] expected_secs: u64) {
        let parsed = parse_timeout(Some(raw)).expect("timeout should parse");
        assert_eq!(parsed, Duration::from_secs(expected_secs));
    }

    #[test]
    fn missing_timeout_defaults_to_two_hours() {
        assert_eq!(parse_timeout(None).expect("default"), DEFAULT_TIMEOUT);
    }

    #[rstest]
    #[case("")]
    #[case("h")]
    #[case("10")]
    #[case("10d")]
    #[case("1.5h")]
    #[case("-5m")]
    #[case("0s")]
    #[case("3h")]
    #[case("121m")]
    #[case("99999999999999999999h")]
    fn rejects_invalid_timeouts(#[case] raw: &str) {
        let err = parse_timeout(Some(raw)).expect_err("timeout should be rejected");
        assert!(matches!(err, SuiteError::Timeout { .. }), "unexpected: {err}");
    }
}
