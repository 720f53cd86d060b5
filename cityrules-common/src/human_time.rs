//! Human-readable duration formatting for progress output
//!
//! Format selection by magnitude:
//! - `< 100s`  → `X.Xs`
//! - `< 100m`  → `M:SS`
//! - otherwise → `H:MM:SS`

/// Upper bound for the seconds-only format
const SHORT_FORMAT_MAX: f64 = 100.0;
/// Upper bound for the minutes format
const MEDIUM_FORMAT_MAX: f64 = 6000.0;

/// Format a duration in seconds.
///
/// Negative and non-finite inputs render as `--`.
///
/// # Examples
///
/// ```
/// use cityrules_common::human_time::format_duration;
///
/// assert_eq!(format_duration(4.2), "4.2s");
/// assert_eq!(format_duration(330.0), "5:30");
/// assert_eq!(format_duration(7261.0), "2:01:01");
/// assert_eq!(format_duration(f64::INFINITY), "--");
/// ```
pub fn format_duration(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "--".to_string();
    }

    if seconds < SHORT_FORMAT_MAX {
        format!("{:.1}s", seconds)
    } else if seconds < MEDIUM_FORMAT_MAX {
        let whole = seconds.round() as u64;
        format!("{}:{:02}", whole / 60, whole % 60)
    } else {
        let whole = seconds.round() as u64;
        format!("{}:{:02}:{:02}", whole / 3600, (whole % 3600) / 60, whole % 60)
    }
}

/// Format an optional ETA; `None` means the rate is not yet known.
///
/// ```
/// use cityrules_common::human_time::format_eta;
///
/// assert_eq!(format_eta(None), "estimating...");
/// assert_eq!(format_eta(Some(0.0)), "0.0s");
/// ```
pub fn format_eta(eta_seconds: Option<f64>) -> String {
    match eta_seconds {
        Some(secs) => format_duration(secs),
        None => "estimating...".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries() {
        assert_eq!(format_duration(0.0), "0.0s");
        assert_eq!(format_duration(99.94), "99.9s");
        assert_eq!(format_duration(100.0), "1:40");
        assert_eq!(format_duration(5999.0), "99:59");
        assert_eq!(format_duration(6000.0), "1:40:00");
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(format_duration(-1.0), "--");
        assert_eq!(format_duration(f64::NAN), "--");
    }
}
