//! Renders elapsed seconds as `H:MM:SS.mmm` for table rows and files.

/// Format a duration in seconds for display. Milliseconds are truncated,
/// not rounded, so a row never shows time that has not elapsed yet.
pub fn format_elapsed(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return format!("{seconds}");
    }
    let whole = seconds as u64;
    let millis = ((seconds - whole as f64) * 1000.0) as u64;
    let hours = whole / 3600;
    let minutes = (whole % 3600) / 60;
    let secs = whole % 60;
    format!("{hours}:{minutes:02}:{secs:02}.{millis:03}")
}

/// Inverse of [`format_elapsed`], good to millisecond precision.
pub fn parse_elapsed(text: &str) -> Option<f64> {
    let (clock, millis) = text.split_once('.')?;
    let mut parts = clock.splitn(3, ':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let secs: u64 = parts.next()?.parse().ok()?;
    let millis: u64 = millis.parse().ok()?;
    Some((hours * 3600 + minutes * 60 + secs) as f64 + millis as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! format_tests {
        ($($name:ident: $value:expr,)*) => {
            $(
                #[test]
                fn $name() {
                    let (seconds, expected) = $value;
                    assert_eq!(
                        format_elapsed(seconds),
                        expected,
                        "formatting {} seconds",
                        seconds
                    );
                }
            )*
        }
    }

    format_tests! {
        zero: (0.0, "0:00:00.000"),
        sub_second: (0.25, "0:00:00.250"),
        one_second: (1.0, "0:00:01.000"),
        millis_truncated_not_rounded: (3.5009, "0:00:03.500"),
        just_under_a_minute: (59.999, "0:00:59.999"),
        minute_rollover: (60.0, "0:01:00.000"),
        over_an_hour: (3661.25, "1:01:01.250"),
        hours_not_padded: (36000.5, "10:00:00.500"),
        negative_falls_back: (-1.5, "-1.5"),
    }

    #[test]
    fn non_finite_falls_back_to_raw() {
        assert_eq!(format_elapsed(f64::NAN), "NaN");
        assert_eq!(format_elapsed(f64::INFINITY), "inf");
    }

    #[test]
    fn parse_inverts_format() {
        for seconds in [0.0, 0.1, 1.5, 59.999, 60.0, 3599.5, 3600.0, 86399.999] {
            let text = format_elapsed(seconds);
            let back = parse_elapsed(&text).expect("parse back");
            assert!(
                (back - seconds).abs() < 0.0015,
                "round trip {} -> {} -> {}",
                seconds,
                text,
                back
            );
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse_elapsed("not a time"), None);
        assert_eq!(parse_elapsed("1:02"), None);
        assert_eq!(parse_elapsed("1:02:03"), None);
    }
}
