//! String conversion helpers: typed scalar parsing for the parameter
//! map and the protocol, plus the time literal grammar used in
//! transport and scene commands.

/// A value that can round-trip through the string representation used by
/// the parameter map and the XML protocol.
pub trait Value: Sized {
    fn parse_text(text: &str) -> Option<Self>;
    fn format_text(&self) -> String;
}

macro_rules! impl_value_via_fromstr {
    ($($t:ty),*) => {
        $(impl Value for $t {
            fn parse_text(text: &str) -> Option<Self> {
                text.trim().parse().ok()
            }
            fn format_text(&self) -> String {
                self.to_string()
            }
        })*
    };
}

impl_value_via_fromstr!(i32, i64, u16, u32, u64, usize, f32, f64);

impl Value for bool {
    /// Accepts `1`/`0` as well as `true`/`false`.
    fn parse_text(text: &str) -> Option<Self> {
        match text.trim() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        }
    }

    fn format_text(&self) -> String {
        self.to_string()
    }
}

impl Value for String {
    fn parse_text(text: &str) -> Option<Self> {
        Some(text.to_string())
    }

    fn format_text(&self) -> String {
        self.clone()
    }
}

impl Value for &str {
    fn parse_text(_text: &str) -> Option<Self> {
        None
    }

    fn format_text(&self) -> String {
        self.to_string()
    }
}

/// Read a run of ASCII digits from the front of `input`; returns the
/// parsed number and the rest. At least one digit is required.
fn split_digits(input: &str) -> Option<(u64, &str)> {
    let end = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    if end == 0 {
        return None;
    }
    Some((input[..end].parse().ok()?, &input[end..]))
}

/// Read exactly two digits from the front of `input`.
fn split_two_digits(input: &str) -> Option<(u64, &str)> {
    let (head, rest) = input.split_at_checked(2)?;
    if !head.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((head.parse().ok()?, rest))
}

/// Read an optional fraction `.digits` from the front of `input`.
fn split_fraction(input: &str) -> Option<(f64, &str)> {
    match input.strip_prefix('.') {
        None => Some((0.0, input)),
        Some(rest) => {
            let end = rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len());
            if end == 0 {
                return None;
            }
            let fraction: f64 = format!("0.{}", &rest[..end]).parse().ok()?;
            Some((fraction, &rest[end..]))
        }
    }
}

/// Convert a time literal to seconds.
///
/// Accepted forms, optionally signed and surrounded by whitespace:
///
/// * `H:MM:SS[.frac]` with unbounded hours, two-digit minutes and
///   seconds, both below 60;
/// * `MM:SS[.frac]` with minutes below 60 and seconds exactly two
///   digits, below 60 including the fraction;
/// * a bare number with an optional unit suffix `h`, `min`, `s` or `ms`
///   (no suffix means seconds).
///
/// `"1:30.5"` is 90.5 s, `"200 ms"` is 0.2 s, `"-2:11:33"` is −7893 s.
pub fn parse_time(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    let colons = trimmed.matches(':').count();

    if colons == 0 {
        return parse_suffixed_seconds(trimmed);
    }
    if colons > 2 {
        return None;
    }

    let (negative, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (
            false,
            trimmed.strip_prefix('+').unwrap_or(trimmed).trim_start(),
        ),
    };

    let (hours, minutes, rest) = if colons == 2 {
        let (hours, rest) = split_digits(rest)?;
        let rest = rest.strip_prefix(':')?;
        let (minutes, rest) = split_two_digits(rest)?;
        (hours, minutes, rest)
    } else {
        let (minutes, rest) = split_digits(rest)?;
        (0, minutes, rest)
    };
    if minutes > 59 {
        return None;
    }

    let rest = rest.strip_prefix(':')?;
    let (whole_seconds, rest) = split_two_digits(rest)?;
    if whole_seconds > 59 {
        return None;
    }
    let (fraction, rest) = split_fraction(rest)?;
    if !rest.is_empty() {
        return None;
    }

    let seconds_part = whole_seconds as f64 + fraction;
    if seconds_part >= 60.0 {
        return None;
    }

    let total = hours as f64 * 3600.0 + minutes as f64 * 60.0 + seconds_part;
    Some(if negative { -total } else { total })
}

fn parse_suffixed_seconds(input: &str) -> Option<f64> {
    let (number_text, factor) = if let Some(head) = input.strip_suffix("ms") {
        (head, 0.001)
    } else if let Some(head) = input.strip_suffix("min") {
        (head, 60.0)
    } else if let Some(head) = input.strip_suffix('s') {
        (head, 1.0)
    } else if let Some(head) = input.strip_suffix('h') {
        (head, 3600.0)
    } else {
        (input, 1.0)
    };
    let number: f64 = number_text.trim_end().parse().ok()?;
    Some(number * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn typed_parsing() {
        assert_eq!(i32::parse_text(" -42 "), Some(-42));
        assert_eq!(f64::parse_text("2.5"), Some(2.5));
        assert_eq!(bool::parse_text("1"), Some(true));
        assert_eq!(bool::parse_text("false"), Some(false));
        assert_eq!(bool::parse_text("yes"), None);
        assert_eq!(u32::parse_text("3.5"), None);
        assert_eq!(String::parse_text(" keep me "), Some(" keep me ".into()));
    }

    #[test]
    fn formatting() {
        assert_eq!(true.format_text(), "true");
        assert_eq!(3.5f64.format_text(), "3.5");
        assert_eq!((-7i32).format_text(), "-7");
    }

    #[test]
    fn time_minutes_seconds() {
        assert_abs_diff_eq!(parse_time("4:33").unwrap(), 273.0);
        assert_abs_diff_eq!(parse_time("01:33.3").unwrap(), 93.3, epsilon = 1e-9);
        assert_abs_diff_eq!(parse_time("1:30.5").unwrap(), 90.5, epsilon = 1e-9);
        assert_abs_diff_eq!(parse_time("-2:30").unwrap(), -150.0);
    }

    #[test]
    fn time_hours_minutes_seconds() {
        assert_abs_diff_eq!(parse_time("-2:11:33").unwrap(), -7893.0);
        assert_abs_diff_eq!(parse_time("1:00:00").unwrap(), 3600.0);
        assert_abs_diff_eq!(parse_time("100:00:59.25").unwrap(), 360059.25);
    }

    #[test]
    fn time_suffixes() {
        assert_abs_diff_eq!(parse_time("33 ms").unwrap(), 0.033, epsilon = 1e-12);
        assert_abs_diff_eq!(parse_time("200ms").unwrap(), 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(parse_time("1.5 min").unwrap(), 90.0);
        assert_abs_diff_eq!(parse_time("2h").unwrap(), 7200.0);
        assert_abs_diff_eq!(parse_time("42").unwrap(), 42.0);
        assert_abs_diff_eq!(parse_time("-0.5 s").unwrap(), -0.5);
    }

    #[test]
    fn time_rejections() {
        assert_eq!(parse_time("1:60.0"), None); // seconds out of range
        assert_eq!(parse_time("71:33"), None); // minutes out of range
        assert_eq!(parse_time("1:5"), None); // seconds need two digits
        assert_eq!(parse_time("1:05:"), None);
        assert_eq!(parse_time("1:2:3:4"), None);
        assert_eq!(parse_time("12 parsec"), None);
        assert_abs_diff_eq!(parse_time("1:59.99").unwrap(), 119.99, epsilon = 1e-9);
    }
}
