//! Go-compatible duration strings
//!
//! cert-manager stores `duration` and `renewBefore` as Go `time.Duration`
//! strings and the API server re-encodes whatever it receives in that
//! canonical form (`1h0m0s`, `30m0s`, `1.5s`). Writing the canonical form
//! ourselves keeps repeated updates byte-identical with what is stored.

use std::time::Duration;

use crate::Error;

const NANOS_PER_MICRO: u128 = 1_000;
const NANOS_PER_MILLI: u128 = 1_000_000;
const NANOS_PER_SEC: u128 = 1_000_000_000;
const NANOS_PER_MIN: u128 = 60 * NANOS_PER_SEC;
const NANOS_PER_HOUR: u128 = 60 * NANOS_PER_MIN;

/// Format a duration the way Go's `time.Duration.String()` does
pub fn format(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }

    if nanos < NANOS_PER_SEC {
        let (unit, scale) = if nanos < NANOS_PER_MICRO {
            ("ns", 1)
        } else if nanos < NANOS_PER_MILLI {
            ("µs", NANOS_PER_MICRO)
        } else {
            ("ms", NANOS_PER_MILLI)
        };
        return format!("{}{}", fractional(nanos, scale), unit);
    }

    let hours = nanos / NANOS_PER_HOUR;
    let minutes = (nanos % NANOS_PER_HOUR) / NANOS_PER_MIN;
    let seconds = fractional(nanos % NANOS_PER_MIN, NANOS_PER_SEC);

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    out.push_str(&seconds);
    out.push('s');
    out
}

/// Render `value / scale` with trailing fractional zeros trimmed
fn fractional(value: u128, scale: u128) -> String {
    let whole = value / scale;
    let rem = value % scale;
    if rem == 0 {
        return whole.to_string();
    }
    let width = scale.ilog10() as usize;
    let digits = format!("{rem:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

/// Parse a Go duration string such as `1h30m`, `90s` or `1.5h`
///
/// Negative durations are rejected; they have no meaning for certificate
/// lifetimes.
pub fn parse(input: &str) -> Result<Duration, Error> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::config("empty duration"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.starts_with('-') {
        return Err(Error::config(format!("negative duration {input:?}")));
    }
    let s = s.strip_prefix('+').unwrap_or(s);

    let mut total: f64 = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| Error::config(format!("missing unit in duration {input:?}")))?;
        if num_len == 0 {
            return Err(Error::config(format!("invalid duration {input:?}")));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| Error::config(format!("invalid number in duration {input:?}")))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => NANOS_PER_MICRO as f64,
            "ms" => NANOS_PER_MILLI as f64,
            "s" => NANOS_PER_SEC as f64,
            "m" => NANOS_PER_MIN as f64,
            "h" => NANOS_PER_HOUR as f64,
            unit => {
                return Err(Error::config(format!(
                    "unknown unit {unit:?} in duration {input:?}"
                )))
            }
        };
        rest = &rest[unit_len..];
        total += value * nanos_per_unit;
    }

    if !total.is_finite() || total > u64::MAX as f64 {
        return Err(Error::config(format!("duration {input:?} out of range")));
    }
    Ok(Duration::from_nanos(total.round() as u64))
}
