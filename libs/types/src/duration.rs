//! Serde helpers for human-written durations
//!
//! Accepts either a bare integer (milliseconds) or a string with a unit
//! suffix: `"250ms"`, `"1s"`, `"1.5s"`, `"2m"`, `"1h"`. A string without a
//! unit is read as milliseconds too. Durations are written back as `"<n>ms"`.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serializer};
use std::time::Duration;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Millis(u64),
    Text(String),
}

/// Parse a duration string such as `"1s"` or `"250ms"`
pub fn parse(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration {input:?}"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("duration must be a non-negative number: {input:?}"));
    }

    let unit_nanos = match unit.trim() {
        "" | "ms" => 1e6,
        "s" => 1e9,
        "m" => 60.0 * 1e9,
        "h" => 3600.0 * 1e9,
        other => return Err(format!("unknown duration unit {other:?} in {input:?}")),
    };

    Ok(from_nanos_f64(value * unit_nanos))
}

/// Round a nanosecond count to a [`Duration`], saturating at [`Duration::MAX`]
pub fn from_nanos_f64(nanos: f64) -> Duration {
    if !nanos.is_finite() || nanos >= u64::MAX as f64 {
        return Duration::MAX;
    }
    Duration::from_nanos(nanos.max(0.0).round() as u64)
}

/// Deserialize a [`Duration`] from an integer or a unit-suffixed string
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Millis(ms) => Ok(Duration::from_millis(ms)),
        RawDuration::Text(text) => parse(&text).map_err(de::Error::custom),
    }
}

/// Serialize a [`Duration`] as a millisecond string
pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{}ms", duration.as_millis()))
}

/// Same helpers for `Option<Duration>` fields
pub mod option {
    use super::RawDuration;
    use serde::de::{self, Deserializer};
    use serde::{Deserialize, Serializer};
    use std::time::Duration;

    /// Deserialize an optional duration; `null` maps to `None`
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<RawDuration>::deserialize(deserializer)? {
            None => Ok(None),
            Some(RawDuration::Millis(ms)) => Ok(Some(Duration::from_millis(ms))),
            Some(RawDuration::Text(text)) => {
                super::parse(&text).map(Some).map_err(de::Error::custom)
            }
        }
    }

    /// Serialize an optional duration
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse("40").unwrap(), Duration::from_millis(40));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("fast").is_err());
        assert!(parse("-1s").is_err());
        assert!(parse("3d").is_err());
    }
}
