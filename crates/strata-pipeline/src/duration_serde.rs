//! Serde helpers for human-readable durations such as `"250ms"`, `"30s"` or `"5m"`.

use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(duration))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// `Option<Duration>` variant, for use with `#[serde(default, with = "duration_serde::option")]`.
pub mod option {
    use super::*;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&format_duration(d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

fn format_duration(duration: &Duration) -> String {
    format!("{}ms", duration.as_millis())
}

/// Parse a duration string with one of the suffixes `ms`, `s`, `m`, `h`, `d`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (digits, unit_ms) = if let Some(val) = s.strip_suffix("ms") {
        (val, 1)
    } else if let Some(val) = s.strip_suffix('s') {
        (val, 1_000)
    } else if let Some(val) = s.strip_suffix('m') {
        (val, 60_000)
    } else if let Some(val) = s.strip_suffix('h') {
        (val, 3_600_000)
    } else if let Some(val) = s.strip_suffix('d') {
        (val, 86_400_000)
    } else {
        return Err(format!("unknown duration format: {}", s));
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|e| format!("invalid duration '{}': {}", s, e))?;
    Ok(Duration::from_millis(n.saturating_mul(unit_ms)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_suffix() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn rejects_unknown_suffix() {
        assert!(parse_duration("10 weeks").is_err());
        assert!(parse_duration("abcs").is_err());
    }

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Holder {
        #[serde(default, with = "super::option")]
        timeout: Option<Duration>,
    }

    #[test]
    fn optional_field_serde() {
        let h: Holder = serde_json::from_str(r#"{"timeout": "2s"}"#).unwrap();
        assert_eq!(h.timeout, Some(Duration::from_secs(2)));

        let h: Holder = serde_json::from_str("{}").unwrap();
        assert_eq!(h.timeout, None);

        let json = serde_json::to_string(&Holder {
            timeout: Some(Duration::from_millis(1500)),
        })
        .unwrap();
        assert_eq!(json, r#"{"timeout":"1500ms"}"#);
    }
}
