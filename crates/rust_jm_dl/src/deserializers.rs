//! Contains definitions for deserialize patterns with user-defined types.
//!
//! The JM app api is loose with its types: ids show up as numbers or strings,
//! counters as strings, and timestamps as unix seconds inside strings.

use chrono::{DateTime, Utc};
use log::LevelFilter;
use serde::Deserialize;

pub fn deserialize_logging_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let input_level = String::deserialize(deserializer)?;

    match input_level.to_ascii_uppercase().as_str() {
        "TRACE" => Ok(LevelFilter::Trace),
        "DEBUG" => Ok(LevelFilter::Debug),
        "INFO" => Ok(LevelFilter::Info),
        "WARN" => Ok(LevelFilter::Warn),
        "ERROR" => Ok(LevelFilter::Error),
        "OFF" => Ok(LevelFilter::Off),
        _ => Err(serde::de::Error::custom(format!(
            "invalid logging level {input_level:?}"
        ))),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(serde_json::Number),
}

impl StringOrNumber {
    fn into_string(self) -> String {
        match self {
            Self::String(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

/// Helper function to deserialize ids that may be either `123` or `"123"`
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = StringOrNumber::deserialize(deserializer)?.into_string();

    raw.trim()
        .parse::<u64>()
        .map_err(|_| serde::de::Error::custom(format!("invalid id {raw:?}")))
}

/// Helper function to deserialize a value as [`String`] even if it's a number.
///
/// Missing values and `null` become an empty string.
pub fn deserialize_lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Option::<StringOrNumber>::deserialize(deserializer)?;
    Ok(v.map(StringOrNumber::into_string).unwrap_or_default())
}

/// Helper function to deserialize counters such as likes and views.
///
/// These come as `"1234"`, `1234`, or occasionally `"1.2K"`; anything
/// unparseable becomes `0` rather than failing the whole record.
pub fn deserialize_counter<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Option::<StringOrNumber>::deserialize(deserializer)?;
    let raw = v.map(StringOrNumber::into_string).unwrap_or_default();

    Ok(parse_counter(&raw))
}

fn parse_counter(raw: &str) -> u64 {
    let raw = raw.trim().replace(',', "");
    let (number, multiplier) = match raw.chars().last() {
        Some('K' | 'k') => (&raw[..raw.len() - 1], 1_000f64),
        Some('M' | 'm') => (&raw[..raw.len() - 1], 1_000_000f64),
        _ => (raw.as_str(), 1f64),
    };

    number
        .parse::<f64>()
        .map(|n| (n * multiplier).round() as u64)
        .unwrap_or(0)
}

/// Helper function to deserialize unix seconds (as number or string) into [`DateTime<Utc>`]
pub fn deserialize_unix_time_maybe<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Option::<StringOrNumber>::deserialize(deserializer)?;

    Ok(v.map(StringOrNumber::into_string)
        .and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0)))
}

/// Deserializes either a list of strings or a single whitespace-separated string
/// into [`Vec<String>`]; `null` becomes an empty list.
pub fn deserialize_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrString {
        List(Vec<StringOrNumber>),
        String(String),
    }

    let v = Option::<ListOrString>::deserialize(deserializer)?;

    Ok(match v {
        None => Vec::new(),
        Some(ListOrString::List(items)) => items
            .into_iter()
            .map(StringOrNumber::into_string)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(ListOrString::String(s)) => s.split_whitespace().map(str::to_string).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Sample {
        #[serde(deserialize_with = "deserialize_id")]
        id: u64,
        #[serde(default, deserialize_with = "deserialize_counter")]
        likes: u64,
        #[serde(default, deserialize_with = "deserialize_string_list")]
        tags: Vec<String>,
        #[serde(default, deserialize_with = "deserialize_unix_time_maybe")]
        addtime: Option<DateTime<Utc>>,
    }

    #[test]
    fn loose_types() {
        let s: Sample = serde_json::from_str(
            r#"{"id": "350234", "likes": "1.5K", "tags": "a  b c", "addtime": "1700000000"}"#,
        )
        .unwrap();

        assert_eq!(s.id, 350234);
        assert_eq!(s.likes, 1500);
        assert_eq!(s.tags, vec!["a", "b", "c"]);
        assert_eq!(s.addtime.unwrap().timestamp(), 1_700_000_000);

        let s: Sample = serde_json::from_str(r#"{"id": 7, "tags": ["x", 3], "likes": null}"#).unwrap();
        assert_eq!(s.id, 7);
        assert_eq!(s.likes, 0);
        assert_eq!(s.tags, vec!["x", "3"]);
        assert!(s.addtime.is_none());
    }

    #[test]
    fn bad_id_is_an_error() {
        assert!(serde_json::from_str::<Sample>(r#"{"id": "abc"}"#).is_err());
    }
}
