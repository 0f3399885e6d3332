//! Serde helpers that encode durations as integer milliseconds.
//!
//! Use with `#[serde(with = "crate::utils::duration_ms")]`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serializes a duration as milliseconds.
pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    serializer.serialize_u64(millis)
}

/// Deserializes a duration from milliseconds.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timed {
        #[serde(with = "super")]
        wait: Duration,
    }

    #[test]
    fn test_duration_as_millis() {
        let timed = Timed {
            wait: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&timed).unwrap();
        assert_eq!(json["wait"], 1500);
    }

    #[test]
    fn test_duration_from_millis() {
        let timed: Timed = serde_json::from_str(r#"{"wait": 250}"#).unwrap();
        assert_eq!(timed.wait, Duration::from_millis(250));
    }
}
