//! Serialize a [`Duration`] as whole milliseconds
//!
//! Use with `#[serde(with = "tilecast_core::serde_millis")]` on configuration
//! fields so settings stores can carry plain integers.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serialize as milliseconds
pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    serializer.serialize_u64(millis)
}

/// Deserialize from milliseconds
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Delay {
        #[serde(with = "super")]
        delay: Duration,
    }

    #[test]
    fn test_millis_representation() {
        let json = serde_json::to_string(&Delay {
            delay: Duration::from_millis(500),
        })
        .unwrap();
        assert_eq!(json, r#"{"delay":500}"#);

        let parsed: Delay = serde_json::from_str(r#"{"delay":100}"#).unwrap();
        assert_eq!(parsed.delay, Duration::from_millis(100));
    }
}
