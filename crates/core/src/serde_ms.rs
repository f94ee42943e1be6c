//! Serialize a [`Duration`] as integer milliseconds.
//!
//! ```rust,ignore
//! #[serde(with = "lowtide_core::serde_ms")]
//! pub sync_interval: Duration,
//! ```

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Serialize as milliseconds.
pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

/// Deserialize from milliseconds.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Same encoding for `Option<Duration>`.
pub mod option {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as optional milliseconds.
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize from optional milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        #[serde(with = "crate::serde_ms")]
        every: Duration,
        #[serde(with = "crate::serde_ms::option", default)]
        window: Option<Duration>,
    }

    #[test]
    fn durations_are_plain_millis() {
        let probe = Probe {
            every: Duration::from_secs(2),
            window: Some(Duration::from_millis(250)),
        };
        let json = serde_json::to_string(&probe).unwrap();
        assert_eq!(json, r#"{"every":2000,"window":250}"#);
        let back: Probe = serde_json::from_str(r#"{"every":1500}"#).unwrap();
        assert_eq!(back.every, Duration::from_millis(1500));
        assert_eq!(back.window, None);
    }
}
