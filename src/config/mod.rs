//! Settings and configuration module
//!
//! Provides unified configuration with:
//! - JSON loading
//! - Validation of ranges and capacities
//! - Per-component sections with defaults

pub mod settings;

pub use settings::{ConfigError, HarvesterConfig, NavigationConfig, ProxySpec};

/// Serde helpers that encode durations as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    /// Same encoding for `(min, max)` ranges.
    pub mod range {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(value: &(Duration, Duration), serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            use serde::ser::SerializeTuple;
            let mut tuple = serializer.serialize_tuple(2)?;
            tuple.serialize_element(&(value.0.as_millis() as u64))?;
            tuple.serialize_element(&(value.1.as_millis() as u64))?;
            tuple.end()
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<(Duration, Duration), D::Error>
        where
            D: Deserializer<'de>,
        {
            let (min, max) = <(u64, u64)>::deserialize(deserializer)?;
            Ok((Duration::from_millis(min), Duration::from_millis(max)))
        }
    }

    /// Optional durations, `null` when unset.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}
