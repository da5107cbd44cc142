//! Serde helpers that store `Duration`s as fractional seconds.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

fn from_secs<E: serde::de::Error>(secs: f64) -> Result<Duration, E> {
    Duration::try_from_secs_f64(secs).map_err(|e| E::custom(format!("invalid duration {}: {}", secs, e)))
}

/// `Duration` as seconds.
pub mod secs {
    use super::{Deserialize, Deserializer, Duration, Serializer, from_secs};

    /// Serializes as seconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    /// Deserializes from seconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        from_secs(f64::deserialize(deserializer)?)
    }
}

/// `Option<Duration>` as optional seconds.
pub mod option_secs {
    use super::{Deserialize, Deserializer, Duration, Serializer, from_secs};

    /// Serializes as optional seconds.
    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    /// Deserializes from optional seconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?.map(from_secs).transpose()
    }
}
