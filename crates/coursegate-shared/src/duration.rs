//! Typed media duration.
//!
//! Content documents carry video lengths either as a number of seconds or as
//! a clock string (`"MM:SS"` or `"HH:MM:SS"`). Both forms are normalised into
//! [`MediaDuration`] when the document is deserialized, so nothing past
//! ingestion has to guess which representation it is looking at.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ParseError;

/// A strictly positive playback length.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct MediaDuration(Duration);

impl MediaDuration {
    pub fn from_secs_f64(secs: f64) -> Result<Self, ParseError> {
        if !secs.is_finite() || secs <= 0.0 {
            return Err(ParseError::InvalidDuration(secs.to_string()));
        }
        Duration::try_from_secs_f64(secs)
            .map(Self)
            .map_err(|_| ParseError::InvalidDuration(secs.to_string()))
    }

    /// Parse `"95"`, `"95.5"`, `"01:35"` or `"1:02:03"`.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let raw = raw.trim();
        if !raw.contains(':') {
            let secs: f64 = raw
                .parse()
                .map_err(|_| ParseError::InvalidDuration(raw.to_string()))?;
            return Self::from_secs_f64(secs);
        }

        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() > 3 {
            return Err(ParseError::InvalidDuration(raw.to_string()));
        }

        let mut total = 0.0;
        for (i, part) in parts.iter().enumerate() {
            let value: f64 = part
                .trim()
                .parse()
                .map_err(|_| ParseError::InvalidDuration(raw.to_string()))?;
            // Minutes and seconds fields must stay below 60, hours are free.
            let is_leading = i == 0;
            if value < 0.0 || (!is_leading && value >= 60.0) {
                return Err(ParseError::InvalidDuration(raw.to_string()));
            }
            total = total * 60.0 + value;
        }
        Self::from_secs_f64(total)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Serialize for MediaDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_secs_f64())
    }
}

impl<'de> Deserialize<'de> for MediaDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(f64),
            Clock(String),
        }

        let parsed = match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => MediaDuration::from_secs_f64(secs),
            Raw::Clock(s) => MediaDuration::parse(&s),
        };
        parsed.map_err(serde::de::Error::custom)
    }
}
