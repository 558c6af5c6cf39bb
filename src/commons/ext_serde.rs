//! Defines helper methods for Serializing and Deserializing external types.

use std::str::FromStr;
use std::time::Duration;

use log::LevelFilter;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};


//------------ Duration ------------------------------------------------------

/// A duration as found in provider configuration: either a human readable
/// string such as `"72h"` or `"500ms"`, or a number of seconds.
#[derive(Deserialize)]
#[serde(untagged)]
enum FlexibleDuration {
    Seconds(u64),
    Text(String),
}

impl FlexibleDuration {
    fn into_duration<E: de::Error>(self) -> Result<Duration, E> {
        match self {
            FlexibleDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            FlexibleDuration::Text(text) => {
                humantime::parse_duration(text.trim()).map_err(|e| {
                    de::Error::custom(format!(
                        "invalid duration '{text}': {e}"
                    ))
                })
            }
        }
    }
}

pub fn de_duration<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    FlexibleDuration::deserialize(d)?.into_duration()
}

pub fn ser_duration<S>(duration: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    humantime::format_duration(*duration).to_string().serialize(s)
}


//------------ Bool ----------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum FlexibleBool {
    Bool(bool),
    Text(String),
}

/// Accepts both `true` and `"true"`, as provider configuration maps are
/// often built from string-only sources.
pub fn de_flexible_bool<'de, D>(d: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match FlexibleBool::deserialize(d)? {
        FlexibleBool::Bool(b) => Ok(b),
        FlexibleBool::Text(text) => bool::from_str(text.trim())
            .map_err(|_| de::Error::custom(format!("expected bool, found '{text}'"))),
    }
}


//------------ LevelFilter ---------------------------------------------------

pub fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}


//------------ Tests ---------------------------------------------------------
