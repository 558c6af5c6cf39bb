use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};


//------------ BuildVersion --------------------------------------------------

/// The software build a server advertises through membership metadata.
///
/// Builds use `major.minor.patch` with an optional `-prerelease` part and
/// an optional `+metadata` part, e.g. `1.9.1`, `1.10.0-beta2` or
/// `1.8.3+ent`. Metadata is kept for display but ignored when comparing.
#[derive(Clone, Debug)]
pub struct BuildVersion {
    major: u64,
    minor: u64,
    patch: u64,
    pre_release: Option<String>,
    metadata: Option<String>,
}

impl BuildVersion {
    pub const fn release(major: u64, minor: u64, patch: u64) -> Self {
        BuildVersion {
            major,
            minor,
            patch,
            pre_release: None,
            metadata: None,
        }
    }
}

impl FromStr for BuildVersion {
    type Err = BuildVersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // x.y.z            => release
        // x.y.z-<pre>      => pre-release
        // x.y.z[-<pre>]+m  => either, with build metadata
        // other            => cannot parse
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);

        let (version, metadata) = match s.split_once('+') {
            Some((version, meta)) => (version, Some(meta.to_string())),
            None => (s, None),
        };
        let (version, pre_release) = match version.split_once('-') {
            Some((version, pre)) if !pre.is_empty() => {
                (version, Some(pre.to_string()))
            }
            Some(_) => return Err(BuildVersionParseError::for_str(s)),
            None => (version, None),
        };

        let parts: Vec<&str> = version.split('.').collect();
        if parts.len() != 3 {
            return Err(BuildVersionParseError::for_str(s));
        }

        let number = |part: &str| {
            u64::from_str(part).map_err(|_| BuildVersionParseError::for_str(s))
        };

        Ok(BuildVersion {
            major: number(parts[0])?,
            minor: number(parts[1])?,
            patch: number(parts[2])?,
            pre_release,
            metadata,
        })
    }
}

impl fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre_release {
            write!(f, "-{pre}")?;
        }
        if let Some(meta) = &self.metadata {
            write!(f, "+{meta}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct BuildVersionParseError(String);

impl BuildVersionParseError {
    fn for_str(s: &str) -> Self {
        BuildVersionParseError(s.to_string())
    }
}

impl fmt::Display for BuildVersionParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Could not parse build version from string: {}", self.0)
    }
}

impl std::error::Error for BuildVersionParseError {}

impl Ord for BuildVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (&self.pre_release, &other.pre_release) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(mine), Some(theirs)) => mine.cmp(theirs),
            })
    }
}

impl PartialOrd for BuildVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for BuildVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BuildVersion {}

impl Serialize for BuildVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BuildVersion {
    fn deserialize<D>(
        deserializer: D,
    ) -> std::result::Result<BuildVersion, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        BuildVersion::from_str(string.as_str()).map_err(de::Error::custom)
    }
}


//------------ Tests ---------------------------------------------------------
