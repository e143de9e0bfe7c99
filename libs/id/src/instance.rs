//! Instance identifiers.
//!
//! Instance ids double as directory names under the node's instances
//! directory, so every constructor runs the allow-list check. There is no
//! way to build an `InstanceId` holding a separator or a dot.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::IdError;

/// Longest accepted instance id.
pub const MAX_INSTANCE_ID_LEN: usize = 128;

/// Validated instance identifier (`[A-Za-z0-9_-]+`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    /// Validates `s` against the allow-list.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > MAX_INSTANCE_ID_LEN {
            return Err(IdError::TooLong {
                len: s.len(),
                max: MAX_INSTANCE_ID_LEN,
            });
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(IdError::IllegalCharacters { id: s.to_string() });
        }
        Ok(Self(s.to_string()))
    }

    /// Derives the id of the instance listening on `port` in `region`.
    pub fn derive(region: &str, port: u16) -> Result<Self, IdError> {
        Self::parse(&format!("{region}-{port}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for InstanceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::borrow::Borrow<str> for InstanceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<std::path::Path> for InstanceId {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.0)
    }
}

impl Serialize for InstanceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_derive_from_region_and_port() {
        let id = InstanceId::derive("eu-west", 7777).unwrap();
        assert_eq!(id.as_str(), "eu-west-7777");
    }

    #[test]
    fn test_region_with_space_is_rejected() {
        let err = InstanceId::derive("eu west", 7777).unwrap_err();
        assert!(err.is_allow_list_error());
    }

    #[test]
    fn test_traversal_is_rejected() {
        for bad in ["../etc", "a/b", "a\\b", "a.b", "..", "inst\0"] {
            assert!(InstanceId::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_too_long() {
        let long = "a".repeat(MAX_INSTANCE_ID_LEN + 1);
        assert!(matches!(
            InstanceId::parse(&long).unwrap_err(),
            IdError::TooLong { .. }
        ));
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: InstanceId = serde_json::from_str("\"us_east-1\"").unwrap();
        assert_eq!(ok.as_str(), "us_east-1");
        assert!(serde_json::from_str::<InstanceId>("\"../x\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_allow_listed_strings_parse(s in "[A-Za-z0-9_-]{1,64}") {
            let id = InstanceId::parse(&s).unwrap();
            prop_assert_eq!(id.as_str(), s.as_str());
        }

        #[test]
        fn prop_any_foreign_char_rejects(
            prefix in "[A-Za-z0-9_-]{0,16}",
            bad in "[^A-Za-z0-9_-]",
            suffix in "[A-Za-z0-9_-]{0,16}",
        ) {
            let candidate = format!("{prefix}{bad}{suffix}");
            prop_assert!(InstanceId::parse(&candidate).is_err());
        }
    }
}
