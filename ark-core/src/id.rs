use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Longest accepted VM name. Names end up inside directory names and
/// process arguments, so they are kept short.
pub const MAX_NAME_LEN: usize = 48;

/// Unique, human-chosen name of a VM instance.
///
/// Accepted names are 1 to [`MAX_NAME_LEN`] characters of lowercase ASCII
/// letters, digits, `-` and `_`, starting with a letter or digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VmName(String);

impl VmName {
    /// Validates and wraps a VM name.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidName`] if the name is empty, too long,
    /// or contains characters outside `[a-z0-9_-]`.
    pub fn new(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        let reject = |reason: &str| CoreError::InvalidName {
            name: name.clone(),
            reason: reason.to_owned(),
        };

        let Some(first) = name.chars().next() else {
            return Err(reject("must not be empty"));
        };
        if name.len() > MAX_NAME_LEN {
            return Err(reject(&format!("must be at most {MAX_NAME_LEN} characters")));
        }
        if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
            return Err(reject("must start with a lowercase letter or digit"));
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_'))
        {
            return Err(reject(&format!("character '{bad}' is not allowed")));
        }

        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VmName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for VmName {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<VmName> for String {
    fn from(name: VmName) -> Self {
        name.0
    }
}

impl AsRef<str> for VmName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique identifier for one launched subsystem process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SubsystemId(pub Uuid);

impl SubsystemId {
    /// Creates a new random `SubsystemId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubsystemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubsystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SubsystemId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_name_accepts_typical_names() {
        for name in ["redis", "vm-0", "a", "web_01", "0abc"] {
            assert!(VmName::new(name).is_ok(), "{name} should be accepted");
        }
    }

    #[test]
    fn vm_name_rejects_bad_names() {
        for name in ["", "-lead", "_lead", "Upper", "has space", "dot.name", "slash/name", "ümlaut"] {
            assert!(
                matches!(VmName::new(name), Err(CoreError::InvalidName { .. })),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn vm_name_rejects_overlong_names() {
        let name = "a".repeat(MAX_NAME_LEN + 1);
        assert!(VmName::new(name).is_err());
        let name = "a".repeat(MAX_NAME_LEN);
        assert!(VmName::new(name).is_ok());
    }

    #[test]
    fn vm_name_deserialization_validates() {
        let ok: Result<VmName, _> = serde_json::from_str("\"redis\"");
        assert!(ok.is_ok());
        let bad: Result<VmName, _> = serde_json::from_str("\"../etc\"");
        assert!(bad.is_err(), "path-like names must not deserialize");
    }

    proptest::proptest! {
        #[test]
        fn proptest_valid_names_never_contain_path_separators(s in "\\PC{0,64}") {
            if let Ok(name) = VmName::new(s) {
                proptest::prop_assert!(!name.as_str().contains('/'));
                proptest::prop_assert!(!name.as_str().contains(".."));
                proptest::prop_assert!(name.as_str().len() <= MAX_NAME_LEN);
            }
        }
    }
}
