//! File attributes captured in a snapshot
//!
//! Provides [`Attribute`] keys and the [`AttributeSet`] map attached to files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Attribute key a task may declare as relevant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    /// Owning user
    User,
    /// Owning group
    Group,
    /// Byte length
    Size,
    /// Permission bits
    Mode,
    /// Last access time
    Atime,
    /// Last modification time
    Mtime,
    /// Last status change time
    Ctime,
    /// Verbatim file content
    Content,
}

impl Attribute {
    /// All attribute keys in canonical order
    pub const ALL: [Attribute; 8] = [
        Attribute::User,
        Attribute::Group,
        Attribute::Size,
        Attribute::Mode,
        Attribute::Atime,
        Attribute::Mtime,
        Attribute::Ctime,
        Attribute::Content,
    ];

    /// Timestamps are never required to match
    #[inline]
    #[must_use]
    pub fn is_timestamp(self) -> bool {
        matches!(self, Self::Atime | Self::Mtime | Self::Ctime)
    }

    /// Key as written in JSON
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::Size => "size",
            Self::Mode => "mode",
            Self::Atime => "atime",
            Self::Mtime => "mtime",
            Self::Ctime => "ctime",
            Self::Content => "content",
        }
    }
}

impl Display for Attribute {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Attribute {
    type Err = UnknownAttribute;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| UnknownAttribute(s.to_string()))
    }
}

/// Unrecognized attribute key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown attribute: {0}")]
pub struct UnknownAttribute(pub String);

/// Attribute values of a single file
///
/// Absent keys are never compared. A present key with a `None` value means
/// the attribute was requested but could not be determined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeSet(BTreeMap<Attribute, Option<String>>);

impl AttributeSet {
    /// Empty set
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert
    #[inline]
    #[must_use]
    pub fn with(mut self, key: Attribute, value: impl Into<String>) -> Self {
        self.0.insert(key, Some(value.into()));
        self
    }

    /// Insert or replace a value
    #[inline]
    pub fn insert(&mut self, key: Attribute, value: Option<String>) {
        self.0.insert(key, value);
    }

    /// Value for key; `None` when the key is absent or has no value
    #[inline]
    #[must_use]
    pub fn get(&self, key: Attribute) -> Option<&str> {
        self.0.get(&key).and_then(|v| v.as_deref())
    }

    /// Whether the key is present at all
    #[inline]
    #[must_use]
    pub fn contains(&self, key: Attribute) -> bool {
        self.0.contains_key(&key)
    }

    /// Raw entry for key
    #[inline]
    #[must_use]
    pub fn entry(&self, key: Attribute) -> Option<&Option<String>> {
        self.0.get(&key)
    }

    /// Iterate over present keys and values
    pub fn iter(&self) -> impl Iterator<Item = (Attribute, Option<&str>)> {
        self.0.iter().map(|(k, v)| (*k, v.as_deref()))
    }

    /// Number of present keys
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// No keys present
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy restricted to the requested keys
    #[must_use]
    pub fn filtered(&self, keys: &[Attribute]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(k, _)| keys.contains(k))
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
        )
    }
}

impl FromIterator<(Attribute, Option<String>)> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = (Attribute, Option<String>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
