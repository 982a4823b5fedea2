//! Diff annotations
//!
//! Every node of a diff result carries a [`DiffTags`] map from [`Tag`] to an
//! integer. Leaves use `correct`/`incorrect`/`extra`/`missing` with value 1;
//! directories aggregate over their direct children with the `ch_*` counters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    /// File matches the goal
    Correct,
    /// File exists in both trees but attributes differ
    Incorrect,
    /// Present only in the current tree
    Extra,
    /// Present only in the goal tree
    Missing,
    /// Direct children tagged missing
    ChMissing,
    /// Direct children tagged extra
    ChExtra,
    /// Direct children containing an error
    ChIncorrect,
    /// Goal expects this node to be found
    ToSelect,
    /// Selection verdict: 0 right, 1 wrong, -1 never selected
    Selected,
}

impl Tag {
    /// Directory error counters
    pub const COUNTERS: [Tag; 3] = [Tag::ChMissing, Tag::ChExtra, Tag::ChIncorrect];
}

/// Tag map attached to a diff node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiffTags(BTreeMap<Tag, i64>);

impl DiffTags {
    /// Empty map
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Map with one tag set to 1
    #[inline]
    #[must_use]
    pub fn single(tag: Tag) -> Self {
        let mut tags = Self::new();
        tags.set(tag, 1);
        tags
    }

    /// Value of a tag
    #[inline]
    #[must_use]
    pub fn get(&self, tag: Tag) -> Option<i64> {
        self.0.get(&tag).copied()
    }

    /// Whether the tag is present
    #[inline]
    #[must_use]
    pub fn has(&self, tag: Tag) -> bool {
        self.0.contains_key(&tag)
    }

    /// Set a tag value
    #[inline]
    pub fn set(&mut self, tag: Tag, value: i64) {
        self.0.insert(tag, value);
    }

    /// Add to a counter; zero amounts leave the map untouched
    #[inline]
    pub fn add(&mut self, tag: Tag, amount: i64) {
        if amount != 0 {
            *self.0.entry(tag).or_insert(0) += amount;
        }
    }

    /// Increment a counter by one
    #[inline]
    pub fn incr(&mut self, tag: Tag) {
        self.add(tag, 1);
    }

    /// Sum of the directory error counters
    #[must_use]
    pub fn error_count(&self) -> i64 {
        Tag::COUNTERS.iter().filter_map(|t| self.get(*t)).sum()
    }

    /// Whether this node carries an error of its own or in its counters
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.has(Tag::Incorrect) || self.has(Tag::Extra) || self.has(Tag::Missing) || self.error_count() > 0
    }

    /// No tags at all
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over tags and values
    pub fn iter(&self) -> impl Iterator<Item = (Tag, i64)> + '_ {
        self.0.iter().map(|(t, v)| (*t, *v))
    }
}
