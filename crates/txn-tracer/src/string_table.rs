// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! String interning for transaction trace compression.
//!
//! Segment names repeat heavily inside one trace, so the trace encoder
//! replaces each one with a back-reference of the form `` `N `` that points
//! at entry `N` of a table shipped next to the tree.

use hashbrown::HashMap;
use serde::{Serialize, Serializer};
use std::borrow::Cow;

const REFERENCE_PREFIX: char = '`';

/// Holds unique strings and hands out indices in insertion order.
#[derive(Debug, Default, Clone)]
pub struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, usize>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table with a fixed set of entries, deduplicating as it goes.
    pub fn from_strings<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut table = Self::new();
        for s in strings {
            table.intern(s.as_ref());
        }
        table
    }

    /// Rebuilds a received table exactly as shipped. Duplicate entries keep
    /// their positions, so every index still points at the same string.
    pub fn from_wire(strings: Vec<String>) -> Self {
        let mut index = HashMap::with_capacity(strings.len());
        for (idx, s) in strings.iter().enumerate() {
            index.entry(s.clone()).or_insert(idx);
        }
        Self { strings, index }
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Returns the index of `s`, adding it to the end of the table if it is
    /// not present yet.
    pub fn intern(&mut self, s: &str) -> usize {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let idx = self.strings.len();
        self.strings.push(s.to_owned());
        self.index.insert(s.to_owned(), idx);
        idx
    }

    pub fn get(&self, idx: usize) -> Option<&str> {
        self.strings.get(idx).map(String::as_str)
    }

    /// Interns `s` and returns its back-reference token.
    pub fn reference(&mut self, s: &str) -> String {
        format!("{REFERENCE_PREFIX}{}", self.intern(s))
    }

    /// Resolves a back-reference against this table.
    ///
    /// Anything that is not exactly a backtick followed by digits is returned
    /// unchanged, as is a reference past the end of the table.
    pub fn resolve<'a>(&'a self, s: &'a str) -> Cow<'a, str> {
        match parse_reference(s).and_then(|idx| self.get(idx)) {
            Some(resolved) => Cow::Borrowed(resolved),
            None => Cow::Borrowed(s),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(String::as_str)
    }
}

impl Serialize for StringTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.strings.serialize(serializer)
    }
}

/// Parses a back-reference token. The whole string must be the token: no
/// surrounding whitespace, no sign, at least one digit.
pub fn parse_reference(s: &str) -> Option<usize> {
    let digits = s.strip_prefix(REFERENCE_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
