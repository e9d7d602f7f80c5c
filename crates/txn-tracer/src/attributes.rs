// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed, destination-filtered attributes.
//!
//! Host runtimes hand us dynamically typed values. They are coerced into a
//! closed [`TypedScalar`] at the boundary; anything that is not a finite
//! scalar is rejected there and never stored.

use crate::config::SecurityPolicy;
use crate::errors::AttributeError;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::sync::Arc;
use tracing::debug;

pub const MAX_KEY_BYTES: usize = 255;
pub const MAX_VALUE_BYTES: usize = 255;
pub const MAX_USER_ATTRIBUTES: usize = 64;

pub const REDACTED_MESSAGE: &str = "Message removed by New Relic security settings";

/// Attribute map as it appears in a payload. Ordered so that encoding the
/// same store twice produces identical bytes.
pub type AttributeMap = BTreeMap<String, TypedScalar>;

/// Runtime type tag of a host value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTag {
    Null,
    Bool,
    Long,
    Double,
    String,
    Array,
    Object,
    Resource,
}

impl fmt::Display for ValueTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ValueTag::Null => "IS_NULL",
            ValueTag::Bool => "IS_BOOL",
            ValueTag::Long => "IS_LONG",
            ValueTag::Double => "IS_DOUBLE",
            ValueTag::String => "IS_STRING",
            ValueTag::Array => "IS_ARRAY",
            ValueTag::Object => "IS_OBJECT",
            ValueTag::Resource => "IS_RESOURCE",
        };
        f.write_str(tag)
    }
}

/// A value as handed over by the host runtime, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Null,
    Bool(bool),
    Long(i64),
    Double(f64),
    String(String),
    Array(Vec<HostValue>),
    Object(BTreeMap<String, HostValue>),
    Resource(u64),
}

impl HostValue {
    pub fn type_tag(&self) -> ValueTag {
        match self {
            HostValue::Null => ValueTag::Null,
            HostValue::Bool(_) => ValueTag::Bool,
            HostValue::Long(_) => ValueTag::Long,
            HostValue::Double(_) => ValueTag::Double,
            HostValue::String(_) => ValueTag::String,
            HostValue::Array(_) => ValueTag::Array,
            HostValue::Object(_) => ValueTag::Object,
            HostValue::Resource(_) => ValueTag::Resource,
        }
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::String(value.to_owned())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value)
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        HostValue::Long(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Double(value)
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

/// A validated attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedScalar {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl TypedScalar {
    pub fn type_tag(&self) -> ValueTag {
        match self {
            TypedScalar::String(_) => ValueTag::String,
            TypedScalar::Int(_) => ValueTag::Long,
            TypedScalar::Float(_) => ValueTag::Double,
            TypedScalar::Bool(_) => ValueTag::Bool,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedScalar::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn truncated(self) -> Self {
        match self {
            TypedScalar::String(s) => TypedScalar::String(truncate_utf8(s, MAX_VALUE_BYTES)),
            other => other,
        }
    }
}

impl TryFrom<HostValue> for TypedScalar {
    type Error = AttributeError;

    fn try_from(value: HostValue) -> Result<Self, Self::Error> {
        match value {
            HostValue::Bool(b) => Ok(TypedScalar::Bool(b)),
            HostValue::Long(i) => Ok(TypedScalar::Int(i)),
            HostValue::Double(f) if f.is_finite() => Ok(TypedScalar::Float(f)),
            HostValue::Double(_) => Err(AttributeError::NonFinite),
            HostValue::String(s) => Ok(TypedScalar::String(s)),
            other => Err(AttributeError::UnsupportedValue(other.type_tag())),
        }
    }
}

impl From<&str> for TypedScalar {
    fn from(value: &str) -> Self {
        TypedScalar::String(value.to_owned())
    }
}

impl From<String> for TypedScalar {
    fn from(value: String) -> Self {
        TypedScalar::String(value)
    }
}

impl From<i64> for TypedScalar {
    fn from(value: i64) -> Self {
        TypedScalar::Int(value)
    }
}

impl From<f64> for TypedScalar {
    fn from(value: f64) -> Self {
        TypedScalar::Float(value)
    }
}

impl From<bool> for TypedScalar {
    fn from(value: bool) -> Self {
        TypedScalar::Bool(value)
    }
}

impl Serialize for TypedScalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TypedScalar::String(s) => serializer.serialize_str(s),
            TypedScalar::Int(i) => serializer.serialize_i64(*i),
            TypedScalar::Float(f) => serializer.serialize_f64(*f),
            TypedScalar::Bool(b) => serializer.serialize_bool(*b),
        }
    }
}

/// Validates a host-supplied key. Only strings are accepted; numeric strings
/// stay strings.
pub fn coerce_key(key: HostValue) -> Result<String, AttributeError> {
    match key {
        HostValue::String(s) => validate_key(s),
        other => Err(AttributeError::UnsupportedKey(other.type_tag())),
    }
}

fn validate_key(key: String) -> Result<String, AttributeError> {
    if key.is_empty() {
        return Err(AttributeError::EmptyKey);
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(AttributeError::KeyTooLong {
            limit: MAX_KEY_BYTES,
        });
    }
    Ok(key)
}

fn truncate_utf8(mut s: String, limit: usize) -> String {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s
}

/// Set of payload kinds an attribute may appear on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Destinations(u8);

impl Destinations {
    pub const NONE: Destinations = Destinations(0);
    pub const TXN_EVENT: Destinations = Destinations(1 << 0);
    pub const TXN_TRACE: Destinations = Destinations(1 << 1);
    pub const ERROR: Destinations = Destinations(1 << 2);
    pub const BROWSER: Destinations = Destinations(1 << 3);
    pub const SPAN: Destinations = Destinations(1 << 4);
    pub const TXN_SEGMENT: Destinations = Destinations(1 << 5);
    pub const ALL: Destinations = Destinations(0b11_1111);

    /// Where user attributes go when no rule says otherwise.
    pub const DEFAULT_USER: Destinations = Destinations(
        Self::TXN_EVENT.0 | Self::TXN_TRACE.0 | Self::ERROR.0 | Self::SPAN.0 | Self::TXN_SEGMENT.0,
    );

    const NAMES: [(Destinations, &'static str); 6] = [
        (Self::TXN_EVENT, "transaction_events"),
        (Self::TXN_TRACE, "transaction_tracer"),
        (Self::ERROR, "error_collector"),
        (Self::BROWSER, "browser_monitoring"),
        (Self::SPAN, "span_events"),
        (Self::TXN_SEGMENT, "transaction_segments"),
    ];

    pub fn contains(self, other: Destinations) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Single-destination members of this set.
    pub fn iter(self) -> impl Iterator<Item = Destinations> {
        Self::NAMES
            .into_iter()
            .map(|(dest, _)| dest)
            .filter(move |dest| self.contains(*dest))
    }

    pub fn from_name(name: &str) -> Option<Destinations> {
        Self::NAMES
            .into_iter()
            .find(|(_, n)| *n == name)
            .map(|(dest, _)| dest)
    }
}

impl fmt::Debug for Destinations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .into_iter()
            .filter(|(dest, _)| self.contains(*dest))
            .map(|(_, name)| name)
            .collect();
        write!(f, "Destinations({})", names.join("|"))
    }
}

impl BitOr for Destinations {
    type Output = Destinations;
    fn bitor(self, rhs: Self) -> Self {
        Destinations(self.0 | rhs.0)
    }
}

impl BitOrAssign for Destinations {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Destinations {
    type Output = Destinations;
    fn bitand(self, rhs: Self) -> Self {
        Destinations(self.0 & rhs.0)
    }
}

impl Not for Destinations {
    type Output = Destinations;
    fn not(self) -> Self {
        Destinations(!self.0 & Self::ALL.0)
    }
}

/// One include or exclude rule. A pattern ending in `*` matches by prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRule {
    pub pattern: String,
    pub include: bool,
    pub destinations: Destinations,
}

impl AttributeRule {
    pub fn include(pattern: &str, destinations: Destinations) -> Self {
        Self {
            pattern: pattern.to_owned(),
            include: true,
            destinations,
        }
    }

    pub fn exclude(pattern: &str, destinations: Destinations) -> Self {
        Self {
            pattern: pattern.to_owned(),
            include: false,
            destinations,
        }
    }

    fn matches(&self, key: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == self.pattern,
        }
    }

    /// Longer patterns win; an exact match beats a wildcard of the same
    /// length; exclude beats include.
    fn precedence(&self) -> (usize, bool, bool) {
        let wildcard = self.pattern.ends_with('*');
        let len = self.pattern.len() - usize::from(wildcard);
        (len, !wildcard, !self.include)
    }
}

/// Attribute routing configuration.
#[derive(Debug, Clone, Default)]
pub struct AttributeConfig {
    /// Destinations for which attribute capture is turned off entirely.
    pub disabled: Destinations,
    pub rules: Vec<AttributeRule>,
}

impl AttributeConfig {
    /// Computes the final destination set for `key`.
    pub fn apply(&self, key: &str, requested: Destinations) -> Destinations {
        let mut result = requested;
        for dest in Destinations::ALL.iter() {
            let winner = self
                .rules
                .iter()
                .filter(|rule| rule.destinations.contains(dest) && rule.matches(key))
                .max_by_key(|rule| rule.precedence());
            match winner {
                Some(rule) if rule.include => result |= dest,
                Some(_) => result = result & !dest,
                None => {}
            }
        }
        result & !self.disabled
    }

    /// Drops the entries of `attributes` that are not routed to `destination`.
    pub fn retain_for(&self, attributes: &mut AttributeMap, destination: Destinations) {
        attributes.retain(|key, _| self.apply(key, destination).contains(destination));
    }
}

/// A value together with the destinations it is currently sent to.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeEntry {
    pub value: TypedScalar,
    pub destinations: Destinations,
}

/// Values of one key. Destination sets of the entries never overlap, so a
/// key is emitted at most once per destination.
type Entries = BTreeMap<String, Vec<AttributeEntry>>;

/// Attribute bag owned by one transaction, segment or span.
#[derive(Debug, Clone)]
pub struct AttributeStore {
    config: Arc<AttributeConfig>,
    user: Entries,
    agent: Entries,
}

impl Default for AttributeStore {
    fn default() -> Self {
        Self::new(Arc::new(AttributeConfig::default()))
    }
}

impl AttributeStore {
    pub fn new(config: Arc<AttributeConfig>) -> Self {
        Self {
            config,
            user: BTreeMap::new(),
            agent: BTreeMap::new(),
        }
    }

    /// Sets a user attribute from host-supplied key and value.
    pub fn set_user(
        &mut self,
        key: HostValue,
        value: HostValue,
        destinations: Destinations,
        policy: &SecurityPolicy,
    ) -> Result<(), AttributeError> {
        if !policy.custom_parameters {
            return Err(AttributeError::Blocked);
        }
        let key = coerce_key(key)?;
        let value = TypedScalar::try_from(value)?;
        if !self.user.contains_key(&key) && self.user.len() >= MAX_USER_ATTRIBUTES {
            return Err(AttributeError::LimitExceeded {
                limit: MAX_USER_ATTRIBUTES,
            });
        }
        let destinations = self.config.apply(&key, destinations);
        Self::insert(&mut self.user, key, value, destinations);
        Ok(())
    }

    /// Sets an attribute the engine itself captured.
    pub fn set_agent(
        &mut self,
        key: &str,
        value: impl Into<TypedScalar>,
        destinations: Destinations,
    ) -> Result<(), AttributeError> {
        let key = validate_key(key.to_owned())?;
        let value = value.into();
        if let TypedScalar::Float(f) = value {
            if !f.is_finite() {
                return Err(AttributeError::NonFinite);
            }
        }
        let destinations = self.config.apply(&key, destinations);
        Self::insert(&mut self.agent, key, value, destinations);
        Ok(())
    }

    /// Overwrites `key` for `destinations` only. Earlier values keep the
    /// destinations this write does not name.
    fn insert(map: &mut Entries, key: String, value: TypedScalar, destinations: Destinations) {
        if destinations.is_empty() {
            debug!("attribute {key} has no remaining destinations, dropping the write");
            return;
        }
        let entries = map.entry(key).or_default();
        for entry in entries.iter_mut() {
            entry.destinations = entry.destinations & !destinations;
        }
        entries.retain(|entry| !entry.destinations.is_empty());
        entries.push(AttributeEntry {
            value: value.truncated(),
            destinations,
        });
    }

    /// Number of distinct user attribute keys.
    pub fn user_len(&self) -> usize {
        self.user.len()
    }

    pub fn user_entry(&self, key: &str, destination: Destinations) -> Option<&AttributeEntry> {
        Self::lookup(&self.user, key, destination)
    }

    pub fn agent_entry(&self, key: &str, destination: Destinations) -> Option<&AttributeEntry> {
        Self::lookup(&self.agent, key, destination)
    }

    fn lookup<'a>(
        map: &'a Entries,
        key: &str,
        destination: Destinations,
    ) -> Option<&'a AttributeEntry> {
        map.get(key)?
            .iter()
            .find(|entry| entry.destinations.contains(destination))
    }

    /// User attributes routed to `destination`, after security policy.
    pub fn user_attributes(&self, destination: Destinations, policy: &SecurityPolicy) -> AttributeMap {
        if !policy.custom_parameters {
            return AttributeMap::new();
        }
        Self::filter(&self.user, destination)
    }

    /// Agent attributes routed to `destination`.
    pub fn agent_attributes(&self, destination: Destinations) -> AttributeMap {
        Self::filter(&self.agent, destination)
    }

    fn filter(map: &Entries, destination: Destinations) -> AttributeMap {
        map.iter()
            .filter_map(|(key, entries)| {
                entries
                    .iter()
                    .find(|entry| entry.destinations.contains(destination))
                    .map(|entry| (key.clone(), entry.value.clone()))
            })
            .collect()
    }
}

/// Replaces an exception message with the redaction marker when policy
/// forbids shipping raw messages.
pub fn redact_message(message: &str, policy: &SecurityPolicy) -> String {
    if policy.allow_raw_exception_messages {
        message.to_owned()
    } else {
        REDACTED_MESSAGE.to_owned()
    }
}
