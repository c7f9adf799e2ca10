//! Canonical resource keys.
//!
//! A [`ResourceKey`] pairs a resource name with a parameter bag. Two calls that
//! differ only in parameter order or in the presence of absent/empty values
//! produce the same [`CanonicalKey`], so they share one cache entry.
//!
//! Resource names may be hierarchical, using `/` between segments
//! (`submissions/assignment`). A [`KeyPrefix`] for `submissions` matches every
//! key beneath it.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::error::InvalidKeyError;

/// Separator between segments of a hierarchical resource name.
pub const SEGMENT_SEPARATOR: char = '/';

/// Parameter bag. Always sorted by key.
pub type Params = BTreeMap<String, ParamValue>;

/// A single parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Explicitly absent; removed during canonicalization.
    Absent,
    Bool(bool),
    Number(Number),
    Text(String),
    List(Vec<ParamValue>),
    Map(Params),
}

impl ParamValue {
    /// Strip absent and empty values, recursing into nested mappings.
    ///
    /// Returns `None` when nothing meaningful is left. Mappings that end up
    /// empty are dropped too. List positions are preserved, so absent list
    /// items become nulls rather than disappearing.
    fn canonicalize(self) -> Option<ParamValue> {
        match self {
            ParamValue::Absent => None,
            ParamValue::Text(s) if s.is_empty() => None,
            ParamValue::Map(map) => {
                let cleaned = canonicalize_params(map);
                if cleaned.is_empty() {
                    None
                } else {
                    Some(ParamValue::Map(cleaned))
                }
            }
            ParamValue::List(items) => Some(ParamValue::List(
                items
                    .into_iter()
                    .map(|item| item.canonicalize().unwrap_or(ParamValue::Absent))
                    .collect(),
            )),
            other => Some(other),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            ParamValue::Absent => Value::Null,
            ParamValue::Bool(b) => Value::Bool(*b),
            ParamValue::Number(n) => Value::Number(n.clone()),
            ParamValue::Text(s) => Value::String(s.clone()),
            ParamValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            ParamValue::Map(map) => Value::Object(params_to_json(map)),
        }
    }

    /// Partial match used by prefixes: nested mappings match when the
    /// pattern's entries are a subset, everything else must be equal.
    fn contains(&self, pattern: &ParamValue) -> bool {
        match (self, pattern) {
            (ParamValue::Map(value), ParamValue::Map(pattern)) => params_contain(value, pattern),
            (value, pattern) => value == pattern,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

macro_rules! impl_from_integer {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ParamValue {
                fn from(value: $ty) -> Self {
                    ParamValue::Number(Number::from(value))
                }
            }
        )*
    };
}

impl_from_integer!(i32, i64, u32, u64, usize);

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        // NaN and infinities have no JSON form.
        Number::from_f64(value)
            .map(ParamValue::Number)
            .unwrap_or(ParamValue::Absent)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

impl From<&String> for ParamValue {
    fn from(value: &String) -> Self {
        ParamValue::Text(value.clone())
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ParamValue::Absent)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(value: Vec<T>) -> Self {
        ParamValue::List(value.into_iter().map(Into::into).collect())
    }
}

impl From<Params> for ParamValue {
    fn from(value: Params) -> Self {
        ParamValue::Map(value)
    }
}

impl From<&Value> for ParamValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => ParamValue::Absent,
            Value::Bool(b) => ParamValue::Bool(*b),
            Value::Number(n) => ParamValue::Number(n.clone()),
            Value::String(s) => ParamValue::Text(s.clone()),
            Value::Array(items) => ParamValue::List(items.iter().map(Into::into).collect()),
            Value::Object(map) => ParamValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), ParamValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        ParamValue::from(&value)
    }
}

fn canonicalize_params(params: Params) -> Params {
    params
        .into_iter()
        .filter_map(|(k, v)| v.canonicalize().map(|v| (k, v)))
        .collect()
}

fn params_to_json(params: &Params) -> Map<String, Value> {
    params
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect()
}

fn params_contain(params: &Params, pattern: &Params) -> bool {
    pattern.iter().all(|(k, expected)| {
        params
            .get(k)
            .map(|actual| actual.contains(expected))
            .unwrap_or(false)
    })
}

fn validate_resource(resource: &str) -> Result<(), InvalidKeyError> {
    if resource.trim().is_empty() {
        return Err(InvalidKeyError::EmptyResourceName);
    }
    if resource
        .split(SEGMENT_SEPARATOR)
        .any(|segment| segment.trim().is_empty())
    {
        return Err(InvalidKeyError::EmptySegment {
            name: resource.to_string(),
        });
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn json_params(resource: &str, params: &Value) -> Result<Params, InvalidKeyError> {
    match params {
        Value::Null => Ok(Params::new()),
        Value::Object(map) => Ok(map
            .iter()
            .map(|(k, v)| (k.clone(), ParamValue::from(v)))
            .collect()),
        other => Err(InvalidKeyError::ParamsNotMapping {
            resource: resource.to_string(),
            found: json_kind(other).to_string(),
        }),
    }
}

/// Serialized, hashable form of a [`ResourceKey`].
///
/// Compact JSON: `["<resource>",{<sorted params>}]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resource name plus a canonical parameter bag.
///
/// Equality and hashing go through the canonical form.
#[derive(Debug, Clone)]
pub struct ResourceKey {
    resource: String,
    params: Params,
    canonical: CanonicalKey,
}

impl ResourceKey {
    /// Build a key from a resource name and a bag of parameters.
    ///
    /// Equivalent to [`build_key`].
    pub fn new<I, K, V>(resource: &str, params: I) -> Result<Self, InvalidKeyError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParamValue>,
    {
        build_key(resource, params)
    }

    /// A key with no parameters.
    pub fn bare(resource: &str) -> Result<Self, InvalidKeyError> {
        build_key(resource, std::iter::empty::<(String, ParamValue)>())
    }

    /// Build a key from a JSON object (or `null` for no parameters).
    pub fn from_json(resource: &str, params: &Value) -> Result<Self, InvalidKeyError> {
        validate_resource(resource)?;
        let params = json_params(resource, params)?;
        Ok(Self::from_parts(resource, canonicalize_params(params)))
    }

    fn from_parts(resource: &str, params: Params) -> Self {
        let canonical = Value::Array(vec![
            Value::String(resource.to_string()),
            Value::Object(params_to_json(&params)),
        ])
        .to_string();
        Self {
            resource: resource.to_string(),
            params,
            canonical: CanonicalKey(canonical),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    pub fn canonical(&self) -> &CanonicalKey {
        &self.canonical
    }

    /// Parameters as a JSON object, for building query strings.
    pub fn params_json(&self) -> Map<String, Value> {
        params_to_json(&self.params)
    }
}

impl PartialEq for ResourceKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for ResourceKey {}

impl std::hash::Hash for ResourceKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.canonical, f)
    }
}

/// Derive the canonical key for `resource` and `params`.
///
/// Absent and empty-string values are removed, keys are sorted, and nested
/// mappings are canonicalized the same way. Fails if the resource name is
/// empty or has an empty `/` segment.
pub fn build_key<I, K, V>(resource: &str, params: I) -> Result<ResourceKey, InvalidKeyError>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<ParamValue>,
{
    validate_resource(resource)?;
    let params: Params = params
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    Ok(ResourceKey::from_parts(resource, canonicalize_params(params)))
}

/// Selects a family of keys for invalidation.
///
/// A key matches when its resource name equals the prefix's resource (or
/// sits beneath it as a `/` path) and its parameters contain every parameter
/// of the prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPrefix {
    resource: String,
    params: Params,
}

impl KeyPrefix {
    /// Every key of a resource, regardless of parameters.
    pub fn resource(resource: &str) -> Result<Self, InvalidKeyError> {
        validate_resource(resource)?;
        Ok(Self {
            resource: resource.to_string(),
            params: Params::new(),
        })
    }

    /// Keys of a resource whose parameters include `params`.
    pub fn scoped<I, K, V>(resource: &str, params: I) -> Result<Self, InvalidKeyError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParamValue>,
    {
        let key = build_key(resource, params)?;
        Ok(Self::from(&key))
    }

    pub fn resource_name(&self) -> &str {
        &self.resource
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn matches(&self, key: &ResourceKey) -> bool {
        self.matches_resource(key.resource()) && params_contain(key.params(), &self.params)
    }

    fn matches_resource(&self, resource: &str) -> bool {
        match resource.strip_prefix(self.resource.as_str()) {
            Some("") => true,
            Some(rest) => rest.starts_with(SEGMENT_SEPARATOR),
            None => false,
        }
    }
}

impl From<&ResourceKey> for KeyPrefix {
    fn from(key: &ResourceKey) -> Self {
        Self {
            resource: key.resource.clone(),
            params: key.params.clone(),
        }
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            f.write_str(&self.resource)
        } else {
            write!(
                f,
                "{}{}",
                self.resource,
                Value::Object(params_to_json(&self.params))
            )
        }
    }
}
