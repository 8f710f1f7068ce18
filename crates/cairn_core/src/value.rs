use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{GraphError, GraphResult, Timestamp};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Str,
    Int,
    Float,
    Bool,
    Time,
    StrArray,
    Map,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Time(Timestamp),
    StrArray(Vec<String>),
    Map(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            PropertyValue::Str(_) => ValueType::Str,
            PropertyValue::Int(_) => ValueType::Int,
            PropertyValue::Float(_) => ValueType::Float,
            PropertyValue::Bool(_) => ValueType::Bool,
            PropertyValue::Time(_) => ValueType::Time,
            PropertyValue::StrArray(_) => ValueType::StrArray,
            PropertyValue::Map(_) => ValueType::Map,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(value) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Ordering between comparable values. Integers and floats compare with
    /// each other; every other pairing of different types is unordered.
    pub fn compare(&self, other: &PropertyValue) -> Option<Ordering> {
        match (self, other) {
            (PropertyValue::Str(a), PropertyValue::Str(b)) => Some(a.cmp(b)),
            (PropertyValue::Int(a), PropertyValue::Int(b)) => Some(a.cmp(b)),
            (PropertyValue::Float(a), PropertyValue::Float(b)) => a.partial_cmp(b),
            (PropertyValue::Int(a), PropertyValue::Float(b)) => (*a as f64).partial_cmp(b),
            (PropertyValue::Float(a), PropertyValue::Int(b)) => a.partial_cmp(&(*b as f64)),
            (PropertyValue::Bool(a), PropertyValue::Bool(b)) => Some(a.cmp(b)),
            (PropertyValue::Time(a), PropertyValue::Time(b)) => Some(a.cmp(b)),
            (PropertyValue::StrArray(a), PropertyValue::StrArray(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// False for NaN or infinite floats, at any nesting depth.
    pub fn is_finite(&self) -> bool {
        match self {
            PropertyValue::Float(value) => value.is_finite(),
            PropertyValue::Map(entries) => entries.values().all(PropertyValue::is_finite),
            _ => true,
        }
    }

    /// Rebuild the value with `rewrite` applied to every string it holds,
    /// including array members and nested map values. Map keys are left alone.
    pub fn map_strings(&self, rewrite: &impl Fn(&str) -> String) -> PropertyValue {
        match self {
            PropertyValue::Str(value) => PropertyValue::Str(rewrite(value.as_str())),
            PropertyValue::StrArray(values) => {
                PropertyValue::StrArray(values.iter().map(|value| rewrite(value.as_str())).collect())
            }
            PropertyValue::Map(entries) => PropertyValue::Map(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.map_strings(rewrite)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Str(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<Timestamp> for PropertyValue {
    fn from(value: Timestamp) -> Self {
        PropertyValue::Time(value)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(value: Vec<String>) -> Self {
        PropertyValue::StrArray(value)
    }
}

/// Attribute name to value, kept in name order so two bags with the same
/// content are equal regardless of how they were built.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyBag(BTreeMap<String, PropertyValue>);

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Option<PropertyValue> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(PropertyValue::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Overwrite the attributes named in `other`, leaving the rest untouched.
    pub fn merge(&mut self, other: &PropertyBag) {
        for (name, value) in other.iter() {
            self.0.insert(name.clone(), value.clone());
        }
    }

    pub fn merged(&self, other: &PropertyBag) -> PropertyBag {
        let mut merged = self.clone();
        merged.merge(other);
        merged
    }

    /// Rejects NaN and infinite floats; they have no JSON form and no order.
    pub fn validate_finite(&self) -> GraphResult<()> {
        match self.0.iter().find(|(_, value)| !value.is_finite()) {
            Some((name, _)) => Err(GraphError::invalid(format!(
                "property '{name}' holds a non-finite number"
            ))),
            None => Ok(()),
        }
    }

    pub fn map_strings(&self, rewrite: &impl Fn(&str) -> String) -> PropertyBag {
        PropertyBag(
            self.0
                .iter()
                .map(|(name, value)| (name.clone(), value.map_strings(rewrite)))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<PropertyValue>> FromIterator<(K, V)> for PropertyBag {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        PropertyBag(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}
