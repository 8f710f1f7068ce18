use std::cmp::Ordering;

use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::{GraphError, GraphResult, PropertyBag, PropertyValue};

/// Properties searched by free-text queries.
pub const TEXT_PROPERTIES: [&str; 3] = ["name", "qualifiedName", "description"];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Predicate {
    Eq(PropertyValue),
    Neq(PropertyValue),
    /// Unanchored regular expression; a plain word is a substring match.
    Like(String),
    Gt(PropertyValue),
    Lt(PropertyValue),
    Gte(PropertyValue),
    Lte(PropertyValue),
    In(Vec<PropertyValue>),
    IsNull,
    NotNull,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertyCondition {
    pub property: String,
    pub predicate: Predicate,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SearchCondition {
    Property(PropertyCondition),
    And(Vec<SearchCondition>),
    Or(Vec<SearchCondition>),
    Not(Box<SearchCondition>),
}

impl SearchCondition {
    pub fn property(name: impl Into<String>, predicate: Predicate) -> Self {
        SearchCondition::Property(PropertyCondition {
            property: name.into(),
            predicate,
        })
    }

    pub fn eq(name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self::property(name, Predicate::Eq(value.into()))
    }

    pub fn like(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::property(name, Predicate::Like(pattern.into()))
    }

    pub fn and(conditions: impl IntoIterator<Item = SearchCondition>) -> Self {
        SearchCondition::And(conditions.into_iter().collect())
    }

    pub fn or(conditions: impl IntoIterator<Item = SearchCondition>) -> Self {
        SearchCondition::Or(conditions.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(condition: SearchCondition) -> Self {
        SearchCondition::Not(Box::new(condition))
    }

    /// `pattern` against any of the free-text properties.
    pub fn text(pattern: &str) -> Self {
        Self::or(TEXT_PROPERTIES.iter().map(|name| Self::like(*name, pattern)))
    }

    /// Validate the tree and compile its regular expressions once.
    pub fn compile(&self) -> GraphResult<CompiledCondition> {
        Ok(CompiledCondition(self.compile_node()?))
    }

    fn compile_node(&self) -> GraphResult<Node> {
        Ok(match self {
            SearchCondition::Property(leaf) => {
                if leaf.property.trim().is_empty() {
                    return Err(GraphError::invalid("condition property name is empty"));
                }
                let matcher = match &leaf.predicate {
                    Predicate::Like(pattern) => {
                        let normalized: String = pattern.nfc().collect();
                        let regex = Regex::new(&normalized).map_err(|err| {
                            GraphError::invalid(format!("invalid pattern '{pattern}': {err}"))
                        })?;
                        Matcher::Like(regex)
                    }
                    Predicate::In(values) if values.is_empty() => {
                        return Err(GraphError::invalid(format!(
                            "IN condition on '{}' has no values",
                            leaf.property
                        )));
                    }
                    other => Matcher::Plain(other.clone()),
                };
                Node::Leaf {
                    property: leaf.property.clone(),
                    matcher,
                }
            }
            SearchCondition::And(children) => Node::And(
                children
                    .iter()
                    .map(SearchCondition::compile_node)
                    .collect::<GraphResult<_>>()?,
            ),
            SearchCondition::Or(children) => Node::Or(
                children
                    .iter()
                    .map(SearchCondition::compile_node)
                    .collect::<GraphResult<_>>()?,
            ),
            SearchCondition::Not(child) => Node::Not(Box::new(child.compile_node()?)),
        })
    }
}

#[derive(Clone, Debug)]
enum Matcher {
    Plain(Predicate),
    Like(Regex),
}

#[derive(Clone, Debug)]
enum Node {
    Leaf { property: String, matcher: Matcher },
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
}

impl Node {
    fn matches(&self, properties: &PropertyBag) -> bool {
        match self {
            Node::Leaf { property, matcher } => leaf_matches(properties.get(property), matcher),
            Node::And(children) => children.iter().all(|c| c.matches(properties)),
            Node::Or(children) => children.iter().any(|c| c.matches(properties)),
            Node::Not(child) => !child.matches(properties),
        }
    }
}

/// A validated condition tree, ready to be evaluated against many bags.
#[derive(Clone, Debug)]
pub struct CompiledCondition(Node);

impl CompiledCondition {
    /// Short-circuits: `And` stops at the first miss, `Or` at the first hit.
    /// An empty `And` matches everything and an empty `Or` matches nothing.
    pub fn matches(&self, properties: &PropertyBag) -> bool {
        self.0.matches(properties)
    }
}

fn leaf_matches(actual: Option<&PropertyValue>, matcher: &Matcher) -> bool {
    let predicate = match matcher {
        Matcher::Like(regex) => return actual.is_some_and(|value| like_matches(value, regex)),
        Matcher::Plain(predicate) => predicate,
    };
    let Some(actual) = actual else {
        return matches!(predicate, Predicate::IsNull | Predicate::Neq(_));
    };
    match predicate {
        Predicate::IsNull => false,
        Predicate::NotNull => true,
        Predicate::Eq(expected) => values_equal(actual, expected),
        Predicate::Neq(expected) => !values_equal(actual, expected),
        Predicate::In(options) => options.iter().any(|option| values_equal(actual, option)),
        Predicate::Gt(bound) => ordering(actual, bound) == Some(Ordering::Greater),
        Predicate::Lt(bound) => ordering(actual, bound) == Some(Ordering::Less),
        Predicate::Gte(bound) => matches!(
            ordering(actual, bound),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Predicate::Lte(bound) => {
            matches!(ordering(actual, bound), Some(Ordering::Less | Ordering::Equal))
        }
        Predicate::Like(_) => false,
    }
}

fn normalize(value: &str) -> String {
    value.nfc().collect()
}

/// A string array equals a string when it contains it.
fn values_equal(actual: &PropertyValue, expected: &PropertyValue) -> bool {
    match (actual, expected) {
        (PropertyValue::Str(a), PropertyValue::Str(b)) => normalize(a) == normalize(b),
        (PropertyValue::StrArray(items), PropertyValue::Str(b)) => {
            let b = normalize(b);
            items.iter().any(|item| normalize(item) == b)
        }
        _ => actual.compare(expected) == Some(Ordering::Equal) || actual == expected,
    }
}

fn ordering(actual: &PropertyValue, bound: &PropertyValue) -> Option<Ordering> {
    match (actual, bound) {
        (PropertyValue::Str(a), PropertyValue::Str(b)) => Some(normalize(a).cmp(&normalize(b))),
        _ => actual.compare(bound),
    }
}

fn like_matches(value: &PropertyValue, regex: &Regex) -> bool {
    match value {
        PropertyValue::Str(text) => regex.is_match(&normalize(text)),
        PropertyValue::StrArray(items) => items.iter().any(|item| regex.is_match(&normalize(item))),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{Predicate, SearchCondition};
    use crate::{PropertyBag, PropertyValue};

    fn orders() -> PropertyBag {
        PropertyBag::new()
            .with("qualifiedName", "csv::orders_raw")
            .with("name", "Orders")
            .with("size", 42_i64)
            .with("tags", vec!["sales".to_string(), "raw".to_string()])
    }

    #[test]
    fn comparison_operators() {
        let props = orders();
        let check = |predicate: Predicate| {
            SearchCondition::property("size", predicate)
                .compile()
                .expect("compile")
                .matches(&props)
        };
        assert!(check(Predicate::Gt(PropertyValue::Int(41))));
        assert!(!check(Predicate::Lt(PropertyValue::Int(42))));
        assert!(check(Predicate::Lte(PropertyValue::Int(42))));
        assert!(check(Predicate::Gte(PropertyValue::Float(41.5))));
        assert!(check(Predicate::In(vec![PropertyValue::Int(1), PropertyValue::Int(42)])));
        assert!(check(Predicate::NotNull));
    }

    #[test]
    fn strings_are_case_sensitive() {
        let props = orders();
        let exact = SearchCondition::eq("name", "Orders").compile().expect("compile");
        let lower = SearchCondition::eq("name", "orders").compile().expect("compile");
        assert!(exact.matches(&props));
        assert!(!lower.matches(&props));
    }

    #[test]
    fn like_is_unanchored_regex() {
        let props = orders();
        assert!(SearchCondition::like("qualifiedName", "orders").compile().unwrap().matches(&props));
        assert!(SearchCondition::like("qualifiedName", "^csv::.*_raw$").compile().unwrap().matches(&props));
        assert!(SearchCondition::like("tags", "^sal").compile().unwrap().matches(&props));
        assert!(!SearchCondition::like("size", "42").compile().unwrap().matches(&props));
    }

    #[test]
    fn missing_properties() {
        let props = orders();
        let null = SearchCondition::property("owner", Predicate::IsNull).compile().unwrap();
        let neq = SearchCondition::property("owner", Predicate::Neq("x".into())).compile().unwrap();
        let eq = SearchCondition::eq("owner", "x").compile().unwrap();
        assert!(null.matches(&props));
        assert!(neq.matches(&props));
        assert!(!eq.matches(&props));
    }

    #[test]
    fn boolean_tree() {
        let props = orders();
        let tree = SearchCondition::and([
            SearchCondition::eq("tags", "sales"),
            SearchCondition::not(SearchCondition::or([
                SearchCondition::eq("name", "Invoices"),
                SearchCondition::property("size", Predicate::Gt(PropertyValue::Int(100))),
            ])),
        ]);
        assert!(tree.compile().unwrap().matches(&props));
        assert!(SearchCondition::and([]).compile().unwrap().matches(&props));
        assert!(!SearchCondition::or([]).compile().unwrap().matches(&props));
    }

    #[test]
    fn text_condition_spans_text_properties() {
        let props = PropertyBag::new()
            .with("qualifiedName", "x")
            .with("description", "customer orders feed");
        assert!(SearchCondition::text("orders").compile().unwrap().matches(&props));
        assert!(!SearchCondition::text("invoices").compile().unwrap().matches(&props));
    }

    #[test]
    fn invalid_patterns_and_empty_in_are_rejected() {
        assert!(SearchCondition::like("name", "(").compile().is_err());
        assert!(SearchCondition::property("name", Predicate::In(vec![])).compile().is_err());
        assert!(SearchCondition::eq(" ", "x").compile().is_err());
    }
}
