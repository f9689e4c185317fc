//! Label selectors
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    iter::FromIterator,
    str::FromStr,
};
use thiserror::Error;

// local type aliases
type Map = BTreeMap<String, String>;
type Expressions = Vec<Expression>;

/// A selector expression with existing operations
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Expression {
    /// Label value is one of the given values
    In(String, BTreeSet<String>),
    /// Label is absent or its value is none of the given values
    NotIn(String, BTreeSet<String>),
    /// Label has exactly this value
    Equal(String, String),
    /// Label is absent or has a different value
    NotEqual(String, String),
    /// Label is present
    Exists(String),
    /// Label is absent
    DoesNotExist(String),
}

/// Perform selection on a list of expressions
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize)]
pub struct Selector(Expressions);

/// A selector string could not be parsed
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid label selector expression: {0:?}")]
pub struct ParseSelectorError(String);

impl Selector {
    /// Create a selector from a vector of expressions
    fn from_expressions(exprs: Expressions) -> Self {
        Self(exprs)
    }

    /// Create a selector from a map of key=value label matches
    fn from_map(map: Map) -> Self {
        Self(map.into_iter().map(|(k, v)| Expression::Equal(k, v)).collect())
    }

    /// Convert a selector to a string for the API
    #[must_use]
    pub fn to_selector_string(&self) -> String {
        let selectors: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        selectors.join(",")
    }

    /// Indicates whether this label selector matches everything
    #[must_use]
    pub fn selects_all(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a set of labels satisfies every expression
    #[must_use]
    pub fn matches(&self, labels: &Map) -> bool {
        self.0.iter().all(|expr| expr.matches(labels))
    }
}

// === Expression ===

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match self {
            Expression::In(key, values) => match labels.get(key) {
                Some(v) => values.contains(v),
                None => false,
            },
            Expression::NotIn(key, values) => match labels.get(key) {
                Some(v) => !values.contains(v),
                None => true,
            },
            Expression::Exists(key) => labels.contains_key(key),
            Expression::DoesNotExist(key) => !labels.contains_key(key),
            Expression::Equal(key, value) => labels.get(key) == Some(value),
            Expression::NotEqual(key, value) => labels.get(key) != Some(value),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::In(key, values) => {
                write!(f, "{key} in ({})", values.iter().cloned().collect::<Vec<_>>().join(","))
            }
            Expression::NotIn(key, values) => {
                write!(f, "{key} notin ({})", values.iter().cloned().collect::<Vec<_>>().join(","))
            }
            Expression::Equal(key, value) => write!(f, "{key}={value}"),
            Expression::NotEqual(key, value) => write!(f, "{key}!={value}"),
            Expression::Exists(key) => write!(f, "{key}"),
            Expression::DoesNotExist(key) => write!(f, "!{key}"),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_selector_string())
    }
}

// === Parsing ===

/// Split on commas that are not inside a `( .. )` value set
fn split_terms(input: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let (mut depth, mut start) = (0usize, 0usize);
    for (idx, ch) in input.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&input[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    terms.push(&input[start..]);
    terms
}

fn parse_set(raw: &str) -> Option<BTreeSet<String>> {
    let inner = raw.trim().strip_prefix('(')?.strip_suffix(')')?;
    Some(
        inner
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
            .collect(),
    )
}

impl FromStr for Expression {
    type Err = ParseSelectorError;

    fn from_str(term: &str) -> Result<Self, Self::Err> {
        let term = term.trim();
        let invalid = || ParseSelectorError(term.to_string());
        if let Some((key, rest)) = term.split_once(" notin ") {
            return Ok(Expression::NotIn(key.trim().into(), parse_set(rest).ok_or_else(invalid)?));
        }
        if let Some((key, rest)) = term.split_once(" in ") {
            return Ok(Expression::In(key.trim().into(), parse_set(rest).ok_or_else(invalid)?));
        }
        if let Some((key, value)) = term.split_once("!=") {
            return Ok(Expression::NotEqual(key.trim().into(), value.trim().into()));
        }
        if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
            return Ok(Expression::Equal(key.trim().into(), value.trim().into()));
        }
        if let Some(key) = term.strip_prefix('!') {
            return Ok(Expression::DoesNotExist(key.trim().into()));
        }
        if term.is_empty() || term.contains(char::is_whitespace) {
            return Err(invalid());
        }
        Ok(Expression::Exists(term.into()))
    }
}

impl FromStr for Selector {
    type Err = ParseSelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Selector::default());
        }
        split_terms(s)
            .into_iter()
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Selector::from_expressions)
    }
}

// convenience conversions for Selector

impl FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

impl From<Expression> for Selector {
    fn from(value: Expression) -> Self {
        Self(vec![value])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Map {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_raw_matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), Map::default(), true, "empty match"),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                labels(&[("foo", "bar")]),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                labels(&[("foo", "bar"), ("bah", "baz")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(Some(Expression::In(
                    "foo".into(),
                    Some("bar".to_string()).into_iter().collect(),
                ))),
                labels(&[("foo", "bar"), ("bah", "baz")]),
                true,
                "In expression match",
            ),
            (
                Selector::from_iter(Some(Expression::NotEqual("foo".into(), "bar".into()))),
                labels(&[("foo", "bar")]),
                false,
                "NotEqual expression mismatch",
            ),
            (
                Selector::from_iter(Some(Expression::DoesNotExist("foo".into()))),
                labels(&[("bah", "baz")]),
                true,
                "DoesNotExist expression match",
            ),
            (
                Selector::from_iter(Some(Expression::Exists("foo".into()))),
                Map::default(),
                false,
                "Exists expression mismatch",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }

    #[test]
    fn test_parse_roundtrip() {
        let raw = "app=web,tier!=db,env in (prod,staging),zone notin (a),managed,!legacy";
        let selector: Selector = raw.parse().unwrap();
        assert_eq!(selector.0.len(), 6);
        assert_eq!(
            selector.to_selector_string(),
            "app=web,tier!=db,env in (prod,staging),zone notin (a),managed,!legacy"
        );
        assert!(selector.matches(&labels(&[("app", "web"), ("env", "prod"), ("managed", "yes")])));
        assert!(!selector.matches(&labels(&[("app", "web"), ("env", "dev"), ("managed", "yes")])));
    }

    #[test]
    fn test_parse_empty_selects_all() {
        let selector: Selector = "  ".parse().unwrap();
        assert!(selector.selects_all());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("env in prod".parse::<Selector>().is_err());
        assert!("a b".parse::<Selector>().is_err());
    }
}
