//! Term representation for policy values.
//!
//! A [`Term`] is the recursive value model shared by the parser, the compiler
//! and the evaluator: JSON-like scalars and collections plus variables and
//! references. Parsed terms remember where they came from; locations never
//! take part in equality.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a term in policy source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Source file; empty for queries.
    pub file: String,
    /// Line, starting at 1.
    pub row: usize,
    /// Column, starting at 1.
    pub col: usize,
}

impl Location {
    /// A location in `file`.
    #[must_use]
    pub fn new(file: impl Into<String>, row: usize, col: usize) -> Self {
        Self {
            file: file.into(),
            row,
            col,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file.is_empty() {
            write!(f, "{}:{}", self.row, self.col)
        } else {
            write!(f, "{}:{}:{}", self.file, self.row, self.col)
        }
    }
}

/// A reference such as `data.authz.allow` or `input.user`.
///
/// `root` is the head variable; `path` holds the dotted segments after it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ref {
    /// Head variable, e.g. `data` or `input`.
    pub root: String,
    /// Segments after the head.
    pub path: Vec<String>,
}

impl Ref {
    /// A reference to `root` followed by `path`.
    #[must_use]
    pub fn new(root: impl Into<String>, path: Vec<String>) -> Self {
        Self {
            root: root.into(),
            path,
        }
    }

    /// True for refs rooted at `data`.
    #[must_use]
    pub fn is_data(&self) -> bool {
        self.root == "data"
    }

    /// True for refs rooted at `input`.
    #[must_use]
    pub fn is_input(&self) -> bool {
        self.root == "input"
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root)?;
        for seg in &self.path {
            write!(f, ".{seg}")?;
        }
        Ok(())
    }
}

/// The value carried by a term.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TermValue {
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Array(Vec<Term>),
    /// Key/value pairs. Keys may be any ground term; order is insignificant.
    Object(Vec<(Term, Term)>),
    Var(String),
    Ref(Ref),
}

/// A value with an optional source location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Term {
    /// The value.
    pub value: TermValue,
    /// Where the term was parsed from, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Term {
    /// A term without a location.
    #[must_use]
    pub const fn new(value: TermValue) -> Self {
        Self {
            value,
            location: None,
        }
    }

    /// Attach a source location.
    #[must_use]
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// `null`.
    #[must_use]
    pub const fn null() -> Self {
        Self::new(TermValue::Null)
    }

    /// A boolean.
    #[must_use]
    pub const fn boolean(v: bool) -> Self {
        Self::new(TermValue::Boolean(v))
    }

    /// A number.
    #[must_use]
    pub const fn number(v: f64) -> Self {
        Self::new(TermValue::Number(v))
    }

    /// A string.
    #[must_use]
    pub fn string(v: impl Into<String>) -> Self {
        Self::new(TermValue::String(v.into()))
    }

    /// A variable.
    #[must_use]
    pub fn var(name: impl Into<String>) -> Self {
        Self::new(TermValue::Var(name.into()))
    }

    /// A reference.
    #[must_use]
    pub fn reference(r: Ref) -> Self {
        Self::new(TermValue::Ref(r))
    }

    /// An array.
    #[must_use]
    pub const fn array(items: Vec<Term>) -> Self {
        Self::new(TermValue::Array(items))
    }

    /// An object from key/value pairs.
    #[must_use]
    pub const fn object(pairs: Vec<(Term, Term)>) -> Self {
        Self::new(TermValue::Object(pairs))
    }

    /// True when the term contains no variables or references.
    #[must_use]
    pub fn is_ground(&self) -> bool {
        match &self.value {
            TermValue::Var(_) | TermValue::Ref(_) => false,
            TermValue::Array(items) => items.iter().all(Term::is_ground),
            TermValue::Object(pairs) => pairs.iter().all(|(k, v)| k.is_ground() && v.is_ground()),
            _ => true,
        }
    }

    /// Look up a member of an object term by string key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Term> {
        let TermValue::Object(pairs) = &self.value else {
            return None;
        };
        pairs.iter().find_map(|(k, v)| match &k.value {
            TermValue::String(s) if s == key => Some(v),
            _ => None,
        })
    }

    /// Everything except `false` counts as a successful expression value.
    #[must_use]
    pub const fn is_truthy(&self) -> bool {
        !matches!(self.value, TermValue::Boolean(false))
    }

    /// Convert a ground term to JSON. Non-string object keys are rendered
    /// with their display form. Returns `None` for non-ground terms.
    #[must_use]
    pub fn to_json(&self) -> Option<serde_json::Value> {
        use serde_json::Value;

        Some(match &self.value {
            TermValue::Null => Value::Null,
            TermValue::Boolean(b) => Value::Bool(*b),
            TermValue::Number(n) => number_to_json(*n),
            TermValue::String(s) => Value::String(s.clone()),
            TermValue::Array(items) => Value::Array(
                items
                    .iter()
                    .map(Term::to_json)
                    .collect::<Option<Vec<_>>>()?,
            ),
            TermValue::Object(pairs) => {
                let mut out = serde_json::Map::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let key = match &k.value {
                        TermValue::String(s) => s.clone(),
                        _ if k.is_ground() => k.to_string(),
                        _ => return None,
                    };
                    out.insert(key, v.to_json()?);
                }
                Value::Object(out)
            }
            TermValue::Var(_) | TermValue::Ref(_) => return None,
        })
    }
}

#[allow(clippy::cast_possible_truncation)]
fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        return serde_json::Value::from(n as i64);
    }
    serde_json::Number::from_f64(n).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

impl From<&serde_json::Value> for Term {
    fn from(value: &serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::null(),
            Value::Bool(b) => Self::boolean(*b),
            Value::Number(n) => Self::number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Self::string(s.clone()),
            Value::Array(items) => Self::array(items.iter().map(Self::from).collect()),
            Value::Object(map) => Self::object(
                map.iter()
                    .map(|(k, v)| (Self::string(k.clone()), Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Term {
    fn from(value: serde_json::Value) -> Self {
        Self::from(&value)
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl PartialEq for TermValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) | (Self::Var(a), Self::Var(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(ka, va)| b.iter().any(|(kb, vb)| ka == kb && va == vb))
            }
            _ => false,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            TermValue::Null => f.write_str("null"),
            TermValue::Boolean(b) => write!(f, "{b}"),
            TermValue::Number(n) => write!(f, "{n}"),
            TermValue::String(s) => write!(f, "{s:?}"),
            TermValue::Var(name) => f.write_str(name),
            TermValue::Ref(r) => write!(f, "{r}"),
            TermValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            TermValue::Object(pairs) => {
                f.write_str("{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_renders_policy_syntax() {
        let t = Term::object(vec![
            (Term::string("a"), Term::array(vec![Term::number(1.0), Term::null()])),
            (Term::string("b"), Term::boolean(true)),
        ]);
        assert_eq!(t.to_string(), r#"{"a": [1, null], "b": true}"#);
        assert_eq!(Term::number(2.5).to_string(), "2.5");
        assert_eq!(Term::var("x").to_string(), "x");
        assert_eq!(
            Term::reference(Ref::new("data", vec!["a".into(), "b".into()])).to_string(),
            "data.a.b"
        );
    }

    #[test]
    fn equality_ignores_location_and_object_order() {
        let a = Term::object(vec![
            (Term::string("x"), Term::number(1.0)),
            (Term::string("y"), Term::number(2.0)),
        ])
        .with_location(Location::new("a.policy", 1, 1));
        let b = Term::object(vec![
            (Term::string("y"), Term::number(2.0)),
            (Term::string("x"), Term::number(1.0)),
        ]);
        assert_eq!(a, b);
        assert_ne!(Term::string("1"), Term::number(1.0));
        assert_ne!(
            Term::array(vec![Term::number(1.0)]),
            Term::array(vec![Term::number(1.0), Term::number(1.0)])
        );
    }

    #[test]
    fn json_conversion_keeps_integers_integral() {
        let json = serde_json::json!({"n": 3, "f": 0.5, "s": ["a"]});
        let t = Term::from(&json);
        assert!(t.is_ground());
        assert_eq!(t.to_json(), Some(json));
        assert_eq!(Term::var("x").to_json(), None);
    }

    #[test]
    fn truthiness_only_rejects_false() {
        assert!(Term::null().is_truthy());
        assert!(Term::number(0.0).is_truthy());
        assert!(!Term::boolean(false).is_truthy());
    }
}
