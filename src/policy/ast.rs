//! Syntax tree for policy modules and queries.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::term::{Location, Term, TermValue};

/// Expression forms allowed in rule bodies and queries.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExprKind {
    /// Succeeds when the term is defined and not `false`.
    Term { term: Term },
    /// Unification: binds variables on either side.
    Unify { left: Term, right: Term },
    /// Comparison without binding.
    Equal { left: Term, right: Term },
    /// Negated comparison.
    NotEqual { left: Term, right: Term },
}

/// One expression with its source location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    /// What the expression does.
    pub kind: ExprKind,
    /// Where the expression starts.
    pub location: Location,
}

impl Expr {
    /// Terms appearing in this expression, left to right.
    #[must_use]
    pub fn terms(&self) -> Vec<&Term> {
        match &self.kind {
            ExprKind::Term { term } => vec![term],
            ExprKind::Unify { left, right }
            | ExprKind::Equal { left, right }
            | ExprKind::NotEqual { left, right } => vec![left, right],
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Term { term } => write!(f, "{term}"),
            ExprKind::Unify { left, right } => write!(f, "{left} = {right}"),
            ExprKind::Equal { left, right } => write!(f, "{left} == {right}"),
            ExprKind::NotEqual { left, right } => write!(f, "{left} != {right}"),
        }
    }
}

/// A parsed query: a conjunction of expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Expressions, all of which must succeed.
    pub exprs: Vec<Expr>,
}

impl Query {
    /// Variables that appear anywhere in the query, in sorted order.
    #[must_use]
    pub fn vars(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for expr in &self.exprs {
            for term in expr.terms() {
                collect_vars(term, &mut out);
            }
        }
        out
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, expr) in self.exprs.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{expr}")?;
        }
        Ok(())
    }
}

/// A complete rule: `[default] name [= value] [{ body }]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Rule name, the last segment of its `data` path.
    pub name: String,
    /// True for a `default` rule, used when no other definition applies.
    pub default: bool,
    /// Value produced when the body succeeds; `true` if omitted.
    pub value: Term,
    /// Conditions; empty means unconditional.
    pub body: Vec<Expr>,
    /// Where the rule starts.
    pub location: Location,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.default {
            f.write_str("default ")?;
        }
        write!(f, "{} = {}", self.name, self.value)?;
        if !self.body.is_empty() {
            f.write_str(" { ")?;
            for (i, expr) in self.body.iter().enumerate() {
                if i > 0 {
                    f.write_str("; ")?;
                }
                write!(f, "{expr}")?;
            }
            f.write_str(" }")?;
        }
        Ok(())
    }
}

/// One policy source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Module id, as given when the policy was installed.
    pub id: String,
    /// Package path, e.g. `["authz"]` for `package authz`.
    pub package: Vec<String>,
    /// Rules in source order.
    pub rules: Vec<Rule>,
    /// Original source text.
    pub source: String,
}

impl Module {
    /// `data` path segments of the rule named `name` in this module.
    #[must_use]
    pub fn rule_path(&self, name: &str) -> Vec<String> {
        let mut path = self.package.clone();
        path.push(name.to_string());
        path
    }
}

/// Collect variable names (including ref roots that are not `data`/`input`).
pub(crate) fn collect_vars(term: &Term, out: &mut BTreeSet<String>) {
    match &term.value {
        TermValue::Var(name) => {
            out.insert(name.clone());
        }
        TermValue::Ref(r) if !r.is_data() && !r.is_input() => {
            out.insert(r.root.clone());
        }
        TermValue::Array(items) => {
            for item in items {
                collect_vars(item, out);
            }
        }
        TermValue::Object(pairs) => {
            for (k, v) in pairs {
                collect_vars(k, out);
                collect_vars(v, out);
            }
        }
        _ => {}
    }
}
