//! Policy compiler: checks parsed modules and indexes their rules.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::policy::ast::{collect_vars, Expr, ExprKind, Module, Query, Rule};
use crate::storage::Path;
use crate::term::{Location, Term, TermValue};

/// One compiler finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Finding category, one of the `*_ERR` constants.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Where the problem is, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Diagnostic {
    /// Generic compile failure.
    pub const COMPILE_ERR: &'static str = "compile_error";
    /// A variable is used without being bound.
    pub const UNSAFE_VAR_ERR: &'static str = "unsafe_var_error";
    /// A value has the wrong type for where it is used.
    pub const TYPE_ERR: &'static str = "type_error";

    /// A finding with `code` and `message`.
    #[must_use]
    pub fn new(code: &str, message: impl Into<String>, location: Option<Location>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            location,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{loc}: {}: {}", self.code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

/// Collects diagnostics up to a limit. A limit of zero means unlimited.
struct Diagnostics {
    limit: usize,
    items: Vec<Diagnostic>,
    truncated: bool,
}

impl Diagnostics {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            items: Vec::new(),
            truncated: false,
        }
    }

    fn full(&self) -> bool {
        self.truncated
    }

    fn push(&mut self, d: Diagnostic) {
        if self.truncated {
            return;
        }
        if self.limit > 0 && self.items.len() == self.limit {
            self.items.push(Diagnostic::new(
                Diagnostic::COMPILE_ERR,
                "error limit reached",
                None,
            ));
            self.truncated = true;
            return;
        }
        self.items.push(d);
    }
}

/// The active, validated, ready-to-evaluate policy set.
#[derive(Debug, Clone, Default)]
pub struct CompiledPolicy {
    modules: BTreeMap<String, Module>,
    rules: BTreeMap<Vec<String>, Vec<Rule>>,
    fingerprint: String,
}

impl CompiledPolicy {
    /// A policy with no modules.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Modules the policy was compiled from, by id.
    #[must_use]
    pub fn modules(&self) -> &BTreeMap<String, Module> {
        &self.modules
    }

    /// Module `id`, if present.
    #[must_use]
    pub fn module(&self, id: &str) -> Option<&Module> {
        self.modules.get(id)
    }

    /// Stable blake3 digest over module ids and sources (hex).
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// All definitions of the rule at `path` (below `data`).
    #[must_use]
    pub fn rules_at(&self, path: &[String]) -> Option<&[Rule]> {
        self.rules.get(path).map(Vec::as_slice)
    }

    /// The longest prefix of `path` naming a rule, with the rule definitions.
    #[must_use]
    pub fn rule_prefix(&self, path: &[String]) -> Option<(usize, &[Rule])> {
        (1..=path.len())
            .rev()
            .find_map(|n| self.rules_at(&path[..n]).map(|r| (n, r)))
    }

    /// Rule paths strictly below `prefix` (virtual documents under a package).
    pub fn rules_below<'a>(
        &'a self,
        prefix: &'a [String],
    ) -> impl Iterator<Item = (&'a Vec<String>, &'a Vec<Rule>)> + 'a {
        self.rules
            .iter()
            .filter(move |(p, _)| p.len() > prefix.len() && p.starts_with(prefix))
    }

    /// Base-document paths a query may read, following rule references.
    #[must_use]
    pub fn data_dependencies(&self, query: &Query) -> BTreeSet<Path> {
        let mut out = BTreeSet::new();
        let mut visited = BTreeSet::new();
        for expr in &query.exprs {
            self.expr_deps(expr, &mut visited, &mut out);
        }
        out
    }

    fn expr_deps(
        &self,
        expr: &Expr,
        visited: &mut BTreeSet<Vec<String>>,
        out: &mut BTreeSet<Path>,
    ) {
        for term in expr.terms() {
            self.term_deps(term, visited, out);
        }
    }

    fn term_deps(
        &self,
        term: &Term,
        visited: &mut BTreeSet<Vec<String>>,
        out: &mut BTreeSet<Path>,
    ) {
        match &term.value {
            TermValue::Ref(r) if r.is_data() => {
                if let Some((n, _)) = self.rule_prefix(&r.path) {
                    self.rule_deps(&r.path[..n], visited, out);
                    return;
                }
                let below: Vec<Vec<String>> =
                    self.rules_below(&r.path).map(|(p, _)| p.clone()).collect();
                for p in below {
                    self.rule_deps(&p, visited, out);
                }
                out.insert(Path::new(r.path.clone()));
            }
            TermValue::Array(items) => {
                for item in items {
                    self.term_deps(item, visited, out);
                }
            }
            TermValue::Object(pairs) => {
                for (k, v) in pairs {
                    self.term_deps(k, visited, out);
                    self.term_deps(v, visited, out);
                }
            }
            _ => {}
        }
    }

    fn rule_deps(
        &self,
        path: &[String],
        visited: &mut BTreeSet<Vec<String>>,
        out: &mut BTreeSet<Path>,
    ) {
        if !visited.insert(path.to_vec()) {
            return;
        }
        let Some(rules) = self.rules_at(path) else {
            return;
        };
        for rule in rules {
            self.term_deps(&rule.value, visited, out);
            for expr in &rule.body {
                self.expr_deps(expr, visited, out);
            }
        }
    }
}

/// Check variable safety of a body followed by an optional head value.
///
/// Variables become bound by appearing in a unification; every other use
/// must come after a binding.
fn check_safety(body: &[Expr], head: Option<&Term>, diags: &mut Diagnostics) {
    let mut bound = BTreeSet::new();
    for expr in body {
        let mut vars = BTreeSet::new();
        for term in expr.terms() {
            collect_vars(term, &mut vars);
        }
        if let ExprKind::Unify { .. } = expr.kind {
            bound.extend(vars);
            continue;
        }
        for var in vars.difference(&bound) {
            diags.push(Diagnostic::new(
                Diagnostic::UNSAFE_VAR_ERR,
                format!("var {var} is unsafe"),
                Some(expr.location.clone()),
            ));
        }
    }
    if let Some(head) = head {
        let mut vars = BTreeSet::new();
        collect_vars(head, &mut vars);
        for var in vars.difference(&bound) {
            diags.push(Diagnostic::new(
                Diagnostic::UNSAFE_VAR_ERR,
                format!("var {var} is unsafe"),
                head.location.clone(),
            ));
        }
    }
}

/// Check a query for unsafe variables.
pub fn check_query(query: &Query) -> Result<(), Vec<Diagnostic>> {
    let mut diags = Diagnostics::new(0);
    check_safety(&query.exprs, None, &mut diags);
    if diags.items.is_empty() {
        Ok(())
    } else {
        Err(diags.items)
    }
}

fn fingerprint(modules: &BTreeMap<String, Module>) -> String {
    let mut hasher = blake3::Hasher::new();
    for (id, module) in modules {
        hasher.update(id.as_bytes());
        hasher.update(&[0]);
        hasher.update(module.source.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Compile a full module set, reporting at most `error_limit` diagnostics
/// (zero means unlimited).
pub fn compile(
    modules: BTreeMap<String, Module>,
    error_limit: usize,
) -> Result<CompiledPolicy, Vec<Diagnostic>> {
    let mut diags = Diagnostics::new(error_limit);
    let mut rules: BTreeMap<Vec<String>, Vec<Rule>> = BTreeMap::new();

    for module in modules.values() {
        for rule in &module.rules {
            if diags.full() {
                break;
            }
            check_safety(&rule.body, Some(&rule.value), &mut diags);
            rules
                .entry(module.rule_path(&rule.name))
                .or_default()
                .push(rule.clone());
        }
    }

    for (path, defs) in &rules {
        let defaults: Vec<&Rule> = defs.iter().filter(|r| r.default).collect();
        if defaults.len() > 1 {
            diags.push(Diagnostic::new(
                Diagnostic::TYPE_ERR,
                format!("multiple default rules data.{} found", path.join(".")),
                Some(defaults[1].location.clone()),
            ));
        }
        for default in defaults {
            if !default.value.is_ground() {
                diags.push(Diagnostic::new(
                    Diagnostic::TYPE_ERR,
                    format!("default rule data.{} value must be ground", path.join(".")),
                    Some(default.location.clone()),
                ));
            }
        }
    }

    for path in rules.keys() {
        for (other, defs) in &rules {
            if other.len() > path.len() && other.starts_with(path) {
                diags.push(Diagnostic::new(
                    Diagnostic::TYPE_ERR,
                    format!(
                        "rule data.{} conflicts with rule data.{}",
                        path.join("."),
                        other.join(".")
                    ),
                    defs.first().map(|r| r.location.clone()),
                ));
            }
        }
    }

    if !diags.items.is_empty() {
        return Err(diags.items);
    }

    let fingerprint = fingerprint(&modules);
    Ok(CompiledPolicy {
        modules,
        rules,
        fingerprint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::policy::parser::{parse_module, parse_query};

    fn modules(srcs: &[(&str, &str)]) -> BTreeMap<String, Module> {
        srcs.iter()
            .map(|(id, src)| (id.to_string(), parse_module(id, src).unwrap()))
            .collect()
    }

    #[test]
    fn compiles_and_indexes_rules() {
        let policy = compile(
            modules(&[("a", "package authz\ndefault allow = false\nallow { input.admin == true }")]),
            10,
        )
        .unwrap();
        let path = vec!["authz".to_string(), "allow".to_string()];
        assert_eq!(policy.rules_at(&path).unwrap().len(), 2);
        assert_eq!(policy.fingerprint().len(), 64);
    }

    #[test]
    fn unsafe_vars_are_reported() {
        let err = compile(modules(&[("a", "package a\np = x { x != 1 }")]), 10).unwrap_err();
        assert!(err.iter().all(|d| d.code == Diagnostic::UNSAFE_VAR_ERR));
        assert!(err[0].message.contains("var x is unsafe"));
    }

    #[test]
    fn error_limit_truncates_diagnostics() {
        let src = "package a\np = x\nq = y\nr = z";
        let err = compile(modules(&[("a", src)]), 2).unwrap_err();
        assert_eq!(err.len(), 3);
        assert_eq!(err[2].message, "error limit reached");

        let err = compile(modules(&[("a", src)]), 0).unwrap_err();
        assert_eq!(err.len(), 3);
        assert!(err.iter().all(|d| d.code == Diagnostic::UNSAFE_VAR_ERR));
    }

    #[test]
    fn duplicate_defaults_and_nested_rule_conflicts() {
        let err = compile(
            modules(&[
                ("a", "package a\ndefault p = 1\ndefault p = 2"),
                ("b", "package a.p\nq = 1"),
            ]),
            10,
        )
        .unwrap_err();
        assert!(err.iter().any(|d| d.message.contains("multiple default rules")));
        assert!(err.iter().any(|d| d.message.contains("conflicts with")));
    }

    #[test]
    fn fingerprint_tracks_sources() {
        let a = compile(modules(&[("a", "package a\np = 1")]), 0).unwrap();
        let b = compile(modules(&[("a", "package a\np = 1")]), 0).unwrap();
        let c = compile(modules(&[("a", "package a\np = 2")]), 0).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn dependencies_follow_rules_into_base_documents() {
        let policy = compile(
            modules(&[(
                "a",
                "package authz\nallow { data.users.admins == input.user }\nview = data.authz.allow",
            )]),
            0,
        )
        .unwrap();
        let q = parse_query("data.authz.view; data.roles.x = y").unwrap();
        let deps: Vec<String> = policy
            .data_dependencies(&q)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(deps, vec!["/roles/x", "/users/admins"]);
    }

    #[test]
    fn query_safety() {
        assert!(check_query(&parse_query("x = 1; x == 1").unwrap()).is_ok());
        assert!(check_query(&parse_query("x == 1").unwrap()).is_err());
    }
}
