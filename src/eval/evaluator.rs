//! Top-down evaluator for queries and complete rules.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use crate::context::Context;
use crate::eval::metrics::{Metrics, COUNTER_DATA_READS, COUNTER_RULE_EVALUATIONS};
use crate::eval::trace::{BufferTracer, TraceEvent, TraceOp};
use crate::eval::{EvalError, ExpressionValue, QueryResult, ResultSet};
use crate::policy::ast::{Expr, ExprKind, Query};
use crate::policy::compiler::CompiledPolicy;
use crate::storage::{Path, StorageError, Store, Transaction};
use crate::term::{Term, TermValue};

type Bindings = BTreeMap<String, Term>;

/// Where base documents come from during evaluation.
pub(crate) trait DataSource {
    /// `Ok(None)` when nothing is stored at `path`.
    fn read(&self, ctx: &Context, path: &Path) -> Result<Option<serde_json::Value>, EvalError>;
}

pub(crate) struct StoreSource<'a> {
    pub store: &'a dyn Store,
    pub txn: &'a Transaction,
}

impl DataSource for StoreSource<'_> {
    fn read(&self, ctx: &Context, path: &Path) -> Result<Option<serde_json::Value>, EvalError> {
        match self.store.read(ctx, self.txn, path) {
            Ok(v) => Ok(Some(v)),
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Base documents captured ahead of time, keyed by the path they were read at.
pub(crate) struct SnapshotSource<'a> {
    pub snapshot: &'a BTreeMap<Path, Option<serde_json::Value>>,
}

impl DataSource for SnapshotSource<'_> {
    fn read(&self, _ctx: &Context, path: &Path) -> Result<Option<serde_json::Value>, EvalError> {
        if let Some(v) = self.snapshot.get(path) {
            return Ok(v.clone());
        }
        let Some((base, value)) = self
            .snapshot
            .iter()
            .rev()
            .find(|(p, _)| path.has_prefix(p))
        else {
            return Err(EvalError::SnapshotMiss { path: path.clone() });
        };
        let Some(mut cur) = value.as_ref() else {
            return Ok(None);
        };
        for seg in &path.segments()[base.segments().len()..] {
            let next = match cur {
                serde_json::Value::Object(map) => map.get(seg),
                serde_json::Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            let Some(next) = next else {
                return Ok(None);
            };
            cur = next;
        }
        Ok(Some(cur.clone()))
    }
}

pub(crate) struct Evaluator<'a> {
    pub ctx: &'a Context,
    pub policy: &'a CompiledPolicy,
    pub data: &'a dyn DataSource,
    pub input: Option<&'a Term>,
    pub metrics: &'a Metrics,
    pub instrument: bool,
    pub tracer: Option<&'a BufferTracer>,
    memo: RefCell<HashMap<Vec<String>, Option<Term>>>,
    stack: RefCell<Vec<Vec<String>>>,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        ctx: &'a Context,
        policy: &'a CompiledPolicy,
        data: &'a dyn DataSource,
        input: Option<&'a Term>,
        metrics: &'a Metrics,
        instrument: bool,
        tracer: Option<&'a BufferTracer>,
    ) -> Self {
        Self {
            ctx,
            policy,
            data,
            input,
            metrics,
            instrument,
            tracer,
            memo: RefCell::new(HashMap::new()),
            stack: RefCell::new(Vec::new()),
        }
    }

    fn trace(&self, op: TraceOp, node: impl FnOnce() -> String, expr: Option<&Expr>) {
        if let Some(tracer) = self.tracer {
            tracer.trace(TraceEvent {
                op,
                node: node(),
                location: expr.map(|e| e.location.clone()),
                depth: self.stack.borrow().len(),
            });
        }
    }

    /// Evaluate a query; at most one result since terms are single-valued.
    pub fn eval_query(&self, query: &Query) -> Result<ResultSet, EvalError> {
        self.trace(TraceOp::Enter, || query.to_string(), None);
        let mut env = Bindings::new();
        let mut expressions = Vec::with_capacity(query.exprs.len());
        for expr in &query.exprs {
            match self.eval_expr(expr, &mut env)? {
                Some(value) => expressions.push(ExpressionValue {
                    value: value.to_json().unwrap_or(serde_json::Value::Null),
                    text: expr.to_string(),
                    location: expr.location.clone(),
                }),
                None => {
                    self.trace(TraceOp::Fail, || query.to_string(), None);
                    return Ok(Vec::new());
                }
            }
        }
        self.trace(TraceOp::Exit, || query.to_string(), None);

        let bindings = query
            .vars()
            .into_iter()
            .filter_map(|name| {
                let value = env.get(&name)?.to_json()?;
                Some((name, value))
            })
            .collect();
        Ok(vec![QueryResult {
            expressions,
            bindings,
        }])
    }

    /// Evaluate one expression. `Some(value)` on success, `None` on failure.
    fn eval_expr(&self, expr: &Expr, env: &mut Bindings) -> Result<Option<Term>, EvalError> {
        if let Some(err) = self.ctx.err() {
            return Err(err.into());
        }
        self.trace(TraceOp::Eval, || expr.to_string(), Some(expr));

        let out = match &expr.kind {
            ExprKind::Term { term } => self.eval_term(term, env)?.filter(Term::is_truthy),
            ExprKind::Unify { left, right } => {
                self.unify(left, right, env)?.then(|| Term::boolean(true))
            }
            ExprKind::Equal { left, right } => {
                match (self.eval_term(left, env)?, self.eval_term(right, env)?) {
                    (Some(a), Some(b)) => (a == b).then(|| Term::boolean(true)),
                    _ => None,
                }
            }
            ExprKind::NotEqual { left, right } => {
                match (self.eval_term(left, env)?, self.eval_term(right, env)?) {
                    (Some(a), Some(b)) => (a != b).then(|| Term::boolean(true)),
                    _ => None,
                }
            }
        };
        if out.is_none() {
            self.trace(TraceOp::Fail, || expr.to_string(), Some(expr));
        }
        Ok(out)
    }

    fn eval_body(&self, body: &[Expr], env: &mut Bindings) -> Result<bool, EvalError> {
        for expr in body {
            if self.eval_expr(expr, env)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Evaluate a term to a ground value; `None` means undefined.
    fn eval_term(&self, term: &Term, env: &Bindings) -> Result<Option<Term>, EvalError> {
        match &term.value {
            TermValue::Var(name) => Ok(env.get(name).cloned()),
            TermValue::Ref(r) if r.is_data() => self.eval_data(&r.path),
            TermValue::Ref(r) if r.is_input() => Ok(self.input.and_then(|i| index(i, &r.path))),
            TermValue::Ref(r) => Ok(env.get(&r.root).and_then(|v| index(v, &r.path))),
            TermValue::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    let Some(v) = self.eval_term(item, env)? else {
                        return Ok(None);
                    };
                    out.push(v);
                }
                Ok(Some(Term::array(out)))
            }
            TermValue::Object(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let (Some(k), Some(v)) = (self.eval_term(k, env)?, self.eval_term(v, env)?)
                    else {
                        return Ok(None);
                    };
                    out.push((k, v));
                }
                Ok(Some(Term::object(out)))
            }
            _ => Ok(Some(Term::new(term.value.clone()))),
        }
    }

    fn eval_data(&self, path: &[String]) -> Result<Option<Term>, EvalError> {
        if let Some((n, _)) = self.policy.rule_prefix(path) {
            let value = self.eval_rule(&path[..n])?;
            return Ok(value.and_then(|v| index(&v, &path[n..])));
        }

        if self.instrument {
            self.metrics.incr(COUNTER_DATA_READS);
        }
        let base = self
            .data
            .read(self.ctx, &Path::new(path.to_vec()))?
            .map(Term::from);

        let below: Vec<Vec<String>> = self
            .policy
            .rules_below(path)
            .map(|(p, _)| p.clone())
            .collect();
        if below.is_empty() {
            return Ok(base);
        }

        let mut doc = match base {
            Some(t) if matches!(t.value, TermValue::Object(_)) => t,
            Some(other) => return Ok(Some(other)),
            None => Term::object(Vec::new()),
        };
        let mut any = false;
        for rule_path in below {
            if let Some(v) = self.eval_rule(&rule_path)? {
                insert(&mut doc, &rule_path[path.len()..], v);
                any = true;
            }
        }
        match &doc.value {
            TermValue::Object(pairs) if pairs.is_empty() && !any => Ok(None),
            _ => Ok(Some(doc)),
        }
    }

    /// Complete-rule semantics: all defined bodies must agree on one value;
    /// the default value applies when none is defined.
    fn eval_rule(&self, path: &[String]) -> Result<Option<Term>, EvalError> {
        if let Some(v) = self.memo.borrow().get(path) {
            return Ok(v.clone());
        }
        let name = format!("data.{}", path.join("."));
        if self.stack.borrow().iter().any(|p| p == path) {
            return Err(EvalError::Recursion { rule: name });
        }
        let Some(rules) = self.policy.rules_at(path) else {
            return Ok(None);
        };
        if self.instrument {
            self.metrics.incr(COUNTER_RULE_EVALUATIONS);
        }

        self.stack.borrow_mut().push(path.to_vec());
        let result = self.eval_rule_defs(&name, rules);
        self.stack.borrow_mut().pop();
        let value = result?;

        self.memo.borrow_mut().insert(path.to_vec(), value.clone());
        Ok(value)
    }

    fn eval_rule_defs(
        &self,
        name: &str,
        rules: &[crate::policy::ast::Rule],
    ) -> Result<Option<Term>, EvalError> {
        let mut value: Option<Term> = None;
        for rule in rules.iter().filter(|r| !r.default) {
            self.trace(TraceOp::Enter, || rule.to_string(), None);
            let mut env = Bindings::new();
            if !self.eval_body(&rule.body, &mut env)? {
                self.trace(TraceOp::Fail, || rule.to_string(), None);
                continue;
            }
            let Some(v) = self.eval_term(&rule.value, &env)? else {
                self.trace(TraceOp::Fail, || rule.to_string(), None);
                continue;
            };
            self.trace(TraceOp::Exit, || rule.to_string(), None);
            match &value {
                Some(existing) if *existing != v => {
                    return Err(EvalError::Conflict {
                        rule: name.to_string(),
                    });
                }
                Some(_) => {}
                None => value = Some(v),
            }
        }
        if value.is_some() {
            return Ok(value);
        }
        Ok(rules
            .iter()
            .find(|r| r.default)
            .map(|r| Term::new(r.value.value.clone())))
    }

    fn unify(&self, a: &Term, b: &Term, env: &mut Bindings) -> Result<bool, EvalError> {
        if let Some(name) = unbound_var(a, env) {
            return self.bind(name, b, env);
        }
        if let Some(name) = unbound_var(b, env) {
            return self.bind(name, a, env);
        }
        match (&a.value, &b.value) {
            (TermValue::Array(pattern), _) if !a.is_ground() => self.unify_array(pattern, b, env),
            (_, TermValue::Array(pattern)) if !b.is_ground() => self.unify_array(pattern, a, env),
            (TermValue::Object(pattern), _) if !a.is_ground() => self.unify_object(pattern, b, env),
            (_, TermValue::Object(pattern)) if !b.is_ground() => self.unify_object(pattern, a, env),
            _ => match (self.eval_term(a, env)?, self.eval_term(b, env)?) {
                (Some(x), Some(y)) => Ok(x == y),
                _ => Ok(false),
            },
        }
    }

    fn bind(&self, name: &str, other: &Term, env: &mut Bindings) -> Result<bool, EvalError> {
        match self.eval_term(other, env)? {
            Some(v) => {
                env.insert(name.to_string(), v);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn unify_array(
        &self,
        pattern: &[Term],
        other: &Term,
        env: &mut Bindings,
    ) -> Result<bool, EvalError> {
        let items = match &other.value {
            TermValue::Array(items) => items.clone(),
            _ => match self.eval_term(other, env)? {
                Some(Term {
                    value: TermValue::Array(items),
                    ..
                }) => items,
                _ => return Ok(false),
            },
        };
        if items.len() != pattern.len() {
            return Ok(false);
        }
        for (p, v) in pattern.iter().zip(items.iter()) {
            if !self.unify(p, v, env)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn unify_object(
        &self,
        pattern: &[(Term, Term)],
        other: &Term,
        env: &mut Bindings,
    ) -> Result<bool, EvalError> {
        let Some(Term {
            value: TermValue::Object(pairs),
            ..
        }) = self.eval_term_shallow(other, env)?
        else {
            return Ok(false);
        };
        if pairs.len() != pattern.len() {
            return Ok(false);
        }
        for (pk, pv) in pattern {
            let Some(key) = self.eval_term(pk, env)? else {
                return Ok(false);
            };
            let Some((_, v)) = pairs.iter().find(|(k, _)| *k == key) else {
                return Ok(false);
            };
            if !self.unify(pv, v, env)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Object literals keep their (possibly non-ground) values for pairwise
    /// unification; anything else is evaluated.
    fn eval_term_shallow(&self, term: &Term, env: &Bindings) -> Result<Option<Term>, EvalError> {
        match &term.value {
            TermValue::Object(_) => Ok(Some(term.clone())),
            _ => self.eval_term(term, env),
        }
    }
}

fn unbound_var<'t>(term: &'t Term, env: &Bindings) -> Option<&'t str> {
    match &term.value {
        TermValue::Var(name) if !env.contains_key(name) => Some(name),
        _ => None,
    }
}

/// Walk `path` into a ground term.
fn index(term: &Term, path: &[String]) -> Option<Term> {
    let mut cur = term;
    for seg in path {
        cur = match &cur.value {
            TermValue::Object(_) => cur.get(seg)?,
            TermValue::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(Term::new(cur.value.clone()))
}

/// Set `value` at `rel` inside an object term, creating objects on the way.
fn insert(doc: &mut Term, rel: &[String], value: Term) {
    let Some((first, rest)) = rel.split_first() else {
        *doc = value;
        return;
    };
    let TermValue::Object(pairs) = &mut doc.value else {
        return;
    };
    let pos = pairs
        .iter()
        .position(|(k, _)| matches!(&k.value, TermValue::String(s) if s == first));
    let slot = match pos {
        Some(i) => &mut pairs[i].1,
        None => {
            pairs.push((Term::string(first.clone()), Term::object(Vec::new())));
            let last = pairs.len() - 1;
            &mut pairs[last].1
        }
    };
    insert(slot, rest, value);
}
