//! Label selectors and list/watch match criteria.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{StoreError, StoreResult};
use crate::Object;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Equals(String),
    NotEquals(String),
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub op: Operator,
}

impl Requirement {
    fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let val = labels.and_then(|l| l.get(&self.key));
        match &self.op {
            Operator::Equals(v) => val == Some(v),
            Operator::NotEquals(v) => val != Some(v),
            Operator::In(set) => val.map(|v| set.contains(v)).unwrap_or(false),
            Operator::NotIn(set) => val.map(|v| !set.contains(v)).unwrap_or(true),
            Operator::Exists => val.is_some(),
            Operator::DoesNotExist => val.is_none(),
        }
    }
}

/// Conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub requirements: SmallVec<[Requirement; 4]>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn eq(key: &str, value: &str) -> Self {
        let mut s = Self::default();
        s.requirements.push(Requirement { key: key.to_string(), op: Operator::Equals(value.to_string()) });
        s
    }

    /// Parse the textual selector syntax: `a=b,c!=d,e,!f,g in (x,y),h notin (z)`.
    pub fn parse(input: &str) -> StoreResult<Self> {
        let mut out = Self::default();
        for term in split_terms(input) {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            out.requirements.push(parse_term(term)?);
        }
        Ok(out)
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

// Split on commas that are not inside a parenthesized value set.
fn split_terms(input: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&input[start..]);
    terms
}

fn parse_set(raw: &str) -> StoreResult<BTreeSet<String>> {
    let inner = raw
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| StoreError::Validation(format!("invalid value set: {}", raw)))?;
    Ok(inner.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
}

fn parse_term(term: &str) -> StoreResult<Requirement> {
    let invalid = || StoreError::Validation(format!("invalid label selector term: {}", term));
    if let Some(key) = term.strip_prefix('!') {
        let key = key.trim();
        if key.is_empty() {
            return Err(invalid());
        }
        return Ok(Requirement { key: key.to_string(), op: Operator::DoesNotExist });
    }
    if let Some((key, rest)) = term.split_once(" notin ") {
        return Ok(Requirement { key: key.trim().to_string(), op: Operator::NotIn(parse_set(rest)?) });
    }
    if let Some((key, rest)) = term.split_once(" in ") {
        return Ok(Requirement { key: key.trim().to_string(), op: Operator::In(parse_set(rest)?) });
    }
    if let Some((key, val)) = term.split_once("!=") {
        return Ok(Requirement { key: key.trim().to_string(), op: Operator::NotEquals(val.trim().to_string()) });
    }
    if let Some((key, val)) = term.split_once("==").or_else(|| term.split_once('=')) {
        if key.trim().is_empty() {
            return Err(invalid());
        }
        return Ok(Requirement { key: key.trim().to_string(), op: Operator::Equals(val.trim().to_string()) });
    }
    if term.contains(char::is_whitespace) {
        return Err(invalid());
    }
    Ok(Requirement { key: term.to_string(), op: Operator::Exists })
}

/// Filter applied by list, watch and bulk delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCriteria {
    /// `None` matches every namespace.
    pub namespace: Option<String>,
    /// `None` matches every name.
    pub names: Option<BTreeSet<String>>,
    pub labels: LabelSelector,
}

impl MatchCriteria {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_namespace(ns: &str) -> Self {
        Self { namespace: Some(ns.to_string()), ..Self::default() }
    }

    pub fn with_labels(mut self, labels: LabelSelector) -> Self {
        self.labels = labels;
        self
    }

    pub fn matches(&self, obj: &Object) -> bool {
        let meta = obj.meta();
        if let Some(ns) = self.namespace.as_deref() {
            if !ns.is_empty() && meta.namespace.as_deref().unwrap_or("") != ns {
                return false;
            }
        }
        if let Some(names) = &self.names {
            if !names.contains(meta.name.as_deref().unwrap_or("")) {
                return false;
            }
        }
        self.labels.matches(meta.labels.as_ref())
    }
}
