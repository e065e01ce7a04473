//! Precondition rules of an OpsDefinition: `<path> <op> <literal>`.
//!
//! Paths are `cluster.phase`, `component.phase`, `component.replicas` and
//! `component.name`; operators are `==` and `!=`. Literals may be quoted.

use crate::controller::error::{Error, Result};
use crate::crd::{PreCheckResult, PreCondition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Path {
    ClusterPhase,
    ComponentPhase,
    ComponentReplicas,
    ComponentName,
}

impl std::str::FromStr for Path {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cluster.phase" => Ok(Path::ClusterPhase),
            "component.phase" => Ok(Path::ComponentPhase),
            "component.replicas" => Ok(Path::ComponentReplicas),
            "component.name" => Ok(Path::ComponentName),
            other => Err(Error::fatal(format!("unknown precondition path {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    pub path: Path,
    pub op: Op,
    pub literal: String,
}

fn unquote(s: &str) -> &str {
    for q in ['"', '\''] {
        if let Some(inner) = s.strip_prefix(q).and_then(|s| s.strip_suffix(q)) {
            return inner;
        }
    }
    s
}

impl std::str::FromStr for Expression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (lhs, op, rhs) = if let Some((l, r)) = s.split_once("!=") {
            (l, Op::Ne, r)
        } else if let Some((l, r)) = s.split_once("==") {
            (l, Op::Eq, r)
        } else {
            return Err(Error::fatal(format!("invalid precondition expression {:?}", s)));
        };
        Ok(Expression {
            path: lhs.trim().parse()?,
            op,
            literal: unquote(rhs.trim()).to_string(),
        })
    }
}

/// Values the rules are evaluated against
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Facts {
    pub cluster_phase: String,
    pub component_phase: String,
    pub component_replicas: i32,
    pub component_name: String,
}

impl Expression {
    pub fn evaluate(&self, facts: &Facts) -> bool {
        let actual = match self.path {
            Path::ClusterPhase => facts.cluster_phase.clone(),
            Path::ComponentPhase => facts.component_phase.clone(),
            Path::ComponentReplicas => facts.component_replicas.to_string(),
            Path::ComponentName => facts.component_name.clone(),
        };
        match self.op {
            Op::Eq => actual == self.literal,
            Op::Ne => actual != self.literal,
        }
    }
}

/// Evaluate every rule; the first failing rule's message is reported
pub fn check(rules: &[PreCondition], facts: &Facts) -> Result<PreCheckResult> {
    for rule in rules {
        let expr: Expression = rule.rule.expression.parse()?;
        if !expr.evaluate(facts) {
            return Ok(PreCheckResult {
                pass: false,
                message: Some(rule.rule.message.clone()),
            });
        }
    }
    Ok(PreCheckResult {
        pass: true,
        message: None,
    })
}
