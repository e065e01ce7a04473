//! The reconfigure pipeline over a prefetched ConfigMap file and its constraint.
//!
//! `Validate → FetchConfigConstraint → Merge → Sync → UpdateLabels`. The
//! pipeline is pure; the handler applies the resulting [`ConfigPlan`].

use std::collections::BTreeMap;

use crate::controller::error::{Error, Result};
use crate::controller::workflow::Pipeline;
use crate::crd::{ConfigConstraintSpec, ParameterPair, annotations};

use super::diff::{ConfigDiff, ConfigFile};

/// Inputs of one component's reconfiguration
#[derive(Debug, Clone, Default)]
pub struct ReconfigureInput {
    pub ops_name: String,
    pub component: String,
    pub config_map: String,
    pub file_name: String,
    /// Current file content; `None` when the ConfigMap lacks the key
    pub current: Option<String>,
    pub constraint: Option<ConfigConstraintSpec>,
    pub parameters: Vec<ParameterPair>,
}

/// What the handler has to write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigPlan {
    pub diff: ConfigDiff,
    /// New file content; `None` leaves the ConfigMap untouched
    pub content: Option<String>,
    pub restart_required: bool,
    /// Annotations to set on the ConfigMap
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    input: ReconfigureInput,
    constraint: ConfigConstraintSpec,
    before: Option<ConfigFile>,
    after: Option<ConfigFile>,
    plan: ConfigPlan,
}

fn validate(state: &mut State) -> Result<()> {
    let input = &state.input;
    if input.parameters.is_empty() {
        return Err(Error::fatal(format!(
            "no parameters to update for component {}",
            input.component
        )));
    }
    if input.current.is_none() {
        return Err(Error::fatal(format!(
            "config file {} not found in ConfigMap {}",
            input.file_name, input.config_map
        )));
    }
    Ok(())
}

fn fetch_config_constraint(state: &mut State) -> Result<()> {
    let constraint = state.input.constraint.clone().ok_or_else(|| {
        Error::fatal(format!(
            "config constraint of component {} not found",
            state.input.component
        ))
    })?;
    for p in &state.input.parameters {
        if constraint.immutable_parameters.contains(&p.key) {
            return Err(Error::fatal(format!(
                "parameter {} is immutable and can not be updated",
                p.key
            )));
        }
    }
    state.constraint = constraint;
    Ok(())
}

fn merge(state: &mut State) -> Result<()> {
    let text = state.input.current.as_deref().unwrap_or_default();
    let before = ConfigFile::parse(state.constraint.file_format, text);
    let mut after = before.clone();
    for p in &state.input.parameters {
        after.set(&p.key, p.value.as_deref());
    }
    let diff = ConfigDiff::between(&before.parameters(), &after.parameters());
    state.plan.restart_required = restart_required(&state.constraint, &diff);
    state.plan.diff = diff;
    state.before = Some(before);
    state.after = Some(after);
    Ok(())
}

/// A change needs a restart when any changed key is static or not known to be dynamic
pub fn restart_required(constraint: &ConfigConstraintSpec, diff: &ConfigDiff) -> bool {
    diff.changed_keys().any(|k| {
        constraint.static_parameters.contains(k) || !constraint.dynamic_parameters.contains(k)
    })
}

fn sync(state: &mut State) -> Result<()> {
    if state.plan.diff.is_empty() {
        return Ok(());
    }
    state.plan.content = state.after.as_ref().map(ConfigFile::render);
    Ok(())
}

fn update_labels(state: &mut State) -> Result<()> {
    if state.plan.content.is_none() {
        return Ok(());
    }
    state.plan.annotations = BTreeMap::from([
        (
            annotations::LAST_APPLIED_OPS.to_string(),
            state.input.ops_name.clone(),
        ),
        (
            annotations::RESTART_REQUIRED.to_string(),
            state.plan.restart_required.to_string(),
        ),
    ]);
    Ok(())
}

pub fn plan(input: ReconfigureInput) -> Result<ConfigPlan> {
    let state = State {
        input,
        ..Default::default()
    };
    Pipeline::new(state)
        .step("Validate", validate)
        .step("FetchConfigConstraint", fetch_config_constraint)
        .step("Merge", merge)
        .step("Sync", sync)
        .step("UpdateLabels", update_labels)
        .complete()
        .map(|s| s.plan)
}
