//! Registry of supported operation kinds.
//!
//! `OpsKind` is the closed set of kinds this operator can execute. The
//! registry maps an API `OpsType` to its kind and static behaviour; it is
//! built once at startup and shared through the controller context.

use std::collections::HashMap;

use crate::controller::queue::QueueMode;
use crate::crd::{ClusterPhase, OpsType};

/// Operation kinds with a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpsKind {
    HorizontalScaling,
    Restart,
    VolumeExpansion,
    Switchover,
    RebuildInstance,
    Reconfiguring,
    Expose,
    Custom,
}

impl OpsKind {
    pub const ALL: [OpsKind; 8] = [
        OpsKind::HorizontalScaling,
        OpsKind::Restart,
        OpsKind::VolumeExpansion,
        OpsKind::Switchover,
        OpsKind::RebuildInstance,
        OpsKind::Reconfiguring,
        OpsKind::Expose,
        OpsKind::Custom,
    ];

    pub fn ops_type(&self) -> OpsType {
        match self {
            OpsKind::HorizontalScaling => OpsType::HorizontalScaling,
            OpsKind::Restart => OpsType::Restart,
            OpsKind::VolumeExpansion => OpsType::VolumeExpansion,
            OpsKind::Switchover => OpsType::Switchover,
            OpsKind::RebuildInstance => OpsType::RebuildInstance,
            OpsKind::Reconfiguring => OpsType::Reconfiguring,
            OpsKind::Expose => OpsType::Expose,
            OpsKind::Custom => OpsType::Custom,
        }
    }

    /// A targeted component stuck Failed/Abnormal fails the request
    pub fn tracks_component_health(&self) -> bool {
        matches!(
            self,
            OpsKind::HorizontalScaling | OpsKind::Restart | OpsKind::Reconfiguring
        )
    }

    /// Condition type set when the operation starts
    pub fn started_condition(&self) -> &'static str {
        match self {
            OpsKind::HorizontalScaling => "HorizontalScaling",
            OpsKind::Restart => "Restarting",
            OpsKind::VolumeExpansion => "VolumeExpanding",
            OpsKind::Switchover => "Switchover",
            OpsKind::RebuildInstance => "RebuildInstance",
            OpsKind::Reconfiguring => "Reconfigure",
            OpsKind::Expose => "Exposing",
            OpsKind::Custom => "CustomOperation",
        }
    }
}

/// Static behaviour of one kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsBehaviour {
    pub kind: OpsKind,
    /// Cluster phases the request may start from; empty means any
    pub from_cluster_phases: Vec<ClusterPhase>,
    /// Phase the cluster is patched to once the mutation is applied
    pub to_cluster_phase: Option<ClusterPhase>,
    pub queue_mode: QueueMode,
    /// Whether `spec.cancel` is honoured
    pub cancellable: bool,
}

fn up_running_phases() -> Vec<ClusterPhase> {
    vec![
        ClusterPhase::Running,
        ClusterPhase::Failed,
        ClusterPhase::Abnormal,
    ]
}

impl OpsBehaviour {
    fn for_kind(kind: OpsKind) -> Self {
        let (from_cluster_phases, to_cluster_phase, queue_mode, cancellable) = match kind {
            OpsKind::HorizontalScaling => (
                up_running_phases(),
                Some(ClusterPhase::Updating),
                QueueMode::ByCluster,
                true,
            ),
            OpsKind::Restart | OpsKind::Switchover | OpsKind::Reconfiguring => (
                up_running_phases(),
                Some(ClusterPhase::Updating),
                QueueMode::ByCluster,
                false,
            ),
            OpsKind::VolumeExpansion => (
                Vec::new(),
                Some(ClusterPhase::Updating),
                QueueMode::BySelf,
                false,
            ),
            OpsKind::RebuildInstance => (
                vec![
                    ClusterPhase::Abnormal,
                    ClusterPhase::Failed,
                    ClusterPhase::Updating,
                ],
                Some(ClusterPhase::Updating),
                QueueMode::ByCluster,
                false,
            ),
            // Exposing leaves the cluster phase alone
            OpsKind::Expose => (Vec::new(), None, QueueMode::BySelf, false),
            OpsKind::Custom => (Vec::new(), None, QueueMode::None, false),
        };
        Self {
            kind,
            from_cluster_phases,
            to_cluster_phase,
            queue_mode,
            cancellable,
        }
    }

    pub fn allows_cluster_phase(&self, phase: ClusterPhase) -> bool {
        self.from_cluster_phases.is_empty() || self.from_cluster_phases.contains(&phase)
    }
}

/// Behaviours of every supported kind, keyed by API type
#[derive(Debug, Clone)]
pub struct OpsRegistry {
    behaviours: HashMap<OpsType, OpsBehaviour>,
}

impl Default for OpsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OpsRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            behaviours: HashMap::new(),
        };
        for kind in OpsKind::ALL {
            registry.register(OpsBehaviour::for_kind(kind));
        }
        registry
    }

    /// Register or replace the behaviour of a kind
    pub fn register(&mut self, behaviour: OpsBehaviour) {
        self.behaviours.insert(behaviour.kind.ops_type(), behaviour);
    }

    /// Behaviour for an API type; `None` means the type is not supported
    pub fn get(&self, ops_type: OpsType) -> Option<&OpsBehaviour> {
        self.behaviours.get(&ops_type)
    }

    pub fn len(&self) -> usize {
        self.behaviours.len()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviours.is_empty()
    }
}
