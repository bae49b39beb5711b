//! Planner
//!
//! Consults operators in priority order and returns the first plan. Pure
//! and deterministic: the same inputs always yield the same plan.

use crate::operators::{Operator, Plan, default_operators};
use cluster_model::{Cluster, ClusterStatus, Resources};
use tracing::debug;

/// A plan together with the operator that produced it
#[derive(Debug, Clone)]
pub struct Decision {
    pub operator: &'static str,
    pub plan: Plan,
}

/// Priority-ordered operator registry
pub struct Planner {
    operators: Vec<Box<dyn Operator>>,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.operators.iter().map(|o| o.name()).collect();
        f.debug_struct("Planner").field("operators", &names).finish()
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(default_operators())
    }
}

impl Planner {
    /// Sorts operators by priority; ties keep their given order
    pub fn new(mut operators: Vec<Box<dyn Operator>>) -> Self {
        operators.sort_by_key(|o| o.priority());
        Self { operators }
    }

    /// Operator names in the order they are consulted
    pub fn operator_names(&self) -> Vec<&'static str> {
        self.operators.iter().map(|o| o.name()).collect()
    }

    /// First plan of the highest-priority operator that does not decline
    pub fn plan(&self, cluster: &Cluster, status: &ClusterStatus, resources: &Resources) -> Option<Decision> {
        for operator in &self.operators {
            if let Some(plan) = operator.next_commands(cluster, status, resources) {
                debug!("Operator {} planned {}", operator.name(), plan.name);
                return Some(Decision {
                    operator: operator.name(),
                    plan,
                });
            }
        }
        None
    }
}
