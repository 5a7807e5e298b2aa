use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::task::{TaskId, TaskStatus};

/// The closed error taxonomy surfaced to callers. The HTTP collaborator maps
/// each variant to a transport code; `External` never propagates verbatim to
/// end users.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("dependencies unresolved: {}", format_dependencies(.0))]
    DependenciesUnresolved(Vec<DependencyState>),

    #[error("budget exceeded ({}): spent {spent} of {limit}", .scope.as_str())]
    BudgetExceeded {
        scope: BudgetScope,
        spent: Decimal,
        limit: Decimal,
    },

    #[error("validation: {0}")]
    Validation(String),

    #[error("concurrency: {0}")]
    Concurrency(String),

    #[error("external: {0}")]
    External(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl ConductorError {
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        ConductorError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Transient errors the API layer may retry once before surfacing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConductorError::Concurrency(_))
    }
}

/// One offending dependency: its status, or `None` when the id does not
/// exist at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyState {
    pub task_id: TaskId,
    pub status: Option<TaskStatus>,
}

fn format_dependencies(deps: &[DependencyState]) -> String {
    deps.iter()
        .map(|dep| match dep.status {
            Some(status) => format!("task {} ({status})", dep.task_id),
            None => format!("task {} (missing)", dep.task_id),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    TeamDaily,
    PerTask,
}

impl BudgetScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetScope::TeamDaily => "team_daily",
            BudgetScope::PerTask => "per_task",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_error_lists_every_offender() {
        let err = ConductorError::DependenciesUnresolved(vec![
            DependencyState {
                task_id: 3,
                status: Some(TaskStatus::Todo),
            },
            DependencyState {
                task_id: 9,
                status: None,
            },
        ]);
        let rendered = err.to_string();
        assert!(rendered.contains("task 3 (todo)"));
        assert!(rendered.contains("task 9 (missing)"));
    }

    #[test]
    fn budget_error_names_the_cap() {
        let err = ConductorError::BudgetExceeded {
            scope: BudgetScope::TeamDaily,
            spent: Decimal::new(1_000_000, 6),
            limit: Decimal::new(1_000_000, 6),
        };
        assert!(err.to_string().contains("team_daily"));
        assert!(err.to_string().contains("1.000000"));
    }

    #[test]
    fn only_concurrency_is_retryable() {
        assert!(ConductorError::Concurrency("turn in flight".into()).is_retryable());
        assert!(!ConductorError::Conflict("done is terminal".into()).is_retryable());
    }
}
