//! Report types shared by bootstrap, start and status, plus the volume
//! provisioning and status-report builders.

mod diagnostics;
pub mod provisioning;

pub use diagnostics::status_report;
pub use provisioning::{load_context_files, populate_volume, ContextDoc, ProvisionPlan};

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Error,
    Security,
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// Aggregated report returned by any workflow entry point.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
}

impl WorkflowReport {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, level: WorkflowLevel, message: impl Into<String>) {
        self.events.push(event(level, message));
    }

    pub fn has_warnings(&self) -> bool {
        self.events
            .iter()
            .any(|ev| matches!(ev.level, WorkflowLevel::Warn | WorkflowLevel::Error))
    }
}

/// Convenience constructor that wraps the repeated boilerplate.
pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}
