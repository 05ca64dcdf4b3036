//! Approval gates
//!
//! A gate is a persisted checkpoint keyed by `(workflow_id, gate_id)`:
//!
//! ```text
//!            approve              reset
//! pending ───────────▶ approved ─────────┐
//!    │                                   │
//!    │ reject              reset         ▼
//!    └──────────────▶ rejected ─────▶ pending
//! ```
//!
//! Approving an approved gate and rejecting a rejected gate are no-ops.
//! Moving directly between the two settled states needs a reset first.
//! Only the gate mutation interface changes status; the pipeline runtime
//! just reads it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::state::{gate_key, gate_namespace, StateManager};
use crate::{Error, Result};

/// Status of a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    /// Waiting for a decision
    #[default]
    Pending,
    /// Approved; runs pass through
    Approved,
    /// Rejected; runs reaching it fail
    Rejected,
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GateStatus::Pending => "pending",
            GateStatus::Approved => "approved",
            GateStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Identity of a gate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GateRef {
    pub workflow_id: String,
    pub gate_id: String,
}

impl GateRef {
    pub fn new(workflow_id: impl Into<String>, gate_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            gate_id: gate_id.into(),
        }
    }

    /// Gate id used when an `approve` stage does not name one
    pub fn default_id(stage_index: usize) -> String {
        format!("stage-{}", stage_index)
    }
}

/// Persisted gate record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalGate {
    pub workflow_id: String,
    pub gate_id: String,
    pub status: GateStatus,
    /// Who approved the gate
    #[serde(default)]
    pub approved_by: Option<String>,
    /// Approval note or rejection reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Stage index of the gate stage that first reached this gate
    #[serde(default)]
    pub stage_index: Option<usize>,
    /// Prompt shown to approvers
    #[serde(default)]
    pub prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the gate was last settled
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalGate {
    /// A fresh pending gate
    pub fn new(workflow_id: &str, gate_id: &str) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.to_string(),
            gate_id: gate_id.to_string(),
            status: GateStatus::Pending,
            approved_by: None,
            reason: None,
            stage_index: None,
            prompt: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        }
    }

    pub fn gate_ref(&self) -> GateRef {
        GateRef::new(&self.workflow_id, &self.gate_id)
    }

    /// Settle as approved; returns whether the record changed
    pub fn approve(&mut self, approved_by: &str, reason: Option<String>) -> Result<bool> {
        match self.status {
            GateStatus::Approved => Ok(false),
            GateStatus::Rejected => Err(Error::GateTransition(format!(
                "gate '{}' is rejected; reset it before approving",
                self.gate_id
            ))),
            GateStatus::Pending => {
                let now = Utc::now();
                self.status = GateStatus::Approved;
                self.approved_by = Some(approved_by.to_string());
                self.reason = reason;
                self.updated_at = now;
                self.resolved_at = Some(now);
                Ok(true)
            }
        }
    }

    /// Settle as rejected; returns whether the record changed
    pub fn reject(&mut self, reason: Option<String>) -> Result<bool> {
        match self.status {
            GateStatus::Rejected => Ok(false),
            GateStatus::Approved => Err(Error::GateTransition(format!(
                "gate '{}' is approved; reset it before rejecting",
                self.gate_id
            ))),
            GateStatus::Pending => {
                let now = Utc::now();
                self.status = GateStatus::Rejected;
                self.approved_by = None;
                self.reason = reason;
                self.updated_at = now;
                self.resolved_at = Some(now);
                Ok(true)
            }
        }
    }

    /// Return to pending from any state
    pub fn reset(&mut self) {
        self.status = GateStatus::Pending;
        self.approved_by = None;
        self.reason = None;
        self.resolved_at = None;
        self.updated_at = Utc::now();
    }
}

/// Gate mutation interface over the state manager
#[derive(Clone)]
pub struct GateStore {
    state: StateManager,
}

impl GateStore {
    pub fn new(state: StateManager) -> Self {
        Self { state }
    }

    /// Load a gate record if it exists
    pub fn get(&self, workflow_id: &str, gate_id: &str) -> Result<Option<ApprovalGate>> {
        self.state.try_load(&gate_key(workflow_id, gate_id)?)
    }

    /// Current status; a gate never reached is pending
    pub fn status(&self, workflow_id: &str, gate_id: &str) -> Result<GateStatus> {
        Ok(self
            .get(workflow_id, gate_id)?
            .map(|g| g.status)
            .unwrap_or_default())
    }

    /// Approve a gate, creating it if it was never reached
    pub fn approve(
        &self,
        workflow_id: &str,
        gate_id: &str,
        approved_by: &str,
        reason: Option<String>,
    ) -> Result<ApprovalGate> {
        let mut gate = self.get_or_new(workflow_id, gate_id)?;
        if gate.approve(approved_by, reason)? {
            self.save(&gate)?;
            info!("Gate {}/{} approved by {}", workflow_id, gate_id, approved_by);
        }
        Ok(gate)
    }

    /// Reject a gate, creating it if it was never reached
    pub fn reject(
        &self,
        workflow_id: &str,
        gate_id: &str,
        reason: Option<String>,
    ) -> Result<ApprovalGate> {
        let mut gate = self.get_or_new(workflow_id, gate_id)?;
        if gate.reject(reason)? {
            self.save(&gate)?;
            info!(
                "Gate {}/{} rejected: {}",
                workflow_id,
                gate_id,
                gate.reason.as_deref().unwrap_or("no reason given")
            );
        }
        Ok(gate)
    }

    /// Return a gate to pending
    pub fn reset(&self, workflow_id: &str, gate_id: &str) -> Result<ApprovalGate> {
        let mut gate = self.get_or_new(workflow_id, gate_id)?;
        gate.reset();
        self.save(&gate)?;
        info!("Gate {}/{} reset to pending", workflow_id, gate_id);
        Ok(gate)
    }

    /// Delete a gate record; returns whether it existed
    pub fn remove(&self, workflow_id: &str, gate_id: &str) -> Result<bool> {
        self.state.reset(&gate_key(workflow_id, gate_id)?)
    }

    /// Create the pending record the first time a gate stage is reached
    ///
    /// An existing record is returned untouched.
    pub fn ensure_pending(
        &self,
        workflow_id: &str,
        gate_id: &str,
        stage_index: usize,
        prompt: Option<&str>,
    ) -> Result<ApprovalGate> {
        if let Some(gate) = self.get(workflow_id, gate_id)? {
            return Ok(gate);
        }

        let mut gate = ApprovalGate::new(workflow_id, gate_id);
        gate.stage_index = Some(stage_index);
        gate.prompt = prompt.map(str::to_string);
        self.save(&gate)?;
        Ok(gate)
    }

    /// All gates of a workflow
    pub fn list(&self, workflow_id: &str) -> Result<Vec<ApprovalGate>> {
        let mut gates = Vec::new();
        for key in self.state.keys(&gate_namespace(workflow_id)?)? {
            if let Some(gate) = self.state.try_load::<ApprovalGate>(&key)? {
                gates.push(gate);
            }
        }
        Ok(gates)
    }

    fn get_or_new(&self, workflow_id: &str, gate_id: &str) -> Result<ApprovalGate> {
        Ok(self
            .get(workflow_id, gate_id)?
            .unwrap_or_else(|| ApprovalGate::new(workflow_id, gate_id)))
    }

    fn save(&self, gate: &ApprovalGate) -> Result<()> {
        self.state
            .save(&gate_key(&gate.workflow_id, &gate.gate_id)?, gate)
    }
}
