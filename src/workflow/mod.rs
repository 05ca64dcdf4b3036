//! Workflow state and approval gates
//!
//! - **Gates**: persisted approval checkpoints (pending/approved/rejected)
//! - **State**: string-keyed store for run records and gate records, with
//!   file and in-memory backends
//!
//! ## Layout on disk
//!
//! ```text
//! .lobster/
//! ├── runs/
//! │   └── <workflow_id>.json
//! └── gates/
//!     └── <workflow_id>/
//!         └── <gate_id>.json
//! ```

pub mod gate;
pub mod state;

pub use gate::{ApprovalGate, GateRef, GateStatus, GateStore};
pub use state::{
    gate_key, run_key, validate_id, FileBackend, MemoryBackend, RunRecord, RunStatus,
    StateBackend, StateManager,
};
