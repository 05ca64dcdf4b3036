//! Pipeline parsing, resume tokens and the runtime that drives stages
//!
//! ```text
//! run("a | approve | b")
//!   │
//!   ├─ stage 0: a ─────────▶ carried = a's items
//!   ├─ stage 1: approve
//!   │     pending  ─▶ Paused { token(pipeline, 1, carried) }
//!   │     approved ─▶ carried unchanged
//!   │     rejected ─▶ Error { kind: gate_rejected }
//!   └─ stage 2: b ─────────▶ Complete { output: b's items }
//!
//! resume(token) re-enters the loop at the gate stage, so the gate is
//! checked again rather than skipped.
//! ```

pub mod parser;
pub mod runtime;
pub mod token;

pub use parser::{parse, PipelineDefinition, StageDescriptor};
pub use runtime::{Outcome, Runtime};
pub use token::ResumeToken;
