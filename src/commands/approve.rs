//! `approve`: approval gate stage
//!
//! Usage: `approve [--prompt TEXT] [GATE_ID]`
//!
//! Without a gate id the gate is `stage-<index>` of the run's workflow.

use async_trait::async_trait;
use tracing::info;

use super::{ItemStream, PauseRequest, StageContext, StageHandler, StageOutput};
use crate::workflow::{GateRef, GateStatus};
use crate::{Error, Result};

/// Pauses the run until its gate is approved
pub struct ApproveHandler;

struct ApproveArgs {
    gate_id: Option<String>,
    prompt: Option<String>,
}

fn parse_args(ctx: &StageContext) -> Result<ApproveArgs> {
    let mut parsed = ApproveArgs {
        gate_id: None,
        prompt: None,
    };

    let mut args = ctx.args().iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--prompt" => {
                let prompt = args
                    .next()
                    .ok_or_else(|| ctx.error("--prompt needs a value"))?;
                parsed.prompt = Some(prompt.clone());
            }
            flag if flag.starts_with("--") => {
                return Err(ctx.error(format!("unknown flag {}", flag)));
            }
            _ if parsed.gate_id.is_some() => {
                return Err(ctx.error(format!("unexpected argument {}", arg)));
            }
            _ => parsed.gate_id = Some(arg.clone()),
        }
    }

    Ok(parsed)
}

#[async_trait]
impl StageHandler for ApproveHandler {
    async fn execute(&self, ctx: &StageContext, _input: ItemStream) -> Result<StageOutput> {
        let args = parse_args(ctx)?;
        let gate_id = args
            .gate_id
            .unwrap_or_else(|| GateRef::default_id(ctx.stage_index));
        let gate = ctx.gates.get(&ctx.workflow_id, &gate_id)?;

        match gate.as_ref().map(|g| g.status).unwrap_or_default() {
            GateStatus::Approved => Ok(StageOutput::PassThrough),
            GateStatus::Rejected => Err(Error::GateRejected {
                gate: gate_id,
                reason: gate
                    .and_then(|g| g.reason)
                    .unwrap_or_else(|| "no reason given".to_string()),
            }),
            GateStatus::Pending => {
                let gate = ctx.gates.ensure_pending(
                    &ctx.workflow_id,
                    &gate_id,
                    ctx.stage_index,
                    args.prompt.as_deref(),
                )?;
                info!(
                    "Waiting for approval of gate {}/{}",
                    ctx.workflow_id, gate_id
                );
                Ok(StageOutput::Pause(PauseRequest {
                    gate: gate.gate_ref(),
                    prompt: args.prompt.or(gate.prompt),
                }))
            }
        }
    }

    fn usage(&self) -> &str {
        "approve [--prompt TEXT] [GATE_ID]  pause until the gate is approved"
    }
}
