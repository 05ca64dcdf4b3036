//! Pipeline runtime
//!
//! Drives a parsed pipeline stage by stage. Each stage's items are fully
//! collected before the next stage starts, so a failure is always attributed
//! to the stage that raised it. The run record in the state store mirrors
//! every pause and terminal state; resuming always goes through a token.

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::parser::{PipelineDefinition, StageDescriptor};
use super::token::ResumeToken;
use crate::commands::{
    item_stream, CommandRegistry, ExecHandler, PauseRequest, StageContext, StageOutput,
};
use crate::config::Config;
use crate::workflow::{validate_id, GateRef, GateStore, RunRecord, RunStatus, StateManager};
use crate::{Error, Result};

/// Result of `run` or `resume`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    /// Every stage ran; `output` is the last stage's items
    Complete { output: Option<Vec<Value>> },
    /// Stopped at an unapproved gate
    Paused {
        /// Items produced before the gate
        output: Option<Vec<Value>>,
        token: String,
        gate: GateRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
    /// The run failed and cannot be resumed
    Error {
        error: String,
        /// Stable tag from [`Error::kind`]
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage_index: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
}

impl Outcome {
    /// Error outcome, attributed to a stage when one was running
    pub fn failure(error: &Error, stage: Option<(usize, &str)>) -> Self {
        let message = match stage {
            Some((index, command)) => format!("stage {} ({}): {}", index, command, error),
            None => error.to_string(),
        };
        Outcome::Error {
            error: message,
            kind: error.kind().to_string(),
            stage_index: stage.map(|(index, _)| index),
            command: stage.map(|(_, command)| command.to_string()),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Outcome::Complete { .. } => "complete",
            Outcome::Paused { .. } => "paused",
            Outcome::Error { .. } => "error",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Outcome::Complete { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Outcome::Paused { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error { .. })
    }

    /// Output items (complete and paused outcomes)
    pub fn output(&self) -> Option<&[Value]> {
        match self {
            Outcome::Complete { output } | Outcome::Paused { output, .. } => output.as_deref(),
            Outcome::Error { .. } => None,
        }
    }

    /// Resume token (paused outcomes only)
    pub fn token(&self) -> Option<&str> {
        match self {
            Outcome::Paused { token, .. } => Some(token),
            _ => None,
        }
    }
}

/// Runs pipelines against a command registry and a state store
pub struct Runtime {
    registry: CommandRegistry,
    state: StateManager,
    gates: GateStore,
    /// Workflow used by fresh runs
    workflow_id: String,
}

impl Runtime {
    pub fn new(registry: CommandRegistry, state: StateManager, workflow_id: impl Into<String>) -> Self {
        let gates = GateStore::new(state.clone());
        Self {
            registry,
            state,
            gates,
            workflow_id: workflow_id.into(),
        }
    }

    /// Built-in commands over file-backed state, as configured
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = CommandRegistry::with_builtins();
        registry.register(
            "exec",
            ExecHandler::new(&config.exec.shell, config.exec.timeout()?),
        );
        let state = StateManager::file(config.state_dir()?);
        Ok(Self::new(registry, state, &config.workflow_id))
    }

    /// Built-in commands over volatile state
    pub fn in_memory(workflow_id: impl Into<String>) -> Self {
        Self::new(
            CommandRegistry::with_builtins(),
            StateManager::in_memory(),
            workflow_id,
        )
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Register custom commands before running
    pub fn registry_mut(&mut self) -> &mut CommandRegistry {
        &mut self.registry
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn gates(&self) -> &GateStore {
        &self.gates
    }

    /// Run a pipeline from its first stage
    pub async fn run(&self, pipeline: &str) -> Outcome {
        if let Err(e) = validate_id("workflow id", &self.workflow_id) {
            return Outcome::failure(&e, None);
        }
        let definition = match PipelineDefinition::parse(pipeline) {
            Ok(definition) => definition,
            Err(e) => return Outcome::failure(&e, None),
        };

        let record = RunRecord::new(&self.workflow_id, definition.source());
        info!(
            "Starting run {} ({} stages) in workflow {}",
            record.id,
            definition.len(),
            self.workflow_id
        );
        self.drive(&definition, record).await
    }

    /// Continue a paused run from its token
    pub async fn resume(&self, token: &str) -> Outcome {
        match self.prepare_resume(token) {
            Ok((definition, record)) => {
                info!(
                    "Resuming run {} at stage {} in workflow {}",
                    record.id, record.stage_index, record.workflow_id
                );
                self.drive(&definition, record).await
            }
            Err(e) => Outcome::failure(&e, None),
        }
    }

    /// Resume the paused run stored for a workflow
    pub async fn resume_workflow(&self, workflow_id: &str) -> Outcome {
        let token = self.state.load_run(workflow_id).and_then(|record| {
            match (record.status, record.token) {
                (RunStatus::Paused, Some(token)) => Ok(token),
                (status, _) => Err(Error::NotFound(format!(
                    "paused run in workflow '{}' (last run is {:?})",
                    workflow_id, status
                ))),
            }
        });

        match token {
            Ok(token) => self.resume(&token).await,
            Err(e) => Outcome::failure(&e, None),
        }
    }

    fn prepare_resume(&self, token: &str) -> Result<(PipelineDefinition, RunRecord)> {
        let decoded = ResumeToken::decode(token)?;
        let workflow_id = decoded
            .workflow_id
            .clone()
            .unwrap_or_else(|| self.workflow_id.clone());
        validate_id("workflow id", &workflow_id)?;

        let definition = PipelineDefinition::parse(&decoded.pipeline)
            .map_err(|e| Error::InvalidToken(format!("pipeline does not parse: {}", e)))?;
        if decoded.stage_index >= definition.len() {
            return Err(Error::InvalidToken(format!(
                "stage {} is out of range for a {}-stage pipeline",
                decoded.stage_index,
                definition.len()
            )));
        }

        // Keep the run's identity when the stored record is the one that paused
        let mut record = match self.state.load_run(&workflow_id) {
            Ok(record) if record.token.as_deref() == Some(token.trim()) => record,
            _ => RunRecord::new(&workflow_id, &decoded.pipeline),
        };
        record.status = RunStatus::Running;
        record.token = None;
        record.gate = None;
        record.stage_index = decoded.stage_index;
        record.carried = decoded.carried;
        Ok((definition, record))
    }

    async fn drive(&self, definition: &PipelineDefinition, mut record: RunRecord) -> Outcome {
        let count = definition.len();
        self.mirror(&record);

        for (index, stage) in definition.stages().iter().enumerate().skip(record.stage_index) {
            record.stage_index = index;
            debug!("Stage {}/{}: {}", index + 1, count, stage);

            let handler = match self.registry.lookup(&stage.command) {
                Ok(handler) => handler,
                Err(e) => return self.fail(record, stage, e),
            };
            let ctx = StageContext {
                workflow_id: record.workflow_id.clone(),
                stage_index: index,
                stage_count: count,
                stage: stage.clone(),
                has_input: record.carried.is_some(),
                gates: self.gates.clone(),
            };
            let input = item_stream(record.carried.clone().unwrap_or_default());

            let output = match handler.execute(&ctx, input).await {
                Ok(output) => output,
                Err(e) => return self.fail(record, stage, e),
            };
            match output {
                StageOutput::Items(items) => match items.try_collect::<Vec<Value>>().await {
                    Ok(items) => record.carried = Some(items),
                    Err(e) => return self.fail(record, stage, e),
                },
                StageOutput::PassThrough => {}
                StageOutput::Pause(pause) => return self.pause(definition, record, pause),
            }
        }

        record.stage_index = count;
        record.complete();
        self.mirror(&record);
        info!("Run {} completed", record.id);
        Outcome::Complete {
            output: record.carried,
        }
    }

    fn pause(
        &self,
        definition: &PipelineDefinition,
        mut record: RunRecord,
        pause: PauseRequest,
    ) -> Outcome {
        let index = record.stage_index;
        let token = ResumeToken::new(definition.source(), index, record.carried.clone())
            .with_workflow(&record.workflow_id)
            .encode();
        let token = match token {
            Ok(token) => token,
            Err(e) => {
                let stage = &definition.stages()[index];
                return self.fail(record, stage, e);
            }
        };

        record.pause(index, token.clone(), pause.gate.clone());
        self.mirror(&record);
        info!(
            "Run {} paused at stage {} waiting for gate {}",
            record.id, index, pause.gate.gate_id
        );

        Outcome::Paused {
            output: record.carried,
            token,
            gate: pause.gate,
            prompt: pause.prompt,
        }
    }

    fn fail(&self, mut record: RunRecord, stage: &StageDescriptor, error: Error) -> Outcome {
        let index = record.stage_index;
        let outcome = Outcome::failure(&error, Some((index, stage.command.as_str())));
        if let Outcome::Error { error: message, .. } = &outcome {
            warn!("Run {} failed: {}", record.id, message);
            record.fail(Some(index), message);
        }
        self.mirror(&record);
        outcome
    }

    /// Best-effort write of the run record
    fn mirror(&self, record: &RunRecord) {
        if let Err(e) = self.state.save_run(record) {
            warn!("Failed to save run {}: {}", record.id, e);
        }
    }
}
