//! Stage commands
//!
//! Every pipeline stage names a command. A command is a [`StageHandler`]
//! registered by name in a [`CommandRegistry`]. Built-ins:
//!
//! - `exec`: run a program, one item per stdout line
//! - `approve`: approval gate; pauses the run until approved
//! - `json`: `pick`, `keys`, `values`, `parse` over structured items
//! - `table`: render items as an aligned text table
//! - `echo`, `sleep`, `http`: small utilities
//!
//! Items flow between stages as a pull-based stream. A handler may read its
//! input partially and stop; the stream is not restartable.

mod approve;
mod echo;
mod exec;
mod http;
mod json;
mod table;

pub use approve::ApproveHandler;
pub use echo::{EchoHandler, SleepHandler};
pub use exec::{render_line, ExecHandler};
pub use http::HttpHandler;
pub use json::JsonHandler;
pub use table::{render_table, TableHandler};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::pipeline::StageDescriptor;
use crate::workflow::{GateRef, GateStore};
use crate::{Error, Result};

/// Items flowing from one stage to the next
pub type ItemStream = BoxStream<'static, Result<Value>>;

/// Stream over already materialized items
pub fn item_stream(items: Vec<Value>) -> ItemStream {
    stream::iter(items.into_iter().map(Ok)).boxed()
}

/// What a stage hands back to the runtime
pub enum StageOutput {
    /// New items for the next stage
    Items(ItemStream),
    /// Keep the previous stage's output as-is
    PassThrough,
    /// Stop the run here until the gate is approved
    Pause(PauseRequest),
}

impl std::fmt::Debug for StageOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageOutput::Items(_) => f.write_str("Items(..)"),
            StageOutput::PassThrough => f.write_str("PassThrough"),
            StageOutput::Pause(p) => f.debug_tuple("Pause").field(p).finish(),
        }
    }
}

/// Pause signal raised by a gate stage
#[derive(Debug, Clone, PartialEq)]
pub struct PauseRequest {
    pub gate: GateRef,
    pub prompt: Option<String>,
}

/// Everything a handler knows about the stage it is running
#[derive(Clone)]
pub struct StageContext {
    pub workflow_id: String,
    pub stage_index: usize,
    pub stage_count: usize,
    pub stage: StageDescriptor,
    /// False until some stage has produced items
    pub has_input: bool,
    pub gates: GateStore,
}

impl StageContext {
    pub fn command(&self) -> &str {
        &self.stage.command
    }

    pub fn args(&self) -> &[String] {
        &self.stage.args
    }

    /// Failure attributed to this stage's command
    pub fn error(&self, message: impl std::fmt::Display) -> Error {
        Error::HandlerExecution(format!("{}: {}", self.stage.command, message))
    }
}

/// A command that can run as a pipeline stage
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Run the stage against the previous stage's items
    async fn execute(&self, ctx: &StageContext, input: ItemStream) -> Result<StageOutput>;

    /// One-line usage shown by `lobster commands`
    fn usage(&self) -> &str;
}

/// Command name to handler mapping
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn StageHandler>>,
}

impl CommandRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all built-in commands
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("exec", ExecHandler::default());
        registry.register("approve", ApproveHandler);
        registry.register("json", JsonHandler);
        registry.register("table", TableHandler);
        registry.register("echo", EchoHandler);
        registry.register("sleep", SleepHandler);
        registry.register("http", HttpHandler::default());
        registry
    }

    /// Register a handler; replaces any existing handler of the same name
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl StageHandler + 'static,
    ) -> Option<Arc<dyn StageHandler>> {
        self.register_arc(name, Arc::new(handler))
    }

    /// Register a shared handler; replaces any existing handler of the same name
    pub fn register_arc(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn StageHandler>,
    ) -> Option<Arc<dyn StageHandler>> {
        self.handlers.insert(name.into(), handler)
    }

    /// Find the handler for a command name (case-sensitive)
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn StageHandler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownCommand(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names and usage lines, sorted by name
    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<_> = self
            .handlers
            .iter()
            .map(|(name, handler)| (name.as_str(), handler.usage()))
            .collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }
}
