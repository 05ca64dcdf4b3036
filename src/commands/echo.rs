//! Small utility stages: `echo` and `sleep`

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{item_stream, ItemStream, StageContext, StageHandler, StageOutput};
use crate::config::parse_duration;
use crate::Result;

/// `echo [WORDS...]`: one string item, ignoring any input
pub struct EchoHandler;

#[async_trait]
impl StageHandler for EchoHandler {
    async fn execute(&self, ctx: &StageContext, _input: ItemStream) -> Result<StageOutput> {
        let text = ctx.args().join(" ");
        Ok(StageOutput::Items(item_stream(vec![Value::String(text)])))
    }

    fn usage(&self) -> &str {
        "echo [WORDS...]  emit the words as one item"
    }
}

/// `sleep DURATION`: wait, then pass the input through
pub struct SleepHandler;

#[async_trait]
impl StageHandler for SleepHandler {
    async fn execute(&self, ctx: &StageContext, _input: ItemStream) -> Result<StageOutput> {
        let [duration] = ctx.args() else {
            return Err(ctx.error("expected a single duration, e.g. 2s"));
        };
        let duration = parse_duration(duration).map_err(|e| ctx.error(e))?;
        debug!("Sleeping for {:?}", duration);
        tokio::time::sleep(duration).await;
        Ok(StageOutput::PassThrough)
    }

    fn usage(&self) -> &str {
        "sleep DURATION  wait, then pass input through"
    }
}
