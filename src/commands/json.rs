//! `json`: reshape structured items
//!
//! - `json pick FIELD...`: keep only the listed fields of each object
//! - `json keys`: distinct keys of all objects, first seen first
//! - `json values`: every value of every object
//! - `json parse`: turn string items into JSON values
//!
//! String items holding a JSON object or array are parsed before `pick`,
//! `keys` and `values` look at them, so `exec` output can feed straight in.

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::{Map, Value};

use super::{item_stream, ItemStream, StageContext, StageHandler, StageOutput};
use crate::Result;

pub struct JsonHandler;

/// Parse strings that look like JSON containers; leave everything else alone
fn coerce(item: Value) -> Value {
    if let Value::String(s) = &item {
        let trimmed = s.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(parsed) = serde_json::from_str(s) {
                return parsed;
            }
        }
    }
    item
}

/// Flatten array items into their elements
fn records(items: Vec<Value>) -> Vec<Value> {
    items
        .into_iter()
        .map(coerce)
        .flat_map(|item| match item {
            Value::Array(elements) => elements,
            other => vec![other],
        })
        .collect()
}

fn expect_object(ctx: &StageContext, item: Value) -> Result<Map<String, Value>> {
    match item {
        Value::Object(map) => Ok(map),
        other => Err(ctx.error(format!("expected an object, got {}", other))),
    }
}

fn pick(ctx: &StageContext, fields: &[String], items: Vec<Value>) -> Result<Vec<Value>> {
    if fields.is_empty() {
        return Err(ctx.error("pick needs at least one field"));
    }
    records(items)
        .into_iter()
        .map(|item| {
            let mut object = expect_object(ctx, item)?;
            let picked: Map<String, Value> = fields
                .iter()
                .filter_map(|field| object.remove(field).map(|v| (field.clone(), v)))
                .collect();
            Ok(Value::Object(picked))
        })
        .collect()
}

fn keys(ctx: &StageContext, items: Vec<Value>) -> Result<Vec<Value>> {
    let mut seen: Vec<String> = Vec::new();
    for item in records(items) {
        for key in expect_object(ctx, item)?.keys() {
            if !seen.contains(key) {
                seen.push(key.clone());
            }
        }
    }
    Ok(seen.into_iter().map(Value::String).collect())
}

fn values(ctx: &StageContext, items: Vec<Value>) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    for item in records(items) {
        out.extend(expect_object(ctx, item)?.into_iter().map(|(_, v)| v));
    }
    Ok(out)
}

fn parse(ctx: &StageContext, items: Vec<Value>) -> Result<Vec<Value>> {
    items
        .into_iter()
        .map(|item| match item {
            Value::String(s) => serde_json::from_str(&s)
                .map_err(|e| ctx.error(format!("cannot parse {:?}: {}", s, e))),
            other => Ok(other),
        })
        .collect()
}

#[async_trait]
impl StageHandler for JsonHandler {
    async fn execute(&self, ctx: &StageContext, input: ItemStream) -> Result<StageOutput> {
        let (sub, rest) = ctx
            .args()
            .split_first()
            .ok_or_else(|| ctx.error("expected pick, keys, values or parse"))?;
        let items: Vec<Value> = input.try_collect().await?;

        let output = match sub.as_str() {
            "pick" => pick(ctx, rest, items)?,
            "keys" => keys(ctx, items)?,
            "values" => values(ctx, items)?,
            "parse" => parse(ctx, items)?,
            other => return Err(ctx.error(format!("unknown subcommand {}", other))),
        };
        Ok(StageOutput::Items(item_stream(output)))
    }

    fn usage(&self) -> &str {
        "json pick FIELD... | keys | values | parse  reshape structured items"
    }
}
