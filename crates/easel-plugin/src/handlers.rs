//! Built-in commands.
//!
//! Supported commands:
//! - `ping` - Health check, returns `{pong: true}`.
//! - `echo` - Returns its params unchanged.
//! - `delay` - Sleeps for `ms` milliseconds.
//! - `fail` - Fails with the given `message`.
//! - `scan_items` - Walks a list in chunks, reporting progress per chunk.
//! - `get_channel_info` - Channel token and registered command names.

use crate::dispatch::{handler_fn, HandlerContext, RegistryBuilder};
use crate::error::RegistryError;
use anyhow::{anyhow, bail};
use easel_core::{ChunkInfo, ProgressTracker};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Add the built-in commands to `builder`.
pub fn register_builtin(builder: RegistryBuilder) -> Result<RegistryBuilder, RegistryError> {
    builder
        .register("ping", handler_fn(ping))?
        .register("echo", handler_fn(echo))?
        .register("delay", handler_fn(delay))?
        .register("fail", handler_fn(fail))?
        .register("scan_items", handler_fn(scan_items))?
        .register("get_channel_info", handler_fn(get_channel_info))
}

fn parse<T: DeserializeOwned>(command: &str, params: Value) -> anyhow::Result<T> {
    // Commands without params may receive null; treat it as an empty object.
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| anyhow!("invalid params for {command}: {e}"))
}

async fn ping(_ctx: HandlerContext, _params: Value) -> anyhow::Result<Value> {
    Ok(json!({"pong": true}))
}

async fn echo(_ctx: HandlerContext, params: Value) -> anyhow::Result<Value> {
    Ok(params)
}

#[derive(Debug, Deserialize)]
struct DelayParams {
    ms: u64,
}

async fn delay(ctx: HandlerContext, params: Value) -> anyhow::Result<Value> {
    let p: DelayParams = parse(&ctx.command, params)?;
    tokio::time::sleep(Duration::from_millis(p.ms)).await;
    Ok(json!({"sleptMs": p.ms}))
}

#[derive(Debug, Deserialize)]
struct FailParams {
    #[serde(default)]
    message: Option<String>,
}

async fn fail(ctx: HandlerContext, params: Value) -> anyhow::Result<Value> {
    let p: FailParams = parse(&ctx.command, params)?;
    bail!(p.message.unwrap_or_else(|| "Command failed".to_string()))
}

fn default_chunk_size() -> usize {
    10
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanParams {
    items: Vec<Value>,
    #[serde(default = "default_chunk_size")]
    chunk_size: usize,
    #[serde(default)]
    delay_ms: u64,
}

async fn scan_items(ctx: HandlerContext, params: Value) -> anyhow::Result<Value> {
    let p: ScanParams = parse(&ctx.command, params)?;
    if p.chunk_size == 0 {
        bail!("chunkSize must be greater than zero");
    }

    let total = p.items.len();
    let chunks = total.div_ceil(p.chunk_size);
    let tracker = ProgressTracker::new(&ctx.command_id, &ctx.command, total as u64);
    ctx.report(tracker.started(format!("Scanning {total} items in {chunks} chunks")));

    let mut processed = 0usize;
    for (index, chunk) in p.items.chunks(p.chunk_size).enumerate() {
        if index > 0 && p.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(p.delay_ms)).await;
        }
        processed += chunk.len();
        let info = ChunkInfo {
            current_chunk: (index + 1) as u32,
            total_chunks: chunks as u32,
            chunk_size: p.chunk_size as u32,
        };
        ctx.report(tracker.chunk(
            processed as u64,
            info,
            format!("Processed chunk {}/{chunks}", index + 1),
        ));
    }

    ctx.report(tracker.completed(format!("Scanned {processed} items")));
    Ok(json!({"processed": processed, "chunks": chunks}))
}

async fn get_channel_info(ctx: HandlerContext, _params: Value) -> anyhow::Result<Value> {
    Ok(json!({
        "channel": ctx.channel,
        "commands": ctx.commands.as_ref(),
    }))
}
