//! Check evaluator: the collaborator that produces a value
//! for non-log-family keys. The scheduler calls it for every runnable check
//! whose key isn't a `log[]`/`logrt[]`/`eventlog[]` family (those go through
//! [`crate::tailer`] instead).
//!
//! `CheckEvaluator` is a single async entry point the caller is not
//! expected to reimplement, with a concrete default impl provided for the
//! keys this agent resolves itself.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::warn;

use crate::error::CoreResult;

/// Result of evaluating one non-log check.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    /// A value to enqueue as-is.
    Text(String),
    /// The key is not supported; the evaluator supplies the reason but the
    /// NOTSUPPORTED sentinel text itself is the caller's responsibility.
    Message(String),
}

#[async_trait]
pub trait CheckEvaluator: Send + Sync {
    async fn evaluate(&self, key: &str) -> CoreResult<EvalOutcome>;
}

/// Resolves a handful of built-in introspection keys directly; this
/// evaluator only answers what it can compute in-process, and reports
/// anything else not supported.
#[derive(Debug, Default)]
pub struct DefaultEvaluator;

#[async_trait]
impl CheckEvaluator for DefaultEvaluator {
    async fn evaluate(&self, key: &str) -> CoreResult<EvalOutcome> {
        match key {
            "agent.ping" => Ok(EvalOutcome::Text("1".to_string())),
            "agent.version" => Ok(EvalOutcome::Text(env!("CARGO_PKG_VERSION").to_string())),
            "agent.hostname" => match crate::config::Config::global() {
                Ok(cfg) => Ok(EvalOutcome::Text(cfg.hostname)),
                Err(e) => Ok(EvalOutcome::Message(e.to_string())),
            },
            "system.localtime" => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                Ok(EvalOutcome::Text(now.to_string()))
            }
            "system.uptime" => read_uptime_seconds().await,
            other => {
                warn!(key = other, "no evaluator registered for key");
                Ok(EvalOutcome::Message(format!("unsupported item key: {other}")))
            }
        }
    }
}

async fn read_uptime_seconds() -> CoreResult<EvalOutcome> {
    match tokio::fs::read_to_string("/proc/uptime").await {
        Ok(contents) => match contents.split_whitespace().next() {
            Some(secs) => Ok(EvalOutcome::Text(secs.to_string())),
            None => Ok(EvalOutcome::Message("malformed /proc/uptime".to_string())),
        },
        Err(_) => {
            // Non-Linux fallback: ask the shell instead of a syscall.
            match Command::new("uptime").arg("-s").output().await {
                Ok(out) if out.status.success() => {
                    Ok(EvalOutcome::Text(String::from_utf8_lossy(&out.stdout).trim().to_string()))
                }
                _ => Ok(EvalOutcome::Message("uptime not available".to_string())),
            }
        }
    }
}
