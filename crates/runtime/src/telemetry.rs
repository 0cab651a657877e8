//! Telemetry sink contract.
//!
//! Subsystems report notable events (goal pivots, tool calls, failures)
//! through a [`TelemetrySink`]. Sinks must never propagate failures back
//! into the calling operation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::Metadata;

/// Category of a telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    Prompt,
    Output,
    Action,
    Pivot,
    Error,
}

impl TelemetryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::Output => "output",
            Self::Action => "action",
            Self::Pivot => "pivot",
            Self::Error => "error",
        }
    }
}

/// Scope used for events not tied to a session.
pub const SYSTEM_SCOPE: &str = "system";

/// Destination for telemetry events.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Record one event. `scope` is a session id or [`SYSTEM_SCOPE`].
    ///
    /// Implementations swallow their own failures; callers never see them.
    async fn track(&self, scope: &str, kind: TelemetryKind, message: &str, metadata: Option<Metadata>);
}

/// Default sink: structured `tracing` events.
#[derive(Debug, Default, Clone)]
pub struct TracingTelemetry;

#[async_trait]
impl TelemetrySink for TracingTelemetry {
    async fn track(
        &self,
        scope: &str,
        kind: TelemetryKind,
        message: &str,
        metadata: Option<Metadata>,
    ) {
        let metadata = metadata
            .map(|m| serde_json::Value::Object(m).to_string())
            .unwrap_or_default();
        match kind {
            TelemetryKind::Error => {
                tracing::warn!(scope, kind = kind.as_str(), metadata, "{message}")
            }
            _ => tracing::info!(scope, kind = kind.as_str(), metadata, "{message}"),
        }
    }
}

/// Sink that drops everything. Useful in tests.
#[derive(Debug, Default, Clone)]
pub struct NullTelemetry;

#[async_trait]
impl TelemetrySink for NullTelemetry {
    async fn track(&self, _: &str, _: TelemetryKind, _: &str, _: Option<Metadata>) {}
}
