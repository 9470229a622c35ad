//! Per-run tool health registry
//!
//! Each tool is probed at most once per run, the first time a unit needs it.
//! Concurrent units of the same tool wait on the same probe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::{info, warn};

use veritas_core::ToolHealth;

use crate::tool_models::AnalysisTool;

/// Health registry
pub struct HealthRegistry {
    probe_timeout_ms: u64,
    cells: Mutex<HashMap<String, Arc<OnceCell<ToolHealth>>>>,
}

impl HealthRegistry {
    pub fn new(probe_timeout_ms: u64) -> Self {
        Self {
            probe_timeout_ms,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Probe result for `tool`, probing on first use
    pub async fn check(&self, tool: &dyn AnalysisTool) -> ToolHealth {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(cells.entry(tool.name().to_string()).or_default())
        };

        cell.get_or_init(|| async {
            let health = tool.probe(self.probe_timeout_ms).await;
            if health.status.is_healthy() {
                info!("Tool {} is healthy: {}", tool.name(), health.detail);
            } else {
                warn!(
                    "Tool {} failed its health probe ({:?}): {}",
                    tool.name(),
                    health.status,
                    health.detail
                );
            }
            health
        })
        .await
        .clone()
    }

    /// Every probe completed so far, ordered by tool name
    pub fn report(&self) -> Vec<ToolHealth> {
        let cells = self.cells.lock().unwrap_or_else(|p| p.into_inner());
        let mut report: Vec<ToolHealth> = cells.values().filter_map(|c| c.get().cloned()).collect();
        report.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
        report
    }
}
