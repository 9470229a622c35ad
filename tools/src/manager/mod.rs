//! Tools Manager Module
//!
//! Holds the configured analysis tools for the lifetime of the process.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::info;

use veritas_core::{ToolHealth, ToolSpec, VeritasConfig};

use crate::tool_models::{AnalysisTool, CommandTool};

pub mod executors;

/// Registered tools, in configuration order
#[derive(Clone, Default)]
pub struct ToolManager {
    tools: Vec<Arc<dyn AnalysisTool>>,
    by_name: HashMap<String, usize>,
}

impl ToolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`CommandTool`] per configured tool spec
    pub fn from_config(config: &VeritasConfig) -> Self {
        let mut manager = Self::new();
        for spec in &config.tools {
            manager.register_spec(spec.clone());
        }
        info!("Registered {} analysis tool(s)", manager.tools.len());
        manager
    }

    pub fn register_spec(&mut self, spec: ToolSpec) {
        self.register(Arc::new(CommandTool::new(spec)));
    }

    /// Register a tool; a tool with the same name replaces the earlier one
    pub fn register(&mut self, tool: Arc<dyn AnalysisTool>) {
        let name = tool.name().to_string();
        match self.by_name.get(&name) {
            Some(&index) => self.tools[index] = tool,
            None => {
                self.by_name.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AnalysisTool>> {
        self.by_name.get(name).map(|&i| Arc::clone(&self.tools[i]))
    }

    pub fn tools(&self) -> &[Arc<dyn AnalysisTool>] {
        &self.tools
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Probe every tool concurrently, ordered by tool name
    pub async fn probe_all(&self, timeout_ms: u64) -> Vec<ToolHealth> {
        let mut report = join_all(self.tools.iter().map(|t| t.probe(timeout_ms))).await;
        report.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veritas_core::{HealthStatus, UnitKind};

    #[test]
    fn test_from_config_keeps_order_and_replaces_duplicates() {
        let mut manager = ToolManager::new();
        manager.register_spec(ToolSpec::new("b", UnitKind::StaticScan, "true", &[]));
        manager.register_spec(ToolSpec::new("a", UnitKind::Trace, "true", &[]));
        manager.register_spec(ToolSpec::new("b", UnitKind::Trace, "false", &[]));

        let names: Vec<&str> = manager.tools().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(manager.get("b").unwrap().kind(), UnitKind::Trace);
        assert!(manager.get("c").is_none());
    }

    #[tokio::test]
    async fn test_probe_all_reports_each_tool() {
        let mut ok = ToolSpec::new("ok", UnitKind::StaticScan, "sh", &[]);
        ok.probe_args = vec!["-c".to_string(), "echo 1.0".to_string()];
        let missing = ToolSpec::new("missing", UnitKind::StaticScan, "veritas-nope", &[]);

        let mut manager = ToolManager::new();
        manager.register_spec(ok);
        manager.register_spec(missing);

        let report = manager.probe_all(5_000).await;
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].tool_name, "missing");
        assert_eq!(report[0].status, HealthStatus::NotInstalled);
        assert_eq!(report[1].status, HealthStatus::Healthy);
    }
}
