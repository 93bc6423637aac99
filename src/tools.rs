//! Tool Dispatcher (C4): resolves an action to a registered tool, enforces
//! path/root policy, invokes it under a timeout, and normalizes the result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::action::{Action, ActionArgs};
use crate::event::{EventBus, EventType, Priority};

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathScope {
    Project,
    Workspace,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteRoot {
    Project,
    Workspace,
}

impl WriteRoot {
    /// `WRITE_ROOT` env override, defaulting to `project` (§4.4.4).
    pub fn from_env() -> Self {
        match std::env::var("WRITE_ROOT").ok().as_deref() {
            Some("workspace") => WriteRoot::Workspace,
            _ => WriteRoot::Project,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ok,
    Error,
    Refused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub action: String,
    pub status: ToolStatus,
    pub result: String,
    pub metadata: serde_json::Value,
}

impl ToolResult {
    pub fn ok(action: &str, result: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            status: ToolStatus::Ok,
            result: result.into(),
            metadata: serde_json::json!({}),
        }
    }

    pub fn error(action: &str, result: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            status: ToolStatus::Error,
            result: result.into(),
            metadata: serde_json::json!({}),
        }
    }

    pub fn timed_out(action: &str) -> Self {
        Self {
            action: action.to_string(),
            status: ToolStatus::Error,
            result: "tool call timed out".to_string(),
            metadata: serde_json::json!({ "timeout": true }),
        }
    }

    pub fn refused(action: &str, reason: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            status: ToolStatus::Refused,
            result: reason.into(),
            metadata: serde_json::json!({}),
        }
    }
}

/// A single tool's execution boundary. Implementors are expected never to
/// panic on expected failure paths — return `ToolResult::error` instead.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn path_scope(&self) -> PathScope {
        PathScope::Any
    }
    fn requires_write(&self) -> bool {
        false
    }
    fn requires_network(&self) -> bool {
        false
    }
    fn timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }

    async fn invoke(&self, args: &ActionArgs, roots: &RootPolicy) -> ToolResult;
}

/// Allowed filesystem roots a path-scoped tool may write/read under.
#[derive(Debug, Clone)]
pub struct RootPolicy {
    pub project_root: PathBuf,
    pub workspace_root: PathBuf,
    pub additional_roots: Vec<PathBuf>,
    pub active_write_root: WriteRoot,
}

impl RootPolicy {
    pub fn new(project_root: PathBuf, workspace_root: PathBuf) -> Self {
        Self {
            project_root,
            workspace_root,
            additional_roots: Vec::new(),
            active_write_root: WriteRoot::from_env(),
        }
    }

    pub fn active_root(&self) -> &Path {
        match self.active_write_root {
            WriteRoot::Project => &self.project_root,
            WriteRoot::Workspace => &self.workspace_root,
        }
    }

    /// Resolves `path` (symlinks included) and checks it falls under one of
    /// the roots permitted by `scope`. A nonexistent path is checked against
    /// its nearest existing ancestor.
    pub fn check(&self, path: &Path, scope: PathScope) -> Result<PathBuf, String> {
        if scope == PathScope::Any {
            return canonicalize_best_effort(path);
        }

        let resolved = canonicalize_best_effort(path)?;
        let allowed: Vec<&Path> = match scope {
            PathScope::Project => vec![self.project_root.as_path()],
            PathScope::Workspace => vec![self.workspace_root.as_path()],
            PathScope::Any => unreachable!(),
        }
        .into_iter()
        .chain(self.additional_roots.iter().map(|p| p.as_path()))
        .collect();

        if allowed.iter().any(|root| resolved.starts_with(root)) {
            Ok(resolved)
        } else {
            Err(format!(
                "path '{}' is outside the allowed {:?} scope",
                path.display(),
                scope
            ))
        }
    }
}

fn canonicalize_best_effort(path: &Path) -> Result<PathBuf, String> {
    if let Ok(canon) = path.canonicalize() {
        return Ok(canon);
    }
    let mut current = path.to_path_buf();
    let mut trailer = Vec::new();
    loop {
        if let Ok(canon) = current.canonicalize() {
            let mut result = canon;
            for part in trailer.into_iter().rev() {
                result.push(part);
            }
            return Ok(result);
        }
        match (current.file_name().map(|n| n.to_owned()), current.parent()) {
            (Some(name), Some(parent)) => {
                trailer.push(name);
                current = parent.to_path_buf();
            }
            _ => return Ok(path.to_path_buf()),
        }
    }
}

/// Registry of tools keyed by action name (C4). Stateless aside from the
/// registry itself; concurrent dispatches are allowed.
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn ToolHandler>>,
    roots: RootPolicy,
}

impl ToolRegistry {
    pub fn new(roots: RootPolicy) -> Self {
        Self {
            tools: DashMap::new(),
            roots,
        }
    }

    pub fn register(&self, tool: Arc<dyn ToolHandler>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|e| e.key().clone()).collect()
    }

    /// Resolves and invokes the tool for `action`, publishing `TOOL_RESULT`
    /// on `bus` when given. Unknown actions yield an `error` result, never a
    /// panic (§4.4 step 1).
    pub async fn dispatch(&self, action: &Action, bus: Option<&EventBus>) -> ToolResult {
        let tool = match self.tools.get(&action.name) {
            Some(t) => t.clone(),
            None => {
                let result = ToolResult::error(&action.name, format!("unknown action '{}'", action.name));
                self.publish(bus, &result).await;
                return result;
            }
        };

        let result = match tokio::time::timeout(tool.timeout(), tool.invoke(&action.args, &self.roots)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(action = %action.name, "tool call timed out");
                ToolResult::timed_out(&action.name)
            }
        };

        info!(action = %action.name, status = ?result.status, "tool dispatched");
        self.publish(bus, &result).await;
        result
    }

    async fn publish(&self, bus: Option<&EventBus>, result: &ToolResult) {
        if let Some(bus) = bus {
            bus.publish(
                EventType::ToolResult,
                serde_json::to_value(result).unwrap_or_default(),
                Priority::Normal,
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(&self, args: &ActionArgs, _roots: &RootPolicy) -> ToolResult {
            ToolResult::ok("echo", args.as_raw().unwrap_or("").to_string())
        }
    }

    struct SlowTool;

    #[async_trait]
    impl ToolHandler for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn invoke(&self, _args: &ActionArgs, _roots: &RootPolicy) -> ToolResult {
            tokio::time::sleep(Duration::from_millis(200)).await;
            ToolResult::ok("slow", "done")
        }
    }

    struct ProjectOnlyTool;

    #[async_trait]
    impl ToolHandler for ProjectOnlyTool {
        fn name(&self) -> &str {
            "write_file"
        }

        fn path_scope(&self) -> PathScope {
            PathScope::Project
        }

        async fn invoke(&self, args: &ActionArgs, roots: &RootPolicy) -> ToolResult {
            let path = Path::new(args.as_raw().unwrap_or(""));
            match roots.check(path, self.path_scope()) {
                Ok(_) => ToolResult::ok("write_file", "written"),
                Err(reason) => ToolResult::refused("write_file", reason),
            }
        }
    }

    fn registry() -> ToolRegistry {
        let dir = tempdir().unwrap();
        let roots = RootPolicy::new(dir.path().to_path_buf(), dir.path().to_path_buf());
        let registry = ToolRegistry::new(roots);
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(SlowTool));
        registry.register(Arc::new(ProjectOnlyTool));
        registry
    }

    fn action(name: &str, raw: &str) -> Action {
        Action {
            name: name.to_string(),
            args: ActionArgs::Raw(raw.to_string()),
            raw_span: format!("<{name}>{raw}</{name}>"),
        }
    }

    #[tokio::test]
    async fn unknown_action_is_an_error_result_not_a_panic() {
        let result = registry().dispatch(&action("does_not_exist", ""), None).await;
        assert_eq!(result.status, ToolStatus::Error);
    }

    #[tokio::test]
    async fn known_tool_dispatches_and_returns_ok() {
        let result = registry().dispatch(&action("echo", "hello"), None).await;
        assert_eq!(result.status, ToolStatus::Ok);
        assert_eq!(result.result, "hello");
    }

    #[tokio::test]
    async fn slow_tool_times_out() {
        let result = registry().dispatch(&action("slow", ""), None).await;
        assert_eq!(result.status, ToolStatus::Error);
        assert_eq!(result.metadata["timeout"], true);
    }

    #[tokio::test]
    async fn path_outside_project_root_is_refused() {
        let result = registry().dispatch(&action("write_file", "/etc/passwd"), None).await;
        assert_eq!(result.status, ToolStatus::Refused);
    }

    #[tokio::test]
    async fn path_inside_project_root_is_accepted() {
        let reg = registry();
        let inside = reg.roots.project_root.join("foo.txt");
        let result = reg.dispatch(&action("write_file", inside.to_str().unwrap()), None).await;
        assert_eq!(result.status, ToolStatus::Ok);
    }
}
