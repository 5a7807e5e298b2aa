//! The narrow interfaces the core invokes but does not own: agent turn
//! execution, coding-agent adapters, git mechanics and dashboard fanout.
//! Production deployments inject real implementations; the bundled ones
//! keep the daemon runnable on its own and back the tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use conductor_core::ConductorError;
use conductor_core::message::Message;
use conductor_core::review::MergeStrategy;
use conductor_core::session::UsageDelta;
use conductor_core::team::{Agent, Repository};

/// Result of one adapter invocation.
#[derive(Debug, Clone, Default)]
pub struct AdapterRun {
    pub output: String,
    pub usage: UsageDelta,
}

/// Executes one bounded agent turn over the pending inbox.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run_turn(&self, agent: &Agent, inbox: &[Message]) -> Result<AdapterRun, ConductorError>;
}

/// Registry of external coding-agent adapters (Claude/Codex/Aider
/// subprocesses). Subprocess mechanics live behind this seam.
#[async_trait]
pub trait AdapterRegistry: Send + Sync {
    async fn run(
        &self,
        adapter: &str,
        prompt: &str,
        worktree: &Path,
        model: &str,
    ) -> Result<AdapterRun, ConductorError>;
}

/// Bridges [`AgentRunner`] onto an [`AdapterRegistry`]: renders the inbox
/// into a prompt and hands it to the agent's configured adapter.
pub struct AdapterRunner {
    registry: Arc<dyn AdapterRegistry>,
    workspace_root: PathBuf,
}

impl AdapterRunner {
    pub fn new(registry: Arc<dyn AdapterRegistry>, workspace_root: PathBuf) -> Self {
        Self {
            registry,
            workspace_root,
        }
    }
}

#[async_trait]
impl AgentRunner for AdapterRunner {
    async fn run_turn(
        &self,
        agent: &Agent,
        inbox: &[Message],
    ) -> Result<AdapterRun, ConductorError> {
        let prompt = render_prompt(agent, inbox);
        let worktree = self.workspace_root.join(agent.id.to_string());
        self.registry
            .run(&agent.adapter, &prompt, &worktree, &agent.model)
            .await
    }
}

/// Inbox rendered as a plain prompt, oldest message first.
pub fn render_prompt(agent: &Agent, inbox: &[Message]) -> String {
    let mut prompt = format!(
        "You are {} ({}). Handle your pending messages:\n",
        agent.name,
        agent.role.as_str()
    );
    for message in inbox {
        prompt.push_str(&format!(
            "\n[message {} from {}:{}]\n{}\n",
            message.id,
            message.sender.kind.as_str(),
            message.sender.id,
            message.content
        ));
    }
    prompt
}

/// Stand-in runner used when no adapter infrastructure is wired up. It
/// consumes the inbox without doing any work, so a bare daemon still drains
/// queues instead of stalling them.
pub struct EchoRunner;

#[async_trait]
impl AgentRunner for EchoRunner {
    async fn run_turn(
        &self,
        agent: &Agent,
        inbox: &[Message],
    ) -> Result<AdapterRun, ConductorError> {
        tracing::debug!(agent = %agent.id, messages = inbox.len(), "echo_turn");
        Ok(AdapterRun {
            output: format!("acknowledged {} message(s)", inbox.len()),
            usage: UsageDelta::default(),
        })
    }
}

/// Git mechanics the merge worker invokes. Worktree/diff/PR plumbing is
/// deployment-provided.
#[async_trait]
pub trait GitService: Send + Sync {
    async fn create_worktree(
        &self,
        repo: &Repository,
        branch: &str,
    ) -> Result<PathBuf, ConductorError>;
    async fn remove_worktree(&self, repo: &Repository, branch: &str)
        -> Result<(), ConductorError>;
    async fn diff(&self, repo: &Repository, branch: &str) -> Result<String, ConductorError>;
    async fn push(&self, repo: &Repository, branch: &str) -> Result<(), ConductorError>;
    async fn open_pr(
        &self,
        repo: &Repository,
        branch: &str,
        title: &str,
    ) -> Result<String, ConductorError>;
    /// Merge `branch` into `target` with the given strategy, returning the
    /// merge commit hash.
    async fn merge(
        &self,
        repo: &Repository,
        branch: &str,
        target: &str,
        strategy: MergeStrategy,
    ) -> Result<String, ConductorError>;
}

/// Placeholder used when no git backend is configured: every operation
/// fails as `External`, which the merge worker records as `merge.failed`
/// and recovers from.
pub struct GitUnavailable;

#[async_trait]
impl GitService for GitUnavailable {
    async fn create_worktree(
        &self,
        _repo: &Repository,
        _branch: &str,
    ) -> Result<PathBuf, ConductorError> {
        Err(unavailable())
    }

    async fn remove_worktree(
        &self,
        _repo: &Repository,
        _branch: &str,
    ) -> Result<(), ConductorError> {
        Err(unavailable())
    }

    async fn diff(&self, _repo: &Repository, _branch: &str) -> Result<String, ConductorError> {
        Err(unavailable())
    }

    async fn push(&self, _repo: &Repository, _branch: &str) -> Result<(), ConductorError> {
        Err(unavailable())
    }

    async fn open_pr(
        &self,
        _repo: &Repository,
        _branch: &str,
        _title: &str,
    ) -> Result<String, ConductorError> {
        Err(unavailable())
    }

    async fn merge(
        &self,
        _repo: &Repository,
        _branch: &str,
        _target: &str,
        _strategy: MergeStrategy,
    ) -> Result<String, ConductorError> {
        Err(unavailable())
    }
}

fn unavailable() -> ConductorError {
    ConductorError::External("git service not configured".into())
}

/// Dashboard fanout. The WebSocket layer implements this; the daemon only
/// calls `publish`.
pub trait RealtimePublisher: Send + Sync {
    fn publish(&self, stream: &str, event: &serde_json::Value);
}

pub struct NoopRealtime;

impl RealtimePublisher for NoopRealtime {
    fn publish(&self, _stream: &str, _event: &serde_json::Value) {}
}
