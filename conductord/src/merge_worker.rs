//! Background merge worker: claims queued jobs in id order, one at a time,
//! runs the configured strategy through the git seam under a timeout, and
//! finalizes job and task state.

use std::sync::Arc;
use std::time::Duration;

use conductor_core::ConductorError;
use conductor_core::config::MergeConfig;
use conductor_core::review::MergeJob;
use conductor_engine::Services;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval, timeout};

use crate::runner::GitService;

pub struct MergeWorker {
    services: Services,
    git: Arc<dyn GitService>,
    config: MergeConfig,
}

impl MergeWorker {
    pub fn new(services: Services, git: Arc<dyn GitService>, config: MergeConfig) -> Self {
        Self {
            services,
            git,
            config,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll = interval(Duration::from_secs(self.config.poll_interval_seconds.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            poll_interval_seconds = self.config.poll_interval_seconds,
            "merge_worker_started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = poll.tick() => {
                    if let Err(err) = self.drain_queue().await {
                        tracing::error!(error = %err, "merge_worker_error");
                    }
                }
            }
        }
        tracing::info!("merge_worker_stopped");
    }

    /// Process every queued job, strictly one at a time.
    pub async fn drain_queue(&self) -> Result<(), ConductorError> {
        while let Some(job) = self.services.reviews.claim_next_job().await? {
            self.execute(job).await;
        }
        Ok(())
    }

    async fn execute(&self, job: MergeJob) {
        tracing::info!(
            job_id = job.id,
            task_id = job.task_id,
            strategy = job.strategy.as_str(),
            "merge_started"
        );

        let outcome = self.run_merge(&job).await;
        let result = match outcome {
            Ok(merge_commit) => {
                tracing::info!(job_id = job.id, merge_commit = %merge_commit, "merge_completed");
                self.services
                    .reviews
                    .complete_job(job.id, &merge_commit)
                    .await
            }
            Err(err) => {
                tracing::warn!(job_id = job.id, error = %err, "merge_failed");
                self.services.reviews.fail_job(job.id, &err.to_string()).await
            }
        };
        if let Err(err) = result {
            tracing::error!(job_id = job.id, error = %err, "merge_finalize_failed");
        }
    }

    async fn run_merge(&self, job: &MergeJob) -> Result<String, ConductorError> {
        let task = self.services.tasks.get_task(job.task_id).await?;
        let repo = self.services.teams.get_repo(job.repo_id).await?;

        let job_timeout = Duration::from_secs(self.config.job_timeout_seconds);
        timeout(
            job_timeout,
            self.git
                .merge(&repo, &task.branch, &repo.default_branch, job.strategy),
        )
        .await
        .map_err(|_| {
            ConductorError::External(format!(
                "merge job timed out after {}s",
                job_timeout.as_secs()
            ))
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conductor_core::ConductorConfig;
    use conductor_core::message::ActorKind;
    use conductor_core::review::{MergeStatus, MergeStrategy, Verdict};
    use conductor_core::task::TaskStatus;
    use conductor_core::team::{AgentRole, Repository};
    use conductor_engine::SystemClock;
    use conductor_engine::task_engine::CreateTask;
    use conductor_store::{NotifyHub, Store};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Scripted git seam: a queue of merge results, recorded calls.
    struct ScriptedGit {
        results: Mutex<Vec<Result<String, ConductorError>>>,
        merges: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedGit {
        fn new(results: Vec<Result<String, ConductorError>>) -> Self {
            Self {
                results: Mutex::new(results),
                merges: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GitService for ScriptedGit {
        async fn create_worktree(
            &self,
            _repo: &Repository,
            _branch: &str,
        ) -> Result<PathBuf, ConductorError> {
            unimplemented!("not used by the merge worker")
        }

        async fn remove_worktree(
            &self,
            _repo: &Repository,
            _branch: &str,
        ) -> Result<(), ConductorError> {
            unimplemented!("not used by the merge worker")
        }

        async fn diff(&self, _repo: &Repository, _branch: &str) -> Result<String, ConductorError> {
            unimplemented!("not used by the merge worker")
        }

        async fn push(&self, _repo: &Repository, _branch: &str) -> Result<(), ConductorError> {
            unimplemented!("not used by the merge worker")
        }

        async fn open_pr(
            &self,
            _repo: &Repository,
            _branch: &str,
            _title: &str,
        ) -> Result<String, ConductorError> {
            unimplemented!("not used by the merge worker")
        }

        async fn merge(
            &self,
            _repo: &Repository,
            branch: &str,
            target: &str,
            _strategy: MergeStrategy,
        ) -> Result<String, ConductorError> {
            self.merges
                .lock()
                .expect("lock")
                .push((branch.to_string(), target.to_string()));
            self.results.lock().expect("lock").remove(0)
        }
    }

    struct Fixture {
        services: Services,
        team_id: Uuid,
        repo: Repository,
    }

    async fn fixture() -> Fixture {
        let store = Store::in_memory().await.expect("store");
        let services = Services::new(
            store,
            NotifyHub::default(),
            Arc::new(SystemClock),
            Arc::new(ConductorConfig::default()),
        );
        let org = services.teams.create_org("Acme", "acme").await.expect("org");
        let (team, _) = services
            .teams
            .create_team(org.id, "Core", "core")
            .await
            .expect("team");
        services
            .teams
            .create_agent(team.id, "e1", AgentRole::Engineer, None, None)
            .await
            .expect("engineer");
        let repo = services
            .teams
            .register_repo(team.id, "api", "/srv/repos/api", "main")
            .await
            .expect("repo");
        Fixture {
            services,
            team_id: team.id,
            repo,
        }
    }

    /// Create an approved task with one queued merge job; returns task id.
    async fn approved_task(fx: &Fixture) -> i64 {
        let task = fx
            .services
            .tasks
            .create_task(CreateTask {
                repo_ids: vec![fx.repo.id],
                ..CreateTask::new(fx.team_id, "Ship feature")
            })
            .await
            .expect("task");
        for status in [TaskStatus::InProgress, TaskStatus::InReview] {
            fx.services
                .tasks
                .change_status(task.id, status, None)
                .await
                .expect("drive");
        }
        let review = fx
            .services
            .reviews
            .request_review(task.id, None, ActorKind::User)
            .await
            .expect("review");
        fx.services
            .reviews
            .set_verdict(review.id, Verdict::Approve, None, None, ActorKind::User)
            .await
            .expect("approve");
        fx.services
            .reviews
            .queue_merge(task.id, MergeStrategy::Rebase)
            .await
            .expect("queue");
        task.id
    }

    fn worker_config() -> MergeConfig {
        MergeConfig {
            job_timeout_seconds: 2,
            poll_interval_seconds: 1,
        }
    }

    #[tokio::test]
    async fn successful_merge_finishes_the_task() {
        let fx = fixture().await;
        let task_id = approved_task(&fx).await;
        let git = Arc::new(ScriptedGit::new(vec![Ok("deadbeef".into())]));
        let worker = MergeWorker::new(fx.services.clone(), git.clone(), worker_config());

        worker.drain_queue().await.expect("drain");

        let task = fx.services.tasks.get_task(task_id).await.expect("task");
        assert_eq!(task.status, TaskStatus::Done);
        let jobs = fx
            .services
            .reviews
            .merge_readiness(task_id)
            .await
            .expect("readiness")
            .jobs;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, MergeStatus::Success);
        assert_eq!(jobs[0].merge_commit.as_deref(), Some("deadbeef"));

        let merges = git.merges.lock().expect("lock");
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].0, task.branch);
        assert_eq!(merges[0].1, "main");
    }

    #[tokio::test]
    async fn failed_merge_reverts_the_task() {
        let fx = fixture().await;
        let task_id = approved_task(&fx).await;
        let git = Arc::new(ScriptedGit::new(vec![Err(ConductorError::External(
            "rebase conflict".into(),
        ))]));
        let worker = MergeWorker::new(fx.services.clone(), git, worker_config());

        worker.drain_queue().await.expect("drain");

        let task = fx.services.tasks.get_task(task_id).await.expect("task");
        assert_eq!(task.status, TaskStatus::InProgress);
        let jobs = fx
            .services
            .reviews
            .merge_readiness(task_id)
            .await
            .expect("readiness")
            .jobs;
        assert_eq!(jobs[0].status, MergeStatus::Failed);
        assert!(
            jobs[0]
                .error
                .as_deref()
                .unwrap_or_default()
                .contains("rebase conflict")
        );
    }

    #[tokio::test]
    async fn jobs_run_in_id_order() {
        let fx = fixture().await;
        let first = approved_task(&fx).await;
        let second = approved_task(&fx).await;
        let git = Arc::new(ScriptedGit::new(vec![
            Ok("commit-1".into()),
            Ok("commit-2".into()),
        ]));
        let worker = MergeWorker::new(fx.services.clone(), git.clone(), worker_config());

        worker.drain_queue().await.expect("drain");

        let first_branch = fx
            .services
            .tasks
            .get_task(first)
            .await
            .expect("first")
            .branch;
        let second_branch = fx
            .services
            .tasks
            .get_task(second)
            .await
            .expect("second")
            .branch;
        let merges = git.merges.lock().expect("lock");
        assert_eq!(merges[0].0, first_branch);
        assert_eq!(merges[1].0, second_branch);
    }
}
