//! The task engine: creation, field updates, assignment, the status state
//! machine with DAG gating, batch creation and task comments.

use std::sync::Arc;

use conductor_core::ConductorError;
use conductor_core::config::BranchingConfig;
use conductor_core::error::DependencyState;
use conductor_core::event::{Event, EventMetadata, EventPayload, task_stream};
use conductor_core::message::ActorRef;
use conductor_core::task::{
    Task, TaskId, TaskPriority, TaskStatus, branch_name, branch_slug, is_transition_allowed,
};
use conductor_store::notify::TaskStatusChange;
use conductor_store::{NotifyHub, Store, events, storage, tasks, teams};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::clock::Clock;

/// Input for a single task creation.
#[derive(Debug, Clone)]
pub struct CreateTask {
    pub team_id: Uuid,
    pub title: String,
    pub description: String,
    pub priority: TaskPriority,
    pub dri_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    pub depends_on: Vec<TaskId>,
    pub repo_ids: Vec<Uuid>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl CreateTask {
    pub fn new(team_id: Uuid, title: impl Into<String>) -> Self {
        Self {
            team_id,
            title: title.into(),
            description: String::new(),
            priority: TaskPriority::Medium,
            dri_id: None,
            assignee_id: None,
            depends_on: Vec::new(),
            repo_ids: Vec::new(),
            tags: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// One entry of a batch. `depends_on_indices` are 0-based positions of other
/// entries in the same batch, resolved to real ids after insertion.
#[derive(Debug, Clone)]
pub struct BatchTask {
    pub spec: CreateTask,
    pub depends_on_indices: Vec<usize>,
}

/// Field patch for `update_task`. Status is not updated here.
#[derive(Debug, Clone, Default)]
pub struct UpdateTask {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<TaskPriority>,
    pub tags: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct TaskEngine {
    store: Store,
    notify: NotifyHub,
    clock: Arc<dyn Clock>,
    branching: BranchingConfig,
}

impl TaskEngine {
    pub fn new(
        store: Store,
        notify: NotifyHub,
        clock: Arc<dyn Clock>,
        branching: BranchingConfig,
    ) -> Self {
        Self {
            store,
            notify,
            clock,
            branching,
        }
    }

    pub async fn create_task(&self, input: CreateTask) -> Result<Task, ConductorError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let task = self
            .create_in_tx(&mut tx, &input, &input.depends_on, now)
            .await?;
        self.store.commit(tx).await?;
        Ok(task)
    }

    /// Atomic multi-create. Entry ids are assigned in array order; index
    /// references are resolved to those ids before the events are written.
    /// Any failure rolls the whole batch back.
    pub async fn batch_create(
        &self,
        entries: Vec<BatchTask>,
    ) -> Result<Vec<Task>, ConductorError> {
        let now = self.clock.now();
        for (position, entry) in entries.iter().enumerate() {
            for &index in &entry.depends_on_indices {
                if index >= entries.len() {
                    return Err(ConductorError::Validation(format!(
                        "entry {position}: depends_on index {index} out of range"
                    )));
                }
                if index == position {
                    return Err(ConductorError::Validation(format!(
                        "entry {position}: depends on itself"
                    )));
                }
            }
        }

        let mut tx = self.store.begin().await?;

        // First pass assigns ids in array order.
        let mut ids = Vec::with_capacity(entries.len());
        for entry in &entries {
            validate_spec(&entry.spec)?;
            check_deps_exist(&mut tx, &entry.spec.depends_on).await?;
            let id = tasks::insert(&mut tx, &new_task_row(&entry.spec), now).await?;
            ids.push(id);
        }

        // Second pass resolves indices and writes branches and events.
        let mut created = Vec::with_capacity(entries.len());
        for (entry, &id) in entries.iter().zip(&ids) {
            let mut depends_on = entry.spec.depends_on.clone();
            depends_on.extend(entry.depends_on_indices.iter().map(|&index| ids[index]));
            depends_on.sort_unstable();
            depends_on.dedup();
            tasks::set_depends_on(&mut tx, id, &depends_on).await?;

            let branch = self
                .branch_for(&mut tx, entry.spec.team_id, id, &entry.spec.title)
                .await?;
            tasks::set_branch(&mut tx, id, &branch).await?;

            events::append(
                &mut tx,
                &task_stream(id),
                &EventPayload::TaskCreated {
                    title: entry.spec.title.clone(),
                    priority: entry.spec.priority,
                    team_id: entry.spec.team_id,
                    assignee_id: entry.spec.assignee_id,
                    depends_on: depends_on.clone(),
                },
                &EventMetadata::default(),
                now,
            )
            .await?;

            let task = tasks::get(&mut tx, id)
                .await?
                .ok_or_else(|| ConductorError::not_found("task", id))?;
            created.push(task);
        }

        self.store.commit(tx).await?;
        tracing::info!(count = created.len(), "tasks_batch_created");
        Ok(created)
    }

    /// Update title/description/priority/tags; appends `task.updated` with
    /// only the fields that changed.
    pub async fn update_task(
        &self,
        task_id: TaskId,
        patch: UpdateTask,
    ) -> Result<Task, ConductorError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let mut task = require_task(&mut tx, task_id).await?;
        require_mutable(&task)?;

        let mut changes = serde_json::Map::new();
        if let Some(title) = patch.title {
            if title.trim().is_empty() {
                return Err(ConductorError::Validation("title must not be empty".into()));
            }
            if title != task.title {
                changes.insert("title".into(), title.clone().into());
                task.title = title;
            }
        }
        if let Some(description) = patch.description {
            if description != task.description {
                changes.insert("description".into(), description.clone().into());
                task.description = description;
            }
        }
        if let Some(priority) = patch.priority {
            if priority != task.priority {
                changes.insert("priority".into(), priority.as_str().into());
                task.priority = priority;
            }
        }
        if let Some(tags) = patch.tags {
            if tags != task.tags {
                changes.insert(
                    "tags".into(),
                    serde_json::to_value(&tags).map_err(storage)?,
                );
                task.tags = tags;
            }
        }

        if changes.is_empty() {
            return Ok(task);
        }

        task.updated_at = now;
        tasks::update(&mut tx, &task).await?;
        events::append(
            &mut tx,
            &task_stream(task_id),
            &EventPayload::TaskUpdated { changes },
            &EventMetadata::default(),
            now,
        )
        .await?;
        self.store.commit(tx).await?;
        Ok(task)
    }

    pub async fn assign_task(
        &self,
        task_id: TaskId,
        assignee_id: Option<Uuid>,
        actor: EventMetadata,
    ) -> Result<Task, ConductorError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let mut task = require_task(&mut tx, task_id).await?;
        require_mutable(&task)?;

        if let Some(agent_id) = assignee_id {
            if teams::get_agent(&mut tx, agent_id).await?.is_none() {
                return Err(ConductorError::not_found("agent", agent_id));
            }
        }

        let from = task.assignee_id;
        task.assignee_id = assignee_id;
        task.updated_at = now;
        tasks::update(&mut tx, &task).await?;
        events::append(
            &mut tx,
            &task_stream(task_id),
            &EventPayload::TaskAssigned {
                from,
                to: assignee_id,
            },
            &actor,
            now,
        )
        .await?;
        self.store.commit(tx).await?;
        Ok(task)
    }

    /// Validate the transition, enforce DAG gating on entry to
    /// `in_progress`, stamp `completed_at` on `done`, append the event and
    /// publish `task_status_changed` after commit.
    pub async fn change_status(
        &self,
        task_id: TaskId,
        to: TaskStatus,
        actor_id: Option<Uuid>,
    ) -> Result<Task, ConductorError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let mut task = require_task(&mut tx, task_id).await?;
        let from = task.status;

        if !is_transition_allowed(from, to) {
            return Err(ConductorError::Conflict(format!(
                "cannot transition task {task_id} from '{from}' to '{to}'"
            )));
        }

        if to == TaskStatus::InProgress && !task.depends_on.is_empty() {
            let statuses = tasks::statuses_of(&mut tx, &task.depends_on).await?;
            let mut blocked: Vec<DependencyState> = task
                .depends_on
                .iter()
                .filter_map(|&dep| match statuses.get(&dep) {
                    Some(TaskStatus::Done) => None,
                    Some(&status) => Some(DependencyState {
                        task_id: dep,
                        status: Some(status),
                    }),
                    None => Some(DependencyState {
                        task_id: dep,
                        status: None,
                    }),
                })
                .collect();
            if !blocked.is_empty() {
                blocked.sort_by_key(|dep| dep.task_id);
                return Err(ConductorError::DependenciesUnresolved(blocked));
            }
        }

        task.status = to;
        task.updated_at = now;
        if to == TaskStatus::Done {
            task.completed_at = Some(now);
        }
        tasks::update(&mut tx, &task).await?;
        let metadata = actor_id.map(EventMetadata::actor).unwrap_or_default();
        events::append(
            &mut tx,
            &task_stream(task_id),
            &EventPayload::TaskStatusChanged { from, to, actor_id },
            &metadata,
            now,
        )
        .await?;
        self.store.commit(tx).await?;

        self.notify.publish_task_status_changed(TaskStatusChange {
            task_id,
            from,
            to,
        });
        tracing::info!(task_id, from = %from, to = %to, "task_status_changed");
        Ok(task)
    }

    /// Comments live only in the event log; there is no projection table.
    pub async fn add_comment(
        &self,
        task_id: TaskId,
        author: ActorRef,
        content: &str,
    ) -> Result<(), ConductorError> {
        if content.trim().is_empty() {
            return Err(ConductorError::Validation(
                "comment must not be empty".into(),
            ));
        }
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        require_task(&mut tx, task_id).await?;
        events::append(
            &mut tx,
            &task_stream(task_id),
            &EventPayload::TaskCommentAdded {
                author,
                content: content.to_string(),
            },
            &EventMetadata::actor(author.id),
            now,
        )
        .await?;
        self.store.commit(tx).await?;
        Ok(())
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        require_task(&mut conn, task_id).await
    }

    pub async fn list_tasks(
        &self,
        team_id: Uuid,
        status: Option<TaskStatus>,
        assignee_id: Option<Uuid>,
    ) -> Result<Vec<Task>, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        tasks::list(&mut conn, team_id, status, assignee_id, 100).await
    }

    /// The task's causal history in event-id order.
    pub async fn task_events(
        &self,
        task_id: TaskId,
        since_id: i64,
        limit: i64,
    ) -> Result<Vec<Event>, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        events::read_stream(&mut conn, &task_stream(task_id), since_id, limit).await
    }

    async fn create_in_tx(
        &self,
        tx: &mut SqliteConnection,
        spec: &CreateTask,
        depends_on: &[TaskId],
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Task, ConductorError> {
        validate_spec(spec)?;
        check_deps_exist(tx, depends_on).await?;

        let id = tasks::insert(tx, &new_task_row(spec), now).await?;
        let branch = self.branch_for(tx, spec.team_id, id, &spec.title).await?;
        tasks::set_branch(tx, id, &branch).await?;

        events::append(
            tx,
            &task_stream(id),
            &EventPayload::TaskCreated {
                title: spec.title.clone(),
                priority: spec.priority,
                team_id: spec.team_id,
                assignee_id: spec.assignee_id,
                depends_on: depends_on.to_vec(),
            },
            &EventMetadata::default(),
            now,
        )
        .await?;

        tasks::get(tx, id)
            .await?
            .ok_or_else(|| ConductorError::not_found("task", id))
    }

    /// Team branch prefix wins over the global one.
    async fn branch_for(
        &self,
        tx: &mut SqliteConnection,
        team_id: Uuid,
        id: TaskId,
        title: &str,
    ) -> Result<String, ConductorError> {
        let team = teams::get_team(tx, team_id)
            .await?
            .ok_or_else(|| ConductorError::not_found("team", team_id))?;
        let prefix = team
            .settings
            .branch_prefix
            .unwrap_or_else(|| self.branching.prefix.clone());
        let slug = branch_slug(title, self.branching.slug_max_length);
        Ok(branch_name(&prefix, id, &slug))
    }
}

fn validate_spec(spec: &CreateTask) -> Result<(), ConductorError> {
    if spec.title.trim().is_empty() {
        return Err(ConductorError::Validation("title must not be empty".into()));
    }
    Ok(())
}

/// Dependencies must exist at creation time; gating by status happens later,
/// on the transition into `in_progress`.
async fn check_deps_exist(
    conn: &mut SqliteConnection,
    depends_on: &[TaskId],
) -> Result<(), ConductorError> {
    if depends_on.is_empty() {
        return Ok(());
    }
    let statuses = tasks::statuses_of(conn, depends_on).await?;
    let missing: Vec<TaskId> = depends_on
        .iter()
        .copied()
        .filter(|dep| !statuses.contains_key(dep))
        .collect();
    if !missing.is_empty() {
        return Err(ConductorError::Validation(format!(
            "unknown dependency tasks: {missing:?}"
        )));
    }
    Ok(())
}

fn new_task_row(spec: &CreateTask) -> tasks::NewTask {
    tasks::NewTask {
        team_id: spec.team_id,
        title: spec.title.clone(),
        description: spec.description.clone(),
        priority: spec.priority,
        dri_id: spec.dri_id,
        assignee_id: spec.assignee_id,
        depends_on: spec.depends_on.clone(),
        repo_ids: spec.repo_ids.clone(),
        tags: spec.tags.clone(),
        metadata: spec.metadata.clone(),
    }
}

async fn require_task(
    conn: &mut SqliteConnection,
    task_id: TaskId,
) -> Result<Task, ConductorError> {
    tasks::get(conn, task_id)
        .await?
        .ok_or_else(|| ConductorError::not_found("task", task_id))
}

fn require_mutable(task: &Task) -> Result<(), ConductorError> {
    if task.status.is_terminal() {
        return Err(ConductorError::Conflict(format!(
            "task {} is {} and can no longer change",
            task.id, task.status
        )));
    }
    Ok(())
}
