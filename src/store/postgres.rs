//! PostgreSQL persistence.
//!
//! Requires the `postgres` feature flag:
//! ```toml
//! [dependencies]
//! taskhive = { features = ["postgres"] }
//! ```
//!
//! The claim path is the one strong-consistency requirement in the system:
//! a single conditional `UPDATE ... WHERE id = $1 AND status = 'pending'`
//! whose affected-row count decides the race.

#[cfg(feature = "postgres")]
mod inner {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::Value;
    use sqlx::postgres::PgRow;
    use sqlx::{PgPool, Row};
    use uuid::Uuid;

    use crate::error::{HiveError, Result};
    use crate::store::task::{NewTask, Priority, Task, TaskStatus};
    use crate::store::{
        AgentRecord, DecisionOutcome, MessageRecord, RoutingDecision, Store, WorkflowRecord,
        LIVE_AGENT_STATUSES,
    };

    /// PostgreSQL-backed store.
    #[derive(Clone)]
    pub struct PgStore {
        pool: PgPool,
    }

    impl PgStore {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        /// Create the tables if they don't exist. Idempotent.
        pub async fn migrate(&self) -> Result<()> {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS tasks (
                    id UUID PRIMARY KEY,
                    assigned_agent TEXT NOT NULL,
                    lead_agent TEXT,
                    name TEXT NOT NULL,
                    description TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    priority INTEGER NOT NULL DEFAULT 5,
                    result JSONB,
                    error_message TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                    completion_summary TEXT,
                    participating_agents TEXT[] NOT NULL DEFAULT '{}',
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    started_at TIMESTAMPTZ,
                    completed_at TIMESTAMPTZ,
                    archived_at TIMESTAMPTZ
                )
                "#,
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS workflows (
                    id UUID PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT,
                    steps JSONB NOT NULL DEFAULT '[]'::jsonb,
                    status TEXT NOT NULL DEFAULT 'in_progress',
                    current_step INTEGER NOT NULL DEFAULT 0,
                    result JSONB,
                    created_by TEXT NOT NULL DEFAULT 'hive',
                    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    id UUID PRIMARY KEY,
                    content TEXT NOT NULL,
                    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS agents (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    role TEXT NOT NULL,
                    capabilities TEXT[] NOT NULL DEFAULT '{}',
                    endpoint TEXT,
                    location TEXT,
                    status TEXT NOT NULL DEFAULT 'online',
                    last_heartbeat TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    metadata JSONB NOT NULL DEFAULT '{}'::jsonb
                )
                "#,
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS routing_decisions (
                    message_id UUID NOT NULL,
                    agent_id TEXT NOT NULL,
                    score DOUBLE PRECISION NOT NULL,
                    outcome TEXT NOT NULL,
                    response_time_ms BIGINT NOT NULL DEFAULT 0,
                    recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS activities (
                    id BIGSERIAL PRIMARY KEY,
                    event_type TEXT NOT NULL,
                    agent_id TEXT NOT NULL,
                    details JSONB NOT NULL DEFAULT '{}'::jsonb,
                    recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            )
            .execute(&self.pool)
            .await?;

            tracing::debug!("taskhive tables migrated");
            Ok(())
        }
    }

    fn row_to_task(row: &PgRow) -> sqlx::Result<Task> {
        let status: String = row.try_get("status")?;
        Ok(Task {
            id: row.try_get("id")?,
            assigned_agent: row.try_get("assigned_agent")?,
            lead_agent: row.try_get("lead_agent")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
            priority: Priority(row.try_get::<i32, _>("priority")?),
            result: row.try_get("result")?,
            error_message: row.try_get("error_message")?,
            retry_count: row.try_get("retry_count")?,
            metadata: row.try_get("metadata")?,
            completion_summary: row.try_get("completion_summary")?,
            participating_agents: row.try_get("participating_agents")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            archived_at: row.try_get("archived_at")?,
        })
    }

    fn row_to_workflow(row: &PgRow) -> sqlx::Result<WorkflowRecord> {
        Ok(WorkflowRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            steps: row.try_get("steps")?,
            status: row.try_get("status")?,
            current_step: row.try_get("current_step")?,
            result: row.try_get("result")?,
            created_by: row.try_get("created_by")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    const TASK_COLUMNS: &str = "id, assigned_agent, lead_agent, name, description, status, \
         priority, result, error_message, retry_count, metadata, completion_summary, \
         participating_agents, created_at, started_at, completed_at, archived_at";

    #[async_trait]
    impl Store for PgStore {
        async fn insert_task(&self, new: NewTask) -> Result<Task> {
            let id = Uuid::new_v4();
            let row = sqlx::query(&format!(
                "INSERT INTO tasks (id, assigned_agent, lead_agent, name, description, status, priority, metadata)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 RETURNING {TASK_COLUMNS}"
            ))
            .bind(id)
            .bind(&new.assigned_agent)
            .bind(&new.lead_agent)
            .bind(&new.name)
            .bind(&new.description)
            .bind(new.status.as_str())
            .bind(new.priority.0)
            .bind(&new.metadata)
            .fetch_one(&self.pool)
            .await?;
            Ok(row_to_task(&row)?)
        }

        async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
            let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.as_ref().map(row_to_task).transpose()?)
        }

        async fn poll_pending(&self, agent_id: &str) -> Result<Option<Task>> {
            let row = sqlx::query(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE assigned_agent = $1 AND status = 'pending'
                 ORDER BY priority ASC, created_at ASC
                 LIMIT 1"
            ))
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.as_ref().map(row_to_task).transpose()?)
        }

        async fn claim_task(&self, id: Uuid, agent_id: &str) -> Result<bool> {
            let result = sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'in_progress',
                    started_at = NOW(),
                    metadata = COALESCE(metadata, '{}'::jsonb)
                        || jsonb_build_object('claimed_by', $2::text, 'claimed_at', NOW()::text)
                WHERE id = $1 AND status = 'pending'
                "#,
            )
            .bind(id)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn complete_task(
            &self,
            id: Uuid,
            result: Value,
            summary: Option<&str>,
        ) -> Result<()> {
            let outcome = sqlx::query(
                "UPDATE tasks
                 SET status = 'completed', result = $2, completed_at = NOW(),
                     completion_summary = COALESCE($3, completion_summary)
                 WHERE id = $1",
            )
            .bind(id)
            .bind(&result)
            .bind(summary)
            .execute(&self.pool)
            .await?;
            if outcome.rows_affected() == 0 {
                return Err(HiveError::TaskNotFound(id));
            }
            Ok(())
        }

        async fn fail_task(&self, id: Uuid, error_message: &str) -> Result<()> {
            let outcome = sqlx::query(
                "UPDATE tasks
                 SET status = 'failed', error_message = $2, retry_count = retry_count + 1
                 WHERE id = $1",
            )
            .bind(id)
            .bind(error_message)
            .execute(&self.pool)
            .await?;
            if outcome.rows_affected() == 0 {
                return Err(HiveError::TaskNotFound(id));
            }
            Ok(())
        }

        async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<()> {
            let outcome = sqlx::query("UPDATE tasks SET status = $2 WHERE id = $1")
                .bind(id)
                .bind(status.as_str())
                .execute(&self.pool)
                .await?;
            if outcome.rows_affected() == 0 {
                return Err(HiveError::TaskNotFound(id));
            }
            Ok(())
        }

        async fn merge_task_metadata(&self, id: Uuid, patch: Value) -> Result<()> {
            let outcome = sqlx::query(
                "UPDATE tasks SET metadata = COALESCE(metadata, '{}'::jsonb) || $2 WHERE id = $1",
            )
            .bind(id)
            .bind(&patch)
            .execute(&self.pool)
            .await?;
            if outcome.rows_affected() == 0 {
                return Err(HiveError::TaskNotFound(id));
            }
            Ok(())
        }

        async fn add_participant(&self, id: Uuid, agent_id: &str) -> Result<()> {
            sqlx::query(
                "UPDATE tasks
                 SET participating_agents = array_append(participating_agents, $2)
                 WHERE id = $1 AND NOT ($2 = ANY(participating_agents))",
            )
            .bind(id)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn list_tasks(
            &self,
            status: Option<TaskStatus>,
            include_archived: bool,
            limit: usize,
        ) -> Result<Vec<Task>> {
            let rows = sqlx::query(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE ($1::text IS NULL OR status = $1)
                   AND ($2 OR archived_at IS NULL)
                 ORDER BY created_at DESC
                 LIMIT $3"
            ))
            .bind(status.map(|s| s.as_str()))
            .bind(include_archived)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows
                .iter()
                .map(row_to_task)
                .collect::<sqlx::Result<Vec<_>>>()?)
        }

        async fn mark_archived(&self, id: Uuid) -> Result<()> {
            let outcome = sqlx::query("UPDATE tasks SET archived_at = NOW() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
            if outcome.rows_affected() == 0 {
                return Err(HiveError::TaskNotFound(id));
            }
            Ok(())
        }

        async fn insert_workflow(
            &self,
            name: &str,
            description: Option<&str>,
            steps: Value,
            metadata: Value,
        ) -> Result<Uuid> {
            let id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO workflows (id, name, description, steps, status, metadata)
                 VALUES ($1, $2, $3, $4, 'in_progress', $5)",
            )
            .bind(id)
            .bind(name)
            .bind(description)
            .bind(&steps)
            .bind(&metadata)
            .execute(&self.pool)
            .await?;
            Ok(id)
        }

        async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRecord>> {
            let row = sqlx::query("SELECT * FROM workflows WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.as_ref().map(row_to_workflow).transpose()?)
        }

        async fn list_workflows(&self, limit: usize) -> Result<Vec<WorkflowRecord>> {
            let rows = sqlx::query("SELECT * FROM workflows ORDER BY created_at DESC LIMIT $1")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
            Ok(rows
                .iter()
                .map(row_to_workflow)
                .collect::<sqlx::Result<Vec<_>>>()?)
        }

        async fn update_workflow_meta(
            &self,
            id: Uuid,
            current_step: Option<i32>,
            patch: Value,
        ) -> Result<()> {
            let outcome = sqlx::query(
                "UPDATE workflows
                 SET metadata = COALESCE(metadata, '{}'::jsonb) || $2,
                     current_step = COALESCE($3, current_step),
                     updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(id)
            .bind(&patch)
            .bind(current_step)
            .execute(&self.pool)
            .await?;
            if outcome.rows_affected() == 0 {
                return Err(HiveError::WorkflowNotFound(id));
            }
            Ok(())
        }

        async fn finish_workflow(&self, id: Uuid, status: &str, result: Value) -> Result<()> {
            let outcome = sqlx::query(
                "UPDATE workflows SET status = $2, result = $3, updated_at = NOW() WHERE id = $1",
            )
            .bind(id)
            .bind(status)
            .bind(&result)
            .execute(&self.pool)
            .await?;
            if outcome.rows_affected() == 0 {
                return Err(HiveError::WorkflowNotFound(id));
            }
            Ok(())
        }

        async fn insert_message(&self, content: &str, metadata: Value) -> Result<Uuid> {
            let id = Uuid::new_v4();
            sqlx::query("INSERT INTO messages (id, content, metadata) VALUES ($1, $2, $3)")
                .bind(id)
                .bind(content)
                .bind(&metadata)
                .execute(&self.pool)
                .await?;
            Ok(id)
        }

        async fn fetch_unrouted(&self, batch: usize) -> Result<Vec<MessageRecord>> {
            let rows = sqlx::query(
                "SELECT id, content, metadata, created_at
                 FROM messages
                 WHERE (metadata->>'routed_to') IS NULL
                   AND (metadata->>'routing_failed') IS NULL
                 ORDER BY created_at ASC
                 LIMIT $1",
            )
            .bind(batch as i64)
            .fetch_all(&self.pool)
            .await?;
            rows.iter()
                .map(|row| {
                    Ok(MessageRecord {
                        id: row.try_get("id").map_err(HiveError::from)?,
                        content: row.try_get("content").map_err(HiveError::from)?,
                        metadata: row.try_get("metadata").map_err(HiveError::from)?,
                        created_at: row.try_get("created_at").map_err(HiveError::from)?,
                    })
                })
                .collect()
        }

        async fn mark_routed(
            &self,
            message_id: Uuid,
            agent_id: &str,
            score: f64,
            fallback: bool,
        ) -> Result<()> {
            sqlx::query(
                r#"
                UPDATE messages
                SET metadata = COALESCE(metadata, '{}'::jsonb) || jsonb_build_object(
                    'routed_to', $2::text,
                    'routing_score', $3::double precision,
                    'routing_fallback', $4::boolean,
                    'routed_at', NOW()::text
                )
                WHERE id = $1
                "#,
            )
            .bind(message_id)
            .bind(agent_id)
            .bind(score)
            .bind(fallback)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn upsert_agent(&self, agent: AgentRecord) -> Result<()> {
            sqlx::query(
                r#"
                INSERT INTO agents (id, name, role, capabilities, endpoint, location, status, last_heartbeat, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), $8)
                ON CONFLICT (id) DO UPDATE SET
                    name = EXCLUDED.name,
                    role = EXCLUDED.role,
                    capabilities = EXCLUDED.capabilities,
                    endpoint = EXCLUDED.endpoint,
                    location = EXCLUDED.location,
                    status = EXCLUDED.status,
                    last_heartbeat = NOW(),
                    metadata = EXCLUDED.metadata
                "#,
            )
            .bind(&agent.id)
            .bind(&agent.name)
            .bind(&agent.role)
            .bind(&agent.capabilities)
            .bind(&agent.endpoint)
            .bind(&agent.location)
            .bind(&agent.status)
            .bind(&agent.metadata)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn record_heartbeat(
            &self,
            agent_id: &str,
            status: Option<&str>,
            payload: Value,
        ) -> Result<bool> {
            let outcome = sqlx::query(
                r#"
                UPDATE agents
                SET last_heartbeat = NOW(),
                    status = COALESCE($2, status),
                    metadata = jsonb_set(COALESCE(metadata, '{}'::jsonb), '{heartbeat}', $3)
                WHERE id = $1
                "#,
            )
            .bind(agent_id)
            .bind(status)
            .bind(&payload)
            .execute(&self.pool)
            .await?;
            Ok(outcome.rows_affected() == 1)
        }

        async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
            let row = sqlx::query("SELECT * FROM agents WHERE id = $1")
                .bind(agent_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(|row| row_to_agent(&row)).transpose()?)
        }

        async fn list_agents(&self) -> Result<Vec<AgentRecord>> {
            let rows = sqlx::query("SELECT * FROM agents ORDER BY last_heartbeat DESC")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows
                .iter()
                .map(row_to_agent)
                .collect::<sqlx::Result<Vec<_>>>()?)
        }

        async fn find_live_agent(&self, candidates: &[String]) -> Result<Option<String>> {
            let live: Vec<String> = LIVE_AGENT_STATUSES.iter().map(|s| s.to_string()).collect();
            let row = if candidates.is_empty() {
                sqlx::query(
                    "SELECT id FROM agents WHERE status = ANY($1)
                     ORDER BY last_heartbeat DESC LIMIT 1",
                )
                .bind(&live)
                .fetch_optional(&self.pool)
                .await?
            } else {
                sqlx::query(
                    "SELECT id FROM agents WHERE id = ANY($1) AND status = ANY($2)
                     ORDER BY array_position($1, id) LIMIT 1",
                )
                .bind(candidates)
                .bind(&live)
                .fetch_optional(&self.pool)
                .await?
            };
            Ok(row.map(|r| r.try_get("id")).transpose()?)
        }

        async fn save_decisions(&self, decisions: &[RoutingDecision]) -> Result<()> {
            for decision in decisions {
                sqlx::query(
                    "INSERT INTO routing_decisions
                         (message_id, agent_id, score, outcome, response_time_ms, recorded_at)
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(decision.message_id)
                .bind(&decision.agent_id)
                .bind(decision.score)
                .bind(match decision.outcome {
                    DecisionOutcome::Success => "success",
                    DecisionOutcome::Failure => "failure",
                })
                .bind(decision.response_time_ms as i64)
                .bind(decision.recorded_at)
                .execute(&self.pool)
                .await?;
            }
            Ok(())
        }

        async fn load_recent_decisions(&self, limit: usize) -> Result<Vec<RoutingDecision>> {
            let rows = sqlx::query(
                "SELECT message_id, agent_id, score, outcome, response_time_ms, recorded_at
                 FROM routing_decisions
                 ORDER BY recorded_at DESC
                 LIMIT $1",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

            let mut decisions: Vec<RoutingDecision> = rows
                .iter()
                .map(|row| {
                    let outcome: String = row.try_get("outcome")?;
                    Ok(RoutingDecision {
                        message_id: row.try_get("message_id")?,
                        agent_id: row.try_get("agent_id")?,
                        score: row.try_get("score")?,
                        outcome: if outcome == "success" {
                            DecisionOutcome::Success
                        } else {
                            DecisionOutcome::Failure
                        },
                        response_time_ms: row.try_get::<i64, _>("response_time_ms")? as u64,
                        recorded_at: row.try_get::<DateTime<Utc>, _>("recorded_at")?,
                    })
                })
                .collect::<sqlx::Result<Vec<_>>>()?;
            // Stored newest-first; the window wants original order.
            decisions.reverse();
            Ok(decisions)
        }

        async fn record_activity(
            &self,
            event_type: &str,
            agent_id: &str,
            details: Value,
        ) -> Result<()> {
            sqlx::query(
                "INSERT INTO activities (event_type, agent_id, details) VALUES ($1, $2, $3)",
            )
            .bind(event_type)
            .bind(agent_id)
            .bind(&details)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

    fn row_to_agent(row: &PgRow) -> sqlx::Result<AgentRecord> {
        Ok(AgentRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            role: row.try_get("role")?,
            capabilities: row.try_get("capabilities")?,
            endpoint: row.try_get("endpoint")?,
            location: row.try_get("location")?,
            status: row.try_get("status")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

#[cfg(feature = "postgres")]
pub use inner::*;
