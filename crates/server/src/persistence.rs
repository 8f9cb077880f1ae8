//! Persistence gateway - SQLite-backed projects, tasks and messages.
//!
//! Uses `spawn_blocking` for async-safe SQLite access. Every state-changing
//! operation runs its access check and its write inside one
//! `BEGIN IMMEDIATE` transaction, so a membership change cannot slip in
//! between the check and the write.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use taskroom_protocol::{new_id, TaskStatus, UserSummary};

use crate::access::{can_act, Project};
use crate::clock;
use crate::error::GatewayError;
use crate::migration_runner::run_migrations;

/// A chat message as committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub project_id: String,
    pub content: String,
    pub sender: UserSummary,
    pub created_at: String,
}

/// A task after a status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTask {
    pub id: String,
    pub project_id: String,
    pub status: TaskStatus,
    pub updated_by: String,
    pub updated_at: String,
}

/// Handle to the database (cheap to Clone).
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database file and apply pending migrations.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut conn = Connection::open(path)?;
        run_migrations(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Fresh, migrated in-memory database.
    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        run_migrations(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` against the connection on the blocking pool.
    ///
    /// The work is detached from the caller: if the calling task is dropped
    /// mid-flight, the closure still runs to completion.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, GatewayError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        })
        .await?
    }

    /// Cheap connectivity probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), GatewayError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    /// Load a project and check that `user_id` may act on it.
    pub async fn find_project_access(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<Project, GatewayError> {
        let project_id = project_id.to_string();
        let user_id = user_id.to_string();
        self.with_conn(move |conn| authorize(conn, &project_id, &user_id))
            .await
    }

    /// Check access and insert the message in one transaction.
    pub async fn create_message_if_authorized(
        &self,
        user_id: &str,
        project_id: &str,
        content: &str,
    ) -> Result<StoredMessage, GatewayError> {
        let user_id = user_id.to_string();
        let project_id = project_id.to_string();
        let content = content.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            authorize(&tx, &project_id, &user_id)?;

            let id = new_id();
            let created_at = clock::now_rfc3339();
            tx.execute(
                "INSERT INTO messages (id, project_id, sender_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, project_id, user_id, content, created_at],
            )?;
            let sender = load_user_summary(&tx, &user_id)?;
            tx.commit()?;

            debug!(
                component = "persistence",
                event = "message.inserted",
                message_id = %id,
                project_id = %project_id,
                "Inserted message"
            );

            Ok(StoredMessage {
                id,
                project_id,
                content,
                sender,
                created_at,
            })
        })
        .await
    }

    /// Check access to the task's project and update its status in one transaction.
    pub async fn update_task_status_if_authorized(
        &self,
        user_id: &str,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<StoredTask, GatewayError> {
        let user_id = user_id.to_string();
        let task_id = task_id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let project_id: String = tx
                .query_row(
                    "SELECT project_id FROM tasks WHERE id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(GatewayError::NotFound("Task"))?;
            authorize(&tx, &project_id, &user_id)?;

            let updated_at = clock::now_rfc3339();
            tx.execute(
                "UPDATE tasks SET status = ?1, updated_by = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), user_id, updated_at, task_id],
            )?;
            tx.commit()?;

            Ok(StoredTask {
                id: task_id,
                project_id,
                status,
                updated_by: user_id,
                updated_at,
            })
        })
        .await
    }

    // -- Collaborator operations (seeding, administration, tests) --

    pub async fn create_user(
        &self,
        id: &str,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<(), GatewayError> {
        let (id, name, email) = (id.to_string(), name.map(str::to_string), email.map(str::to_string));
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO users (id, name, email) VALUES (?1, ?2, ?3)",
                params![id, name, email],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn create_project(
        &self,
        id: &str,
        name: &str,
        description: Option<&str>,
        owner_id: &str,
    ) -> Result<(), GatewayError> {
        let (id, name, owner_id) = (id.to_string(), name.to_string(), owner_id.to_string());
        let description = description.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO projects (id, name, description, owner_id) VALUES (?1, ?2, ?3, ?4)",
                params![id, name, description, owner_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn add_member(&self, project_id: &str, user_id: &str) -> Result<(), GatewayError> {
        let (project_id, user_id) = (project_id.to_string(), user_id.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO project_members (project_id, user_id) VALUES (?1, ?2)",
                params![project_id, user_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Returns whether a membership row was removed.
    #[cfg(test)]
    pub async fn remove_member(&self, project_id: &str, user_id: &str) -> Result<bool, GatewayError> {
        let (project_id, user_id) = (project_id.to_string(), user_id.to_string());
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM project_members WHERE project_id = ?1 AND user_id = ?2",
                params![project_id, user_id],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    pub async fn create_task(
        &self,
        id: &str,
        project_id: &str,
        title: &str,
        status: TaskStatus,
    ) -> Result<(), GatewayError> {
        let (id, project_id, title) = (id.to_string(), project_id.to_string(), title.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, project_id, title, status) VALUES (?1, ?2, ?3, ?4)",
                params![id, project_id, title, status.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete every row, children first.
    pub async fn clear_all(&self) -> Result<(), GatewayError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute_batch(
                "DELETE FROM messages;
                 DELETE FROM tasks;
                 DELETE FROM project_members;
                 DELETE FROM projects;
                 DELETE FROM users;",
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    #[cfg(test)]
    pub(crate) async fn message_count(&self, project_id: &str) -> i64 {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE project_id = ?1",
                params![project_id],
                |row| row.get::<_, i64>(0),
            )?)
        })
        .await
        .unwrap()
    }

    #[cfg(test)]
    pub(crate) async fn task_status(&self, task_id: &str) -> Option<String> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT status FROM tasks WHERE id = ?1",
                    params![task_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?)
        })
        .await
        .unwrap()
    }
}

/// Fetch a project with its member set.
fn find_project(conn: &Connection, project_id: &str) -> rusqlite::Result<Option<Project>> {
    let Some(owner_id) = conn
        .query_row(
            "SELECT owner_id FROM projects WHERE id = ?1",
            params![project_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?
    else {
        return Ok(None);
    };

    let member_ids: HashSet<String> = conn
        .prepare("SELECT user_id FROM project_members WHERE project_id = ?1")?
        .query_map(params![project_id], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    Ok(Some(Project {
        id: project_id.to_string(),
        owner_id,
        member_ids,
    }))
}

/// Project lookup plus the access policy. Callers inside a transaction pass
/// the transaction, so the check shares its isolation.
fn authorize(conn: &Connection, project_id: &str, user_id: &str) -> Result<Project, GatewayError> {
    let project = find_project(conn, project_id)?.ok_or(GatewayError::NotFound("Project"))?;
    if !can_act(user_id, &project) {
        return Err(GatewayError::AuthorizationDenied);
    }
    Ok(project)
}

fn load_user_summary(conn: &Connection, user_id: &str) -> rusqlite::Result<UserSummary> {
    let row = conn
        .query_row(
            "SELECT name, email FROM users WHERE id = ?1",
            params![user_id],
            |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional()?;

    Ok(match row {
        Some((name, email)) => UserSummary {
            id: user_id.to_string(),
            name,
            email,
        },
        None => UserSummary::bare(user_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .create_user("alice", Some("Alice Johnson"), Some("alice@example.com"))
            .await
            .unwrap();
        store.create_project("p1", "Website", None, "alice").await.unwrap();
        store.add_member("p1", "bob").await.unwrap();
        store
            .create_task("t1", "p1", "Draft wireframes", TaskStatus::Todo)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn owner_and_member_pass_access_check() {
        let store = seeded_store().await;

        let project = store.find_project_access("p1", "alice").await.unwrap();
        assert_eq!(project.owner_id, "alice");
        assert!(project.member_ids.contains("bob"));

        assert!(store.find_project_access("p1", "bob").await.is_ok());
    }

    #[tokio::test]
    async fn outsider_and_unknown_project_are_rejected() {
        let store = seeded_store().await;

        assert!(matches!(
            store.find_project_access("p1", "mallory").await,
            Err(GatewayError::AuthorizationDenied)
        ));
        assert!(matches!(
            store.find_project_access("nope", "alice").await,
            Err(GatewayError::NotFound("Project"))
        ));
    }

    #[tokio::test]
    async fn authorized_message_is_stored_with_sender_summary() {
        let store = seeded_store().await;

        let message = store
            .create_message_if_authorized("alice", "p1", "hello")
            .await
            .unwrap();
        assert_eq!(message.content, "hello");
        assert_eq!(message.project_id, "p1");
        assert_eq!(message.sender.name.as_deref(), Some("Alice Johnson"));
        assert_eq!(store.message_count("p1").await, 1);

        // bob has no user row; the summary falls back to the bare id
        let message = store
            .create_message_if_authorized("bob", "p1", "hi")
            .await
            .unwrap();
        assert_eq!(message.sender, UserSummary::bare("bob"));
        assert_eq!(store.message_count("p1").await, 2);
    }

    #[tokio::test]
    async fn unauthorized_message_is_not_stored() {
        let store = seeded_store().await;

        let result = store
            .create_message_if_authorized("mallory", "p1", "let me in")
            .await;
        assert!(matches!(result, Err(GatewayError::AuthorizationDenied)));
        assert_eq!(store.message_count("p1").await, 0);
    }

    #[tokio::test]
    async fn revoked_member_can_no_longer_write() {
        let store = seeded_store().await;

        assert!(store.create_message_if_authorized("bob", "p1", "one").await.is_ok());
        assert!(store.remove_member("p1", "bob").await.unwrap());

        let result = store.create_message_if_authorized("bob", "p1", "two").await;
        assert!(matches!(result, Err(GatewayError::AuthorizationDenied)));
        assert_eq!(store.message_count("p1").await, 1);
    }

    #[tokio::test]
    async fn task_status_update_checks_access() {
        let store = seeded_store().await;

        let task = store
            .update_task_status_if_authorized("bob", "t1", TaskStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(task.project_id, "p1");
        assert_eq!(task.updated_by, "bob");
        assert_eq!(store.task_status("t1").await.as_deref(), Some("in-progress"));

        let denied = store
            .update_task_status_if_authorized("mallory", "t1", TaskStatus::Done)
            .await;
        assert!(matches!(denied, Err(GatewayError::AuthorizationDenied)));
        assert_eq!(store.task_status("t1").await.as_deref(), Some("in-progress"));

        let missing = store
            .update_task_status_if_authorized("alice", "t404", TaskStatus::Done)
            .await;
        assert!(matches!(missing, Err(GatewayError::NotFound("Task"))));
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskroom.db");

        {
            let store = Store::open(&path).unwrap();
            store.create_project("p1", "Website", None, "alice").await.unwrap();
            store
                .create_message_if_authorized("alice", "p1", "persisted")
                .await
                .unwrap();
        }

        let store = Store::open(&path).unwrap();
        store.ping().await.unwrap();
        assert_eq!(store.message_count("p1").await, 1);
    }
}
