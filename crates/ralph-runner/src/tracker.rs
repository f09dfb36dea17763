//! External issue tracker: the system of record for project lifecycle.
//!
//! [`LinearTracker`] speaks Linear's GraphQL API over reqwest.
//! [`MemoryTracker`] keeps everything in process for tests and offline runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ralph_core::lifecycle::{IssueState, ProjectState};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Read and write access to the tracker that owns project lifecycle.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn project_state(&self, project_id: &str) -> Result<ProjectState>;

    /// Write `state` unconditionally. Transition rules are enforced by
    /// [`LifecycleSync`](crate::sync::LifecycleSync), not here.
    async fn set_project_state(&self, project_id: &str, state: ProjectState) -> Result<()>;

    /// States of the given issues. Unknown ids are an error.
    async fn issue_states(&self, issue_ids: &[String]) -> Result<Vec<IssueState>>;
}

#[async_trait]
impl<T: Tracker + ?Sized> Tracker for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn project_state(&self, project_id: &str) -> Result<ProjectState> {
        (**self).project_state(project_id).await
    }

    async fn set_project_state(&self, project_id: &str, state: ProjectState) -> Result<()> {
        (**self).set_project_state(project_id, state).await
    }

    async fn issue_states(&self, issue_ids: &[String]) -> Result<Vec<IssueState>> {
        (**self).issue_states(issue_ids).await
    }
}

// ─── In-memory ──────────────────────────────────────────────────────────

/// In-process tracker. A panic while a lock is held does not lose state;
/// later calls keep using the data as it was left.
#[derive(Default)]
pub struct MemoryTracker {
    projects: Mutex<HashMap<String, ProjectState>>,
    issues: Mutex<HashMap<String, IssueState>>,
    writes: Mutex<Vec<(String, ProjectState)>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(self, id: &str, state: ProjectState) -> Self {
        lock(&self.projects).insert(id.to_string(), state);
        self
    }

    pub fn with_issue(self, id: &str, state: IssueState) -> Self {
        self.set_issue(id, state);
        self
    }

    pub fn set_issue(&self, id: &str, state: IssueState) {
        lock(&self.issues).insert(id.to_string(), state);
    }

    /// Every successful `set_project_state`, in call order.
    pub fn writes(&self) -> Vec<(String, ProjectState)> {
        lock(&self.writes).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Tracker for MemoryTracker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn project_state(&self, project_id: &str) -> Result<ProjectState> {
        lock(&self.projects)
            .get(project_id)
            .copied()
            .with_context(|| format!("unknown project {project_id}"))
    }

    async fn set_project_state(&self, project_id: &str, state: ProjectState) -> Result<()> {
        lock(&self.projects).insert(project_id.to_string(), state);
        lock(&self.writes).push((project_id.to_string(), state));
        Ok(())
    }

    async fn issue_states(&self, issue_ids: &[String]) -> Result<Vec<IssueState>> {
        let issues = lock(&self.issues);
        issue_ids
            .iter()
            .map(|id| {
                issues
                    .get(id)
                    .copied()
                    .with_context(|| format!("unknown issue {id}"))
            })
            .collect()
    }
}

// ─── Linear ─────────────────────────────────────────────────────────────

const LINEAR_API_URL: &str = "https://api.linear.app/graphql";
/// Environment variable holding the Linear API key.
pub const LINEAR_API_KEY_VAR: &str = "LINEAR_API_KEY";
const ISSUES_PAGE_SIZE: u32 = 250;

/// Linear over GraphQL. Project lifecycle maps to project statuses, and
/// milestone issues are read page by page.
pub struct LinearTracker {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl LinearTracker {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            endpoint: LINEAR_API_URL.to_string(),
        }
    }

    /// Create from environment variable `LINEAR_API_KEY`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create from whatever `lookup` returns for `LINEAR_API_KEY`. A blank
    /// key counts as missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = lookup(LINEAR_API_KEY_VAR)
            .filter(|key| !key.trim().is_empty())
            .with_context(|| format!("{LINEAR_API_KEY_VAR} not set"))?;
        Ok(Self::new(api_key))
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("authorization", &self.api_key)
            .header("content-type", "application/json")
            .json(&GraphQlRequest { query, variables })
            .send()
            .await
            .context("failed to send Linear API request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Linear API error ({status}): {body}");
        }

        let body: GraphQlResponse<T> = response
            .json()
            .await
            .context("failed to parse Linear response")?;
        body.into_data()
    }

    async fn status_id_for(&self, state: ProjectState) -> Result<String> {
        let data: ProjectStatusesData = self
            .graphql("query { projectStatuses { nodes { id name } } }", serde_json::json!({}))
            .await?;
        data.project_statuses
            .nodes
            .into_iter()
            .find(|s| ProjectState::from_display_name(&s.name) == Some(state))
            .map(|s| s.id)
            .with_context(|| {
                format!("workspace has no project status named {:?}", state.display_name())
            })
    }
}

#[async_trait]
impl Tracker for LinearTracker {
    fn name(&self) -> &str {
        "linear"
    }

    async fn project_state(&self, project_id: &str) -> Result<ProjectState> {
        let data: ProjectData = self
            .graphql(
                "query($id: String!) { project(id: $id) { status { name type } } }",
                serde_json::json!({ "id": project_id }),
            )
            .await?;
        project_state_from_status(&data.project.status)
    }

    async fn set_project_state(&self, project_id: &str, state: ProjectState) -> Result<()> {
        let status_id = self.status_id_for(state).await?;
        let data: ProjectUpdateData = self
            .graphql(
                "mutation($id: String!, $statusId: String!) { \
                   projectUpdate(id: $id, input: { statusId: $statusId }) { success } }",
                serde_json::json!({ "id": project_id, "statusId": status_id }),
            )
            .await?;
        if !data.project_update.success {
            anyhow::bail!("Linear rejected status update for project {project_id}");
        }
        tracing::info!(project = project_id, state = %state, "tracker project state updated");
        Ok(())
    }

    async fn issue_states(&self, issue_ids: &[String]) -> Result<Vec<IssueState>> {
        if issue_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut by_id: HashMap<String, String> = HashMap::with_capacity(issue_ids.len());
        let mut after: Option<String> = None;
        loop {
            let data: IssuesData = self
                .graphql(
                    "query($ids: [ID!], $first: Int!, $after: String) { \
                       issues(filter: { id: { in: $ids } }, first: $first, after: $after) \
                       { nodes { id state { type } } pageInfo { hasNextPage endCursor } } }",
                    serde_json::json!({
                        "ids": issue_ids,
                        "first": ISSUES_PAGE_SIZE,
                        "after": after,
                    }),
                )
                .await?;
            by_id.extend(data.issues.nodes.into_iter().map(|n| (n.id, n.state.state_type)));

            match data.issues.page_info {
                Some(PageInfo {
                    has_next_page: true,
                    end_cursor: Some(cursor),
                }) => {
                    if after.as_deref() == Some(cursor.as_str()) {
                        anyhow::bail!("Linear repeated issue page cursor {cursor:?}");
                    }
                    tracing::debug!(fetched = by_id.len(), "fetching next page of issues");
                    after = Some(cursor);
                }
                _ => break,
            }
        }

        issue_ids
            .iter()
            .map(|id| {
                let state_type = by_id
                    .get(id)
                    .with_context(|| format!("Linear returned no issue {id}"))?;
                issue_state_from_type(state_type)
            })
            .collect()
    }
}

/// Linear workflow state type → issue state.
pub fn issue_state_from_type(state_type: &str) -> Result<IssueState> {
    Ok(match state_type {
        "completed" => IssueState::Done,
        "canceled" => IssueState::Canceled,
        "started" => IssueState::InProgress,
        "unstarted" => IssueState::Todo,
        "backlog" | "triage" => IssueState::Backlog,
        other => anyhow::bail!("unknown Linear state type {other:?}"),
    })
}

/// Status name first (custom workspaces keep the default names), then type.
fn project_state_from_status(status: &ProjectStatusNode) -> Result<ProjectState> {
    if let Some(state) = ProjectState::from_display_name(&status.name) {
        return Ok(state);
    }
    Ok(match status.status_type.as_deref() {
        Some("backlog") => ProjectState::Backlog,
        Some("planned") => ProjectState::Planned,
        Some("started") => ProjectState::InProgress,
        Some("completed") => ProjectState::Done,
        _ => anyhow::bail!("cannot map Linear project status {:?}", status.name),
    })
}

#[derive(Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: serde_json::Value,
}

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

impl<T> GraphQlResponse<T> {
    fn into_data(self) -> Result<T> {
        if !self.errors.is_empty() {
            let messages: Vec<_> = self.errors.into_iter().map(|e| e.message).collect();
            anyhow::bail!("Linear GraphQL error: {}", messages.join("; "));
        }
        self.data.context("Linear response had no data")
    }
}

#[derive(Deserialize)]
struct ProjectData {
    project: ProjectNode,
}

#[derive(Deserialize)]
struct ProjectNode {
    status: ProjectStatusNode,
}

#[derive(Deserialize)]
struct ProjectStatusNode {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(rename = "type", default)]
    status_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectStatusesData {
    project_statuses: Nodes<ProjectStatusNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectUpdateData {
    project_update: Success,
}

#[derive(Deserialize)]
struct Success {
    success: bool,
}

#[derive(Deserialize)]
struct IssuesData {
    issues: Nodes<IssueNode>,
}

#[derive(Deserialize)]
struct IssueNode {
    id: String,
    state: IssueStateNode,
}

#[derive(Deserialize)]
struct IssueStateNode {
    #[serde(rename = "type")]
    state_type: String,
}

#[derive(Deserialize)]
struct Nodes<T> {
    nodes: Vec<T>,
    #[serde(rename = "pageInfo", default)]
    page_info: Option<PageInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_tracker_roundtrip() {
        let tracker = MemoryTracker::new()
            .with_project("p", ProjectState::Planned)
            .with_issue("a", IssueState::Done)
            .with_issue("b", IssueState::Todo);

        assert_eq!(tracker.project_state("p").await.unwrap(), ProjectState::Planned);
        tracker.set_project_state("p", ProjectState::InProgress).await.unwrap();
        assert_eq!(tracker.project_state("p").await.unwrap(), ProjectState::InProgress);
        assert_eq!(tracker.writes(), vec![("p".to_string(), ProjectState::InProgress)]);

        let states = tracker.issue_states(&["b".into(), "a".into()]).await.unwrap();
        assert_eq!(states, vec![IssueState::Todo, IssueState::Done]);
        assert!(tracker.issue_states(&["zzz".into()]).await.is_err());
        assert!(tracker.project_state("missing").await.is_err());
    }

    #[test]
    fn linear_state_types() {
        assert_eq!(issue_state_from_type("completed").unwrap(), IssueState::Done);
        assert_eq!(issue_state_from_type("canceled").unwrap(), IssueState::Canceled);
        assert_eq!(issue_state_from_type("triage").unwrap(), IssueState::Backlog);
        assert!(issue_state_from_type("paused").is_err());
    }

    #[test]
    fn project_status_by_name_then_type() {
        let status = |name: &str| {
            let data: ProjectData = serde_json::from_value(serde_json::json!({
                "project": { "status": { "name": name, "type": "started" } }
            }))
            .unwrap();
            project_state_from_status(&data.project.status).unwrap()
        };
        assert_eq!(status("In Review"), ProjectState::InReview);
        assert_eq!(status("Building"), ProjectState::InProgress);
    }

    #[test]
    fn graphql_errors_surface() {
        let body = r#"{"data":null,"errors":[{"message":"Entity not found"}]}"#;
        let resp: GraphQlResponse<ProjectData> = serde_json::from_str(body).unwrap();
        let err = resp.into_data().err().unwrap();
        assert!(err.to_string().contains("Entity not found"));
    }

    #[test]
    fn api_key_is_required() {
        let err = LinearTracker::from_lookup(|_| None).err().unwrap();
        assert!(err.to_string().contains("LINEAR_API_KEY"));
        assert!(LinearTracker::from_lookup(|_| Some("  ".into())).is_err());

        let tracker = LinearTracker::from_lookup(|key| {
            (key == LINEAR_API_KEY_VAR).then(|| "lin_api_test".to_string())
        })
        .unwrap();
        assert_eq!(tracker.api_key, "lin_api_test");
        assert_eq!(tracker.endpoint, LINEAR_API_URL);
    }

    #[tokio::test]
    async fn poisoned_memory_tracker_keeps_working() {
        let tracker = MemoryTracker::new().with_project("p", ProjectState::Planned);
        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _projects = tracker.projects.lock().unwrap();
            let _issues = tracker.issues.lock().unwrap();
            panic!("writer died mid-update");
        }));
        assert!(poisoned.is_err());
        assert!(tracker.projects.is_poisoned());

        let tracker = tracker
            .with_project("q", ProjectState::Backlog)
            .with_issue("a", IssueState::Done);
        assert_eq!(tracker.project_state("p").await.unwrap(), ProjectState::Planned);
        assert_eq!(tracker.project_state("q").await.unwrap(), ProjectState::Backlog);
        tracker.set_project_state("p", ProjectState::InProgress).await.unwrap();
        assert_eq!(tracker.issue_states(&["a".into()]).await.unwrap(), vec![IssueState::Done]);
        assert_eq!(tracker.writes(), vec![("p".to_string(), ProjectState::InProgress)]);
    }
}
