//! Task prediction service
//!
//! All three analyses read only the task/dependency subgraph: assignee
//! recommendation scores users on five weighted factors, ETA prediction
//! derives a duration distribution from recent same-type completions, and
//! critical-path analysis ranks tasks by how much work they hold up. The
//! critical-path traversal is one-hop by construction (it aggregates over
//! the edge list, never recurses), so dependency cycles cannot loop it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::domain::graph::{
    DependencyProperties, EdgeType, GraphNode, GraphStore, NodeProperties, NodeType,
};
use crate::domain::prediction::types::{
    AssigneeCandidate, AssigneeRecommendation, CriticalPathEntry, EtaPrediction,
};
use crate::error::{Error, Result};

const WEIGHT_AFFINITY: f64 = 0.30;
const WEIGHT_WORKLOAD: f64 = 0.25;
const WEIGHT_ROLE: f64 = 0.20;
const WEIGHT_PERFORMANCE: f64 = 0.15;
const WEIGHT_AVAILABILITY: f64 = 0.10;

/// Placeholder until scheduling data is wired in
const AVAILABILITY_PLACEHOLDER: f64 = 0.8;

/// Lookback for completion history
const HISTORY_DAYS: i64 = 90;
/// Completions of a type at which affinity saturates
const AFFINITY_CAP: usize = 10;
/// Active tasks at which workload bottoms out
const WORKLOAD_CAP: usize = 5;
/// Maximum historical durations sampled for an ETA
const ETA_SAMPLE_CAP: usize = 100;
/// Delay assumed for an incomplete predecessor with no usable due date
const DEPENDENCY_FALLBACK_HOURS: i64 = 4;
/// Critical-path result size
const CRITICAL_PATH_LIMIT: usize = 20;
const BLOCKED_HOURS_CAP: f64 = 100.0;

/// Assignee recommendation, ETA prediction, and critical-path analysis
pub struct TaskPredictionService {
    store: Arc<dyn GraphStore>,
}

/// Task fields lifted out of the node payload
#[derive(Debug, Clone)]
struct TaskFacts {
    node_id: String,
    title: String,
    task_type: String,
    status: String,
    required_role: Option<String>,
    assigned_to: Option<String>,
    due_date: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TaskFacts {
    fn from_node(node: &GraphNode) -> Option<Self> {
        let props = match NodeProperties::from_json(&node.properties_json) {
            Ok(props) => props,
            Err(e) => {
                warn!(node_id = %node.node_id, error = %e, "Skipping task with malformed payload");
                return None;
            }
        };
        match props {
            NodeProperties::Task {
                title,
                task_type,
                status,
                required_role,
                assigned_to,
                due_date,
                completed_at,
                ..
            } => Some(Self {
                node_id: node.node_id.clone(),
                title,
                task_type,
                status,
                required_role,
                assigned_to,
                due_date,
                completed_at,
                created_at: node.source_created_at,
            }),
            _ => None,
        }
    }

    fn is_terminal(&self) -> bool {
        self.status == "completed" || self.status == "cancelled"
    }

    fn duration_minutes(&self) -> Option<f64> {
        let completed_at = self.completed_at?;
        let minutes = (completed_at - self.created_at).num_minutes();
        (minutes > 0).then_some(minutes as f64)
    }
}

#[derive(Debug, Clone)]
struct UserFacts {
    user_id: String,
    display_name: String,
    role: String,
    active: bool,
}

impl UserFacts {
    fn from_node(node: &GraphNode) -> Option<Self> {
        match NodeProperties::from_json(&node.properties_json).ok()? {
            NodeProperties::User {
                display_name,
                role,
                active,
            } => Some(Self {
                user_id: node.source_entity_id.clone(),
                display_name,
                role,
                active,
            }),
            _ => None,
        }
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

impl TaskPredictionService {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    async fn load_tasks(&self, site_id: &str) -> Result<Vec<TaskFacts>> {
        let nodes = self
            .store
            .get_nodes_by_type(site_id, NodeType::Task, true)
            .await?;
        Ok(nodes.iter().filter_map(TaskFacts::from_node).collect())
    }

    async fn get_task(&self, task_node_id: &str) -> Result<(GraphNode, TaskFacts)> {
        let node = self
            .store
            .get_node(task_node_id)
            .await?
            .ok_or_else(|| Error::NodeNotFound(task_node_id.to_string()))?;
        let facts = TaskFacts::from_node(&node).ok_or_else(|| {
            Error::InvalidInput(format!("node '{}' has no task payload", task_node_id))
        })?;
        Ok((node, facts))
    }

    /// Recommend who should take a task, with up to 3 alternates
    pub async fn recommend_assignee(
        &self,
        task_node_id: &str,
    ) -> Result<AssigneeRecommendation> {
        let (node, task) = self.get_task(task_node_id).await?;
        let users: Vec<UserFacts> = self
            .store
            .get_nodes_by_type(&node.site_id, NodeType::User, true)
            .await?
            .iter()
            .filter_map(UserFacts::from_node)
            .collect();
        let tasks = self.load_tasks(&node.site_id).await?;

        let cutoff = Utc::now() - Duration::days(HISTORY_DAYS);

        // Cohort-wide mean completion time, the reference for speed scoring
        let cohort_durations: Vec<f64> = tasks
            .iter()
            .filter(|t| t.completed_at.is_some_and(|c| c >= cutoff))
            .filter_map(TaskFacts::duration_minutes)
            .collect();
        let (cohort_mean, _) = mean_std(&cohort_durations);

        let mut candidates: Vec<AssigneeCandidate> = users
            .iter()
            .map(|user| self.score_candidate(user, &task, &tasks, cutoff, cohort_mean))
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut iter = candidates.into_iter();
        let recommended = iter.next();
        let alternates: Vec<AssigneeCandidate> = iter.take(3).collect();

        debug!(
            task = %task_node_id,
            recommended = recommended.as_ref().map(|c| c.user_id.as_str()).unwrap_or("none"),
            "Assignee recommendation computed"
        );
        Ok(AssigneeRecommendation {
            task_node_id: task_node_id.to_string(),
            recommended,
            alternates,
        })
    }

    fn score_candidate(
        &self,
        user: &UserFacts,
        task: &TaskFacts,
        tasks: &[TaskFacts],
        cutoff: DateTime<Utc>,
        cohort_mean: f64,
    ) -> AssigneeCandidate {
        if !user.active {
            return AssigneeCandidate {
                user_id: user.user_id.clone(),
                display_name: user.display_name.clone(),
                score: 0.0,
                factors: BTreeMap::new(),
                reasoning: "inactive user".to_string(),
            };
        }

        let completed_by_user: Vec<&TaskFacts> = tasks
            .iter()
            .filter(|t| {
                t.assigned_to.as_deref() == Some(user.user_id.as_str())
                    && t.completed_at.is_some_and(|c| c >= cutoff)
            })
            .collect();

        let same_type_completions = completed_by_user
            .iter()
            .filter(|t| t.task_type == task.task_type)
            .count();
        let affinity = (same_type_completions.min(AFFINITY_CAP)) as f64 / AFFINITY_CAP as f64;

        let active_count = tasks
            .iter()
            .filter(|t| {
                t.assigned_to.as_deref() == Some(user.user_id.as_str()) && !t.is_terminal()
            })
            .count();
        let workload = 1.0 - (active_count.min(WORKLOAD_CAP)) as f64 / WORKLOAD_CAP as f64;

        let role_match = match &task.required_role {
            None => 0.5,
            Some(required) => {
                let required = required.to_lowercase();
                let role = user.role.to_lowercase();
                if role == required {
                    1.0
                } else if role.contains(&required) || required.contains(&role) {
                    0.7
                } else {
                    0.2
                }
            }
        };

        let user_durations: Vec<f64> = completed_by_user
            .iter()
            .filter_map(|t| t.duration_minutes())
            .collect();
        let (user_mean, _) = mean_std(&user_durations);
        let speed = if user_mean > 0.0 && cohort_mean > 0.0 {
            (cohort_mean / user_mean).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let completion_volume =
            (completed_by_user.len().min(AFFINITY_CAP)) as f64 / AFFINITY_CAP as f64;
        let performance = 0.5 * completion_volume + 0.5 * speed;

        let factors = BTreeMap::from([
            ("task_type_affinity".to_string(), affinity),
            ("inverse_workload".to_string(), workload),
            ("role_match".to_string(), role_match),
            ("performance".to_string(), performance),
            ("availability".to_string(), AVAILABILITY_PLACEHOLDER),
        ]);

        let score = (affinity * WEIGHT_AFFINITY
            + workload * WEIGHT_WORKLOAD
            + role_match * WEIGHT_ROLE
            + performance * WEIGHT_PERFORMANCE
            + AVAILABILITY_PLACEHOLDER * WEIGHT_AVAILABILITY)
            .clamp(0.0, 1.0);

        AssigneeCandidate {
            user_id: user.user_id.clone(),
            display_name: user.display_name.clone(),
            score,
            reasoning: Self::reasoning(&[
                ("experienced with this task type", affinity * WEIGHT_AFFINITY),
                ("light current workload", workload * WEIGHT_WORKLOAD),
                ("role fits the requirement", role_match * WEIGHT_ROLE),
                ("strong completion record", performance * WEIGHT_PERFORMANCE),
                (
                    "generally available",
                    AVAILABILITY_PLACEHOLDER * WEIGHT_AVAILABILITY,
                ),
            ]),
            factors,
        }
    }

    /// Top-2 contributing factors, in descending weighted order
    fn reasoning(contributions: &[(&str, f64)]) -> String {
        let mut ranked: Vec<&(&str, f64)> = contributions.iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
            .iter()
            .take(2)
            .map(|(label, _)| *label)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Predict when a task will be done, with a confidence interval
    pub async fn predict_eta(&self, task_node_id: &str) -> Result<EtaPrediction> {
        let (node, task) = self.get_task(task_node_id).await?;
        let tasks = self.load_tasks(&node.site_id).await?;
        let now = Utc::now();
        let cutoff = now - Duration::days(HISTORY_DAYS);

        // Most recent same-type completions, capped
        let mut history: Vec<(DateTime<Utc>, f64)> = tasks
            .iter()
            .filter(|t| t.task_type == task.task_type)
            .filter_map(|t| {
                let completed_at = t.completed_at.filter(|c| *c >= cutoff)?;
                Some((completed_at, t.duration_minutes()?))
            })
            .collect();
        history.sort_by(|a, b| b.0.cmp(&a.0));
        history.truncate(ETA_SAMPLE_CAP);
        let durations: Vec<f64> = history.iter().map(|(_, d)| *d).collect();

        let (duration, confidence, interval_low, interval_high) = if durations.is_empty() {
            (
                Duration::hours(4),
                0.3,
                Duration::hours(1),
                Duration::hours(8),
            )
        } else {
            let (mean, std) = mean_std(&durations);
            let confidence =
                (0.5 + durations.len() as f64 / 100.0 - (std / mean) / 2.0).clamp(0.3, 0.9);
            let half_width = 1.96 * std;
            (
                Duration::minutes(mean as i64),
                confidence,
                Duration::minutes((mean - half_width).max(0.0) as i64),
                Duration::minutes((mean + half_width) as i64),
            )
        };

        // Incomplete predecessors push the start out
        let dependencies = self
            .store
            .get_outgoing_edges(task_node_id, Some(EdgeType::DependsOn), true)
            .await?;
        let by_node_id: HashMap<&str, &TaskFacts> =
            tasks.iter().map(|t| (t.node_id.as_str(), t)).collect();

        let mut delay = Duration::zero();
        let mut incomplete = 0usize;
        let mut blocked = false;
        for edge in &dependencies {
            let Some(predecessor) = by_node_id.get(edge.target_node_id.as_str()) else {
                continue;
            };
            if predecessor.is_terminal() {
                continue;
            }
            incomplete += 1;

            let blocking = edge
                .properties_json
                .as_deref()
                .and_then(|json| DependencyProperties::from_json(json).ok())
                .map(|props| props.blocking)
                .unwrap_or(true);
            blocked = blocked || blocking;

            delay += match predecessor.due_date.filter(|due| *due > now) {
                Some(due) => due - now,
                None => Duration::hours(DEPENDENCY_FALLBACK_HOURS),
            };
        }

        let mut risk_factors = Vec::new();
        if blocked {
            risk_factors.push("blocked by an incomplete dependency".to_string());
        }
        if incomplete > 0 {
            risk_factors.push(format!("waiting on {} dependency(ies)", incomplete));
        }
        if task.due_date.is_some_and(|due| due < now) {
            risk_factors.push("already past due".to_string());
        }
        if durations.len() < 5 {
            risk_factors.push("sparse completion history for this task type".to_string());
        }
        if task.assigned_to.is_none() {
            risk_factors.push("unassigned".to_string());
        }

        Ok(EtaPrediction {
            task_node_id: task_node_id.to_string(),
            predicted_duration: duration,
            predicted_completion: now + delay + duration,
            confidence,
            interval_low,
            interval_high,
            risk_factors,
            sample_size: durations.len(),
        })
    }

    /// Rank non-terminal tasks by how much work they hold up.
    /// One-hop aggregation over the dependency edge list; no recursion.
    pub async fn critical_path(&self, site_id: &str) -> Result<Vec<CriticalPathEntry>> {
        let tasks = self.load_tasks(site_id).await?;
        let by_node_id: HashMap<&str, &TaskFacts> =
            tasks.iter().map(|t| (t.node_id.as_str(), t)).collect();

        let edges = self
            .store
            .get_edges_by_type(site_id, EdgeType::DependsOn, true)
            .await?;

        // dependent -> depends_on: the target is the blocker
        let mut dependent_counts: HashMap<&str, usize> = HashMap::new();
        let mut blocked_hours: HashMap<&str, f64> = HashMap::new();
        let now = Utc::now();

        for edge in &edges {
            let Some(blocker) = by_node_id.get(edge.target_node_id.as_str()) else {
                continue;
            };
            let Some(dependent) = by_node_id.get(edge.source_node_id.as_str()) else {
                continue;
            };
            if blocker.is_terminal() || dependent.is_terminal() {
                continue;
            }

            *dependent_counts.entry(blocker.node_id.as_str()).or_default() += 1;
            if let Some(due) = dependent.due_date {
                let overdue = (now - due).num_minutes() as f64 / 60.0;
                if overdue > 0.0 {
                    *blocked_hours.entry(blocker.node_id.as_str()).or_default() += overdue;
                }
            }
        }

        let mut entries: Vec<CriticalPathEntry> = tasks
            .iter()
            .filter(|t| !t.is_terminal())
            .filter_map(|t| {
                let dependent_count =
                    dependent_counts.get(t.node_id.as_str()).copied().unwrap_or(0);
                let hours = blocked_hours.get(t.node_id.as_str()).copied().unwrap_or(0.0);
                if dependent_count == 0 && hours <= 0.0 {
                    return None;
                }
                Some(CriticalPathEntry {
                    task_node_id: t.node_id.clone(),
                    title: t.title.clone(),
                    dependent_count,
                    blocked_hours: hours,
                    impact_score: 0.3 * dependent_count as f64
                        + 0.01 * hours.min(BLOCKED_HOURS_CAP),
                })
            })
            .collect();

        entries.sort_by(|a, b| {
            b.impact_score
                .partial_cmp(&a.impact_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        entries.truncate(CRITICAL_PATH_LIMIT);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::GraphEdge;
    use crate::infrastructure::graph::SqliteGraphStore;
    use crate::storage::migrations::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> (Arc<SqliteGraphStore>, TaskPredictionService) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool");
        run_migrations(&pool).await.unwrap();
        let store = Arc::new(SqliteGraphStore::new(pool));
        let service = TaskPredictionService::new(store.clone());
        (store, service)
    }

    fn task_node(
        id: &str,
        task_type: &str,
        status: &str,
        assigned_to: Option<&str>,
        required_role: Option<&str>,
        due_date: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    ) -> GraphNode {
        let props = NodeProperties::Task {
            title: format!("Task {}", id),
            task_type: task_type.to_string(),
            status: status.to_string(),
            priority: 0,
            required_role: required_role.map(str::to_string),
            assigned_to: assigned_to.map(str::to_string),
            due_date,
            estimated_minutes: None,
            completed_at,
        };
        GraphNode::new(
            "s-1",
            NodeType::Task,
            id,
            format!("Task {}", id),
            created_at,
            created_at,
            props.to_json().unwrap(),
        )
    }

    fn user_node(id: &str, role: &str, active: bool) -> GraphNode {
        let now = Utc::now();
        let props = NodeProperties::User {
            display_name: format!("User {}", id),
            role: role.to_string(),
            active,
        };
        GraphNode::new("s-1", NodeType::User, id, format!("User {}", id), now, now,
            props.to_json().unwrap())
    }

    fn depends_on(source: &str, target: &str, blocking: bool) -> GraphEdge {
        let props = DependencyProperties {
            dependency_type: "finish_to_start".to_string(),
            blocking,
        };
        GraphEdge::new(
            "s-1",
            EdgeType::DependsOn,
            format!("task:{}", source),
            format!("task:{}", target),
            Utc::now(),
        )
        .with_properties(props.to_json().unwrap())
    }

    /// Six defoliation tasks completed by u-exp over the last month
    async fn seed_history(store: &Arc<SqliteGraphStore>) {
        let mut nodes = Vec::new();
        for i in 0..6 {
            let created = Utc::now() - Duration::days(20 + i as i64);
            nodes.push(task_node(
                &format!("t-hist-{}", i),
                "defoliation",
                "completed",
                Some("u-exp"),
                None,
                None,
                created,
                Some(created + Duration::hours(2)),
            ));
        }
        store.upsert_nodes(&nodes).await.unwrap();
    }

    #[tokio::test]
    async fn test_recommend_prefers_experienced_available_user() {
        let (store, service) = setup().await;
        seed_history(&store).await;

        let mut nodes = vec![
            user_node("u-exp", "cultivator", true),
            user_node("u-busy", "trimmer", true),
            task_node(
                "t-new",
                "defoliation",
                "todo",
                None,
                Some("cultivator"),
                None,
                Utc::now(),
                None,
            ),
        ];
        // u-busy is saturated with open work
        for i in 0..5 {
            nodes.push(task_node(
                &format!("t-busy-{}", i),
                "trimming",
                "in_progress",
                Some("u-busy"),
                None,
                None,
                Utc::now() - Duration::days(1),
                None,
            ));
        }
        store.upsert_nodes(&nodes).await.unwrap();

        let recommendation = service.recommend_assignee("task:t-new").await.unwrap();
        let top = recommendation.recommended.unwrap();
        assert_eq!(top.user_id, "u-exp");
        assert!(top.score > 0.6, "score was {}", top.score);
        assert!(top.factors["task_type_affinity"] >= 0.6);
        assert_eq!(recommendation.alternates.len(), 1);
        assert_eq!(recommendation.alternates[0].user_id, "u-busy");
    }

    #[tokio::test]
    async fn test_inactive_user_scores_zero() {
        let (store, service) = setup().await;
        seed_history(&store).await;
        store
            .upsert_nodes(&[
                user_node("u-exp", "cultivator", false),
                user_node("u-okay", "cultivator", true),
                task_node(
                    "t-new",
                    "defoliation",
                    "todo",
                    None,
                    None,
                    None,
                    Utc::now(),
                    None,
                ),
            ])
            .await
            .unwrap();

        let recommendation = service.recommend_assignee("task:t-new").await.unwrap();
        let top = recommendation.recommended.unwrap();
        assert_eq!(top.user_id, "u-okay");

        let inactive = &recommendation.alternates[0];
        assert_eq!(inactive.user_id, "u-exp");
        assert_eq!(inactive.score, 0.0);
    }

    #[tokio::test]
    async fn test_eta_without_history_uses_defaults() {
        let (store, service) = setup().await;
        store
            .upsert_nodes(&[task_node(
                "t-new",
                "pruning",
                "todo",
                None,
                None,
                None,
                Utc::now(),
                None,
            )])
            .await
            .unwrap();

        let eta = service.predict_eta("task:t-new").await.unwrap();
        assert_eq!(eta.predicted_duration, Duration::hours(4));
        assert_eq!(eta.confidence, 0.3);
        assert_eq!(eta.interval_low, Duration::hours(1));
        assert_eq!(eta.interval_high, Duration::hours(8));
        assert_eq!(eta.sample_size, 0);
        assert!(eta
            .risk_factors
            .iter()
            .any(|r| r.contains("sparse completion history")));
        assert!(eta.risk_factors.iter().any(|r| r == "unassigned"));
    }

    #[tokio::test]
    async fn test_eta_with_uniform_history() {
        let (store, service) = setup().await;
        let mut nodes = Vec::new();
        for i in 0..10 {
            let created = Utc::now() - Duration::days(10 + i as i64);
            nodes.push(task_node(
                &format!("t-hist-{}", i),
                "pruning",
                "completed",
                Some("u-1"),
                None,
                None,
                created,
                Some(created + Duration::hours(2)),
            ));
        }
        nodes.push(task_node(
            "t-new",
            "pruning",
            "todo",
            Some("u-1"),
            None,
            None,
            Utc::now(),
            None,
        ));
        store.upsert_nodes(&nodes).await.unwrap();

        let eta = service.predict_eta("task:t-new").await.unwrap();
        assert_eq!(eta.sample_size, 10);
        assert_eq!(eta.predicted_duration, Duration::hours(2));
        // Zero spread: confidence is count-driven, interval collapses
        assert!((eta.confidence - 0.6).abs() < 1e-9);
        assert_eq!(eta.interval_low, eta.interval_high);
        assert!(eta.risk_factors.is_empty());
    }

    #[tokio::test]
    async fn test_eta_adds_dependency_delay() {
        let (store, service) = setup().await;
        let due = Utc::now() + Duration::hours(6);
        store
            .upsert_nodes(&[
                task_node("t-pre", "mixing", "in_progress", None, None, Some(due),
                    Utc::now() - Duration::days(1), None),
                task_node("t-new", "pruning", "todo", Some("u-1"), None, None, Utc::now(), None),
            ])
            .await
            .unwrap();
        store
            .upsert_edges(&[depends_on("t-new", "t-pre", true)])
            .await
            .unwrap();

        let eta = service.predict_eta("task:t-new").await.unwrap();

        // 4h default duration + ~6h waiting on the predecessor
        let lead_time = eta.predicted_completion - Utc::now();
        assert!(lead_time > Duration::hours(9) && lead_time <= Duration::hours(10));
        assert!(eta
            .risk_factors
            .iter()
            .any(|r| r.contains("blocked by an incomplete dependency")));
        assert!(eta.risk_factors.iter().any(|r| r.contains("waiting on 1")));
    }

    #[tokio::test]
    async fn test_critical_path_impact_from_dependent_count() {
        let (store, service) = setup().await;
        let now = Utc::now();
        store
            .upsert_nodes(&[
                task_node("t-root", "mixing", "todo", None, None, None, now, None),
                task_node("t-a", "pruning", "todo", None, None, None, now, None),
                task_node("t-b", "pruning", "todo", None, None, None, now, None),
                task_node("t-c", "pruning", "todo", None, None, None, now, None),
                task_node("t-done", "pruning", "completed", None, None, None, now,
                    Some(now)),
            ])
            .await
            .unwrap();
        store
            .upsert_edges(&[
                depends_on("t-a", "t-root", true),
                depends_on("t-b", "t-root", true),
                depends_on("t-c", "t-root", true),
                // Terminal dependents do not count
                depends_on("t-done", "t-root", true),
            ])
            .await
            .unwrap();

        let entries = service.critical_path("s-1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task_node_id, "task:t-root");
        assert_eq!(entries[0].dependent_count, 3);
        assert!((entries[0].impact_score - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_critical_path_caps_blocked_hours() {
        let (store, service) = setup().await;
        let now = Utc::now();
        store
            .upsert_nodes(&[
                task_node("t-root", "mixing", "todo", None, None, None, now, None),
                // Dependent overdue by ~500 hours
                task_node("t-late", "pruning", "todo", None, None,
                    Some(now - Duration::hours(500)), now - Duration::days(30), None),
            ])
            .await
            .unwrap();
        store
            .upsert_edges(&[depends_on("t-late", "t-root", true)])
            .await
            .unwrap();

        let entries = service.critical_path("s-1").await.unwrap();
        let root = entries
            .iter()
            .find(|e| e.task_node_id == "task:t-root")
            .unwrap();
        assert_eq!(root.dependent_count, 1);
        // 0.3 x 1 + 0.01 x min(500, 100)
        assert!((root.impact_score - 1.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_cyclic_dependencies_do_not_loop() {
        let (store, service) = setup().await;
        let now = Utc::now();
        store
            .upsert_nodes(&[
                task_node("t-x", "mixing", "todo", None, None, None, now, None),
                task_node("t-y", "mixing", "todo", None, None, None, now, None),
            ])
            .await
            .unwrap();
        store
            .upsert_edges(&[
                depends_on("t-x", "t-y", true),
                depends_on("t-y", "t-x", true),
            ])
            .await
            .unwrap();

        let entries = service.critical_path("s-1").await.unwrap();
        assert_eq!(entries.len(), 2);
        for entry in entries {
            assert_eq!(entry.dependent_count, 1);
            assert!((entry.impact_score - 0.3).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_missing_task_errors() {
        let (_store, service) = setup().await;
        let err = service.predict_eta("task:nope").await.unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
    }
}
