//! Agent registry, task submission/scheduling with pluggable load-balancing
//! strategies, heartbeat liveness detection, dead-agent task reassignment,
//! and handoff (spec.md §4.7).

use crate::error::{Error, Result};
use crate::kv::KvFacade;
use crate::model::{Agent, AgentStatus, Handoff, Task, TaskStatus};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Agent selection policy for [`AgentCoordinator::schedule_tick`] (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastLoaded,
    PriorityBased,
    CapabilityWeighted,
    Dynamic,
}

/// Options accepted by [`AgentCoordinator::submit_task`].
#[derive(Debug, Clone, Default)]
pub struct SubmitTaskOptions {
    pub deadline: Option<DateTime<Utc>>,
    pub max_attempts: u32,
    pub metadata: std::collections::HashMap<String, serde_json::Value>,
}

/// In-process agent/task/handoff registry plus scheduling logic. Registries
/// live in memory here (spec.md's key layout uses KV hashes for wire
/// persistence; this crate is backend-agnostic, so the in-memory registry
/// is the source of truth and `kv` is used only for the durable event/pubsub
/// surfaces the rest of the core already depends on).
pub struct AgentCoordinator {
    kv: Arc<dyn KvFacade>,
    agents: RwLock<std::collections::HashMap<String, Agent>>,
    tasks: RwLock<std::collections::HashMap<String, Task>>,
    handoffs: RwLock<std::collections::HashMap<String, Handoff>>,
    strategy: LoadBalancingStrategy,
    heartbeat_timeout: Duration,
}

impl AgentCoordinator {
    pub fn new(kv: Arc<dyn KvFacade>, strategy: LoadBalancingStrategy, heartbeat_timeout: Duration) -> Self {
        Self {
            kv,
            agents: RwLock::new(std::collections::HashMap::new()),
            tasks: RwLock::new(std::collections::HashMap::new()),
            handoffs: RwLock::new(std::collections::HashMap::new()),
            strategy,
            heartbeat_timeout,
        }
    }

    pub async fn register_agent(
        &self,
        id: &str,
        agent_type: &str,
        capabilities: HashSet<String>,
        priority: i32,
        max_load: u32,
    ) -> Result<()> {
        let agent = Agent {
            id: id.to_string(),
            agent_type: agent_type.to_string(),
            capabilities,
            priority,
            load: 0,
            max_load,
            status: AgentStatus::Active,
            last_heartbeat: Utc::now(),
            metadata: Default::default(),
            current_sessions: HashSet::new(),
            total_tasks_completed: 0,
            total_tasks_failed: 0,
            average_task_duration_ms: 0.0,
            error_rate: 0.0,
        };
        self.agents.write().await.insert(id.to_string(), agent);
        info!(agent_id = id, agent_type, "agent registered");
        Ok(())
    }

    pub async fn heartbeat(&self, agent_id: &str) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::AgentNotFound {
                id: agent_id.to_string(),
            })?;
        agent.last_heartbeat = Utc::now();
        if agent.status == AgentStatus::Dead {
            agent.status = AgentStatus::Active;
            info!(agent_id, "agent recovered");
        }
        Ok(())
    }

    /// Inserts the task (`status=queued`) and runs a scheduling tick.
    pub async fn submit_task(
        &self,
        task_type: &str,
        priority: i32,
        session_id: &str,
        required_capabilities: HashSet<String>,
        estimated_duration_ms: u64,
        opts: SubmitTaskOptions,
    ) -> Result<String> {
        let task = Task {
            id: format!("task-{}", Uuid::new_v4()),
            task_type: task_type.to_string(),
            priority,
            session_id: session_id.to_string(),
            required_capabilities,
            estimated_duration_ms,
            deadline: opts.deadline,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            attempts: 0,
            max_attempts: if opts.max_attempts == 0 { 3 } else { opts.max_attempts },
            metadata: opts.metadata,
            assigned_agent: None,
            assigned_at: None,
            completed_at: None,
            result: None,
            error: None,
        };
        let task_id = task.id.clone();
        self.tasks.write().await.insert(task_id.clone(), task);
        self.schedule_tick().await?;
        Ok(task_id)
    }

    /// Candidate agents for `task`: `active|idle`, spare capacity, every
    /// required capability present, deadline not yet passed.
    fn candidates<'a>(&self, task: &Task, agents: &'a std::collections::HashMap<String, Agent>) -> Vec<&'a Agent> {
        if let Some(deadline) = task.deadline {
            if Utc::now() > deadline {
                return Vec::new();
            }
        }
        agents
            .values()
            .filter(|a| a.has_capacity())
            .filter(|a| task.required_capabilities.is_subset(&a.capabilities))
            .collect()
    }

    fn pick(&self, task: &Task, candidates: &[&Agent]) -> Option<String> {
        match self.strategy {
            LoadBalancingStrategy::RoundRobin => candidates
                .iter()
                .min_by_key(|a| a.total_tasks_completed)
                .map(|a| a.id.clone()),
            LoadBalancingStrategy::LeastLoaded => candidates
                .iter()
                .min_by(|a, b| a.load_ratio().partial_cmp(&b.load_ratio()).unwrap_or(std::cmp::Ordering::Equal))
                .map(|a| a.id.clone()),
            LoadBalancingStrategy::PriorityBased => candidates
                .iter()
                .max_by_key(|a| a.priority)
                .map(|a| a.id.clone()),
            LoadBalancingStrategy::CapabilityWeighted => candidates
                .iter()
                .max_by(|a, b| {
                    capability_score(a, task)
                        .partial_cmp(&capability_score(b, task))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|a| a.id.clone()),
            LoadBalancingStrategy::Dynamic => candidates
                .iter()
                .max_by(|a, b| {
                    dynamic_score(a, task)
                        .partial_cmp(&dynamic_score(b, task))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|a| a.id.clone()),
        }
    }

    /// Fetch queued tasks high-to-low priority; assign one candidate per
    /// task per the configured strategy.
    pub async fn schedule_tick(&self) -> Result<usize> {
        let mut tasks = self.tasks.write().await;
        let mut agents = self.agents.write().await;

        let mut queued_ids: Vec<String> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .map(|t| t.id.clone())
            .collect();
        queued_ids.sort_by_key(|id| std::cmp::Reverse(tasks[id].priority));

        let mut assigned = 0;
        for task_id in queued_ids {
            let candidates: Vec<String> = {
                let task = &tasks[&task_id];
                let candidate_refs = self.candidates(task, &agents);
                match self.pick(task, &candidate_refs) {
                    Some(id) => vec![id],
                    None => continue,
                }
            };
            let Some(agent_id) = candidates.into_iter().next() else {
                continue;
            };

            let task = tasks.get_mut(&task_id).expect("task exists by id from iteration above");
            let agent = agents.get_mut(&agent_id).expect("agent exists by id from candidate selection above");

            task.status = TaskStatus::Assigned;
            task.assigned_agent = Some(agent_id.clone());
            task.assigned_at = Some(Utc::now());

            agent.load += 1;
            agent.current_sessions.insert(task.session_id.clone());
            if agent.load >= agent.max_load {
                agent.status = AgentStatus::Busy;
            }

            assigned += 1;
            info!(task_id = %task_id, agent_id = %agent_id, "task assigned");
        }

        Ok(assigned)
    }

    /// Decrements load, recomputes the streaming mean duration, reverts
    /// `busy -> active` if capacity freed up, then triggers another tick.
    pub async fn complete_task(&self, task_id: &str, duration_ms: u64, result: Option<serde_json::Value>) -> Result<()> {
        let agent_id = {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(task_id).ok_or_else(|| Error::TaskNotFound { id: task_id.to_string() })?;
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.result = result;
            task.assigned_agent.clone()
        };

        if let Some(agent_id) = agent_id {
            let mut agents = self.agents.write().await;
            if let Some(agent) = agents.get_mut(&agent_id) {
                agent.load = agent.load.saturating_sub(1);
                let n = agent.total_tasks_completed as f64;
                agent.average_task_duration_ms = (agent.average_task_duration_ms * n + duration_ms as f64) / (n + 1.0);
                agent.total_tasks_completed += 1;
                if agent.load < agent.max_load && agent.status == AgentStatus::Busy {
                    agent.status = AgentStatus::Active;
                }
            }
        }

        self.schedule_tick().await?;
        Ok(())
    }

    /// Decrements load, recomputes `errorRate`. Preserves the source's
    /// off-by-one: `attempts` always increments on failure, and the retry
    /// path restores `status=queued` without decrementing `attempts` (spec.md
    /// §9 Open Question #1) — a task only becomes terminally `failed` once
    /// `attempts >= max_attempts` is observed on a *subsequent* failure.
    pub async fn fail_task(&self, task_id: &str, error: &str) -> Result<()> {
        let agent_id = {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(task_id).ok_or_else(|| Error::TaskNotFound { id: task_id.to_string() })?;
            task.attempts += 1;
            task.error = Some(error.to_string());

            if task.attempts < task.max_attempts {
                task.status = TaskStatus::Queued;
                task.assigned_agent.take()
            } else {
                task.status = TaskStatus::Failed;
                task.assigned_agent.clone()
            }
        };

        if let Some(agent_id) = agent_id {
            let mut agents = self.agents.write().await;
            if let Some(agent) = agents.get_mut(&agent_id) {
                agent.load = agent.load.saturating_sub(1);
                let n = (agent.total_tasks_completed + agent.total_tasks_failed) as f64;
                agent.error_rate = (agent.error_rate * n + 1.0) / (n + 1.0);
                agent.total_tasks_failed += 1;
                if agent.status == AgentStatus::Busy && agent.load < agent.max_load {
                    agent.status = AgentStatus::Active;
                }
            }
        }

        self.schedule_tick().await?;
        Ok(())
    }

    /// Scans all agents; marks any with a stale heartbeat `dead`, reassigns
    /// their `assigned` tasks back to `queued`, and publishes a recovery
    /// ping. Returns the ids of agents newly marked dead this tick.
    pub async fn detect_dead_agents(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut newly_dead = Vec::new();

        let dead_ids: Vec<String> = {
            let mut agents = self.agents.write().await;
            let mut dead = Vec::new();
            for agent in agents.values_mut() {
                if agent.status == AgentStatus::Dead {
                    continue;
                }
                let idle = now.signed_duration_since(agent.last_heartbeat);
                if idle.to_std().unwrap_or(Duration::ZERO) > self.heartbeat_timeout {
                    agent.status = AgentStatus::Dead;
                    dead.push(agent.id.clone());
                }
            }
            dead
        };

        for agent_id in &dead_ids {
            let mut tasks = self.tasks.write().await;
            for task in tasks.values_mut() {
                if task.assigned_agent.as_deref() == Some(agent_id.as_str())
                    && task.status == TaskStatus::Assigned
                {
                    task.status = TaskStatus::Queued;
                    task.assigned_agent = None;
                    task.attempts += 1;
                }
            }
            drop(tasks);

            let channel = crate::kv::Channels::agent_recovery(agent_id);
            let _ = self.kv.publish(&channel, "{\"type\":\"recovery_ping\"}").await;
            warn!(agent_id, "agent marked dead, tasks reassigned to queue");
            newly_dead.push(agent_id.clone());
        }

        if !newly_dead.is_empty() {
            self.schedule_tick().await?;
        }

        Ok(newly_dead)
    }

    /// Transfers `session_id` from `from_agent`'s set to `to_agent`'s set,
    /// adjusting both loads/statuses, and records a handoff document.
    pub async fn initiate_handoff(
        &self,
        session_id: &str,
        from_agent: &str,
        to_agent: &str,
        reason: &str,
        context: serde_json::Value,
        priority: i32,
    ) -> Result<String> {
        let mut agents = self.agents.write().await;
        {
            let to = agents
                .get(to_agent)
                .ok_or_else(|| Error::AgentNotFound { id: to_agent.to_string() })?;
            if !to.has_capacity() {
                return Err(Error::Policy {
                    reason: format!("agent {to_agent} has no spare capacity for handoff"),
                });
            }
        }

        if let Some(from) = agents.get_mut(from_agent) {
            from.current_sessions.remove(session_id);
            from.load = from.load.saturating_sub(1);
            if from.status == AgentStatus::Busy && from.load < from.max_load {
                from.status = AgentStatus::Active;
            }
        }
        if let Some(to) = agents.get_mut(to_agent) {
            to.current_sessions.insert(session_id.to_string());
            to.load += 1;
            if to.load >= to.max_load {
                to.status = AgentStatus::Busy;
            }
        }
        drop(agents);

        let handoff = Handoff {
            id: format!("handoff-{}", Uuid::new_v4()),
            session_id: session_id.to_string(),
            from_agent: from_agent.to_string(),
            to_agent: to_agent.to_string(),
            reason: reason.to_string(),
            context,
            timestamp: Utc::now(),
            priority,
            estimated_duration_ms: None,
        };
        let id = handoff.id.clone();
        self.handoffs.write().await.insert(id.clone(), handoff);
        info!(session_id, from_agent, to_agent, "handoff recorded");
        Ok(id)
    }

    pub async fn queue_depth(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .count()
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<Agent> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().await.get(task_id).cloned()
    }
}

fn capability_score(agent: &Agent, task: &Task) -> f64 {
    let matching = agent.capabilities.intersection(&task.required_capabilities).count();
    let extra = agent.capabilities.difference(&task.required_capabilities).count();
    matching as f64 * 2.0 + extra as f64 * 0.5
}

/// `0.3*(1-load/max) + 0.2*(priority/10) + 0.2*(1-errorRate) + 0.15*speed + 0.15*capScore/10`.
fn dynamic_score(agent: &Agent, task: &Task) -> f64 {
    let speed = if agent.average_task_duration_ms <= 0.0 {
        1.0
    } else {
        (1000.0 / agent.average_task_duration_ms).min(1.0)
    };
    0.3 * (1.0 - agent.load_ratio())
        + 0.2 * (agent.priority as f64 / 10.0)
        + 0.2 * (1.0 - agent.error_rate)
        + 0.15 * speed
        + 0.15 * (capability_score(agent, task) / 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::in_memory_kv;

    fn coordinator(strategy: LoadBalancingStrategy, heartbeat_timeout: Duration) -> AgentCoordinator {
        AgentCoordinator::new(in_memory_kv(), strategy, heartbeat_timeout)
    }

    /// spec.md §8 scenario 2: dead agent reassignment.
    #[tokio::test]
    async fn dead_agent_reassigns_tasks_and_increments_attempts_once() {
        let coord = coordinator(LoadBalancingStrategy::LeastLoaded, Duration::from_millis(50));
        coord
            .register_agent("A1", "worker", HashSet::new(), 0, 2)
            .await
            .unwrap();

        let t1 = coord
            .submit_task("build", 1, "sess-1", HashSet::new(), 100, SubmitTaskOptions::default())
            .await
            .unwrap();
        let t2 = coord
            .submit_task("build", 1, "sess-1", HashSet::new(), 100, SubmitTaskOptions::default())
            .await
            .unwrap();

        let task1 = coord.get_task(&t1).await.unwrap();
        let task2 = coord.get_task(&t2).await.unwrap();
        assert_eq!(task1.status, TaskStatus::Assigned);
        assert_eq!(task2.status, TaskStatus::Assigned);
        assert_eq!(coord.get_agent("A1").await.unwrap().load, 2);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let newly_dead = coord.detect_dead_agents().await.unwrap();
        assert_eq!(newly_dead, vec!["A1".to_string()]);
        assert_eq!(coord.get_agent("A1").await.unwrap().status, AgentStatus::Dead);

        let task1 = coord.get_task(&t1).await.unwrap();
        let task2 = coord.get_task(&t2).await.unwrap();
        assert_eq!(task1.status, TaskStatus::Queued);
        assert_eq!(task1.attempts, 1);
        assert_eq!(task2.status, TaskStatus::Queued);
        assert_eq!(task2.attempts, 1);

        // a second tick must not mark A1 dead again or re-bump attempts.
        let newly_dead_again = coord.detect_dead_agents().await.unwrap();
        assert!(newly_dead_again.is_empty());

        coord
            .register_agent("A2", "worker", HashSet::new(), 0, 2)
            .await
            .unwrap();
        coord.schedule_tick().await.unwrap();

        let task1 = coord.get_task(&t1).await.unwrap();
        let task2 = coord.get_task(&t2).await.unwrap();
        assert_eq!(task1.assigned_agent.as_deref(), Some("A2"));
        assert_eq!(task2.assigned_agent.as_deref(), Some("A2"));
        assert_eq!(coord.get_agent("A2").await.unwrap().load, 2);
    }

    #[tokio::test]
    async fn scheduler_never_selects_agent_at_capacity() {
        let coord = coordinator(LoadBalancingStrategy::LeastLoaded, Duration::from_secs(30));
        coord
            .register_agent("A1", "worker", HashSet::new(), 0, 1)
            .await
            .unwrap();
        let t1 = coord
            .submit_task("build", 1, "sess-1", HashSet::new(), 100, SubmitTaskOptions::default())
            .await
            .unwrap();
        assert_eq!(coord.get_task(&t1).await.unwrap().status, TaskStatus::Assigned);
        assert_eq!(coord.get_agent("A1").await.unwrap().status, AgentStatus::Busy);

        let t2 = coord
            .submit_task("build", 1, "sess-1", HashSet::new(), 100, SubmitTaskOptions::default())
            .await
            .unwrap();
        assert_eq!(coord.get_task(&t2).await.unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn scheduler_never_selects_task_with_unfulfilled_capabilities() {
        let coord = coordinator(LoadBalancingStrategy::LeastLoaded, Duration::from_secs(30));
        coord
            .register_agent("A1", "worker", HashSet::new(), 0, 5)
            .await
            .unwrap();

        let mut caps = HashSet::new();
        caps.insert("gpu".to_string());
        let t1 = coord
            .submit_task("build", 1, "sess-1", caps, 100, SubmitTaskOptions::default())
            .await
            .unwrap();
        assert_eq!(coord.get_task(&t1).await.unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn fail_task_requeues_without_decrementing_attempts_until_cap() {
        let coord = coordinator(LoadBalancingStrategy::LeastLoaded, Duration::from_secs(30));
        coord
            .register_agent("A1", "worker", HashSet::new(), 0, 1)
            .await
            .unwrap();
        let t1 = coord
            .submit_task(
                "build",
                1,
                "sess-1",
                HashSet::new(),
                100,
                SubmitTaskOptions {
                    max_attempts: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(coord.get_task(&t1).await.unwrap().status, TaskStatus::Assigned);

        coord.fail_task(&t1, "boom").await.unwrap();
        let task = coord.get_task(&t1).await.unwrap();
        assert_eq!(task.attempts, 1);
        assert_eq!(task.status, TaskStatus::Queued);

        // re-assign then fail again: attempts reaches max_attempts and the
        // task fails terminally (spec.md §9 Open Question #1).
        coord.schedule_tick().await.unwrap();
        coord.fail_task(&t1, "boom again").await.unwrap();
        let task = coord.get_task(&t1).await.unwrap();
        assert_eq!(task.attempts, 2);
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn handoff_transfers_session_and_adjusts_load() {
        let coord = coordinator(LoadBalancingStrategy::LeastLoaded, Duration::from_secs(30));
        coord
            .register_agent("A1", "worker", HashSet::new(), 0, 2)
            .await
            .unwrap();
        coord
            .register_agent("A2", "worker", HashSet::new(), 0, 2)
            .await
            .unwrap();

        coord
            .submit_task("build", 1, "sess-1", HashSet::new(), 100, SubmitTaskOptions::default())
            .await
            .unwrap();
        assert_eq!(coord.get_agent("A1").await.unwrap().load, 1);

        coord
            .initiate_handoff("sess-1", "A1", "A2", "rebalance", serde_json::json!({}), 0)
            .await
            .unwrap();

        assert_eq!(coord.get_agent("A1").await.unwrap().load, 0);
        assert_eq!(coord.get_agent("A2").await.unwrap().load, 1);
        assert!(coord.get_agent("A2").await.unwrap().current_sessions.contains("sess-1"));
    }
}
