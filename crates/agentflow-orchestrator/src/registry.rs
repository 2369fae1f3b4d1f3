//! Agent Registry (spec §4.4): capability-indexed directory of worker
//! endpoints with heartbeat health.
//!
//! This is distinct from `agentflow_durable`'s worker registry
//! (`WorkerInfo`/`register_worker`), which tracks processes claiming
//! generic activity tasks for the engine. `AgentRegistry` tracks the
//! domain-level roster of named agents the Workflow Engine's agent nodes
//! address by name — a different axis of "who can run this."

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Active,
    Busy,
    Offline,
}

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub agent_id: String,
    pub base_endpoint: String,
    pub capabilities: Vec<String>,
    pub metadata: Value,
    pub last_heartbeat: DateTime<Utc>,
    pub status: AgentStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("agent not found: {0}")]
    NotFound(String),
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentRecord>>,
    heartbeat_interval: Duration,
}

impl AgentRegistry {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            heartbeat_interval,
        }
    }

    pub async fn register(
        &self,
        agent_id: impl Into<String>,
        base_endpoint: impl Into<String>,
        capabilities: Vec<String>,
        metadata: Value,
    ) {
        let agent_id = agent_id.into();
        let mut agents = self.agents.write().await;
        agents.insert(
            agent_id.clone(),
            AgentRecord {
                agent_id,
                base_endpoint: base_endpoint.into(),
                capabilities,
                metadata,
                last_heartbeat: Utc::now(),
                status: AgentStatus::Active,
            },
        );
    }

    pub async fn heartbeat(&self, agent_id: &str) -> Result<(), RegistryError> {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))?;
        record.last_heartbeat = Utc::now();
        // Late heartbeats revive an offline agent back to active.
        if record.status == AgentStatus::Offline {
            record.status = AgentStatus::Active;
        }
        Ok(())
    }

    pub async fn mark_busy(&self, agent_id: &str) -> Result<(), RegistryError> {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))?;
        record.status = AgentStatus::Busy;
        Ok(())
    }

    pub async fn mark_active(&self, agent_id: &str) -> Result<(), RegistryError> {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))?;
        record.status = AgentStatus::Active;
        Ok(())
    }

    /// Only `active`/`busy` agents are discoverable.
    pub async fn find_by_capability(&self, capability: &str) -> Vec<AgentRecord> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| {
                a.status != AgentStatus::Offline
                    && a.capabilities.iter().any(|c| c == capability)
            })
            .cloned()
            .collect()
    }

    /// Total number of registered agents, regardless of status.
    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn describe(&self, agent_id: &str) -> Result<AgentRecord, RegistryError> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))
    }

    /// Mark `offline` any agent whose last heartbeat is older than
    /// 3x the configured heartbeat interval. Offline agents are excluded
    /// from discovery but never deleted, so late heartbeats can revive them.
    pub async fn sweep(&self) -> usize {
        let ttl = self.heartbeat_interval * 3;
        let threshold = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let mut agents = self.agents.write().await;
        let mut marked = 0;
        for agent in agents.values_mut() {
            if agent.status != AgentStatus::Offline && agent.last_heartbeat < threshold {
                agent.status = AgentStatus::Offline;
                marked += 1;
            }
        }
        marked
    }
}

/// Spawns the health sweeper on a tick of `heartbeat_interval`.
pub fn spawn_sweeper(registry: Arc<AgentRegistry>, tick: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            let marked = registry.sweep().await;
            if marked > 0 {
                info!(marked, "agent registry sweep marked agents offline");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn register_and_find_by_capability() {
        let reg = AgentRegistry::new(Duration::from_secs(10));
        reg.register(
            "coder-1",
            "http://coder-1.local",
            vec!["code_generation".to_string()],
            json!({}),
        )
        .await;

        let found = reg.find_by_capability("code_generation").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].agent_id, "coder-1");

        let missing = reg.find_by_capability("deploy").await;
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn offline_after_missed_heartbeats_excluded_from_discovery() {
        let reg = AgentRegistry::new(Duration::from_millis(5));
        reg.register(
            "coder-1",
            "http://coder-1.local",
            vec!["code_generation".to_string()],
            json!({}),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let marked = reg.sweep().await;
        assert_eq!(marked, 1);

        let found = reg.find_by_capability("code_generation").await;
        assert!(found.is_empty());

        let record = reg.describe("coder-1").await.unwrap();
        assert_eq!(record.status, AgentStatus::Offline);
    }

    #[tokio::test]
    async fn late_heartbeat_revives_offline_agent() {
        let reg = AgentRegistry::new(Duration::from_millis(5));
        reg.register("coder-1", "http://coder-1.local", vec![], json!({}))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        reg.sweep().await;
        reg.heartbeat("coder-1").await.unwrap();
        let record = reg.describe("coder-1").await.unwrap();
        assert_eq!(record.status, AgentStatus::Active);
    }
}
