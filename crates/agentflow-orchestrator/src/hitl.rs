//! HITL Manager (spec §4.8): approval-request lifecycle, authorization, and
//! the 60-second expiry sweeper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::risk::RiskLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: Uuid,
    pub workflow_id: Uuid,
    pub thread_id: String,
    pub checkpoint_id: Uuid,
    pub agent_name: String,
    pub task_descriptor: Value,
    pub risk_level: RiskLevel,
    pub risk_factors: Vec<String>,
    pub status: ApprovalStatus,
    pub required_role: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolver_id: Option<String>,
    pub resolver_role: Option<String>,
    pub justification: Option<String>,
    pub external_ref: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum HitlError {
    #[error("approval request not found: {0}")]
    NotFound(Uuid),
    #[error("approval request {0} is already resolved ({1:?})")]
    AlreadyResolved(Uuid, ApprovalStatus),
    #[error("role '{role}' is not authorized to resolve a {level:?} request")]
    Unauthorized { role: String, level: RiskLevel },
}

/// Notification side-channel: posts the approval prompt to an external
/// system (issue tracker, chat) and returns the opaque `external_ref`.
/// Out of scope to implement for real; a trait keeps the rest of the system
/// decoupled from any particular channel.
#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, request: &ApprovalRequest) -> String;
}

/// No-op channel used when no external notification integration is
/// configured; returns a locally-generated reference.
pub struct NullNotificationChannel;

#[async_trait::async_trait]
impl NotificationChannel for NullNotificationChannel {
    async fn notify(&self, request: &ApprovalRequest) -> String {
        format!("local-ref-{}", request.request_id)
    }
}

pub struct HitlManager {
    requests: RwLock<HashMap<Uuid, ApprovalRequest>>,
    role_authorization: HashMap<String, Vec<RiskLevel>>,
    approval_timeout: HashMap<RiskLevel, Duration>,
    notifier: Arc<dyn NotificationChannel>,
}

impl HitlManager {
    pub fn new(config: &OrchestratorConfig, notifier: Arc<dyn NotificationChannel>) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            role_authorization: config.role_authorization.clone(),
            approval_timeout: config.approval_timeout.clone(),
            notifier,
        }
    }

    /// Returns `None` for risk levels that don't require approval
    /// (auto-approved). Otherwise persists an `ApprovalRequest`, emits a
    /// notification, and stores the `external_ref` it returns.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        workflow_id: Uuid,
        thread_id: impl Into<String>,
        checkpoint_id: Uuid,
        agent_name: impl Into<String>,
        task_descriptor: Value,
        risk_level: RiskLevel,
        risk_factors: Vec<String>,
    ) -> Option<Uuid> {
        if !crate::risk::RiskAssessor::requires_approval(risk_level) {
            return None;
        }

        let timeout = self
            .approval_timeout
            .get(&risk_level)
            .copied()
            .unwrap_or(Duration::from_secs(30 * 60));

        let required_role = self
            .role_authorization
            .iter()
            .filter(|(_, levels)| levels.contains(&risk_level))
            .map(|(role, _)| role.clone())
            .collect();

        let request_id = Uuid::now_v7();
        let now = Utc::now();
        let mut request = ApprovalRequest {
            request_id,
            workflow_id,
            thread_id: thread_id.into(),
            checkpoint_id,
            agent_name: agent_name.into(),
            task_descriptor,
            risk_level,
            risk_factors,
            status: ApprovalStatus::Pending,
            required_role,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero()),
            resolver_id: None,
            resolver_role: None,
            justification: None,
            external_ref: None,
        };

        let external_ref = self.notifier.notify(&request).await;
        request.external_ref = Some(external_ref);

        self.requests.write().await.insert(request_id, request);
        info!(%request_id, %workflow_id, ?risk_level, "approval request created");
        Some(request_id)
    }

    /// Lazily expires a `pending` request that is past `expires_at`.
    pub async fn status(&self, request_id: Uuid) -> Result<ApprovalRequest, HitlError> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&request_id)
            .ok_or(HitlError::NotFound(request_id))?;
        if request.status == ApprovalStatus::Pending && request.expires_at <= Utc::now() {
            request.status = ApprovalStatus::Expired;
        }
        Ok(request.clone())
    }

    pub async fn by_external_ref(&self, external_ref: &str) -> Option<ApprovalRequest> {
        self.requests
            .read()
            .await
            .values()
            .find(|r| r.external_ref.as_deref() == Some(external_ref))
            .cloned()
    }

    pub async fn approve(
        &self,
        request_id: Uuid,
        approver_id: impl Into<String>,
        approver_role: &str,
        justification: Option<String>,
    ) -> Result<ApprovalRequest, HitlError> {
        self.resolve(request_id, approver_id, approver_role, justification, ApprovalStatus::Approved)
            .await
    }

    pub async fn reject(
        &self,
        request_id: Uuid,
        approver_id: impl Into<String>,
        approver_role: &str,
        reason: String,
    ) -> Result<ApprovalRequest, HitlError> {
        self.resolve(request_id, approver_id, approver_role, Some(reason), ApprovalStatus::Rejected)
            .await
    }

    async fn resolve(
        &self,
        request_id: Uuid,
        approver_id: impl Into<String>,
        approver_role: &str,
        justification: Option<String>,
        outcome: ApprovalStatus,
    ) -> Result<ApprovalRequest, HitlError> {
        // Lazily expire first so a resolve attempt on a stale request fails
        // the right way.
        self.status(request_id).await?;

        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&request_id)
            .ok_or(HitlError::NotFound(request_id))?;

        if request.status != ApprovalStatus::Pending {
            return Err(HitlError::AlreadyResolved(request_id, request.status));
        }

        let allowed = self
            .role_authorization
            .get(approver_role)
            .map(|levels| levels.contains(&request.risk_level))
            .unwrap_or(false);
        if !allowed {
            return Err(HitlError::Unauthorized {
                role: approver_role.to_string(),
                level: request.risk_level,
            });
        }

        request.status = outcome;
        request.resolver_id = Some(approver_id.into());
        request.resolver_role = Some(approver_role.to_string());
        request.justification = justification;
        Ok(request.clone())
    }

    /// Used when the originating workflow is cancelled.
    pub async fn cancel(&self, request_id: Uuid) -> Result<(), HitlError> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&request_id)
            .ok_or(HitlError::NotFound(request_id))?;
        if request.status == ApprovalStatus::Pending {
            request.status = ApprovalStatus::Cancelled;
        }
        Ok(())
    }

    /// Background sweep: flips expired pending rows. Returns the ids that
    /// transitioned, so the caller can emit `approval_expired` events.
    pub async fn sweep_expired(&self) -> Vec<Uuid> {
        let mut requests = self.requests.write().await;
        let now = Utc::now();
        let mut expired = Vec::new();
        for request in requests.values_mut() {
            if request.status == ApprovalStatus::Pending && request.expires_at <= now {
                request.status = ApprovalStatus::Expired;
                expired.push(request.request_id);
            }
        }
        expired
    }
}

/// Spawns the 60-second sweeper described in spec §4.8. `on_expired` is
/// invoked with the ids that transitioned so the caller can mirror the
/// expiry onto whatever else references the request (the domain event log,
/// the owning engine workflow) — `HitlManager` itself only owns approval
/// state, not those.
pub fn spawn_sweeper<F, Fut>(manager: Arc<HitlManager>, on_expired: F) -> tokio::task::JoinHandle<()>
where
    F: Fn(Vec<Uuid>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let expired = manager.sweep_expired().await;
            if !expired.is_empty() {
                info!(count = expired.len(), "HITL sweeper expired pending approvals");
                on_expired(expired).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_manager() -> HitlManager {
        HitlManager::new(&OrchestratorConfig::default(), Arc::new(NullNotificationChannel))
    }

    #[tokio::test]
    async fn low_risk_is_auto_approved() {
        let hm = test_manager();
        let result = hm
            .create(
                Uuid::now_v7(),
                "thread-1",
                Uuid::now_v7(),
                "coder",
                json!({}),
                RiskLevel::Low,
                vec![],
            )
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn high_risk_creates_pending_request() {
        let hm = test_manager();
        let id = hm
            .create(
                Uuid::now_v7(),
                "thread-1",
                Uuid::now_v7(),
                "deployer",
                json!({}),
                RiskLevel::High,
                vec!["production_deployment".to_string()],
            )
            .await
            .unwrap();
        let request = hm.status(id).await.unwrap();
        assert_eq!(request.status, ApprovalStatus::Pending);
        assert!(request.external_ref.is_some());
    }

    #[tokio::test]
    async fn operator_can_approve_critical() {
        let hm = test_manager();
        let id = hm
            .create(
                Uuid::now_v7(),
                "thread-1",
                Uuid::now_v7(),
                "deployer",
                json!({}),
                RiskLevel::Critical,
                vec![],
            )
            .await
            .unwrap();
        let resolved = hm.approve(id, "u42", "operator", None).await.unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn developer_cannot_approve_high() {
        let hm = test_manager();
        let id = hm
            .create(
                Uuid::now_v7(),
                "thread-1",
                Uuid::now_v7(),
                "deployer",
                json!({}),
                RiskLevel::High,
                vec![],
            )
            .await
            .unwrap();
        let err = hm.approve(id, "u1", "developer", None).await.unwrap_err();
        assert!(matches!(err, HitlError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn rejection_is_terminal() {
        let hm = test_manager();
        let id = hm
            .create(
                Uuid::now_v7(),
                "thread-1",
                Uuid::now_v7(),
                "deployer",
                json!({}),
                RiskLevel::High,
                vec![],
            )
            .await
            .unwrap();
        hm.reject(id, "u42", "operator", "blocked by compliance".to_string())
            .await
            .unwrap();
        let err = hm.approve(id, "u42", "operator", None).await.unwrap_err();
        assert!(matches!(err, HitlError::AlreadyResolved(_, ApprovalStatus::Rejected)));
    }

    #[tokio::test]
    async fn expiry_sweep_flips_pending_to_expired() {
        let mut config = OrchestratorConfig::default();
        config.approval_timeout.insert(RiskLevel::High, Duration::from_millis(5));
        let hm = HitlManager::new(&config, Arc::new(NullNotificationChannel));

        let id = hm
            .create(
                Uuid::now_v7(),
                "thread-1",
                Uuid::now_v7(),
                "deployer",
                json!({}),
                RiskLevel::High,
                vec![],
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let expired = hm.sweep_expired().await;
        assert_eq!(expired, vec![id]);
        assert_eq!(hm.status(id).await.unwrap().status, ApprovalStatus::Expired);
    }

    #[tokio::test]
    async fn lazy_status_check_also_expires() {
        let mut config = OrchestratorConfig::default();
        config.approval_timeout.insert(RiskLevel::High, Duration::from_millis(5));
        let hm = HitlManager::new(&config, Arc::new(NullNotificationChannel));

        let id = hm
            .create(
                Uuid::now_v7(),
                "thread-1",
                Uuid::now_v7(),
                "deployer",
                json!({}),
                RiskLevel::High,
                vec![],
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hm.status(id).await.unwrap().status, ApprovalStatus::Expired);
    }

    #[tokio::test]
    async fn cancel_is_noop_once_resolved() {
        let hm = test_manager();
        let id = hm
            .create(
                Uuid::now_v7(),
                "thread-1",
                Uuid::now_v7(),
                "deployer",
                json!({}),
                RiskLevel::High,
                vec![],
            )
            .await
            .unwrap();
        hm.approve(id, "u42", "operator", None).await.unwrap();
        hm.cancel(id).await.unwrap();
        assert_eq!(hm.status(id).await.unwrap().status, ApprovalStatus::Approved);
    }
}
