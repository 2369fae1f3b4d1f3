//! Event Store (spec §4.1) and State Persister (spec §4.2).
//!
//! This is the orchestrator's own, domain-level, tamper-evident log —
//! distinct from `agentflow_durable`'s generic `WorkflowEvent` log, which
//! records engine mechanics (activity scheduling, retries). `OrchestratorEvent`
//! records the domain actions enumerated across the spec (`approval_requested`,
//! `agent_invoked`, `cancelled`, ...) and is hash-chained per event, which the
//! generic engine log does not need to be.
//!
//! `append` is the only mutation; `seq` collisions make retries safe.
//! Snapshots are taken every `snapshot_every_events` appends (default 10).
//! The State Persister is realized here as a read-through cache: invalidated
//! (not updated) on every successful append, so a half-finished transaction
//! self-heals on the next read by re-folding from the event log.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::OrchestratorError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkflowStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::RolledBack
        )
    }
}

/// One hash-chained, immutable record (spec §3, §6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub workflow_id: Uuid,
    pub seq: i64,
    pub action: String,
    pub payload: Value,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

/// Canonical pre-hash body: deterministic JSON with sorted keys, per §6.4.
#[derive(Serialize)]
struct EventBody<'a> {
    event_id: &'a Uuid,
    workflow_id: &'a Uuid,
    seq: i64,
    action: &'a str,
    payload: &'a Value,
    actor: &'a str,
    timestamp: &'a DateTime<Utc>,
    prev_hash: &'a str,
}

fn canonical_json(value: &impl Serialize) -> String {
    // serde_json's Value serializer sorts map keys when the `preserve_order`
    // feature is off (the workspace default), which gives us the
    // deterministic, sorted-key encoding the spec requires.
    let v = serde_json::to_value(value).expect("event body is always serializable");
    serde_json::to_string(&v).expect("canonicalized value is always serializable")
}

fn compute_hash(prev_hash: &str, body: &EventBody) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical_json(body).as_bytes());
    hex::encode(hasher.finalize())
}

pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub state: Value,
    pub at_seq: i64,
}

struct WorkflowLog {
    events: Vec<Event>,
    snapshots: Vec<Snapshot>,
}

impl WorkflowLog {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    fn last_hash(&self) -> String {
        self.events
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| ZERO_HASH.to_string())
    }
}

/// A pure total function over (state, event). Unknown actions fail closed:
/// the fold stops and the caller surfaces an administrative error, per spec.
pub trait Reducer<S>: Send + Sync {
    fn reduce(&self, state: S, event: &Event) -> Result<S, OrchestratorError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error("concurrency conflict on workflow {workflow_id}: expected seq {expected}, store is at {actual}")]
    ConcurrencyError {
        workflow_id: Uuid,
        expected: i64,
        actual: i64,
    },
    #[error("workflow not found: {0}")]
    NotFound(Uuid),
    #[error(
        "replay integrity error on workflow {workflow_id} at seq {seq}: expected hash {expected}, computed {computed}"
    )]
    ReplayIntegrityError {
        workflow_id: Uuid,
        seq: i64,
        expected: String,
        computed: String,
    },
    #[error("reducer poisoned on unknown action '{0}'")]
    UnknownAction(String),
}

impl From<EventStoreError> for OrchestratorError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::ConcurrencyError { expected, actual, .. } => {
                OrchestratorError::VersionConflict {
                    expected,
                    actual,
                }
            }
            EventStoreError::NotFound(id) => OrchestratorError::NotFound(format!("workflow {id}")),
            EventStoreError::ReplayIntegrityError {
                workflow_id,
                seq,
                expected,
                computed,
            } => OrchestratorError::ReplayIntegrityError {
                workflow_id,
                seq,
                expected,
                computed,
            },
            EventStoreError::UnknownAction(action) => {
                OrchestratorError::Internal(format!("poisoned reducer: unknown action '{action}'"))
            }
        }
    }
}

/// In-memory append-only Event Store with hash chaining, snapshotting, and
/// a self-healing State Persister cache.
pub struct EventStore {
    logs: RwLock<HashMap<Uuid, WorkflowLog>>,
    state_cache: RwLock<HashMap<Uuid, (Value, i64)>>,
    snapshot_every: u32,
}

impl EventStore {
    pub fn new(snapshot_every: u32) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            state_cache: RwLock::new(HashMap::new()),
            snapshot_every: snapshot_every.max(1),
        }
    }

    /// Append one domain event. `expected_seq` is the optimistic-concurrency
    /// token (the seq the caller last observed); a mismatch returns
    /// `ConcurrencyError` so the caller can re-read and retry once.
    pub async fn append(
        &self,
        workflow_id: Uuid,
        expected_seq: i64,
        action: impl Into<String>,
        payload: Value,
        actor: impl Into<String>,
    ) -> Result<Event, EventStoreError> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(workflow_id).or_insert_with(WorkflowLog::new);

        let current_seq = log.events.len() as i64;
        if current_seq != expected_seq {
            return Err(EventStoreError::ConcurrencyError {
                workflow_id,
                expected: expected_seq,
                actual: current_seq,
            });
        }

        let seq = current_seq + 1;
        let event_id = Uuid::now_v7();
        let timestamp = Utc::now();
        let action = action.into();
        let actor = actor.into();
        let prev_hash = log.last_hash();

        let body = EventBody {
            event_id: &event_id,
            workflow_id: &workflow_id,
            seq,
            action: &action,
            payload: &payload,
            actor: &actor,
            timestamp: &timestamp,
            prev_hash: &prev_hash,
        };
        let hash = compute_hash(&prev_hash, &body);

        let event = Event {
            event_id,
            workflow_id,
            seq,
            action,
            payload,
            actor,
            timestamp,
            prev_hash,
            hash,
        };
        log.events.push(event.clone());

        // Invalidate rather than update: the next `latest_state` call
        // re-folds from the log, which is the self-healing property the
        // spec requires after a half-finished write-through transaction.
        drop(logs);
        self.state_cache.write().await.remove(&workflow_id);

        Ok(event)
    }

    pub async fn load(
        &self,
        workflow_id: Uuid,
        from_seq: i64,
        to_seq: Option<i64>,
    ) -> Vec<Event> {
        let logs = self.logs.read().await;
        let Some(log) = logs.get(&workflow_id) else {
            return Vec::new();
        };
        log.events
            .iter()
            .filter(|e| e.seq > from_seq && to_seq.map(|max| e.seq <= max).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn snapshot(&self, workflow_id: Uuid, state: Value, at_seq: i64) {
        let mut logs = self.logs.write().await;
        if let Some(log) = logs.get_mut(&workflow_id) {
            log.snapshots.push(Snapshot { state, at_seq });
        }
    }

    pub async fn list_snapshots(&self, workflow_id: Uuid) -> Vec<Snapshot> {
        self.logs
            .read()
            .await
            .get(&workflow_id)
            .map(|l| l.snapshots.clone())
            .unwrap_or_default()
    }

    /// `last_snapshot ∘ fold(events_after)`, memoized in `state_cache` until
    /// the next `append` invalidates it. A cache hit skips both the
    /// snapshot lookup and the fold entirely.
    pub async fn latest_state<S, R>(
        &self,
        workflow_id: Uuid,
        initial: S,
        reducer: &R,
    ) -> Result<(S, i64), EventStoreError>
    where
        S: Clone + Serialize + for<'de> Deserialize<'de>,
        R: Reducer<S>,
    {
        if !self.logs.read().await.contains_key(&workflow_id) {
            return Err(EventStoreError::NotFound(workflow_id));
        }

        if let Some((value, seq)) = self.state_cache.read().await.get(&workflow_id).cloned() {
            let state = serde_json::from_value(value).map_err(|_| {
                EventStoreError::UnknownAction("corrupt cached state".to_string())
            })?;
            return Ok((state, seq));
        }

        let events = self.load(workflow_id, 0, None).await;
        let snapshots = self.list_snapshots(workflow_id).await;
        let (mut state, mut from_seq) = match snapshots.last() {
            Some(snap) => (
                serde_json::from_value(snap.state.clone()).map_err(|_| {
                    EventStoreError::UnknownAction("corrupt snapshot".to_string())
                })?,
                snap.at_seq,
            ),
            None => (initial, 0),
        };

        for event in events.iter().filter(|e| e.seq > from_seq) {
            state = reducer.reduce(state, event).map_err(|_| {
                EventStoreError::UnknownAction(event.action.clone())
            })?;
            from_seq = event.seq;

            if from_seq % self.snapshot_every as i64 == 0 {
                if let Ok(value) = serde_json::to_value(&state) {
                    self.snapshot(workflow_id, value, from_seq).await;
                }
            }
        }

        if let Ok(value) = serde_json::to_value(&state) {
            self.state_cache.write().await.insert(workflow_id, (value, from_seq));
        }

        Ok((state, from_seq))
    }

    /// Time-travel: walk events up to `timestamp`.
    pub async fn state_at<S, R>(
        &self,
        workflow_id: Uuid,
        initial: S,
        reducer: &R,
        timestamp: DateTime<Utc>,
    ) -> Result<S, EventStoreError>
    where
        S: Clone,
        R: Reducer<S>,
    {
        let events = self.load(workflow_id, 0, None).await;
        let mut state = initial;
        for event in events.iter().filter(|e| e.timestamp <= timestamp) {
            state = reducer.reduce(state, event).map_err(|_| {
                EventStoreError::UnknownAction(event.action.clone())
            })?;
        }
        Ok(state)
    }

    /// Verify the hash chain end to end. Returns the first corrupted event,
    /// if any.
    pub async fn verify_chain(&self, workflow_id: Uuid) -> Result<(), EventStoreError> {
        let events = self.load(workflow_id, 0, None).await;
        let mut prev_hash = ZERO_HASH.to_string();
        for event in &events {
            if event.prev_hash != prev_hash {
                return Err(EventStoreError::ReplayIntegrityError {
                    workflow_id,
                    seq: event.seq,
                    expected: prev_hash,
                    computed: event.prev_hash.clone(),
                });
            }
            let body = EventBody {
                event_id: &event.event_id,
                workflow_id: &event.workflow_id,
                seq: event.seq,
                action: &event.action,
                payload: &event.payload,
                actor: &event.actor,
                timestamp: &event.timestamp,
                prev_hash: &event.prev_hash,
            };
            let computed = compute_hash(&event.prev_hash, &body);
            if computed != event.hash {
                return Err(EventStoreError::ReplayIntegrityError {
                    workflow_id,
                    seq: event.seq,
                    expected: event.hash.clone(),
                    computed,
                });
            }
            prev_hash = event.hash.clone();
        }
        Ok(())
    }
}

pub type SharedEventStore = Arc<EventStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Clone, Serialize, Deserialize, Default, PartialEq, Debug)]
    struct CounterState {
        count: i64,
        last_action: String,
    }

    struct CounterReducer;
    impl Reducer<CounterState> for CounterReducer {
        fn reduce(&self, mut state: CounterState, event: &Event) -> Result<CounterState, OrchestratorError> {
            match event.action.as_str() {
                "increment" => {
                    state.count += 1;
                    state.last_action = event.action.clone();
                    Ok(state)
                }
                other => Err(OrchestratorError::Internal(format!("unknown action {other}"))),
            }
        }
    }

    #[tokio::test]
    async fn seq_is_contiguous_and_starts_at_one() {
        let store = EventStore::new(10);
        let wf = Uuid::now_v7();
        let e1 = store.append(wf, 0, "increment", json!({}), "test").await.unwrap();
        let e2 = store.append(wf, 1, "increment", json!({}), "test").await.unwrap();
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
        assert_eq!(e1.prev_hash, ZERO_HASH);
        assert_eq!(e2.prev_hash, e1.hash);
    }

    #[tokio::test]
    async fn concurrency_conflict_on_stale_seq() {
        let store = EventStore::new(10);
        let wf = Uuid::now_v7();
        store.append(wf, 0, "increment", json!({}), "test").await.unwrap();
        let err = store
            .append(wf, 0, "increment", json!({}), "test")
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::ConcurrencyError { .. }));
    }

    #[tokio::test]
    async fn reducing_events_reproduces_latest_state() {
        let store = EventStore::new(10);
        let wf = Uuid::now_v7();
        store.append(wf, 0, "increment", json!({}), "test").await.unwrap();
        store.append(wf, 1, "increment", json!({}), "test").await.unwrap();

        let (state, seq) = store
            .latest_state(wf, CounterState::default(), &CounterReducer)
            .await
            .unwrap();
        assert_eq!(state.count, 2);
        assert_eq!(seq, 2);
    }

    #[tokio::test]
    async fn state_at_now_equals_latest_state() {
        let store = EventStore::new(10);
        let wf = Uuid::now_v7();
        store.append(wf, 0, "increment", json!({}), "test").await.unwrap();
        store.append(wf, 1, "increment", json!({}), "test").await.unwrap();

        let (latest, _) = store
            .latest_state(wf, CounterState::default(), &CounterReducer)
            .await
            .unwrap();
        let at_now = store
            .state_at(wf, CounterState::default(), &CounterReducer, Utc::now())
            .await
            .unwrap();
        assert_eq!(latest, at_now);
    }

    #[tokio::test]
    async fn tampering_is_detected_on_verify() {
        let store = EventStore::new(10);
        let wf = Uuid::now_v7();
        store.append(wf, 0, "increment", json!({}), "test").await.unwrap();
        store.append(wf, 1, "increment", json!({}), "test").await.unwrap();

        {
            let mut logs = store.logs.write().await;
            logs.get_mut(&wf).unwrap().events[0].payload = json!({"tampered": true});
        }

        let result = store.verify_chain(wf).await;
        assert!(matches!(result, Err(EventStoreError::ReplayIntegrityError { .. })));
    }

    #[tokio::test]
    async fn snapshot_taken_every_n_events() {
        let store = EventStore::new(2);
        let wf = Uuid::now_v7();
        for i in 0..4 {
            store
                .append(wf, i, "increment", json!({}), "test")
                .await
                .unwrap();
        }
        store
            .latest_state(wf, CounterState::default(), &CounterReducer)
            .await
            .unwrap();
        let snapshots = store.list_snapshots(wf).await;
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].at_seq, 2);
        assert_eq!(snapshots[1].at_seq, 4);
    }

    #[tokio::test]
    async fn unknown_action_fails_closed() {
        let store = EventStore::new(10);
        let wf = Uuid::now_v7();
        store
            .append(wf, 0, "unknown_action", json!({}), "test")
            .await
            .unwrap();
        let result = store
            .latest_state(wf, CounterState::default(), &CounterReducer)
            .await;
        assert!(result.is_err());
    }
}
