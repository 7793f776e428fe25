//! In-memory session registry for consultations.
//!
//! Sessions live for the process lifetime only. The registry is bounded:
//! idle sessions expire after a TTL and, at capacity, the least recently
//! touched session is evicted to make room. Both knobs are configurable.
//!
//! Each entry carries its own async mutex so exactly one orchestrator
//! operation mutates a given session at a time, while operations on
//! different sessions proceed independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::agents::QaExchange;
use crate::models::{
    ConsultationRequest, PipelinePosition, StageName, StagePayload, StageResult,
};
use crate::stream::StreamEvent;

/// Capacity of each session's live event channel. Slow subscribers that
/// lag past this miss events but can re-attach via replay.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ═══════════════════════════════════════════════════════════
// Session
// ═══════════════════════════════════════════════════════════

/// A clarifying question holding the pipeline in AwaitingAnswer.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PendingQuestion {
    /// Stage the pipeline branched from; resume re-runs this stage.
    pub stage: StageName,
    pub question: String,
}

/// The record of one in-progress or completed consultation.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub request: ConsultationRequest,
    pub position: PipelinePosition,
    /// Completed stage results in pipeline order. Append-only.
    pub results: Vec<StageResult>,
    pub qa_history: Vec<QaExchange>,
    pub pending_question: Option<PendingQuestion>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Session {
    pub fn new(id: String, request: ConsultationRequest) -> Self {
        Self {
            id,
            request,
            position: PipelinePosition::Intake,
            results: Vec::new(),
            qa_history: Vec::new(),
            pending_question: None,
            created_at: chrono::Utc::now(),
        }
    }

    /// Payload of a completed stage, if present.
    pub fn payload(&self, stage: StageName) -> Option<&StagePayload> {
        self.results
            .iter()
            .find(|r| r.stage == stage)
            .and_then(|r| r.payload.as_ref())
    }
}

/// One registry entry: session state behind its logical lock, plus the
/// live event channel subscribers attach to.
pub struct SessionHandle {
    pub state: tokio::sync::Mutex<Session>,
    pub events: broadcast::Sender<StreamEvent>,
    last_touched: Mutex<Instant>,
}

impl SessionHandle {
    fn new(session: Session) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: tokio::sync::Mutex::new(session),
            events,
            last_touched: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_touched.lock().expect("touch lock") = Instant::now();
    }

    fn touched_at(&self) -> Instant {
        *self.last_touched.lock().expect("touch lock")
    }
}

// ═══════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════

/// Eviction knobs. TTL bounds idle lifetime; capacity bounds total count.
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    pub ttl: Duration,
    pub max_sessions: usize,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_sessions: 1024,
        }
    }
}

/// Bounded in-memory session registry. Owned exclusively by the
/// orchestrator.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
    policy: EvictionPolicy,
}

impl SessionRegistry {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            policy,
        }
    }

    /// Register a new session, evicting at capacity. Returns the handle.
    pub fn insert(&self, session: Session) -> Arc<SessionHandle> {
        let id = session.id.clone();
        let handle = Arc::new(SessionHandle::new(session));
        let mut sessions = self.sessions.lock().expect("registry lock");

        if sessions.len() >= self.policy.max_sessions {
            evict_lru(&mut sessions);
        }

        sessions.insert(id, Arc::clone(&handle));
        handle
    }

    /// Look up a session, refreshing its idle timer. Expired sessions
    /// are dropped on access.
    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        let mut sessions = self.sessions.lock().expect("registry lock");
        let handle = sessions.get(id)?;
        if handle.touched_at().elapsed() >= self.policy.ttl {
            sessions.remove(id);
            return None;
        }
        let handle = Arc::clone(handle);
        handle.touch();
        Some(handle)
    }

    /// Remove a session explicitly. Returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        self.sessions
            .lock()
            .expect("registry lock")
            .remove(id)
            .is_some()
    }

    /// Drop every session past its TTL. Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let mut sessions = self.sessions.lock().expect("registry lock");
        let before = sessions.len();
        let ttl = self.policy.ttl;
        sessions.retain(|_, handle| handle.touched_at().elapsed() < ttl);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Evict the least recently touched session. Sessions whose state lock
/// is currently held (mid-pipeline) are skipped.
fn evict_lru(sessions: &mut HashMap<String, Arc<SessionHandle>>) {
    let victim = sessions
        .iter()
        .filter(|(_, handle)| handle.state.try_lock().is_ok())
        .min_by_key(|(_, handle)| handle.touched_at())
        .map(|(id, _)| id.clone());

    if let Some(id) = victim {
        tracing::debug!(session_id = %id, "evicting least recently used session");
        sessions.remove(&id);
    }
}
