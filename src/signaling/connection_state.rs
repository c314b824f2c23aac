use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    New,
    Initialized,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateChangeEvent {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub from_state: Option<SessionState>,
    pub to_state: SessionState,
}

/// Aggregate view served by the debug endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub total_sessions: usize,
    pub connected_sessions: usize,
    pub failed_sessions: usize,
    pub success_rate: f64,
    pub state_distribution: HashMap<SessionState, usize>,
    pub sessions: HashMap<String, SessionState>,
}

fn is_valid_transition(from: Option<SessionState>, to: SessionState) -> bool {
    use SessionState::*;
    matches!(
        (from, to),
        (None, New)
            | (Some(New), Initialized)
            | (Some(Initialized), Negotiating)
            | (Some(Negotiating), Negotiating)
            | (Some(Negotiating), Connected)
            | (Some(Connected), Negotiating)
            | (Some(Failed), Negotiating)
    ) || matches!((from, to), (Some(current), Failed | Closed) if current != Closed)
}

#[derive(Debug)]
pub struct SessionStateManager {
    states: Arc<Mutex<HashMap<String, SessionState>>>,
    broadcaster: broadcast::Sender<StateChangeEvent>,
}

impl Default for SessionStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateManager {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(100);
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            broadcaster: tx,
        }
    }

    /// Applies the transition if the lifecycle allows it. Rejected moves leave
    /// the state untouched and return `false`.
    pub async fn transition(&self, session_id: &str, new_state: SessionState) -> bool {
        let mut states = self.states.lock().await;
        let current = states.get(session_id).copied();

        if !is_valid_transition(current, new_state) {
            debug!(
                "Rejected session transition {:?} -> {:?} for {}",
                current, new_state, session_id
            );
            return false;
        }

        let _ = self.broadcaster.send(StateChangeEvent {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            from_state: current,
            to_state: new_state,
        });
        states.insert(session_id.to_string(), new_state);
        true
    }

    pub async fn get_state(&self, session_id: &str) -> Option<SessionState> {
        self.states.lock().await.get(session_id).copied()
    }

    pub async fn get_all_states(&self) -> HashMap<String, SessionState> {
        self.states.lock().await.clone()
    }

    pub async fn remove(&self, session_id: &str) -> Option<SessionState> {
        self.states.lock().await.remove(session_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.broadcaster.subscribe()
    }

    pub async fn summary(&self) -> SessionSummary {
        let sessions = self.get_all_states().await;

        let total = sessions.len();
        let connected = sessions
            .values()
            .filter(|s| matches!(s, SessionState::Connected))
            .count();
        let failed = sessions
            .values()
            .filter(|s| matches!(s, SessionState::Failed))
            .count();
        let success_rate = if total == 0 {
            0.0
        } else {
            (connected as f64 / total as f64) * 100.0
        };
        let state_distribution = sessions.values().fold(HashMap::new(), |mut acc, state| {
            *acc.entry(*state).or_insert(0) += 1;
            acc
        });

        SessionSummary {
            total_sessions: total,
            connected_sessions: connected,
            failed_sessions: failed,
            success_rate,
            state_distribution,
            sessions,
        }
    }
}
