//! Client-side application state.
//!
//! [`reduce`] is the only way state changes: it takes the current snapshot
//! and one topic event and returns the next snapshot, sharing the old one
//! untouched when the event is not understood.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use beacon_core::domain::{
    Checkpoint, ContextStatus, Discrepancy, ProjectStatus, Session, Suggestion, ToolExecution,
};
use beacon_core::{topics, Envelope, EnvelopeType, TopicEvent};

use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::listeners::{Listeners, Subscription};

pub const CHECKPOINT_HISTORY: usize = 10;
pub const EXECUTION_HISTORY: usize = 100;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppState {
    pub session: Option<Session>,
    pub context: Option<ContextStatus>,
    pub discrepancies: Vec<Discrepancy>,
    pub project: Option<ProjectStatus>,
    pub actions: Vec<Suggestion>,
    pub agent_suggestions: Vec<Suggestion>,
    /// Newest first.
    pub checkpoints: Vec<Checkpoint>,
    /// Oldest first.
    pub executions: Vec<ToolExecution>,
}

fn decode<T: DeserializeOwned>(event: &TopicEvent) -> Option<T> {
    match serde_json::from_value(event.data.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(topic = %event.topic, error = %e, "ignoring undecodable event");
            None
        }
    }
}

fn next(state: &AppState, update: impl FnOnce(&mut AppState)) -> Arc<AppState> {
    let mut next = state.clone();
    update(&mut next);
    Arc::new(next)
}

/// Fold one event into `state`.
///
/// Unknown topics and payloads that do not decode return `state` itself.
pub fn reduce(state: &Arc<AppState>, event: &TopicEvent) -> Arc<AppState> {
    let reduced = match event.topic.as_str() {
        topics::SESSION_STATUS => {
            decode::<Option<Session>>(event).map(|session| next(state, |s| s.session = session))
        }
        topics::CONTEXT_STATUS => {
            decode::<ContextStatus>(event).map(|context| next(state, |s| s.context = Some(context)))
        }
        topics::REALITY_CHECKS => {
            decode::<Vec<Discrepancy>>(event).map(|list| next(state, |s| s.discrepancies = list))
        }
        topics::PROJECT_STATUS => {
            decode::<ProjectStatus>(event).map(|project| next(state, |s| s.project = Some(project)))
        }
        topics::SUGGESTIONS_ACTIONS => {
            decode::<Vec<Suggestion>>(event).map(|actions| next(state, |s| s.actions = actions))
        }
        topics::AGENT_SUGGESTIONS => {
            decode::<Vec<Suggestion>>(event).map(|list| next(state, |s| s.agent_suggestions = list))
        }
        topics::SESSION_CHECKPOINT => decode::<Checkpoint>(event).map(|checkpoint| {
            next(state, |s| {
                s.checkpoints.insert(0, checkpoint);
                s.checkpoints.truncate(CHECKPOINT_HISTORY);
            })
        }),
        topics::TOOL_EXECUTION => decode::<ToolExecution>(event).map(|entry| {
            next(state, |s| {
                s.executions.push(entry);
                let overflow = s.executions.len().saturating_sub(EXECUTION_HISTORY);
                s.executions.drain(..overflow);
            })
        }),
        _ => None,
    };
    reduced.unwrap_or_else(|| Arc::clone(state))
}

/// Current snapshot plus change listeners.
pub struct StateStore {
    state: Mutex<Arc<AppState>>,
    connection: Mutex<ConnectionState>,
    listeners: Listeners<Arc<AppState>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(Arc::new(AppState::default())),
            connection: Mutex::new(ConnectionState::Idle),
            listeners: Listeners::new(),
        }
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<AppState> {
        Arc::clone(&self.state.lock())
    }

    pub fn connection(&self) -> ConnectionState {
        *self.connection.lock()
    }

    /// Fold `event` in. Listeners run only when the snapshot changed.
    pub fn apply(&self, event: &TopicEvent) -> bool {
        let updated = {
            let mut current = self.state.lock();
            let reduced = reduce(&current, event);
            if Arc::ptr_eq(&reduced, &current) {
                None
            } else {
                *current = Arc::clone(&reduced);
                Some(reduced)
            }
        };
        match updated {
            Some(state) => {
                self.listeners.emit(&state);
                true
            }
            None => false,
        }
    }

    /// Apply an `event` envelope; anything else is ignored.
    pub fn apply_envelope(&self, envelope: &Envelope) -> bool {
        if envelope.kind != EnvelopeType::Event {
            return false;
        }
        let Some(topic) = envelope.topic.as_deref() else {
            return false;
        };
        let data = envelope.data.clone().unwrap_or(Value::Null);
        self.apply(&TopicEvent::new(topic, data))
    }

    pub fn on_change(&self, callback: impl Fn(&Arc<AppState>) + Send + Sync + 'static) -> Subscription {
        self.listeners.add(callback)
    }

    /// Feed this store from a connection's messages and state changes.
    pub fn attach(self: &Arc<Self>, manager: &ConnectionManager) -> Vec<Subscription> {
        let store = Arc::clone(self);
        let messages = manager.on_message(move |envelope| {
            let _ = store.apply_envelope(envelope);
        });
        let store = Arc::clone(self);
        let states = manager.on_connection_change(move |event| {
            if let ConnectionEvent::StateChanged(state) = event {
                *store.connection.lock() = *state;
            }
        });
        vec![messages, states]
    }
}
