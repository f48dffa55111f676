use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::events::{EventEmitter, LifelineEvent, SessionSummary};
use crate::registry::SessionRegistry;

/// Near-real-time view of the sessions a responder can join.
///
/// Polls the registry listing on a fixed cadence and replaces the whole
/// list each cycle. The caller's selection survives a refresh if the
/// selected session is still listed; otherwise it falls back to the first
/// item, or to none when the list is empty.
pub struct ResponderRoster {
    registry: Arc<dyn SessionRegistry>,
    emitter: EventEmitter,
    sessions: Arc<Mutex<Vec<SessionSummary>>>,
    selected: Arc<Mutex<Option<String>>>,
    active: Arc<AtomicBool>,
    poll: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ResponderRoster {
    pub fn new(registry: Arc<dyn SessionRegistry>, emitter: EventEmitter) -> Self {
        Self {
            registry,
            emitter,
            sessions: Arc::new(Mutex::new(Vec::new())),
            selected: Arc::new(Mutex::new(None)),
            active: Arc::new(AtomicBool::new(false)),
            poll: Mutex::new(None),
        }
    }

    pub async fn sessions(&self) -> Vec<SessionSummary> {
        self.sessions.lock().await.clone()
    }

    pub async fn selected(&self) -> Option<String> {
        self.selected.lock().await.clone()
    }

    /// Select a session by id. Ignored if the id is not currently listed.
    pub async fn select(&self, id: &str) -> bool {
        let known = self.sessions.lock().await.iter().any(|s| s.id == id);
        if known {
            *self.selected.lock().await = Some(id.to_string());
        }
        known
    }

    /// Start polling; the first refresh happens immediately. An
    /// already-running poll is stopped first.
    pub async fn begin_polling(&self, interval: Duration) {
        self.stop().await;
        self.active.store(true, Ordering::SeqCst);

        let registry = self.registry.clone();
        let emitter = self.emitter.clone();
        let sessions = self.sessions.clone();
        let selected = self.selected.clone();
        let active = self.active.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if !active.load(Ordering::SeqCst) {
                    break;
                }

                match registry.list().await {
                    Ok(list) => {
                        if !active.load(Ordering::SeqCst) {
                            break;
                        }
                        {
                            let mut selected = selected.lock().await;
                            *selected = match selected.take() {
                                Some(id) if list.iter().any(|s| s.id == id) => Some(id),
                                _ => list.first().map(|s| s.id.clone()),
                            };
                        }
                        *sessions.lock().await = list.clone();
                        emitter.emit(LifelineEvent::RosterUpdated(list));
                    }
                    Err(crate::errors::LifelineError::CredentialExpired) => {
                        tracing::warn!("roster poll rejected: credential expired");
                        emitter.emit(LifelineEvent::CredentialExpired);
                        active.store(false, Ordering::SeqCst);
                        break;
                    }
                    // Retried by the next natural cycle, never immediately.
                    Err(e) => tracing::warn!("roster poll failed: {e}"),
                }
            }
            tracing::debug!("roster polling ended");
        });

        *self.poll.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.poll.lock().await.take();
    }
}
