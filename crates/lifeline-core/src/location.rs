use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::errors::LifelineError;
use crate::events::{EventEmitter, GeoPoint, LifelineEvent};
use crate::registry::SessionRegistry;

/// Source of the device's current position.
///
/// Acquisition can fail (permission denied, fix timeout); the reporter
/// contains those failures per tick.
#[async_trait]
pub trait PositionSource: Send + Sync {
    async fn current_position(&self) -> Result<GeoPoint, LifelineError>;
}

/// Best-effort periodic position upload.
///
/// One tick = acquire position, upload to the registry. A failed tick is
/// logged and the cycle continues. Ticks never overlap: while an upload is
/// in flight, elapsed ticks are skipped, not queued, so at most one upload
/// is outstanding and the registry never sees out-of-order writes.
pub struct LocationReporter {
    registry: Arc<dyn SessionRegistry>,
    source: Arc<dyn PositionSource>,
    emitter: EventEmitter,
    active: Arc<AtomicBool>,
    last_reported: Arc<Mutex<Option<(GeoPoint, DateTime<Utc>)>>>,
    cycle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LocationReporter {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        source: Arc<dyn PositionSource>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            registry,
            source,
            emitter,
            active: Arc::new(AtomicBool::new(false)),
            last_reported: Arc::new(Mutex::new(None)),
            cycle: Mutex::new(None),
        }
    }

    /// Last position the registry accepted, with its upload time.
    pub async fn last_reported(&self) -> Option<(GeoPoint, DateTime<Utc>)> {
        *self.last_reported.lock().await
    }

    /// Start the reporting cycle. An already-running cycle is stopped first.
    pub async fn begin_cycle(&self, interval: Duration) {
        self.stop().await;
        self.active.store(true, Ordering::SeqCst);

        let registry = self.registry.clone();
        let source = self.source.clone();
        let emitter = self.emitter.clone();
        let active = self.active.clone();
        let last_reported = self.last_reported.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The session start already reported the initial fix; swallow the
            // immediate first tick so the cycle is a clean fixed cadence.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !active.load(Ordering::SeqCst) {
                    break;
                }

                let position = match source.current_position().await {
                    Ok(position) => position,
                    Err(LifelineError::PermissionDenied(reason)) => {
                        tracing::warn!("geolocation denied, retrying next tick: {reason}");
                        emitter.emit(LifelineEvent::LocationPermissionDenied);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("position unavailable, retrying next tick: {e}");
                        continue;
                    }
                };

                // Cancelled while acquiring: issue no upload.
                if !active.load(Ordering::SeqCst) {
                    break;
                }

                match registry.update(position).await {
                    Ok(()) => {
                        if !active.load(Ordering::SeqCst) {
                            break;
                        }
                        *last_reported.lock().await = Some((position, Utc::now()));
                        emitter.emit(LifelineEvent::LocationReported(position));
                    }
                    Err(LifelineError::CredentialExpired) => {
                        tracing::warn!("location upload rejected: credential expired");
                        emitter.emit(LifelineEvent::CredentialExpired);
                        active.store(false, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("location upload failed, retrying next tick: {e}");
                    }
                }
            }
            tracing::debug!("location cycle ended");
        });

        *self.cycle.lock().await = Some(handle);
    }

    /// Stop the cycle. No further tick is scheduled from this point; an
    /// upload already in flight is left to finish on its own.
    pub async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        // Detach rather than abort: aborting would cut off an in-flight
        // upload, the flag already prevents any new one.
        self.cycle.lock().await.take();
    }
}
