//! Content-addressed result cache with per-fingerprint single flight.
//!
//! At most one execution per fingerprint is ever in flight: the first
//! caller becomes the leader and computes, every identical request
//! arriving meanwhile awaits the same watch channel and shares the
//! leader's report. The leader computes inside a spawned task, so a
//! caller that disconnects mid-run can neither abandon the sandbox nor
//! strand the followers. Should the computation itself die, followers
//! clear the dead flight and contend to lead the retry.
//!
//! Storage is governed by
//! [`ExecutionStatus::is_cacheable`](crate::types::ExecutionStatus::is_cacheable):
//! verdicts about the code are kept for the TTL, operational failures are
//! never kept.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error};
use uuid::Uuid;

use crate::types::ExecutionReport;

struct CacheEntry {
    report: Arc<ExecutionReport>,
    created_at: Instant,
    expires_at: Instant,
    exercise_id: Option<Uuid>,
}

struct InFlight {
    rx: watch::Receiver<Option<Arc<ExecutionReport>>>,
    exercise_id: Option<Uuid>,
    /// Identity of the computation that installed this slot. Storing is
    /// conditional on the token still being present, which is how an
    /// invalidation issued mid-flight wins over the eventual store.
    token: Uuid,
}

enum Slot {
    Ready(CacheEntry),
    InFlight(InFlight),
}

pub(crate) struct ResultCache {
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

enum Role {
    Leader {
        tx: watch::Sender<Option<Arc<ExecutionReport>>>,
        token: Uuid,
    },
    Follower {
        rx: watch::Receiver<Option<Arc<ExecutionReport>>>,
        token: Uuid,
    },
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Look up `fingerprint`, computing on a miss. The returned flag is
    /// this caller's `cache_hit`: true for a stored report and for
    /// followers that joined an in-flight computation, false only for
    /// the leader that actually ran it.
    pub async fn get_or_compute<F, Fut>(
        self: &Arc<Self>,
        fingerprint: &str,
        exercise_id: Option<Uuid>,
        compute: F,
    ) -> (Arc<ExecutionReport>, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ExecutionReport> + Send + 'static,
    {
        let mut compute = Some(compute);
        loop {
            let role = {
                let mut slots = self.slots.lock().await;
                let expired = matches!(
                    slots.get(fingerprint),
                    Some(Slot::Ready(entry)) if entry.expires_at <= Instant::now()
                );
                if expired {
                    slots.remove(fingerprint);
                }
                match slots.get(fingerprint) {
                    Some(Slot::Ready(entry)) => {
                        debug!(
                            fingerprint = %&fingerprint[..12.min(fingerprint.len())],
                            age_ms = entry.created_at.elapsed().as_millis() as u64,
                            "result cache hit"
                        );
                        return (Arc::clone(&entry.report), true);
                    }
                    Some(Slot::InFlight(inflight)) => Role::Follower {
                        rx: inflight.rx.clone(),
                        token: inflight.token,
                    },
                    None => {
                        let (tx, rx) = watch::channel::<Option<Arc<ExecutionReport>>>(None);
                        let token = Uuid::new_v4();
                        slots.insert(
                            fingerprint.to_string(),
                            Slot::InFlight(InFlight {
                                rx,
                                exercise_id,
                                token,
                            }),
                        );
                        Role::Leader { tx, token }
                    }
                }
            };

            match role {
                Role::Follower { mut rx, token } => {
                    debug!("joining an in-flight identical execution");
                    loop {
                        if let Some(report) = rx.borrow_and_update().as_ref() {
                            return (Arc::clone(report), true);
                        }
                        if rx.changed().await.is_err() {
                            // Leader died without publishing. Clear the dead
                            // slot ourselves (the leader's own cleanup may
                            // never run if its caller was dropped), then
                            // contend for leadership on the next pass. The
                            // token guard keeps this from evicting a newer
                            // flight for the same fingerprint.
                            self.forget_in_flight(fingerprint, token).await;
                            break;
                        }
                    }
                }
                Role::Leader { tx, token } => {
                    let make = match compute.take() {
                        Some(make) => make,
                        None => {
                            return (
                                Arc::new(ExecutionReport::internal_error(
                                    "cache leadership raced twice for one request",
                                )),
                                false,
                            )
                        }
                    };
                    // Detached so caller-side cancellation cannot strand
                    // the followers or skip the store.
                    let cache = Arc::clone(self);
                    let key = fingerprint.to_string();
                    let task = tokio::spawn(async move {
                        let report = Arc::new(make().await);
                        cache.store(&key, token, Arc::clone(&report)).await;
                        let _ = tx.send(Some(Arc::clone(&report)));
                        report
                    });
                    return match task.await {
                        Ok(report) => (report, false),
                        Err(join_error) => {
                            self.forget_in_flight(fingerprint, token).await;
                            error!(error = %join_error, "cache leader task failed");
                            (
                                Arc::new(ExecutionReport::internal_error(
                                    "execution task failed unexpectedly",
                                )),
                                false,
                            )
                        }
                    };
                }
            }
        }
    }

    async fn store(&self, fingerprint: &str, token: Uuid, report: Arc<ExecutionReport>) {
        let mut slots = self.slots.lock().await;
        let exercise_id = match slots.get(fingerprint) {
            Some(Slot::InFlight(inflight)) if inflight.token == token => inflight.exercise_id,
            // Invalidated or superseded while computing; waiters still
            // get the report through the watch channel, but the slot is
            // not resurrected.
            _ => {
                debug!("in-flight slot superseded during computation; not storing");
                return;
            }
        };
        if report.status.is_cacheable() {
            let now = Instant::now();
            slots.insert(
                fingerprint.to_string(),
                Slot::Ready(CacheEntry {
                    report,
                    created_at: now,
                    expires_at: now + self.ttl,
                    exercise_id,
                }),
            );
        } else {
            debug!(status = %report.status, "report not cacheable; dropping slot");
            slots.remove(fingerprint);
        }
    }

    async fn forget_in_flight(&self, fingerprint: &str, token: Uuid) {
        let mut slots = self.slots.lock().await;
        if matches!(slots.get(fingerprint), Some(Slot::InFlight(inflight)) if inflight.token == token)
        {
            slots.remove(fingerprint);
        }
    }

    /// Drop every entry tagged with `exercise_id`, including in-flight
    /// ones (their computations finish and are delivered to waiters, but
    /// their results are not stored).
    pub async fn invalidate_exercise(&self, exercise_id: Uuid) -> usize {
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready(entry) => entry.exercise_id != Some(exercise_id),
            Slot::InFlight(inflight) => inflight.exercise_id != Some(exercise_id),
        });
        before - slots.len()
    }

    /// Drop entries past their TTL. Expiry is also enforced lazily on
    /// lookup; this exists for housekeeping sweeps.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, slot| !matches!(slot, Slot::Ready(entry) if entry.expires_at <= now));
        before - slots.len()
    }

    pub async fn clear(&self) {
        self.slots.lock().await.clear();
    }

    /// Number of stored (ready) reports; in-flight computations are not
    /// counted.
    pub async fn len(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }
}
