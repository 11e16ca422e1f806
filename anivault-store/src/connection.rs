//! Lazily-established, health-tracked handle to the primary store.
//!
//! The first caller triggers a single bounded connection attempt; concurrent
//! first-callers are coalesced onto it. A failed attempt leaves the manager
//! in a permanent degraded mode for the process lifetime — the repository
//! layer above runs fully in fallback mode, so there is no retry loop.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::store::PrimaryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Connecting,
    Ready,
    Error,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: ConnState,
    pub last_error: Option<String>,
    /// Round-trip latency of the liveness probe, if one succeeded.
    pub probe_latency_ms: Option<u64>,
}

struct Health {
    state: ConnState,
    last_error: Option<String>,
    probe_latency_ms: Option<u64>,
}

pub struct ConnectionManager {
    store: Arc<dyn PrimaryStore>,
    connect_timeout: Duration,
    attempted: OnceCell<bool>,
    health: Mutex<Health>,
}

impl ConnectionManager {
    pub fn new(store: Arc<dyn PrimaryStore>, connect_timeout: Duration) -> Self {
        Self {
            store,
            connect_timeout,
            attempted: OnceCell::new(),
            health: Mutex::new(Health {
                state: ConnState::Connecting,
                last_error: None,
                probe_latency_ms: None,
            }),
        }
    }

    /// A manager with no primary store configured. Every `acquire` returns
    /// `None` without attempting anything.
    pub fn disabled(store: Arc<dyn PrimaryStore>) -> Self {
        Self {
            store,
            connect_timeout: Duration::ZERO,
            attempted: OnceCell::new_with(Some(false)),
            health: Mutex::new(Health {
                state: ConnState::Disabled,
                last_error: None,
                probe_latency_ms: None,
            }),
        }
    }

    /// The primary store handle, or `None` when it is unavailable. Never
    /// errors: unavailability is a signal, not a fault.
    pub async fn acquire(&self) -> Option<Arc<dyn PrimaryStore>> {
        let ok = self
            .attempted
            .get_or_init(|| async { self.try_connect().await })
            .await;
        if *ok {
            Some(Arc::clone(&self.store))
        } else {
            None
        }
    }

    async fn try_connect(&self) -> bool {
        let started = Instant::now();
        let probe = tokio::time::timeout(self.connect_timeout, self.store.ping()).await;

        match probe {
            Ok(Ok(())) => {
                let latency = started.elapsed().as_millis() as u64;
                // Safe to attempt on every startup.
                if let Err(e) = self.store.ensure_schema().await {
                    warn!(error = %e, "Primary store schema setup failed");
                    self.set_health(ConnState::Error, Some(e.to_string()), None);
                    return false;
                }
                info!(latency_ms = latency, "Primary store connection established");
                self.set_health(ConnState::Ready, None, Some(latency));
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Primary store unreachable, entering fallback mode");
                self.set_health(ConnState::Error, Some(e.to_string()), None);
                false
            }
            Err(_) => {
                let msg = format!(
                    "connection attempt timed out after {:?}",
                    self.connect_timeout
                );
                warn!("{msg}; entering fallback mode");
                self.set_health(ConnState::Error, Some(msg), None);
                false
            }
        }
    }

    fn set_health(&self, state: ConnState, error: Option<String>, latency: Option<u64>) {
        let mut health = self.health.lock().unwrap();
        health.state = state;
        health.last_error = error;
        health.probe_latency_ms = latency;
    }

    pub fn health(&self) -> HealthSnapshot {
        let health = self.health.lock().unwrap();
        HealthSnapshot {
            state: health.state,
            last_error: health.last_error.clone(),
            probe_latency_ms: health.probe_latency_ms,
        }
    }
}
