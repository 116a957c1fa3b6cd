use std::{sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, trace};

use crate::peer::PeerHandle;

/// Periodically emits a keep-alive on every registered connection.
///
/// Runs independently of the tasks that own the connections, for the whole
/// life of the process. Each send runs in its own task so one stalled socket
/// cannot hold up the others.
#[derive(Clone)]
pub struct KeepAlive {
    period:  Duration,
    handles: Arc<Mutex<Vec<PeerHandle>>>,
}

impl KeepAlive {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn register(&self, handle: PeerHandle) {
        debug!(peer = %handle.peer(), "registered for keep-alive");
        self.handles.lock().await.push(handle);
    }

    /// Connections still considered live.
    pub async fn live(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Sends one round of keep-alives, forgetting connections that have closed.
    pub async fn tick(&self) {
        let handles = {
            let mut handles = self.handles.lock().await;
            handles.retain(|h| !h.is_closed());
            handles.clone()
        };
        trace!(live = handles.len(), "keep-alive tick");
        for handle in handles {
            tokio::spawn(async move { handle.send_keep_alive().await });
        }
    }

    /// Starts the timer. The first round fires one full period from now.
    pub fn spawn(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + this.period;
            let mut interval = tokio::time::interval_at(start, this.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                this.tick().await;
            }
        })
    }
}
