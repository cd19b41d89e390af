use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Background tasks that run a tick body on a fixed period.
///
/// A tick body always runs to completion; shutdown is only observed
/// between ticks.
#[derive(Debug)]
pub struct PeriodicTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for PeriodicTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl PeriodicTasks {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { shutdown, handles: Vec::new() }
    }

    /// Runs `tick` right away and then every `period`. When `wake` is given,
    /// a notification runs an extra tick without waiting for the period.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, period: Duration, wake: Option<Arc<Notify>>, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = interval.tick() => {}
                    _ = woken(wake.as_deref()) => {
                        interval.reset();
                    }
                }
                tick().await;
            }
            tracing::debug!(task = name, "Periodic task stopped");
        });
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signals every task and waits for them to finish their current tick.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Periodic task ended abnormally");
            }
        }
    }
}

async fn woken(wake: Option<&Notify>) {
    match wake {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}
