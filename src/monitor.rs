//! Connectivity watcher that kicks a background sync on reconnect.

use async_trait::async_trait;
use reqwest::{Client, Url};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::orchestrator::SyncTrigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> Connectivity;
}

/// Treats any HTTP response from the backend as online.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    http: Client,
    url: Url,
}

impl HttpProbe {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn check(&self) -> Connectivity {
        match self.http.get(self.url.clone()).send().await {
            Ok(_) => Connectivity::Online,
            Err(err) => {
                debug!(?err, "connectivity probe failed");
                Connectivity::Offline
            }
        }
    }
}

pub struct NetworkMonitor {
    trigger: Arc<dyn SyncTrigger>,
    online: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Pass started by the poller. Runs on its own task so stopping the poller never cuts it short.
    pass: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    /// Starts in the offline state, so the first online observation counts as a reconnect.
    pub fn new(trigger: Arc<dyn SyncTrigger>) -> Self {
        Self {
            trigger,
            online: AtomicBool::new(false),
            task: Mutex::new(None),
            pass: Mutex::new(None),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Record a connectivity event. True only on an offline to online transition.
    pub fn observe(&self, state: Connectivity) -> bool {
        let now_online = state == Connectivity::Online;
        let was_online = self.online.swap(now_online, Ordering::AcqRel);
        if was_online != now_online {
            info!(?state, "connectivity changed");
        }
        !was_online && now_online
    }

    fn should_sync(&self, state: Connectivity) -> bool {
        if !self.observe(state) {
            return false;
        }
        if self.trigger.is_syncing() {
            debug!("reconnected while a sync is running; not starting another");
            return false;
        }
        info!("reconnected; starting background sync");
        true
    }

    /// Handle a platform connectivity callback and run the pass to completion.
    /// Returns whether a sync was started.
    pub async fn on_change(&self, state: Connectivity) -> bool {
        if !self.should_sync(state) {
            return false;
        }
        self.trigger.trigger_sync().await;
        true
    }

    async fn spawn_pass(&self) {
        let trigger = Arc::clone(&self.trigger);
        let handle = tokio::spawn(async move { trigger.trigger_sync().await });
        // Any replaced handle belongs to a pass that already released its guard.
        self.pass.lock().await.replace(handle);
    }

    /// Poll `probe` every `interval` until [`NetworkMonitor::stop`] is called.
    /// Calling start again replaces the running poller.
    pub async fn start(self: &Arc<Self>, probe: Arc<dyn ConnectivityProbe>, interval: Duration) {
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let state = probe.check().await;
                if monitor.should_sync(state) {
                    monitor.spawn_pass().await;
                }
            }
        });
        if let Some(previous) = self.task.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Stop polling, then wait for a pass the poller already started.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            debug!("network monitor stopped");
        }
        let pass = self.pass.lock().await.take();
        if let Some(pass) = pass {
            if !pass.is_finished() {
                info!("waiting for the running sync pass to finish");
            }
            if let Err(err) = pass.await {
                warn!(?err, "background sync task ended abnormally");
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingTrigger {
        busy: AtomicBool,
        fired: AtomicUsize,
    }

    #[async_trait]
    impl SyncTrigger for CountingTrigger {
        fn is_syncing(&self) -> bool {
            self.busy.load(Ordering::SeqCst)
        }

        async fn trigger_sync(&self) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedProbe {
        states: std::sync::Mutex<VecDeque<Connectivity>>,
    }

    #[async_trait]
    impl ConnectivityProbe for ScriptedProbe {
        async fn check(&self) -> Connectivity {
            self.states
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Connectivity::Online)
        }
    }

    #[test]
    fn observe_reports_only_reconnects() {
        let monitor = NetworkMonitor::new(Arc::new(CountingTrigger::default()));
        assert!(!monitor.observe(Connectivity::Offline));
        assert!(monitor.observe(Connectivity::Online));
        assert!(!monitor.observe(Connectivity::Online));
        assert!(!monitor.observe(Connectivity::Offline));
        assert!(monitor.observe(Connectivity::Online));
    }

    #[tokio::test]
    async fn reconnect_triggers_unless_busy() {
        let trigger = Arc::new(CountingTrigger::default());
        let monitor = NetworkMonitor::new(trigger.clone());

        assert!(monitor.on_change(Connectivity::Online).await);
        assert_eq!(trigger.fired.load(Ordering::SeqCst), 1);

        monitor.on_change(Connectivity::Offline).await;
        trigger.busy.store(true, Ordering::SeqCst);
        assert!(!monitor.on_change(Connectivity::Online).await);
        assert_eq!(trigger.fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poller_fires_once_per_reconnect_and_stops() {
        let trigger = Arc::new(CountingTrigger::default());
        let monitor = Arc::new(NetworkMonitor::new(trigger.clone()));
        let probe = Arc::new(ScriptedProbe {
            states: std::sync::Mutex::new(VecDeque::from([
                Connectivity::Offline,
                Connectivity::Online,
                Connectivity::Online,
                Connectivity::Offline,
                Connectivity::Online,
            ])),
        });

        monitor.start(probe, Duration::from_secs(1)).await;
        assert!(monitor.is_running().await);
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(trigger.fired.load(Ordering::SeqCst), 2);

        monitor.stop().await;
        assert!(!monitor.is_running().await);
    }
}
