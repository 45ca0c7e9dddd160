//! Shared system monitor
//!
//! One `sysinfo::System` behind a lock, refreshed on a timer, so the
//! status endpoint reads cached numbers instead of rescanning the host
//! per request. CPU usage in particular needs two spaced refreshes
//! before it reports anything.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio::sync::RwLock;
use tokio::time;

pub struct SystemMonitor {
    system: Arc<RwLock<System>>,
    _refresh_task: tokio::task::JoinHandle<()>,
}

impl SystemMonitor {
    pub fn new(refresh_interval: Duration) -> Self {
        let system = Arc::new(RwLock::new(System::new_all()));
        let refresh_task = Self::start_refresh_task(system.clone(), refresh_interval);

        Self {
            system,
            _refresh_task: refresh_task,
        }
    }

    /// Get the shared system instance
    pub fn system(&self) -> Arc<RwLock<System>> {
        self.system.clone()
    }

    fn start_refresh_task(
        system: Arc<RwLock<System>>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                let mut sys = system.write().await;
                sys.refresh_memory();
                sys.refresh_cpu_usage();
                tracing::trace!("system monitor refreshed");
            }
        })
    }
}

impl Drop for SystemMonitor {
    fn drop(&mut self) {
        self._refresh_task.abort();
    }
}
