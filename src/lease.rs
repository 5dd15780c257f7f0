//! Renew/expire timer pairs for peer liveness.
//!
//! A [`Lease`] binds one peer relationship to two timers on the runtime's
//! timer wheel:
//!
//! - the **renew** timer fires every renew interval and sends a keep-alive
//!   to the peer;
//! - the **expire** timer fires once if a whole expire interval passes
//!   without [`Lease::renew`] being called, declaring the peer dead.
//!
//! Renewals reset the expire window to a fresh full interval; they do not
//! accumulate. The expire callback runs at most once per start and is
//! detached from the timer task, so [`Lease::stop`] never interrupts a
//! failure declaration that is already in progress.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::LeaseConfig;

#[derive(Debug)]
pub struct Lease {
    config: LeaseConfig,
    armed: Arc<AtomicBool>,
    reset: Arc<Notify>,
    renew_task: Option<JoinHandle<()>>,
    expire_task: Option<JoinHandle<()>>,
}

impl Lease {
    pub fn new(config: LeaseConfig) -> Self {
        Self {
            config,
            armed: Arc::new(AtomicBool::new(false)),
            reset: Arc::new(Notify::new()),
            renew_task: None,
            expire_task: None,
        }
    }

    pub fn config(&self) -> LeaseConfig {
        self.config
    }

    /// Arms both timers. Restarting an armed lease replaces its callbacks.
    pub fn start<R, E>(&mut self, mut on_renew: R, on_expire: E)
    where
        R: FnMut() + Send + 'static,
        E: Future<Output = ()> + Send + 'static,
    {
        self.stop();
        let armed = Arc::new(AtomicBool::new(true));
        let reset = Arc::new(Notify::new());
        self.armed = Arc::clone(&armed);
        self.reset = Arc::clone(&reset);

        let renew_every = self.config.renew_interval;
        let renew_armed = Arc::clone(&armed);
        self.renew_task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + renew_every, renew_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !renew_armed.load(Ordering::Acquire) {
                    return;
                }
                on_renew();
            }
        }));

        let expire_after = self.config.expire_interval;
        self.expire_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = reset.notified() => continue,
                    _ = tokio::time::sleep(expire_after) => {
                        // Only the first expiry after a start counts.
                        if armed.swap(false, Ordering::AcqRel) {
                            tokio::spawn(on_expire);
                        }
                        return;
                    }
                }
            }
        }));
    }

    /// Restarts the expire window. Called when the peer's renewal arrives.
    pub fn renew(&self) {
        if self.is_armed() {
            self.reset.notify_one();
        }
    }

    /// Disarms both timers.
    pub fn stop(&mut self) {
        self.armed.store(false, Ordering::Release);
        if let Some(task) = self.renew_task.take() {
            task.abort();
        }
        if let Some(task) = self.expire_task.take() {
            task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.stop();
    }
}
