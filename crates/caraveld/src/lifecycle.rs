//! Cooperative shutdown for the long-lived workers.
//!
//! The application root owns a [`LifeCycle`]; everything else receives a
//! cloneable [`LifeCycleHandle`] from it. Workers hold an [`Activity`] while
//! they have work in flight and select on a [`ShutdownSubscription`] while
//! idling; `wait_for_shutdown` completes once every Activity is gone.
use tokio::sync::{mpsc, watch};

/// Represents some work that cannot be ruthlessly interrupted. While any
/// Activity instances are alive, `LifeCycle::wait_for_shutdown` cannot
/// complete.
#[derive(Clone)]
pub struct Activity {
    _tx: mpsc::Sender<()>,
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Activity").finish()
    }
}

/// Used by code that is idling: select on your timeout and `shutting_down`
/// to wake when either the timeout expires or shutdown begins.
#[derive(Clone)]
pub struct ShutdownSubscription {
    rx: watch::Receiver<bool>,
}

impl ShutdownSubscription {
    pub fn is_stopping(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn shutting_down(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Cloneable handle passed to services by the application root. Holds
/// only a weak reference to the activity channel, so a forgotten handle
/// can never stall shutdown; only live Activity guards do.
#[derive(Clone)]
pub struct LifeCycleHandle {
    stop_rx: watch::Receiver<bool>,
    request_tx: mpsc::Sender<()>,
    activity_tx: mpsc::WeakSender<()>,
}

impl LifeCycleHandle {
    pub fn subscribe(&self) -> ShutdownSubscription {
        ShutdownSubscription {
            rx: self.stop_rx.clone(),
        }
    }

    pub fn activity(&self) -> Activity {
        match self.activity_tx.upgrade() {
            Some(tx) => Activity { _tx: tx },
            None => {
                // Shutdown is already draining; hand out a guard that
                // blocks nothing
                let (tx, _rx) = mpsc::channel(1);
                Activity { _tx: tx }
            }
        }
    }

    /// Ask the process to shut down. Causes `wait_for_shutdown` on the
    /// owning LifeCycle to wake up and begin the shutdown procedure.
    pub async fn request_shutdown(&self) {
        self.request_tx.send(()).await.ok();
    }
}

/// Owned by the application root; drives the shutdown sequence.
pub struct LifeCycle {
    stop_tx: watch::Sender<bool>,
    activity_master: mpsc::Sender<()>,
    activity_rx: mpsc::Receiver<()>,
    request_rx: mpsc::Receiver<()>,
    handle: LifeCycleHandle,
}

impl LifeCycle {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (activity_master, activity_rx) = mpsc::channel(1);
        let (request_tx, request_rx) = mpsc::channel(1);

        Self {
            stop_tx,
            activity_rx,
            request_rx,
            handle: LifeCycleHandle {
                stop_rx,
                request_tx,
                activity_tx: activity_master.downgrade(),
            },
            activity_master,
        }
    }

    pub fn handle(&self) -> LifeCycleHandle {
        self.handle.clone()
    }

    /// Wait for an interrupt or a shutdown request, propagate the stop
    /// signal, then wait for all outstanding activity to finish.
    pub async fn wait_for_shutdown(mut self) {
        tracing::debug!("waiting for shutdown request");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = self.request_rx.recv() => {}
        };
        tracing::info!("shutdown requested, waiting for in-flight work");
        self.stop_tx.send(true).ok();
        // Release the master sender; the channel closes once every
        // worker has dropped its Activity
        drop(self.activity_master);
        self.activity_rx.recv().await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_waits_for_activity() {
        let lifecycle = LifeCycle::new();
        let handle = lifecycle.handle();

        let activity = handle.activity();
        let mut sub = handle.subscribe();
        assert!(!sub.is_stopping());

        let worker = tokio::spawn(async move {
            sub.shutting_down().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(activity);
        });

        handle.request_shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), lifecycle.wait_for_shutdown())
            .await
            .expect("shutdown must complete once activity is dropped");
        worker.await.unwrap();
        assert!(handle.subscribe().is_stopping());
    }
}
