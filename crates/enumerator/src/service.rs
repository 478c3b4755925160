use crate::error::Result;
use crate::model::Request;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

pub const REQUEST_QUEUE_CAPACITY: usize = 100;

/// State shared by every engine service: the activity flag polled by the
/// quiescence loop, the inbound request queue, and the control channels.
pub struct ServiceBase {
    name: String,
    active: AtomicBool,
    request_tx: mpsc::Sender<Request>,
    request_rx: Mutex<Option<mpsc::Receiver<Request>>>,
    quit_tx: watch::Sender<bool>,
    pause_rx: watch::Receiver<bool>,
}

impl ServiceBase {
    pub fn new(name: &str, pause_rx: watch::Receiver<bool>) -> Self {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (quit_tx, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            active: AtomicBool::new(false),
            request_tx,
            request_rx: Mutex::new(Some(request_rx)),
            quit_tx,
            pause_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark the service as having performed work since the last tick.
    pub fn set_active(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    /// Read and reset the activity flag. Called once per quiescence tick.
    pub fn take_active(&self) -> bool {
        self.active.swap(false, Ordering::Relaxed)
    }

    pub fn request_tx(&self) -> mpsc::Sender<Request> {
        self.request_tx.clone()
    }

    /// Hand the inbound queue to the drain task. Succeeds once.
    pub fn take_request_rx(&self) -> Option<mpsc::Receiver<Request>> {
        self.request_rx
            .lock()
            .expect("request queue lock poisoned")
            .take()
    }

    pub fn quit(&self) {
        let _ = self.quit_tx.send(true);
    }

    pub fn quit_rx(&self) -> watch::Receiver<bool> {
        self.quit_tx.subscribe()
    }

    pub fn pause_rx(&self) -> watch::Receiver<bool> {
        self.pause_rx.clone()
    }
}

/// Block while the engine is paused. Returns immediately when running.
pub async fn pause_point(pause_rx: &mut watch::Receiver<bool>) {
    while *pause_rx.borrow() {
        if pause_rx.changed().await.is_err() {
            return;
        }
    }
}

/// The capability set every engine service implements. Services run their
/// own tasks: at least one driver and one drain of the inbound queue.
#[async_trait]
pub trait Service: Send + Sync {
    fn base(&self) -> &ServiceBase;

    /// Spawn the service tasks. A failure here aborts engine startup.
    async fn start(self: Arc<Self>) -> Result<()>;

    fn name(&self) -> String {
        self.base().name().to_string()
    }

    /// Signal the service tasks to exit.
    fn stop(&self) {
        self.base().quit();
    }

    async fn send_request(&self, req: Request) {
        let _ = self.base().request_tx().send(req).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ServiceBase {
        let (_pause_tx, pause_rx) = watch::channel(false);
        ServiceBase::new("test", pause_rx)
    }

    #[test]
    fn activity_flag_resets_on_take() {
        let base = base();
        assert!(!base.take_active());
        base.set_active();
        assert!(base.take_active());
        assert!(!base.take_active());
    }

    #[test]
    fn request_queue_can_be_taken_once() {
        let base = base();
        assert!(base.take_request_rx().is_some());
        assert!(base.take_request_rx().is_none());
    }

    #[tokio::test]
    async fn quit_reaches_every_subscriber() {
        let base = base();
        let mut rx = base.quit_rx();
        base.quit();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn pause_point_blocks_until_resume() {
        let (pause_tx, pause_rx) = watch::channel(true);
        let mut rx = pause_rx.clone();

        let waiter = tokio::spawn(async move {
            pause_point(&mut rx).await;
        });

        // still paused after a moment
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pause_tx.send(false).unwrap();
        tokio::time::timeout(std::time::Duration::from_millis(200), waiter)
            .await
            .expect("resume should unblock the pause point")
            .unwrap();
    }
}
