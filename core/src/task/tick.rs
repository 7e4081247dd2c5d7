use std::{sync::Arc, time::Duration};
use tokio::select;
use triggered::{trigger, Listener, Trigger};

use super::service::{AsyncService, AsyncServiceFuture};

const TICK: &str = "tick-service";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReason {
    Wakeup,
    Shutdown,
}

pub struct TickService {
    shutdown_trigger: Trigger,
    shutdown_listener: Listener,
}

impl TickService {
    pub fn new() -> Self {
        let (shutdown, monitor) = trigger();
        Self { shutdown_trigger: shutdown, shutdown_listener: monitor }
    }

    /// Waits until `duration` has elapsed when the service is started.
    ///
    /// Returns immediately when the service is stopped.
    pub async fn tick(&self, duration: Duration) -> TickReason {
        if self.is_shutdown() {
            return TickReason::Shutdown;
        }
        let shutdown_listener = self.shutdown_listener.clone();
        select! {
            biased;
            _ = shutdown_listener => TickReason::Shutdown,
            _ = tokio::time::sleep(duration) => TickReason::Wakeup,
        }
    }

    pub fn shutdown(&self) {
        self.shutdown_trigger.trigger();
    }

    /// Non-blocking check, usable from blocking worker threads between units of work
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_listener.is_triggered()
    }
}

impl Default for TickService {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncService for TickService {
    fn ident(self: Arc<Self>) -> &'static str {
        TICK
    }

    fn start(self: Arc<Self>) -> AsyncServiceFuture {
        Box::pin(async move { Ok(()) })
    }

    fn signal_exit(self: Arc<Self>) {
        self.shutdown();
    }

    fn stop(self: Arc<Self>) -> AsyncServiceFuture {
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tick_wakeup_then_shutdown() {
        let ts = Arc::new(TickService::new());
        assert_eq!(ts.tick(Duration::from_millis(10)).await, TickReason::Wakeup);

        let cloned = ts.clone();
        let handle = tokio::spawn(async move { cloned.tick(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ts.clone().signal_exit();
        assert_eq!(handle.await.unwrap(), TickReason::Shutdown);
        assert!(ts.is_shutdown());
        assert_eq!(ts.tick(Duration::from_secs(60)).await, TickReason::Shutdown);
    }
}
