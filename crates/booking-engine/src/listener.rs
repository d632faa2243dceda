//! Long-lived listener for calendar change notifications.
//!
//! The listener keeps a subscription open, scans for changes whenever the
//! subscription signals, and resubscribes after `retry_delay` when the
//! subscription fails. A scan runs to completion once started; stopping only
//! takes effect between scans.
//!
//! ```text
//! Stopped -> Starting -> Listening <-> Scanning
//!               ^            |            |
//!               +-- retry ---+------------+
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ListenerConfig;
use crate::ports::{ChangeScanner, NotificationSource, SignalSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    /// Opening (or reopening) the subscription.
    Starting,
    Listening,
    Scanning,
}

/// Subscription loop for one calendar account.
pub struct ReconnectingNotificationListener {
    account: String,
    source: Arc<dyn NotificationSource>,
    scanner: Arc<dyn ChangeScanner>,
    config: ListenerConfig,
}

impl ReconnectingNotificationListener {
    pub fn new(
        account: impl Into<String>,
        source: Arc<dyn NotificationSource>,
        scanner: Arc<dyn ChangeScanner>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            account: account.into(),
            source,
            scanner,
            config,
        }
    }

    /// Run the listener on the current tokio runtime.
    pub fn spawn(self) -> ListenerHandle {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ListenerState::Starting);
        let task = tokio::spawn(self.run(cancel.clone(), state_tx));
        ListenerHandle {
            cancel,
            state: state_rx,
            task,
        }
    }

    async fn run(self, cancel: CancellationToken, state: watch::Sender<ListenerState>) {
        let (signal_tx, mut signals) = mpsc::channel(1);
        let (failure_tx, mut failures) = mpsc::unbounded_channel();
        let sender = SignalSender::new(signal_tx, failure_tx);

        tracing::info!(account = %self.account, "notification listener started");

        'connect: while !cancel.is_cancelled() {
            state.send_replace(ListenerState::Starting);
            // Leftovers from a previous subscription; the rescan below covers them.
            while failures.try_recv().is_ok() {}
            while signals.try_recv().is_ok() {}

            if let Err(err) = self.source.subscribe(sender.clone()).await {
                tracing::warn!(
                    account = %self.account,
                    error = %err,
                    retry_in_ms = self.config.retry_delay_ms,
                    "subscription failed"
                );
                if !self.wait_before_retry(&cancel).await {
                    break;
                }
                continue;
            }
            tracing::debug!(account = %self.account, "subscribed");

            // Changes may have happened while no subscription was open.
            let mut pending_scan = true;
            loop {
                if pending_scan {
                    state.send_replace(ListenerState::Scanning);
                    match self.scanner.scan().await {
                        Ok(changes) => {
                            tracing::debug!(account = %self.account, changes, "scan complete");
                        }
                        Err(err) => {
                            tracing::warn!(account = %self.account, error = %err, "scan failed");
                            self.source.unsubscribe().await;
                            if !self.wait_before_retry(&cancel).await {
                                break 'connect;
                            }
                            continue 'connect;
                        }
                    }
                    pending_scan = false;
                }

                if cancel.is_cancelled() {
                    break 'connect;
                }
                state.send_replace(ListenerState::Listening);

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'connect,
                    Some(err) = failures.recv() => {
                        tracing::warn!(account = %self.account, error = %err, "subscription lost");
                        self.source.unsubscribe().await;
                        if !self.wait_before_retry(&cancel).await {
                            break 'connect;
                        }
                        continue 'connect;
                    }
                    Some(()) = signals.recv() => pending_scan = true,
                }
            }
        }

        self.source.unsubscribe().await;
        state.send_replace(ListenerState::Stopped);
        tracing::info!(account = %self.account, "notification listener stopped");
    }

    /// Returns false when stopped during the wait.
    async fn wait_before_retry(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.retry_delay()) => true,
        }
    }
}

/// Control handle for a spawned listener.
pub struct ListenerHandle {
    cancel: CancellationToken,
    state: watch::Receiver<ListenerState>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    /// Ask the listener to stop. Idempotent; a running scan completes first.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "notification listener task failed");
        }
    }
}
