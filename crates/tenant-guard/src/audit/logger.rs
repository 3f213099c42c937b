//! Audit logger and outbox dispatcher.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::retry::{RetryExhausted, retry_with_backoff};
use super::{
    AlertKind, AlertSink, AuditAction, AuditAlert, AuditLogEntry, AuditOutcome, AuditStore,
    TracingAlertSink,
};
use crate::authz::DenyReason;
use crate::config::AuditConfig;
use crate::error::{AuditError, GuardResult};
use crate::tenant::{RequestMetadata, TenantId, UserId};

/// Table name recorded on authorization denial entries.
pub const DENIAL_TABLE: &str = "authorization";

/// Signals sent to the dispatcher task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchSignal {
    /// New entries are waiting.
    Wake,
    /// Drain once more and exit.
    Shutdown,
}

/// Counts from one outbox drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries newly appended to the log.
    pub delivered: u64,
    /// Entries the log already held.
    pub duplicates: u64,
}

/// Records audit entries and feeds the dispatcher.
///
/// Cloning is cheap; clones share the store, alert sink and dispatcher.
#[derive(Clone)]
pub struct AuditLogger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    store: Arc<dyn AuditStore>,
    alerts: Arc<dyn AlertSink>,
    config: AuditConfig,
    signal: Mutex<Option<mpsc::Sender<DispatchSignal>>>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("config", &self.inner.config)
            .field("dispatcher_running", &self.inner.signal.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl AuditLogger {
    /// Creates a logger that reports alerts through `tracing`.
    pub fn new(store: Arc<dyn AuditStore>, config: AuditConfig) -> Self {
        Self::with_alert_sink(store, config, Arc::new(TracingAlertSink))
    }

    /// Creates a logger with a custom alert sink.
    pub fn with_alert_sink(
        store: Arc<dyn AuditStore>,
        config: AuditConfig,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                store,
                alerts,
                config,
                signal: Mutex::new(None),
            }),
        }
    }

    /// Returns the audit configuration.
    pub fn config(&self) -> &AuditConfig {
        &self.inner.config
    }

    /// Returns the audit store.
    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.inner.store
    }

    /// Durably queues an entry and wakes the dispatcher.
    ///
    /// Never fails: when every retry fails an alert is raised and the
    /// caller carries on.
    pub async fn record(&self, entry: AuditLogEntry) {
        let store = &self.inner.store;
        let queued = &entry;
        let result = retry_with_backoff(&self.inner.config.retry, "audit enqueue", move || {
            store.enqueue(queued)
        })
        .await;

        match result {
            Ok(()) => self.notify(),
            Err(exhausted) => self.raise(AlertKind::EnqueueFailed, &entry, &exhausted),
        }
    }

    /// Records a denied authorization attempt on the `authorization` table.
    ///
    /// Does nothing when `audit_denials` is off.
    pub async fn record_denial(
        &self,
        user_id: &UserId,
        tenant_id: &TenantId,
        operation: &str,
        reason: &DenyReason,
        metadata: &RequestMetadata,
    ) {
        if !self.inner.config.audit_denials {
            return;
        }

        let entry = AuditLogEntry::new(
            user_id.clone(),
            tenant_id.clone(),
            DENIAL_TABLE,
            AuditAction::Read,
        )
        .with_outcome(AuditOutcome::Denied)
        .with_metadata(metadata.clone())
        .with_detail("operation", operation)
        .with_detail("reason", reason.code());
        self.record(entry).await;
    }

    /// Wakes the dispatcher, if one is running.
    pub fn notify(&self) {
        if let Some(sender) = self.inner.signal.lock().as_ref() {
            // A full channel already holds a pending wake-up.
            let _ = sender.try_send(DispatchSignal::Wake);
        }
    }

    /// Returns the number of entries waiting in the outbox.
    pub async fn pending_count(&self) -> GuardResult<u64> {
        self.inner.store.pending_count().await
    }

    /// Starts the background dispatcher.
    ///
    /// The dispatcher first delivers whatever a previous process left in the
    /// outbox, then delivers on every wake-up and every `flush_interval`.
    /// Run one dispatcher per logger.
    pub fn start_dispatcher(&self) -> DispatcherHandle {
        let (sender, receiver) = mpsc::channel(self.inner.config.queue_capacity.max(1));
        *self.inner.signal.lock() = Some(sender.clone());

        let logger = self.clone();
        let handle = tokio::spawn(async move {
            logger.dispatch_loop(receiver).await;
        });

        DispatcherHandle {
            sender,
            handle,
            logger: self.clone(),
        }
    }

    async fn dispatch_loop(&self, mut receiver: mpsc::Receiver<DispatchSignal>) {
        info!("Audit dispatcher started");
        self.drain_logged().await;

        loop {
            match tokio::time::timeout(self.inner.config.flush_interval, receiver.recv()).await {
                Ok(Some(DispatchSignal::Wake)) | Err(_) => self.drain_logged().await,
                Ok(Some(DispatchSignal::Shutdown)) | Ok(None) => {
                    self.drain_logged().await;
                    break;
                }
            }
        }

        info!("Audit dispatcher stopped");
    }

    async fn drain_logged(&self) {
        match self.flush().await {
            Ok(report) if report.delivered > 0 || report.duplicates > 0 => {
                debug!(
                    delivered = report.delivered,
                    duplicates = report.duplicates,
                    "Delivered audit entries"
                );
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Audit drain stopped early"),
        }
    }

    /// Delivers every queued entry to the audit log, in enqueue order.
    ///
    /// Stops at the first entry that cannot be delivered after retries,
    /// raising an alert and leaving it and everything after it queued.
    pub async fn flush(&self) -> GuardResult<DrainReport> {
        let store = &self.inner.store;
        let retry = &self.inner.config.retry;
        let batch_size = self.inner.config.batch_size.max(1);
        let mut report = DrainReport::default();

        loop {
            let batch = retry_with_backoff(retry, "audit outbox read", move || {
                store.pending(batch_size)
            })
            .await
            .map_err(|exhausted| exhausted.last_error)?;

            if batch.is_empty() {
                return Ok(report);
            }

            for queued in &batch {
                match retry_with_backoff(retry, "audit delivery", move || store.deliver(queued))
                    .await
                {
                    Ok(true) => report.delivered += 1,
                    Ok(false) => report.duplicates += 1,
                    Err(exhausted) => {
                        self.raise(AlertKind::DeliveryFailed, &queued.entry, &exhausted);
                        return Err(AuditError::WriteFailure {
                            entry_id: queued.entry.id,
                            attempts: exhausted.attempts,
                            message: exhausted.last_error.to_string(),
                        }
                        .into());
                    }
                }
            }

            if batch.len() < batch_size {
                return Ok(report);
            }
        }
    }

    fn raise(&self, kind: AlertKind, entry: &AuditLogEntry, exhausted: &RetryExhausted) {
        let alert = AuditAlert {
            kind,
            entry_id: entry.id,
            tenant_id: entry.tenant_id.clone(),
            attempts: exhausted.attempts,
            message: exhausted.last_error.to_string(),
        };
        self.inner.alerts.raise(&alert);
    }
}

/// Handle to a running dispatcher.
pub struct DispatcherHandle {
    sender: mpsc::Sender<DispatchSignal>,
    handle: JoinHandle<()>,
    logger: AuditLogger,
}

impl DispatcherHandle {
    /// Returns true once the dispatcher task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Drains the outbox one last time and stops the dispatcher.
    pub async fn shutdown(self) {
        *self.logger.inner.signal.lock() = None;

        if self.sender.send(DispatchSignal::Shutdown).await.is_err() {
            warn!("Audit dispatcher exited before shutdown");
        }
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Audit dispatcher task failed");
        }
    }
}
