//! Compliance reporting over the audit log.
//!
//! Snapshots are derived data: a pure fold over the delivered audit log for
//! one tenant (or all tenants) and a time window. Running the same report
//! twice over the same log gives equal snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audit::{AuditAction, AuditFilter, AuditOutcome, AuditRecord, AuditStore, TimeWindow};
use crate::config::ComplianceConfig;
use crate::error::{ComplianceError, GuardError, GuardResult};
use crate::tenant::TenantId;

/// Per-action counts for one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCounts {
    /// Creates.
    pub create: u64,
    /// Reads.
    pub read: u64,
    /// Updates.
    pub update: u64,
    /// Deletes.
    pub delete: u64,
}

impl ActionCounts {
    fn add(&mut self, action: AuditAction) {
        match action {
            AuditAction::Create => self.create += 1,
            AuditAction::Read => self.read += 1,
            AuditAction::Update => self.update += 1,
            AuditAction::Delete => self.delete += 1,
        }
    }

    /// Sum over all actions.
    pub fn total(&self) -> u64 {
        self.create + self.read + self.update + self.delete
    }
}

/// Per-outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    /// Entries with outcome `success`.
    pub success: u64,
    /// Entries with outcome `failure`.
    pub failure: u64,
    /// Entries with outcome `denied`.
    pub denied: u64,
}

impl OutcomeCounts {
    fn add(&mut self, outcome: AuditOutcome) {
        match outcome {
            AuditOutcome::Success => self.success += 1,
            AuditOutcome::Failure => self.failure += 1,
            AuditOutcome::Denied => self.denied += 1,
        }
    }
}

/// Access counts over a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceSnapshot {
    /// `None` for a platform-wide report.
    pub tenant_id: Option<TenantId>,
    /// Window the report covers.
    pub window: TimeWindow,
    /// Entries in the window.
    pub total_entries: u64,
    /// Counts per table and action.
    pub by_table: BTreeMap<String, ActionCounts>,
    /// Counts per outcome.
    pub by_outcome: OutcomeCounts,
    /// Number of distinct actors.
    pub distinct_actors: u64,
    /// Denied attempts per actor, for spotting probing.
    pub denials_by_actor: BTreeMap<String, u64>,
}

impl ComplianceSnapshot {
    fn empty(tenant_id: Option<TenantId>, window: TimeWindow) -> Self {
        Self {
            tenant_id,
            window,
            total_entries: 0,
            by_table: BTreeMap::new(),
            by_outcome: OutcomeCounts::default(),
            distinct_actors: 0,
            denials_by_actor: BTreeMap::new(),
        }
    }
}

/// Builds compliance reports from the audit log.
#[derive(Clone)]
pub struct ComplianceAggregator {
    store: Arc<dyn AuditStore>,
    config: ComplianceConfig,
}

impl std::fmt::Debug for ComplianceAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplianceAggregator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ComplianceAggregator {
    /// Creates an aggregator over an audit store.
    pub fn new(store: Arc<dyn AuditStore>, config: ComplianceConfig) -> Self {
        Self { store, config }
    }

    /// Summarizes the audit log for a tenant, or every tenant when `None`.
    ///
    /// Fails with [`ComplianceError::Timeout`] once `query_timeout` elapses.
    pub async fn summarize(
        &self,
        tenant_id: Option<&TenantId>,
        window: TimeWindow,
    ) -> GuardResult<ComplianceSnapshot> {
        let started = Instant::now();
        match tokio::time::timeout(self.config.query_timeout, self.fold(tenant_id, window)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    tenant_id = ?tenant_id,
                    timeout_ms = self.config.query_timeout.as_millis(),
                    "Compliance summary timed out"
                );
                Err(ComplianceError::Timeout {
                    elapsed: started.elapsed(),
                }
                .into())
            }
        }
    }

    /// Like [`summarize`](Self::summarize), but also stops when `cancel` completes.
    pub async fn summarize_until<C>(
        &self,
        tenant_id: Option<&TenantId>,
        window: TimeWindow,
        cancel: C,
    ) -> GuardResult<ComplianceSnapshot>
    where
        C: Future<Output = ()>,
    {
        tokio::select! {
            result = self.summarize(tenant_id, window) => result,
            _ = cancel => {
                debug!(tenant_id = ?tenant_id, "Compliance summary cancelled");
                Err(ComplianceError::Cancelled.into())
            }
        }
    }

    /// Returns every entry for one record within the window, oldest first.
    pub async fn access_history(
        &self,
        tenant_id: &TenantId,
        table_name: &str,
        record_id: &str,
        window: TimeWindow,
    ) -> GuardResult<Vec<AuditRecord>> {
        let filter = AuditFilter::new()
            .for_tenant(tenant_id.clone())
            .for_record(table_name, record_id)
            .within(window);

        let collect = async {
            let mut history = Vec::new();
            self.for_each_page(&filter, |page| history.extend_from_slice(page))
                .await?;
            Ok::<_, GuardError>(history)
        };

        tokio::time::timeout(self.config.query_timeout, collect)
            .await
            .map_err(|_| ComplianceError::Timeout {
                elapsed: self.config.query_timeout,
            })?
    }

    async fn fold(
        &self,
        tenant_id: Option<&TenantId>,
        window: TimeWindow,
    ) -> GuardResult<ComplianceSnapshot> {
        let mut filter = AuditFilter::new().within(window);
        filter.tenant_id = tenant_id.cloned();

        let mut snapshot = ComplianceSnapshot::empty(tenant_id.cloned(), window);
        let mut actors = BTreeSet::new();

        self.for_each_page(&filter, |page| {
            for record in page {
                let entry = &record.entry;
                snapshot.total_entries += 1;
                snapshot
                    .by_table
                    .entry(entry.table_name.clone())
                    .or_default()
                    .add(entry.action);
                snapshot.by_outcome.add(entry.outcome);
                if entry.outcome == AuditOutcome::Denied {
                    *snapshot
                        .denials_by_actor
                        .entry(entry.actor_id.as_str().to_string())
                        .or_default() += 1;
                }
                actors.insert(entry.actor_id.clone());
            }
        })
        .await?;

        snapshot.distinct_actors = actors.len() as u64;
        Ok(snapshot)
    }

    /// Pages through matching log entries by sequence, yielding between pages.
    async fn for_each_page<F>(&self, filter: &AuditFilter, mut visit: F) -> GuardResult<()>
    where
        F: FnMut(&[AuditRecord]),
    {
        let page_size = self.config.page_size.max(1);
        let mut after = 0;

        loop {
            let page = self.store.entries(filter, after, page_size).await?;
            visit(&page);

            match page.last() {
                Some(last) if page.len() == page_size => after = last.sequence,
                _ => return Ok(()),
            }

            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::audit::{AuditLogEntry, QueuedEntry};

    /// A store whose log reads never finish.
    struct StalledStore;

    #[async_trait]
    impl AuditStore for StalledStore {
        async fn enqueue(&self, _entry: &AuditLogEntry) -> GuardResult<()> {
            Ok(())
        }

        async fn pending(&self, _limit: usize) -> GuardResult<Vec<QueuedEntry>> {
            Ok(Vec::new())
        }

        async fn pending_count(&self) -> GuardResult<u64> {
            Ok(0)
        }

        async fn deliver(&self, _queued: &QueuedEntry) -> GuardResult<bool> {
            Ok(false)
        }

        async fn entries(
            &self,
            _filter: &AuditFilter,
            _after_sequence: i64,
            _limit: usize,
        ) -> GuardResult<Vec<AuditRecord>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    fn window() -> TimeWindow {
        TimeWindow::last(ChronoDuration::days(1)).unwrap()
    }

    fn stalled() -> ComplianceAggregator {
        ComplianceAggregator::new(
            Arc::new(StalledStore),
            ComplianceConfig {
                query_timeout: Duration::from_secs(5),
                page_size: 10,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_summarize_times_out() {
        let result = stalled().summarize(None, window()).await;
        assert!(matches!(
            result,
            Err(GuardError::Compliance(ComplianceError::Timeout { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_summarize_until_cancel() {
        let cancel = tokio::time::sleep(Duration::from_secs(1));
        let result = stalled()
            .summarize_until(Some(&TenantId::new("clinic-a")), window(), cancel)
            .await;
        assert!(matches!(
            result,
            Err(GuardError::Compliance(ComplianceError::Cancelled))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_access_history_times_out() {
        let result = stalled()
            .access_history(&TenantId::new("clinic-a"), "patients", "p1", window())
            .await;
        assert!(matches!(
            result,
            Err(GuardError::Compliance(ComplianceError::Timeout { .. }))
        ));
    }

    #[test]
    fn test_action_counts() {
        let mut counts = ActionCounts::default();
        counts.add(AuditAction::Read);
        counts.add(AuditAction::Read);
        counts.add(AuditAction::Delete);
        assert_eq!(counts.read, 2);
        assert_eq!(counts.total(), 3);
    }
}
