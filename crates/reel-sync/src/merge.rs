//! Execute a consolidation plan: re-point or drop picks, then delete losers.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use reel_core::{ConsolidationGroup, PickKind};
use reel_storage::{with_store_retries, BackoffPolicy, CatalogStore, StoreError};
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::consolidate::ConsolidationPlan;
use crate::report::{Category, ReportBuilder, ReportEntry, Stage};
use crate::RunMode;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub groups: usize,
    pub failed_groups: usize,
}

pub struct MergeExecutor {
    store: Arc<dyn CatalogStore>,
    mode: RunMode,
    workers: usize,
    retry: BackoffPolicy,
}

impl MergeExecutor {
    pub fn new(store: Arc<dyn CatalogStore>, mode: RunMode) -> Self {
        Self {
            store,
            mode,
            workers: 4,
            retry: BackoffPolicy::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Groups have disjoint keep ids and run concurrently; fragments are merged
    /// back in plan order. A group whose task dies is reported as failed.
    pub async fn execute(
        &self,
        plan: &ConsolidationPlan,
        report: &mut ReportBuilder,
    ) -> Result<MergeSummary> {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = Vec::with_capacity(plan.groups.len());
        for group in plan.groups.iter().cloned() {
            let store = Arc::clone(&self.store);
            let permits = Arc::clone(&permits);
            let mode = self.mode;
            let retry = self.retry;
            let span = info_span!("merge_group", group = %group.key, keep = %group.keep_id);
            tasks.push(tokio::spawn(
                async move {
                    let _permit = permits.acquire_owned().await;
                    let mut fragment = ReportBuilder::new();
                    let outcome =
                        merge_group(store.as_ref(), mode, &retry, &group, &mut fragment).await;
                    let failed = match outcome {
                        Ok(()) => false,
                        Err(err) => {
                            if err.is_invariant_violation() {
                                error!(group = %group.key, error = %err, "store rejected merge step");
                                fragment.mark_invariant_violation();
                            } else {
                                error!(group = %group.key, error = %err, "merge group failed");
                            }
                            fragment.record(
                                Category::Failed,
                                ReportEntry::new(Stage::Merge, group.key.to_string())
                                    .candidates(group.delete_ids.iter().copied())
                                    .detail(err.to_string()),
                            );
                            true
                        }
                    };
                    (fragment, failed)
                }
                .instrument(span),
            ));
        }

        let mut summary = MergeSummary {
            groups: plan.groups.len(),
            failed_groups: 0,
        };
        for (group, task) in plan.groups.iter().zip(tasks) {
            let (fragment, failed) = match task.await {
                Ok(done) => done,
                Err(err) => {
                    error!(group = %group.key, error = %err, "merge task did not finish");
                    let mut fragment = ReportBuilder::new();
                    fragment.record(
                        Category::Failed,
                        ReportEntry::new(Stage::Merge, group.key.to_string())
                            .candidates(group.delete_ids.iter().copied())
                            .detail(format!("merge task did not finish: {err}")),
                    );
                    (fragment, true)
                }
            };
            summary.failed_groups += usize::from(failed);
            report.merge(fragment);
        }
        info!(
            groups = summary.groups,
            failed = summary.failed_groups,
            applied = self.mode.applies(),
            "merge finished"
        );
        Ok(summary)
    }
}

/// Sequential work for one group. Every step checks current state first, so
/// re-running a finished group does nothing.
async fn merge_group(
    store: &dyn CatalogStore,
    mode: RunMode,
    retry: &BackoffPolicy,
    group: &ConsolidationGroup,
    fragment: &mut ReportBuilder,
) -> Result<(), StoreError> {
    let keep_id = group.keep_id;
    let keep_picks =
        with_store_retries(retry, "picks_for_participant", || store.picks_for_participant(keep_id))
            .await?;
    let mut occupied: HashSet<(Uuid, PickKind)> =
        keep_picks.iter().map(|p| (p.item_id, p.kind)).collect();

    for &loser_id in &group.delete_ids {
        let loser_name = group
            .members
            .iter()
            .find(|m| m.id == loser_id)
            .map(|m| m.display_name.clone())
            .unwrap_or_default();
        let picks = with_store_retries(retry, "picks_for_participant", || {
            store.picks_for_participant(loser_id)
        })
        .await?;

        for pick in picks {
            let key = format!("{}/{}", group.key, pick.id);
            if occupied.contains(&(pick.item_id, pick.kind)) {
                if mode.applies() {
                    with_store_retries(retry, "delete_pick", || store.delete_pick(pick.id)).await?;
                }
                fragment.record(
                    Category::CollisionDropped,
                    ReportEntry::new(Stage::Merge, key)
                        .raw_name(loser_name.clone())
                        .candidates([keep_id])
                        .detail(format!(
                            "{} pick for item {} already owned by {}",
                            pick.kind, pick.item_id, keep_id
                        )),
                );
            } else {
                occupied.insert((pick.item_id, pick.kind));
                if mode.applies() {
                    with_store_retries(retry, "repoint_pick", || {
                        store.repoint_pick(pick.id, keep_id)
                    })
                    .await?;
                }
                fragment.record(
                    Category::Moved,
                    ReportEntry::new(Stage::Merge, key)
                        .raw_name(loser_name.clone())
                        .candidates([keep_id])
                        .detail(format!("{} pick for item {}", pick.kind, pick.item_id)),
                );
            }
        }

        let exists =
            with_store_retries(retry, "find_participant", || store.find_participant(loser_id))
                .await?
                .is_some();
        if !exists {
            continue;
        }
        if mode.applies() {
            with_store_retries(retry, "delete_participant", || {
                store.delete_participant(loser_id)
            })
            .await?;
        }
        fragment.record(
            Category::Deleted,
            ReportEntry::new(Stage::Merge, format!("{}/{}", group.key, loser_id))
                .raw_name(loser_name)
                .candidates([keep_id]),
        );
    }
    Ok(())
}
