// Apply Orchestrator
//
// Drives every resource key through plan -> apply -> commit, one
// descriptor at a time, and collects the per-key outcomes into a run
// report. Keys are independent and run concurrently; descriptors of one key
// never do.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt, TryStreamExt};
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::driver::{DriverError, ResourceDriver};
use crate::ledger::{LedgerBackend, LedgerError};
use crate::migration::{MigrationDescriptor, MigrationRecord, ResourceKey, Version};
use crate::plan::{self, PlanError, PlanSummary};
use crate::source::DescriptorGroup;
use crate::state::{KeyPhase, PhaseError, PhaseMachine};

mod report;

pub use report::{FailureKind, KeyOutcome, KeyStatus, PlanPreview, RunReport};

/// Errors that abort the whole run.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Phase(#[from] PhaseError),
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub applied_by: String,
    pub driver_timeout: Duration,
    pub ledger_timeout: Duration,
    pub max_conflict_retries: u32,
    pub concurrency: usize,
}

impl ApplyOptions {
    pub fn from_config(config: &EngineConfig, run_id: Uuid) -> Self {
        Self {
            applied_by: config.applied_by(run_id),
            driver_timeout: config.driver_timeout(),
            ledger_timeout: config.ledger_timeout(),
            max_conflict_retries: config.max_conflict_retries,
            concurrency: config.concurrency,
        }
    }
}

impl Default for ApplyOptions {
    fn default() -> Self {
        let config = EngineConfig::default_config();
        Self {
            applied_by: "kmigrate".into(),
            ..Self::from_config(&config, Uuid::nil())
        }
    }
}

/// Plan every group against `ledger` without applying anything.
pub async fn preview(
    ledger: &dyn LedgerBackend,
    groups: &[DescriptorGroup],
    ledger_timeout: Duration,
) -> Result<Vec<PlanPreview>, ApplyError> {
    let mut previews = Vec::with_capacity(groups.len());

    for group in groups {
        let history = match timeout(ledger_timeout, ledger.history(&group.key)).await {
            Ok(result) => result?,
            Err(_) => return Err(LedgerError::Timeout(ledger_timeout).into()),
        };

        previews.push(match plan::plan(&group.key, &group.descriptors, &history) {
            Ok(plan) => PlanPreview::Pending(PlanSummary::from(&plan)),
            Err(PlanError::Divergence(report)) => PlanPreview::Diverged(report),
            Err(err) => PlanPreview::Invalid {
                key: group.key.clone(),
                message: err.to_string(),
            },
        });
    }

    Ok(previews)
}

/// Bookkeeping for one key within a run.
struct KeyRun<'a> {
    key: &'a ResourceKey,
    phase: PhaseMachine,
    applied: Vec<Version>,
    conflicts: u32,
}

impl<'a> KeyRun<'a> {
    fn new(key: &'a ResourceKey) -> Self {
        Self {
            key,
            phase: PhaseMachine::new(),
            applied: Vec::new(),
            conflicts: 0,
        }
    }

    fn done(mut self) -> Result<KeyOutcome, ApplyError> {
        self.phase.advance(KeyPhase::Done)?;
        info!(applied = self.applied.len(), "resource done");

        Ok(KeyOutcome {
            key: self.key.clone(),
            status: KeyStatus::Done {
                applied: self.applied,
            },
            conflicts: self.conflicts,
        })
    }

    fn failed(
        mut self,
        version: Option<Version>,
        kind: FailureKind,
        checkpoint: Option<Version>,
        message: String,
    ) -> Result<KeyOutcome, ApplyError> {
        self.phase.fail()?;
        error!(
            ?kind,
            version = ?version,
            checkpoint = ?checkpoint,
            "resource failed: {message}"
        );

        Ok(KeyOutcome {
            key: self.key.clone(),
            status: KeyStatus::Failed {
                version,
                kind,
                checkpoint,
                applied: self.applied,
                message,
            },
            conflicts: self.conflicts,
        })
    }
}

pub struct Orchestrator {
    ledger: Arc<dyn LedgerBackend>,
    driver: Arc<dyn ResourceDriver>,
    options: ApplyOptions,
    run_id: Uuid,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<dyn LedgerBackend>,
        driver: Arc<dyn ResourceDriver>,
        options: ApplyOptions,
    ) -> Self {
        Self {
            ledger,
            driver,
            options,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Migrate every group. A key that fails does not stop the others; an
    /// unavailable ledger stops everything.
    pub async fn run(&self, groups: &[DescriptorGroup]) -> Result<RunReport, ApplyError> {
        info!(
            run_id = %self.run_id,
            ledger = %self.ledger.describe(),
            keys = groups.len(),
            "migration run started"
        );

        let mut outcomes: Vec<KeyOutcome> = stream::iter(groups)
            .map(|group| self.migrate_key(group))
            .buffer_unordered(self.options.concurrency.max(1))
            .try_collect()
            .await?;
        outcomes.sort_by(|a, b| a.key.cmp(&b.key));

        let report = RunReport {
            run_id: self.run_id,
            applied_by: self.options.applied_by.clone(),
            outcomes,
        };
        info!(
            run_id = %self.run_id,
            failed = report.failed().count(),
            "migration run finished"
        );

        Ok(report)
    }

    /// Plan every group without touching drivers or committing.
    pub async fn plan_all(
        &self,
        groups: &[DescriptorGroup],
    ) -> Result<Vec<PlanPreview>, ApplyError> {
        preview(self.ledger.as_ref(), groups, self.options.ledger_timeout).await
    }

    pub async fn migrate_key(&self, group: &DescriptorGroup) -> Result<KeyOutcome, ApplyError> {
        let span = info_span!("migrate", resource = %group.key, run_id = %self.run_id);
        self.migrate_key_inner(group).instrument(span).await
    }

    async fn migrate_key_inner(&self, group: &DescriptorGroup) -> Result<KeyOutcome, ApplyError> {
        let key = &group.key;
        let mut run = KeyRun::new(key);

        // Applied to the resource, but its commit lost a race.
        let mut uncommitted: Option<Version> = None;

        loop {
            let history = self.ledger_call(self.ledger.history(key)).await?;
            let checkpoint = history.latest().map(|r| r.version.clone());

            let plan = match plan::plan(key, &group.descriptors, &history) {
                Ok(plan) => plan,
                Err(err) => {
                    let kind = match &err {
                        PlanError::Divergence(_) => FailureKind::Divergence,
                        _ => FailureKind::InvalidDescriptors,
                    };
                    return run.failed(err.version().cloned(), kind, checkpoint, err.to_string());
                }
            };

            if plan.is_up_to_date() {
                debug!(latest = ?checkpoint, "nothing pending");
                return run.done();
            }

            run.phase.advance(KeyPhase::Applying)?;
            info!(pending = ?plan.pending_versions(), "applying pending migrations");

            let mut previous = plan.latest;
            let mut replan = false;

            for descriptor in &plan.pending {
                if uncommitted.as_ref() == Some(&descriptor.version) {
                    debug!(version = %descriptor.version, "already applied, retrying commit");
                } else {
                    uncommitted = None;
                    if let Err(err) = self.driver_call(key, descriptor).await {
                        let checkpoint = previous.map(|r| r.version);
                        return run.failed(
                            Some(descriptor.version.clone()),
                            FailureKind::Driver,
                            checkpoint,
                            err.to_string(),
                        );
                    }
                }

                run.phase.advance(KeyPhase::Committing)?;
                let candidate =
                    MigrationRecord::from_descriptor(descriptor, &self.options.applied_by);
                let committed = self
                    .ledger_call(self.ledger.commit(candidate, previous.as_ref()))
                    .await;

                match committed {
                    Ok(record) => {
                        info!(version = %record.version, "migration committed");
                        run.applied.push(record.version.clone());
                        previous = Some(record);
                        uncommitted = None;
                        run.phase.advance(KeyPhase::Applying)?;
                    }
                    Err(err) if err.is_unavailable() => return Err(err.into()),
                    Err(conflict) => {
                        run.conflicts += 1;
                        warn!(
                            version = %descriptor.version,
                            conflicts = run.conflicts,
                            "commit conflict, replanning"
                        );

                        if run.conflicts > self.options.max_conflict_retries {
                            let message = format!(
                                "gave up after {} commit conflicts",
                                run.conflicts
                            );
                            return run.failed(
                                Some(descriptor.version.clone()),
                                FailureKind::Conflict,
                                conflict.found().map(|r| r.version.clone()),
                                message,
                            );
                        }

                        uncommitted = Some(descriptor.version.clone());
                        run.phase.advance(KeyPhase::Planning)?;
                        replan = true;
                        break;
                    }
                }
            }

            if !replan {
                return run.done();
            }
        }
    }

    async fn ledger_call<T>(
        &self,
        call: impl Future<Output = Result<T, LedgerError>>,
    ) -> Result<T, LedgerError> {
        match timeout(self.options.ledger_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout(self.options.ledger_timeout)),
        }
    }

    async fn driver_call(
        &self,
        key: &ResourceKey,
        descriptor: &MigrationDescriptor,
    ) -> Result<(), DriverError> {
        debug!(version = %descriptor.version, "invoking driver");

        match timeout(
            self.options.driver_timeout,
            self.driver.apply(key, &descriptor.operation),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(self.options.driver_timeout)),
        }
    }
}
