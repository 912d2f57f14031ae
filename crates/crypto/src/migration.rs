//! Re-encryption migration engine.
//!
//! [`EncryptionMigrationService`] re-encrypts existing [`EncryptedData`]
//! records under a new key or algorithm, either one record at a time or as a
//! bounded-concurrency batch with progress reporting, cancellation, and
//! partial-failure aggregation. Migration runs unattended over large
//! datasets, so single-item [`migrate`](EncryptionMigrationService::migrate)
//! never returns `Err` for crypto failures: it reports them in its result
//! and lets the batch layer apply `continue_on_error` policy uniformly.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{CryptoError, EncryptionError, MigrationError};
use crate::model::{EncryptedData, EncryptionContext};
use crate::policy::{requires_migration, MigrationPolicy};
use crate::service::MessageEncryptionService;

/// Hard cap on tracked run states; the oldest terminal runs are evicted
/// first when the registry is full.
const MAX_TRACKED_RUNS: usize = 256;

/// Assumed per-item crypto cost for estimation.
const ESTIMATE_MS_PER_ITEM: f64 = 3.0;
/// Assumed sustained I/O throughput for estimation (100 MiB/s).
const ESTIMATE_THROUGHPUT_BYTES_PER_SEC: f64 = 100.0 * 1024.0 * 1024.0;
/// Safety margin applied to the raw estimate.
const ESTIMATE_OVERHEAD_FACTOR: f64 = 1.2;

/// One record queued for batch migration, with its own source context.
#[derive(Debug, Clone)]
pub struct MigrationItem {
    pub item_id: String,
    pub data: EncryptedData,
    pub source_context: EncryptionContext,
}

impl MigrationItem {
    pub fn new(item_id: impl Into<String>, data: EncryptedData) -> Self {
        Self { item_id: item_id.into(), data, source_context: EncryptionContext::default() }
    }
}

/// Outcome of a single-record migration. `success == false` carries the
/// error message and the classified cause instead of an `Err`.
#[derive(Debug, Clone)]
pub struct MigrationResult {
    pub success: bool,
    pub migrated: Option<EncryptedData>,
    pub source_key_id: String,
    pub target_key_id: Option<String>,
    pub duration: Duration,
    pub error: Option<String>,
    pub failure: Option<CryptoError>,
}

impl MigrationResult {
    /// Whether retrying this item can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        self.failure.as_ref().is_some_and(CryptoError::is_retryable)
    }
}

/// Cloned progress snapshot passed to the batch progress callback. Never a
/// live reference into the engine's state.
#[derive(Debug, Clone)]
pub struct MigrationProgress {
    pub migration_id: String,
    pub total_items: usize,
    pub completed_items: usize,
    pub succeeded_items: usize,
    pub failed_items: usize,
    pub current_item_id: Option<String>,
    pub elapsed: Duration,
    pub estimated_remaining: Option<Duration>,
}

pub type ProgressCallback = Arc<dyn Fn(MigrationProgress) + Send + Sync>;

/// Options for one batch-migration run.
#[derive(Clone)]
pub struct BatchOptions {
    /// Worker-pool bound; must be at least 1.
    pub max_parallelism: usize,

    /// Record item failures and keep going instead of aborting the batch.
    pub continue_on_error: bool,

    /// Per-item deadline. A timed-out item counts as failed; its in-flight
    /// crypto work is abandoned, not interrupted. `None` means no deadline.
    pub item_timeout: Option<Duration>,

    /// Caller-chosen run id; a UUID is minted when absent.
    pub migration_id: Option<String>,

    /// Invoke the progress callback after each completed item.
    pub track_progress: bool,

    /// Observer for progress snapshots. Runs synchronously on the batch
    /// driver (never on pool workers) so snapshots arrive in completion
    /// order; completion handling and new dispatch stall while it runs, so
    /// keep it fast or hand the snapshot off to your own task.
    pub progress: Option<ProgressCallback>,

    /// Cooperative cancellation for the whole run.
    pub cancellation: CancellationToken,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            continue_on_error: true,
            item_timeout: None,
            migration_id: None,
            track_progress: true,
            progress: None,
            cancellation: CancellationToken::new(),
        }
    }
}

impl fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("max_parallelism", &self.max_parallelism)
            .field("continue_on_error", &self.continue_on_error)
            .field("item_timeout", &self.item_timeout)
            .field("migration_id", &self.migration_id)
            .field("track_progress", &self.track_progress)
            .field("progress", &self.progress.as_ref().map(|_| "[callback]"))
            .finish()
    }
}

impl BatchOptions {
    fn validate(&self) -> Result<(), MigrationError> {
        if self.max_parallelism == 0 {
            return Err(MigrationError::InvalidOptions(
                "max_parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One recorded item failure inside a `continue_on_error` batch.
#[derive(Debug, Clone)]
pub struct BatchItemFailure {
    pub item_id: String,
    pub error: String,
    pub retryable: bool,
}

/// Aggregate outcome of a batch run.
#[derive(Debug, Clone)]
pub struct BatchMigrationResult {
    pub migration_id: String,
    /// True only when every item succeeded and the run was not cancelled.
    pub success: bool,
    pub total_items: usize,
    pub succeeded_items: usize,
    pub failed_items: usize,
    pub duration: Duration,
    pub failures: Vec<BatchItemFailure>,
    pub error_message: Option<String>,
}

impl BatchMigrationResult {
    /// Some items succeeded and some failed.
    pub fn is_partial_success(&self) -> bool {
        self.succeeded_items > 0 && self.failed_items > 0
    }
}

/// Lifecycle of a batch run. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl MigrationState {
    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }
}

/// Mutable record of one batch run, retrievable by migration id until
/// evicted. Process-local only; never persisted.
#[derive(Debug, Clone)]
pub struct MigrationRunState {
    pub migration_id: String,
    pub state: MigrationState,
    pub total_items: usize,
    pub completed_items: usize,
    pub succeeded_items: usize,
    pub failed_items: usize,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Aggregate view over all tracked run states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationStatistics {
    pub total_runs: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub items_processed: u64,
}

/// Deterministic duration/throughput estimate for a prospective migration.
#[derive(Debug, Clone)]
pub struct MigrationEstimate {
    pub estimated_item_count: usize,
    pub estimated_data_size_bytes: u64,
    pub estimated_duration: Duration,
    pub estimated_at: DateTime<Utc>,
    pub warnings: Vec<String>,
}

pub struct EncryptionMigrationService {
    encryption: Arc<MessageEncryptionService>,
    runs: DashMap<String, MigrationRunState>,
}

impl fmt::Debug for EncryptionMigrationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionMigrationService")
            .field("tracked_runs", &self.runs.len())
            .finish()
    }
}

impl EncryptionMigrationService {
    pub fn new(encryption: Arc<MessageEncryptionService>) -> Self {
        Self { encryption, runs: DashMap::new() }
    }

    pub fn encryption_service(&self) -> &Arc<MessageEncryptionService> {
        &self.encryption
    }

    /// Whether `data` must be re-encrypted under `policy`.
    pub fn requires_migration(&self, data: &EncryptedData, policy: &MigrationPolicy) -> bool {
        requires_migration(data, policy)
    }

    /// Re-encrypt one record: decrypt under `source_context`, encrypt under
    /// `target_context`. Crypto failures are reported in the result, never
    /// returned as `Err`.
    pub fn migrate(
        &self,
        data: &EncryptedData,
        source_context: &EncryptionContext,
        target_context: &EncryptionContext,
    ) -> MigrationResult {
        migrate_record(&self.encryption, data, source_context, target_context)
    }

    /// Migrate a batch with bounded concurrency.
    ///
    /// The run is registered as `Running` before any work starts. Items fan
    /// out onto the blocking pool, at most `max_parallelism` in flight;
    /// completions, progress callbacks, and fail-fast/cancellation decisions
    /// all happen on this driver task. Returns `Err` only for unusable
    /// options or a fail-fast abort; a cancelled run returns `Ok` with
    /// `success == false`.
    #[instrument(skip_all, fields(total_items = items.len()))]
    pub async fn migrate_batch(
        &self,
        items: Vec<MigrationItem>,
        target_context: EncryptionContext,
        options: BatchOptions,
    ) -> Result<BatchMigrationResult, MigrationError> {
        options.validate()?;
        let migration_id =
            options.migration_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let total = items.len();
        self.register_run(&migration_id, total);
        info!(%migration_id, total_items = total, "batch migration started");

        let started = Instant::now();
        let mut join_set: JoinSet<ItemOutcome> = JoinSet::new();
        let mut tally = BatchTally::default();
        let mut abort: Option<MigrationError> = None;
        let mut cancelled = false;

        let mut pending = items.into_iter();
        loop {
            let Some(item) = pending.next() else { break };

            // Wait for pool capacity, handling completions as they land.
            while join_set.len() >= options.max_parallelism {
                if let Some(joined) = join_set.join_next().await {
                    self.handle_completion(
                        &migration_id,
                        joined,
                        started,
                        total,
                        &options,
                        &mut tally,
                        &mut abort,
                    );
                }
            }
            // Drain anything else already finished so fail-fast and
            // cancellation observe the freshest state before dispatching.
            while let Some(joined) = join_set.try_join_next() {
                self.handle_completion(
                    &migration_id,
                    joined,
                    started,
                    total,
                    &options,
                    &mut tally,
                    &mut abort,
                );
            }

            if abort.is_some() {
                break;
            }
            if options.cancellation.is_cancelled() {
                cancelled = true;
                break;
            }

            let encryption = Arc::clone(&self.encryption);
            let target = target_context.clone();
            let item_timeout = options.item_timeout;
            join_set.spawn(async move {
                let item_id = item.item_id.clone();
                let work = tokio::task::spawn_blocking(move || {
                    let result =
                        migrate_record(&encryption, &item.data, &item.source_context, &target);
                    (item.item_id, result)
                });
                match item_timeout {
                    Some(timeout) => match tokio::time::timeout(timeout, work).await {
                        Ok(joined) => ItemOutcome::finished(item_id, joined),
                        Err(_) => ItemOutcome::TimedOut { item_id, timeout },
                    },
                    None => ItemOutcome::finished(item_id, work.await),
                }
            });
        }

        // In-flight items run to completion even on cancellation or abort;
        // only dispatch stops early.
        while let Some(joined) = join_set.join_next().await {
            self.handle_completion(
                &migration_id,
                joined,
                started,
                total,
                &options,
                &mut tally,
                &mut abort,
            );
        }
        if !cancelled && options.cancellation.is_cancelled() {
            cancelled = true;
        }

        let duration = started.elapsed();
        if let Some(error) = abort {
            self.finish_run(&migration_id, MigrationState::Failed, Some(error.to_string()));
            warn!(%migration_id, %error, "batch migration aborted");
            return Err(error);
        }

        let (state, error_message) = if cancelled {
            (MigrationState::Cancelled, Some("Migration was cancelled".to_string()))
        } else if tally.failed == 0 {
            (MigrationState::Completed, None)
        } else {
            (MigrationState::Failed, Some(format!("{} item(s) failed", tally.failed)))
        };
        self.finish_run(&migration_id, state, error_message.clone());
        info!(
            %migration_id,
            ?state,
            succeeded = tally.succeeded,
            failed = tally.failed,
            elapsed_ms = duration.as_millis() as u64,
            "batch migration finished"
        );

        Ok(BatchMigrationResult {
            migration_id,
            success: !cancelled && tally.failed == 0,
            total_items: total,
            succeeded_items: tally.succeeded,
            failed_items: tally.failed,
            duration,
            failures: tally.failures,
            error_message,
        })
    }

    /// Run state for a migration id; `None` for unknown or evicted ids.
    pub fn migration_status(&self, migration_id: &str) -> Option<MigrationRunState> {
        self.runs.get(migration_id).map(|entry| entry.clone())
    }

    /// Aggregate statistics over all tracked runs.
    pub fn migration_statistics(&self) -> MigrationStatistics {
        let mut stats = MigrationStatistics::default();
        for entry in self.runs.iter() {
            stats.total_runs += 1;
            stats.items_processed += entry.completed_items as u64;
            match entry.state {
                MigrationState::Running => stats.running += 1,
                MigrationState::Completed => stats.completed += 1,
                MigrationState::Failed => stats.failed += 1,
                MigrationState::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Evict terminal runs that finished more than `older_than` ago.
    /// Returns the number of evicted runs. An age too large to represent
    /// evicts nothing.
    pub fn evict_finished_runs(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|delta| Utc::now().checked_sub_signed(delta))
        else {
            return 0;
        };
        let before = self.runs.len();
        self.runs.retain(|_, run| {
            !(run.state.is_terminal() && run.finished_at.is_some_and(|at| at < cutoff))
        });
        before - self.runs.len()
    }

    /// Deterministic estimate for migrating `item_count` items totalling
    /// `data_size_bytes`. Performs no I/O; concerns surface as warnings,
    /// never errors.
    pub fn estimate_migration(
        &self,
        policy: &MigrationPolicy,
        item_count: usize,
        data_size_bytes: u64,
    ) -> MigrationEstimate {
        let encryption_ms = item_count as f64 * ESTIMATE_MS_PER_ITEM;
        let io_ms = data_size_bytes as f64 / ESTIMATE_THROUGHPUT_BYTES_PER_SEC * 1000.0;
        let estimated_ms = (encryption_ms + io_ms) * ESTIMATE_OVERHEAD_FACTOR;

        let mut warnings = Vec::new();
        if item_count == 0 {
            warnings.push("No items to migrate".to_string());
        }
        if let Some(max_age) = policy.max_key_age {
            if max_age < Duration::from_secs(30 * 24 * 3600) {
                warnings.push(
                    "max_key_age below 30 days will force frequent re-migrations".to_string(),
                );
            }
        }
        if estimated_ms > 3_600_000.0 {
            warnings.push(
                "estimated duration exceeds one hour; consider splitting the batch".to_string(),
            );
        }

        MigrationEstimate {
            estimated_item_count: item_count,
            estimated_data_size_bytes: data_size_bytes,
            estimated_duration: Duration::from_millis(estimated_ms.round() as u64),
            estimated_at: Utc::now(),
            warnings,
        }
    }

    /// Estimate without item counts: always a zero estimate plus a warning
    /// pointing at the counted form. Discovery of real counts is the
    /// caller's data source's concern.
    pub fn estimate_migration_unsized(&self, policy: &MigrationPolicy) -> MigrationEstimate {
        let mut estimate = self.estimate_migration(policy, 0, 0);
        estimate.warnings.push(
            "item counts not supplied; use the counted estimate for a meaningful figure"
                .to_string(),
        );
        estimate
    }

    fn register_run(&self, migration_id: &str, total_items: usize) {
        if self.runs.len() >= MAX_TRACKED_RUNS {
            self.evict_oldest_terminal(self.runs.len() + 1 - MAX_TRACKED_RUNS);
        }
        self.runs.insert(
            migration_id.to_string(),
            MigrationRunState {
                migration_id: migration_id.to_string(),
                state: MigrationState::Running,
                total_items,
                completed_items: 0,
                succeeded_items: 0,
                failed_items: 0,
                error_message: None,
                started_at: Utc::now(),
                finished_at: None,
            },
        );
    }

    fn evict_oldest_terminal(&self, count: usize) {
        let mut terminal: Vec<(String, DateTime<Utc>)> = self
            .runs
            .iter()
            .filter(|entry| entry.state.is_terminal())
            .map(|entry| (entry.migration_id.clone(), entry.finished_at.unwrap_or(entry.started_at)))
            .collect();
        terminal.sort_by_key(|(_, finished)| *finished);
        for (id, _) in terminal.into_iter().take(count) {
            self.runs.remove(&id);
        }
    }

    /// Fold one worker outcome into the tally, the run state, and the
    /// progress callback. Runs only on the batch driver task.
    #[allow(clippy::too_many_arguments)]
    fn handle_completion(
        &self,
        migration_id: &str,
        joined: Result<ItemOutcome, tokio::task::JoinError>,
        started: Instant,
        total: usize,
        options: &BatchOptions,
        tally: &mut BatchTally,
        abort: &mut Option<MigrationError>,
    ) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            // A worker task itself failed; there is no item id to report.
            Err(join_err) => {
                warn!(%migration_id, error = %join_err, "migration worker task failed");
                return;
            }
        };

        let (item_id, succeeded, error, retryable) = match outcome {
            ItemOutcome::Finished { item_id, result } => {
                if result.success {
                    (item_id, true, None, false)
                } else {
                    let message =
                        result.error.clone().unwrap_or_else(|| "migration failed".to_string());
                    if abort.is_none() && !options.continue_on_error {
                        *abort = Some(MigrationError::ItemFailed {
                            migration_id: migration_id.to_string(),
                            item_id: item_id.clone(),
                            source: result.failure.clone().unwrap_or_else(|| {
                                CryptoError::Encryption(EncryptionError::Cipher(message.clone()))
                            }),
                        });
                    }
                    (item_id, false, Some(message), result.is_retryable())
                }
            }
            ItemOutcome::TimedOut { item_id, timeout } => {
                if abort.is_none() && !options.continue_on_error {
                    *abort = Some(MigrationError::ItemTimedOut {
                        migration_id: migration_id.to_string(),
                        item_id: item_id.clone(),
                        timeout,
                    });
                }
                (item_id, false, Some(format!("timed out after {timeout:?}")), true)
            }
        };

        tally.completed += 1;
        if succeeded {
            tally.succeeded += 1;
            debug!(%migration_id, %item_id, "item migrated");
        } else {
            tally.failed += 1;
            let message = error.clone().unwrap_or_default();
            warn!(%migration_id, %item_id, error = %message, "item migration failed");
            tally.failures.push(BatchItemFailure { item_id: item_id.clone(), error: message, retryable });
        }

        if let Some(mut run) = self.runs.get_mut(migration_id) {
            run.completed_items = tally.completed;
            run.succeeded_items = tally.succeeded;
            run.failed_items = tally.failed;
        }

        if options.track_progress {
            if let Some(progress) = &options.progress {
                let elapsed = started.elapsed();
                let remaining = total - tally.completed;
                let estimated_remaining = if tally.completed > 0 && remaining > 0 {
                    Some(elapsed.mul_f64(remaining as f64 / tally.completed as f64))
                } else {
                    None
                };
                progress(MigrationProgress {
                    migration_id: migration_id.to_string(),
                    total_items: total,
                    completed_items: tally.completed,
                    succeeded_items: tally.succeeded,
                    failed_items: tally.failed,
                    current_item_id: Some(item_id),
                    elapsed,
                    estimated_remaining,
                });
            }
        }
    }

    fn finish_run(&self, migration_id: &str, state: MigrationState, error_message: Option<String>) {
        if let Some(mut run) = self.runs.get_mut(migration_id) {
            // Terminal states are final.
            if run.state.is_terminal() {
                return;
            }
            run.state = state;
            run.error_message = error_message;
            run.finished_at = Some(Utc::now());
        }
    }
}

#[derive(Default)]
struct BatchTally {
    completed: usize,
    succeeded: usize,
    failed: usize,
    failures: Vec<BatchItemFailure>,
}

enum ItemOutcome {
    Finished { item_id: String, result: MigrationResult },
    TimedOut { item_id: String, timeout: Duration },
}

impl ItemOutcome {
    fn finished(
        item_id: String,
        joined: Result<(String, MigrationResult), tokio::task::JoinError>,
    ) -> Self {
        match joined {
            Ok((item_id, result)) => Self::Finished { item_id, result },
            Err(join_err) => Self::Finished {
                item_id,
                result: MigrationResult {
                    success: false,
                    migrated: None,
                    source_key_id: String::new(),
                    target_key_id: None,
                    duration: Duration::ZERO,
                    error: Some(format!("migration task failed: {join_err}")),
                    failure: Some(CryptoError::Encryption(EncryptionError::Cipher(format!(
                        "migration task failed: {join_err}"
                    )))),
                },
            },
        }
    }
}

/// Shared single-record migration used by both the sync entry point and the
/// batch workers.
fn migrate_record(
    encryption: &MessageEncryptionService,
    data: &EncryptedData,
    source_context: &EncryptionContext,
    target_context: &EncryptionContext,
) -> MigrationResult {
    let started = Instant::now();
    let source_key_id = data.key_id.clone();

    let plaintext = match encryption.decrypt_record(data, source_context) {
        Ok(plaintext) => plaintext,
        Err(err) => {
            return MigrationResult {
                success: false,
                migrated: None,
                source_key_id,
                target_key_id: None,
                duration: started.elapsed(),
                error: Some(err.to_string()),
                failure: Some(CryptoError::Decryption(err)),
            };
        }
    };

    // The record's tenant carries over unless the target overrides it.
    let mut target = target_context.clone();
    if target.tenant_id.is_none() {
        target.tenant_id = data.tenant_id.clone();
    }

    match encryption.encrypt_record(&plaintext, &target) {
        Ok(migrated) => MigrationResult {
            success: true,
            target_key_id: Some(migrated.key_id.clone()),
            migrated: Some(migrated),
            source_key_id,
            duration: started.elapsed(),
            error: None,
            failure: None,
        },
        Err(err) => MigrationResult {
            success: false,
            migrated: None,
            source_key_id,
            target_key_id: None,
            duration: started.elapsed(),
            error: Some(err.to_string()),
            failure: Some(CryptoError::Encryption(err)),
        },
    }
}
