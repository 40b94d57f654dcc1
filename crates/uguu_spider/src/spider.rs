//! Scan scheduler.
//!
//! Picks due shares, claims them through the catalog, starts a bounded
//! number of scanners and reconciles their output one at a time as they
//! finish. Several spiders may run against the same catalog; they
//! coordinate only through the `next_scan` claim and the tree locks.

use crate::baseline;
use crate::config::SpiderConfig;
use crate::error::{ErrorKind, Result, SpiderError};
use crate::reconcile::{self, ScanJob, ScanOutcome};
use crate::scanner::{self, CaptureOptions, CapturedScan, ScanCommand, ScanRequest};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uguu_db::{DueShare, UguuDb};

type ScanResult = (i64, Result<CapturedScan>);

/// A share whose scanner is running.
struct InFlight {
    job: ScanJob,
    /// Tree locked on behalf of this scan
    locked_tree: Option<i64>,
}

/// Totals of one [`Spider::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub updated: u64,
    pub unchanged: u64,
    pub deduplicated: u64,
    pub failed: u64,
    pub interrupted: bool,
}

impl RunSummary {
    fn record(&mut self, outcome: &ScanOutcome) {
        match outcome {
            ScanOutcome::Updated(_) => self.updated += 1,
            ScanOutcome::Unchanged => self.unchanged += 1,
            ScanOutcome::Deduplicated { .. } => self.deduplicated += 1,
            ScanOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// The scan scheduler.
pub struct Spider {
    db: UguuDb,
    config: Arc<SpiderConfig>,
    commands: HashMap<i64, ScanCommand>,
    options: CaptureOptions,
    holder: String,
}

impl Spider {
    /// Load and check the scan commands of every scan type.
    ///
    /// Scan types with an unusable command are logged and their shares
    /// are skipped.
    pub async fn new(db: UguuDb, config: Arc<SpiderConfig>) -> Result<Self> {
        let mut commands = HashMap::new();
        for scantype in db.load_scantypes().await? {
            match ScanCommand::parse(&scantype.scan_command, scantype.protocol) {
                Ok(command) => {
                    commands.insert(scantype.scantype_id, command);
                }
                Err(e) => warn!(
                    scantype_id = scantype.scantype_id,
                    command = %scantype.scan_command,
                    error = %e,
                    "Ignoring scan type"
                ),
            }
        }

        let options = CaptureOptions {
            scanners_dir: config.scanners_dir.clone(),
            spool_dir: config.save_dir.clone(),
            max_lines: config.max_lines_from_scanner,
            timeout: config.scan_timeout(),
            forward_stderr: config.scanners_logging,
        };
        let holder = format!("{}-{}", std::process::id(), UguuDb::now_millis());

        Ok(Self {
            db,
            config,
            commands,
            options,
            holder,
        })
    }

    /// Name this instance writes into the tree locks it holds.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Scan until no share is due, or until interrupted.
    pub async fn run(&self) -> RunSummary {
        let mut running: JoinSet<ScanResult> = JoinSet::new();
        let mut in_flight: HashMap<i64, InFlight> = HashMap::new();
        let mut summary = RunSummary::default();

        info!(
            holder = %self.holder,
            max_scanners = self.config.max_scanners,
            "Spider started"
        );
        self.schedule(&mut running, &mut in_flight, &mut summary).await;

        running.shutdown().await;
        for (_, flight) in in_flight.drain() {
            self.release(&flight).await;
        }

        info!(
            updated = summary.updated,
            unchanged = summary.unchanged,
            deduplicated = summary.deduplicated,
            failed = summary.failed,
            interrupted = summary.interrupted,
            "Spider finished"
        );
        summary
    }

    async fn schedule(
        &self,
        running: &mut JoinSet<ScanResult>,
        in_flight: &mut HashMap<i64, InFlight>,
        summary: &mut RunSummary,
    ) {
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            self.fill_slots(running, in_flight, summary).await;
            if running.is_empty() {
                debug!("No shares due");
                return;
            }

            let finished = tokio::select! {
                joined = running.join_next() => joined,
                _ = tokio::time::sleep(self.config.poll_interval()) => None,
                _ = &mut shutdown => {
                    warn!("Interrupted, stopping scanners");
                    summary.interrupted = true;
                    return;
                }
            };

            let (share_id, result) = match finished {
                Some(Ok(done)) => done,
                Some(Err(e)) => {
                    error!(error = %e, "Scanner task failed");
                    continue;
                }
                None => continue,
            };
            let Some(flight) = in_flight.remove(&share_id) else {
                warn!(share_id, "Finished scan was not in flight");
                continue;
            };

            let outcome = match result {
                Ok(captured) => {
                    tokio::select! {
                        outcome = reconcile::reconcile(&self.db, &self.config, &flight.job, captured) => {
                            outcome.unwrap_or_else(ScanOutcome::Failed)
                        }
                        _ = &mut shutdown => {
                            warn!(share = %flight.job.share, "Interrupted, rolling back");
                            summary.interrupted = true;
                            self.release(&flight).await;
                            return;
                        }
                    }
                }
                Err(e) => ScanOutcome::Failed(e),
            };

            if let ScanOutcome::Failed(err) = &outcome {
                self.handle_failure(&flight.job, err).await;
            }
            summary.record(&outcome);
            self.release(&flight).await;
        }
    }

    /// Start scanners for due shares until every slot is busy.
    async fn fill_slots(
        &self,
        running: &mut JoinSet<ScanResult>,
        in_flight: &mut HashMap<i64, InFlight>,
        summary: &mut RunSummary,
    ) {
        let free = self.config.max_scanners.saturating_sub(running.len());
        if free == 0 {
            return;
        }

        let now = UguuDb::now_millis();
        let exclude: Vec<i64> = in_flight.keys().copied().collect();
        let due = match self
            .db
            .select_due_shares(now, self.config.select_limit(free), &exclude)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Failed to select due shares");
                return;
            }
        };

        let mut started = 0;
        for share in due {
            if started == free {
                break;
            }
            let share_id = share.share_id;
            if let Some(flight) = self.start(share, now, running, summary).await {
                in_flight.insert(share_id, flight);
                started += 1;
            }
        }
    }

    /// Claim, lock and resolve one share, then spawn its scanner.
    ///
    /// A failure here is the share's failure; the run goes on.
    async fn start(
        &self,
        share: DueShare,
        now: i64,
        running: &mut JoinSet<ScanResult>,
        summary: &mut RunSummary,
    ) -> Option<InFlight> {
        let mut flight = InFlight {
            job: ScanJob {
                share_id: share.share_id,
                share: baseline::share_str(share.protocol, &share.hostname, share.port),
                tree_id: share.tree_id,
                save_path: baseline::save_path(
                    &self.config.save_dir,
                    share.protocol,
                    &share.hostname,
                    share.port,
                ),
                patch_requested: false,
            },
            locked_tree: None,
        };

        match self.prepare(&share, now, &mut flight).await {
            Ok(Some(request)) => {
                let options = self.options.clone();
                let share_id = share.share_id;
                running.spawn(async move {
                    (share_id, scanner::run_scanner(&request, &options).await)
                });
                Some(flight)
            }
            Ok(None) => {
                self.release(&flight).await;
                None
            }
            Err(err) => {
                self.handle_failure(&flight.job, &err).await;
                summary.record(&ScanOutcome::Failed(err));
                self.release(&flight).await;
                None
            }
        }
    }

    /// Everything before the scanner runs. `Ok(None)` skips the share
    /// without counting it.
    async fn prepare(
        &self,
        share: &DueShare,
        now: i64,
        flight: &mut InFlight,
    ) -> Result<Option<ScanRequest>> {
        let next_scan = now.saturating_add(self.config.success_backoff_millis());
        if !self.db.claim_share(share.share_id, now, next_scan).await? {
            debug!(share_id = share.share_id, "Share claimed elsewhere");
            return Ok(None);
        }

        let Some(command) = self.commands.get(&share.scantype_id) else {
            warn!(
                share = %flight.job.share,
                scantype_id = share.scantype_id,
                "No usable scan command"
            );
            return Ok(None);
        };

        if let Some(tree_id) = share.tree_id {
            let ttl = self.config.lock_ttl_millis();
            if !self.db.try_lock_tree(tree_id, &self.holder, ttl).await? {
                return Err(SpiderError::LockBusy { tree_id });
            }
            flight.locked_tree = Some(tree_id);

            let hash = self.db.get_tree(tree_id).await?.and_then(|t| t.hash);
            flight.job.patch_requested = hash.is_some() && flight.job.save_path.is_file();
        }

        let address = scanner::resolve_host(&share.hostname).await?;
        let job = &flight.job;
        Ok(Some(ScanRequest {
            share: job.share.clone(),
            command: command.clone(),
            address,
            port: share.port,
            baseline: job.patch_requested.then(|| job.save_path.clone()),
        }))
    }

    /// Apply the failure policy for one share.
    async fn handle_failure(&self, job: &ScanJob, err: &SpiderError) {
        match err.kind() {
            ErrorKind::Transient => {
                if let SpiderError::LockBusy { tree_id } = err {
                    info!(share = %job.share, tree_id, "Tree busy, skipping share");
                    return;
                }
                warn!(share = %job.share, error = %err, "Scan failed");
                let next_scan =
                    UguuDb::now_millis().saturating_add(self.config.failure_backoff_millis());
                if let Err(e) = self.db.set_next_scan(job.share_id, next_scan).await {
                    error!(share = %job.share, error = %e, "Failed to record failure backoff");
                }
            }
            ErrorKind::Integrity => {
                error!(share = %job.share, error = ?err, "Integrity violation, discarding baseline");
                let stamp = chrono::Utc::now().timestamp();
                if let Err(e) = baseline::quarantine(&job.save_path, stamp) {
                    error!(share = %job.share, error = %e, "Failed to move baseline aside");
                }
            }
            ErrorKind::Unexpected => {
                error!(share = %job.share, error = ?err, "Unexpected scan failure");
            }
        }
    }

    async fn release(&self, flight: &InFlight) {
        let Some(tree_id) = flight.locked_tree else {
            return;
        };
        match self.db.unlock_tree(tree_id, &self.holder).await {
            Ok(true) => {}
            Ok(false) => warn!(share = %flight.job.share, tree_id, "Tree lock was taken over"),
            Err(e) => error!(share = %flight.job.share, tree_id, error = %e, "Failed to unlock tree"),
        }
    }
}
