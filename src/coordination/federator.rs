//! One relay direction: scan, evaluate, relay, checkpoint

use crate::chain::{ConfirmationPolicy, SourceLedger};
use crate::config::FederatorConfig;
use crate::error::{FederatorError, FederatorResult};
use crate::events::{compute_transaction_id, CrossEvent, InvalidLog, ScannedLog, TransactionId};
use crate::metrics;
use crate::notify::{Alert, Notifier};
use crate::state::CheckpointStore;
use crate::tx::{DestinationLedger, ReceiptOutcome};

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Per-cycle state of a federator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FederatorState {
    Idle,
    Scanning,
    Evaluating,
    Relaying,
    Checkpointing,
    /// The last cycle ended early; the next one starts from `Idle`
    Aborted,
}

impl FederatorState {
    /// Numeric code exported as a gauge
    pub fn code(&self) -> u8 {
        match self {
            FederatorState::Idle => 0,
            FederatorState::Scanning => 1,
            FederatorState::Evaluating => 2,
            FederatorState::Relaying => 3,
            FederatorState::Checkpointing => 4,
            FederatorState::Aborted => 5,
        }
    }
}

impl fmt::Display for FederatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FederatorState::Idle => "idle",
            FederatorState::Scanning => "scanning",
            FederatorState::Evaluating => "evaluating",
            FederatorState::Relaying => "relaying",
            FederatorState::Checkpointing => "checkpointing",
            FederatorState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Summary of one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub from_block: u64,
    pub head: u64,
    pub scanned: usize,
    pub relayed: usize,
    pub proposed: usize,
    pub already_processed: usize,
    pub deferred: usize,
    pub invalid: usize,
    /// Checkpoint persisted by this cycle, if it moved
    pub checkpoint: Option<u64>,
}

/// Outcome of evaluating one scanned log
enum Step {
    Invalid(InvalidLog),
    Deferred { event: CrossEvent, have: u64, need: u64 },
    Ready(CrossEvent),
}

/// Tracks the contiguous prefix of resolved events, in source order
#[derive(Debug, Default)]
struct ResolvedPrefix {
    last_resolved_block: Option<u64>,
    first_unresolved_block: Option<u64>,
}

impl ResolvedPrefix {
    fn resolved(&mut self, block: u64) {
        if self.first_unresolved_block.is_none() {
            self.last_resolved_block = Some(block);
        }
    }

    fn unresolved(&mut self, block: u64) {
        if self.first_unresolved_block.is_none() {
            self.first_unresolved_block = Some(block);
        }
    }

    /// Highest block every event at or below which is resolved
    fn target(&self, stable_tip: u64) -> Option<u64> {
        match (self.first_unresolved_block, self.last_resolved_block) {
            (None, _) => Some(stable_tip),
            (Some(unresolved), Some(resolved)) if resolved < unresolved => {
                Some(resolved.min(stable_tip))
            }
            // nothing resolved before it, or the two share a block
            (Some(unresolved), _) => unresolved.checked_sub(1).map(|b| b.min(stable_tip)),
        }
    }
}

/// Relays `Cross` events from one source chain to one destination chain
pub struct Federator {
    direction: String,
    from_block: u64,
    source: Arc<dyn SourceLedger>,
    destination: Arc<dyn DestinationLedger>,
    checkpoints: Arc<dyn CheckpointStore>,
    notifier: Arc<dyn Notifier>,
    policy: ConfirmationPolicy,
    state: RwLock<FederatorState>,
    /// Set once the destination agreed with the local identifier
    identity_verified: AtomicBool,
    /// Proposed to the multisig and awaiting other approvers
    proposed: Mutex<HashSet<TransactionId>>,
    /// Rejected by the destination; needs manual remediation
    quarantined: Mutex<HashSet<TransactionId>>,
    /// Invalid logs already reported, by (block, log index)
    reported_invalid: Mutex<HashSet<(u64, u64)>>,
}

impl Federator {
    pub fn new(
        config: &FederatorConfig,
        source: Arc<dyn SourceLedger>,
        destination: Arc<dyn DestinationLedger>,
        checkpoints: Arc<dyn CheckpointStore>,
        notifier: Arc<dyn Notifier>,
    ) -> FederatorResult<Self> {
        let policy = ConfirmationPolicy::new(&config.confirmation_table)?;

        Ok(Self {
            direction: config.direction(),
            from_block: config.source.from_block,
            source,
            destination,
            checkpoints,
            notifier,
            policy,
            state: RwLock::new(FederatorState::Idle),
            identity_verified: AtomicBool::new(false),
            proposed: Mutex::new(HashSet::new()),
            quarantined: Mutex::new(HashSet::new()),
            reported_invalid: Mutex::new(HashSet::new()),
        })
    }

    pub fn direction(&self) -> &str {
        &self.direction
    }

    pub async fn state(&self) -> FederatorState {
        *self.state.read().await
    }

    async fn set_state(&self, state: FederatorState) {
        *self.state.write().await = state;
        metrics::record_state(&self.direction, state.code());
    }

    /// Run one cycle. Errors end the cycle, never the process.
    pub async fn run(&self) -> FederatorResult<CycleReport> {
        let started = Instant::now();
        self.set_state(FederatorState::Idle).await;

        let result = self.cycle().await;
        metrics::record_cycle_duration(&self.direction, started.elapsed().as_secs_f64());

        match &result {
            Ok(report) => {
                self.set_state(FederatorState::Idle).await;
                info!(
                    "{}: cycle done, blocks {}..={}: {} scanned, {} relayed, \
                     {} proposed, {} already processed, {} deferred, {} invalid, checkpoint {:?}",
                    self.direction,
                    report.from_block,
                    report.head,
                    report.scanned,
                    report.relayed,
                    report.proposed,
                    report.already_processed,
                    report.deferred,
                    report.invalid,
                    report.checkpoint
                );
            }
            Err(e) => {
                self.set_state(FederatorState::Aborted).await;
                metrics::record_abort(&self.direction, e.kind());
                error!("{}: cycle aborted: {}", self.direction, e);

                // reverts and identity mismatches were reported with their details
                let reported = matches!(
                    e,
                    FederatorError::Reverted { .. } | FederatorError::IdentityMismatch { .. }
                );
                if e.should_alert() && !reported {
                    self.notifier
                        .notify(&Alert::CycleAborted {
                            direction: self.direction.clone(),
                            kind: e.kind(),
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        }

        result
    }

    async fn cycle(&self) -> FederatorResult<CycleReport> {
        self.set_state(FederatorState::Scanning).await;

        let destination_chain = self.destination.chain_id();
        let min_confirmation = self.policy.min_confirmation(destination_chain)?;

        let previous = self.checkpoints.load(&self.direction).await?;
        let from_block = previous.map_or(self.from_block, |block| block + 1);
        let head = self.source.head().await?;
        metrics::record_source_head(&self.direction, head);

        let mut report = CycleReport {
            from_block,
            head,
            ..CycleReport::default()
        };

        if from_block > head {
            debug!("{}: no new blocks (next {}, head {})", self.direction, from_block, head);
            return Ok(report);
        }

        let logs = self.source.fetch_events(from_block, head).await?;
        report.scanned = logs.len();
        metrics::record_events_scanned(&self.direction, logs.len());
        debug!(
            "{}: {} events in blocks {}..={}",
            self.direction,
            logs.len(),
            from_block,
            head
        );

        self.set_state(FederatorState::Evaluating).await;
        let steps = self.evaluate(logs, destination_chain, head)?;

        self.set_state(FederatorState::Relaying).await;
        let mut prefix = ResolvedPrefix::default();
        let failure = self.relay(steps, &mut prefix, &mut report).await.err();

        self.set_state(FederatorState::Checkpointing).await;
        let stable_tip = head.saturating_sub(min_confirmation);
        let floor = from_block.saturating_sub(1);

        if let Some(target) = prefix.target(stable_tip).filter(|target| *target > floor) {
            match self.checkpoints.save(&self.direction, target).await {
                Ok(()) => {
                    metrics::record_checkpoint(&self.direction, target);
                    report.checkpoint = Some(target);
                }
                Err(e) if failure.is_some() => {
                    warn!("{}: cannot save checkpoint {}: {}", self.direction, target, e);
                }
                Err(e) => return Err(e),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Classify every log by readiness against the current head
    fn evaluate(
        &self,
        logs: Vec<ScannedLog>,
        destination_chain: u64,
        head: u64,
    ) -> FederatorResult<Vec<Step>> {
        let mut steps = Vec::with_capacity(logs.len());

        for log in logs {
            let event = match log {
                Ok(event) => event,
                Err(invalid) => {
                    steps.push(Step::Invalid(invalid));
                    continue;
                }
            };

            if self.policy.is_ready(destination_chain, &event, head)? {
                steps.push(Step::Ready(event));
            } else {
                let need = self.policy.required_confirmations(
                    destination_chain,
                    &event.symbol,
                    event.amount,
                    event.decimals,
                )?;
                let have = head.saturating_sub(event.block_number);
                steps.push(Step::Deferred { event, have, need });
            }
        }

        Ok(steps)
    }

    /// Relay ready events in order, stopping at the first cycle-fatal error
    async fn relay(
        &self,
        steps: Vec<Step>,
        prefix: &mut ResolvedPrefix,
        report: &mut CycleReport,
    ) -> FederatorResult<()> {
        let mut seen: HashSet<TransactionId> = HashSet::new();

        for step in steps {
            match step {
                Step::Invalid(invalid) => {
                    report.invalid += 1;
                    prefix.resolved(invalid.block_number);
                    self.report_invalid(invalid.position(), invalid.to_string()).await;
                }
                Step::Deferred { event, have, need } => {
                    report.deferred += 1;
                    metrics::record_deferred(&self.direction);
                    prefix.unresolved(event.block_number);
                    debug!(
                        "{}: deferring tx {:?}: {}",
                        self.direction,
                        event.transaction_hash,
                        FederatorError::InsufficientConfirmations { have, need }
                    );
                }
                Step::Ready(event) => {
                    let block = event.block_number;
                    match self.relay_event(&event, &mut seen, report).await {
                        Ok(true) => prefix.resolved(block),
                        Ok(false) => prefix.unresolved(block),
                        Err(FederatorError::InvalidEvent(reason)) => {
                            report.invalid += 1;
                            prefix.resolved(block);
                            self.report_invalid(event.position(), reason).await;
                        }
                        Err(e) => {
                            prefix.unresolved(block);
                            return Err(e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Relay one ready event. `Ok(true)` means it is resolved.
    async fn relay_event(
        &self,
        event: &CrossEvent,
        seen: &mut HashSet<TransactionId>,
        report: &mut CycleReport,
    ) -> FederatorResult<bool> {
        let id = compute_transaction_id(event)?;

        if !seen.insert(id) {
            debug!("{}: duplicate log for {}", self.direction, id);
            return Ok(true);
        }
        if self.proposed.lock().await.contains(&id) {
            debug!("{}: {} awaits multisig approval", self.direction, id);
            return Ok(true);
        }

        self.verify_identity(event, id).await?;

        if self.destination.is_processed(id).await? {
            if self.quarantined.lock().await.remove(&id) {
                info!("{}: quarantined {} was processed on the destination", self.direction, id);
            }
            report.already_processed += 1;
            metrics::record_already_processed(&self.direction);
            debug!("{}: {} already processed", self.direction, id);
            return Ok(true);
        }
        if self.quarantined.lock().await.contains(&id) {
            debug!("{}: {} is quarantined", self.direction, id);
            return Ok(false);
        }

        info!(
            "{}: relaying {} (source tx {:?}, {} {} to {:?})",
            self.direction, id, event.transaction_hash, event.amount, event.symbol, event.recipient
        );

        match self.destination.submit(event).await {
            Ok(outcome) => {
                let destination_tx = outcome.tx_hash();
                let alert = match outcome {
                    ReceiptOutcome::Relayed { block_number, .. } => {
                        report.relayed += 1;
                        metrics::record_relayed(&self.direction);
                        info!(
                            "{}: relayed {} in destination tx {:?} (block {})",
                            self.direction, id, destination_tx, block_number
                        );
                        Alert::Relayed {
                            direction: self.direction.clone(),
                            id,
                            source_tx: event.transaction_hash,
                            destination_tx,
                        }
                    }
                    ReceiptOutcome::Proposed { block_number, .. } => {
                        report.proposed += 1;
                        metrics::record_proposed(&self.direction);
                        self.proposed.lock().await.insert(id);
                        info!(
                            "{}: proposed {} to multisig in tx {:?} (block {})",
                            self.direction, id, destination_tx, block_number
                        );
                        Alert::Proposed {
                            direction: self.direction.clone(),
                            id,
                            source_tx: event.transaction_hash,
                            destination_tx,
                        }
                    }
                };
                self.notifier.notify(&alert).await;
                Ok(true)
            }
            Err(FederatorError::AlreadyProcessed(reason)) => {
                report.already_processed += 1;
                metrics::record_already_processed(&self.direction);
                debug!("{}: {} processed meanwhile: {}", self.direction, id, reason);
                Ok(true)
            }
            Err(FederatorError::Reverted { chain_id, reason }) => {
                self.quarantined.lock().await.insert(id);
                warn!("{}: {} reverted, quarantined: {}", self.direction, id, reason);
                self.notifier
                    .notify(&Alert::Reverted {
                        direction: self.direction.clone(),
                        id,
                        source_tx: event.transaction_hash,
                        reason: reason.clone(),
                    })
                    .await;
                Err(FederatorError::Reverted { chain_id, reason })
            }
            Err(e) => Err(e),
        }
    }

    /// Check once per process that the destination derives the same id
    async fn verify_identity(&self, event: &CrossEvent, local: TransactionId) -> FederatorResult<()> {
        if self.identity_verified.load(Ordering::Acquire) {
            return Ok(());
        }

        let remote = self.destination.remote_transaction_id(event).await?;
        if remote != local {
            let (local, remote) = (local.to_string(), remote.to_string());
            self.notifier
                .notify(&Alert::IdentityMismatch {
                    direction: self.direction.clone(),
                    local: local.clone(),
                    remote: remote.clone(),
                })
                .await;
            return Err(FederatorError::IdentityMismatch { local, remote });
        }

        self.identity_verified.store(true, Ordering::Release);
        info!("{}: transaction id scheme verified against destination", self.direction);
        Ok(())
    }

    async fn report_invalid(&self, position: (u64, u64), detail: String) {
        metrics::record_invalid(&self.direction);
        warn!("{}: skipping invalid event: {}", self.direction, detail);

        if self.reported_invalid.lock().await.insert(position) {
            self.notifier
                .notify(&Alert::InvalidEvent {
                    direction: self.direction.clone(),
                    detail,
                })
                .await;
        }
    }
}
