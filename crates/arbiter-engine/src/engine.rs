//! The decision loop.
//!
//! One cycle takes a batch off the queue and runs it through context,
//! reasoning, calibration, the safety gate, planning and resource
//! reservation. The decision is appended to history before anything
//! executes; execution, outcome recording and learning follow.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use arbiter_core::{
    ActionSpec, Decision, DecisionId, DecisionPayload, EngineConfig, Observation, ObservationId, Outcome,
    OutcomeKind, PatternKey, RawEvent, Urgency,
};
use arbiter_history::{
    DecisionRecord, Escalation, EscalationOutbox, FileHistoryStore, HistoryStore, Journal, Lesson,
    StoreError,
};

use crate::batch::Batcher;
use crate::calibration::Calibrator;
use crate::classifier::Classifier;
use crate::config::ConfigHandle;
use crate::context::ContextBuilder;
use crate::dispatch::{Dispatcher, ExecutionPlan, NovelActionEntry};
use crate::error::Result;
use crate::executor::ExecutorRegistry;
use crate::ingest::{ClassifierCell, Ingestor};
use crate::learner::OutcomeLearner;
use crate::oracle::Oracle;
use crate::queue::QueueHandle;
use crate::reasoner::Reasoner;
use crate::resources::{ResourcePool, ResourceRequest};
use crate::safety::{GateResult, SafetyChecker, SafetyVerdict};
use crate::similarity::KeywordScorer;
use crate::templates::TemplateLibrary;
use crate::tracker::{JsonFileTracker, TaskTracker};

const IDLE_POLL: Duration = Duration::from_secs(1);
const REQUEUE_BACKOFF: Duration = Duration::from_secs(1);

/// How the run loop should wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Running,
    /// Finish what is queued, then return.
    Drain,
    /// Return after the current cycle.
    Stop,
}

/// What one cycle did.
#[derive(Debug, Clone)]
pub enum CycleReport {
    /// A decision was recorded. `outcome` is set when an action ran or was
    /// rejected at planning.
    Decided {
        decision: Box<Decision>,
        outcome: Option<Outcome>,
    },
    /// A noise observation was dropped without a decision.
    Discarded { observation_id: ObservationId },
    /// The decision could not be made durable; the batch went back on the
    /// queue untouched.
    Requeued {
        observation_ids: Vec<ObservationId>,
        error: String,
    },
}

// ── Policy ────────────────────────────────────────────────────────

/// Everything derived from the configuration. Rebuilt whole on reload.
struct Policy {
    config: EngineConfig,
    batcher: Batcher,
    safety: SafetyChecker,
    calibrator: Calibrator,
}

impl Policy {
    fn build(config: EngineConfig) -> Result<(Self, Classifier)> {
        let classifier = Classifier::new(&config.classifier)?;
        let safety = SafetyChecker::new(&config.safety)?;
        let policy = Self {
            batcher: Batcher::new(&config.batch),
            calibrator: Calibrator::new(&config.calibration),
            safety,
            config,
        };
        Ok((policy, classifier))
    }
}

/// A plan already made for an action. A retried cycle that arrives at the
/// same action reuses it, and its decision ID, instead of planning again.
struct PlanMemo {
    decision_id: DecisionId,
    action: ActionSpec,
    planned: std::result::Result<ExecutionPlan, String>,
}

// ── Engine ────────────────────────────────────────────────────────

pub struct Engine {
    config: ConfigHandle,
    policy: Policy,
    classifier: ClassifierCell,
    queue: QueueHandle,
    history: Arc<dyn HistoryStore>,
    outbox: EscalationOutbox,
    templates: Arc<TemplateLibrary>,
    resources: Arc<ResourcePool>,
    context: ContextBuilder,
    reasoner: Reasoner,
    dispatcher: Dispatcher,
    learner: OutcomeLearner,
}

impl Engine {
    /// Open every store under `storage.data_dir` and wire the loop together.
    pub fn open(config: ConfigHandle, oracle: Arc<dyn Oracle>) -> Result<Self> {
        let data_dir = PathBuf::from(&config.current().storage.data_dir);
        let history = Arc::new(FileHistoryStore::open(&data_dir)?);
        Self::with_history(config, oracle, history)
    }

    /// Like [`open`](Self::open), with decisions recorded in `history`
    /// instead of the file store under `storage.data_dir`.
    pub fn with_history(
        config: ConfigHandle,
        oracle: Arc<dyn Oracle>,
        history: Arc<dyn HistoryStore>,
    ) -> Result<Self> {
        let current = config.current().clone();
        let data_dir = PathBuf::from(&current.storage.data_dir);
        let (policy, classifier) = Policy::build(current.clone())?;

        let outbox = EscalationOutbox::open(data_dir.join("outbox"))?;
        let templates = Arc::new(TemplateLibrary::load(data_dir.join("templates"))?);
        let resources = ResourcePool::new(&current.executors);
        let tracker: Arc<dyn TaskTracker> =
            Arc::new(JsonFileTracker::new(data_dir.join("tasks.json")));

        let context = ContextBuilder::new(
            ".",
            history.clone(),
            templates.clone(),
            tracker,
            resources.clone(),
            Arc::new(KeywordScorer),
        );
        let dispatcher = Dispatcher::new(
            oracle.clone(),
            ExecutorRegistry::from_config(&current.executors),
            templates.clone(),
            data_dir.join("novel_actions.jsonl"),
        );
        let learner = OutcomeLearner::new(templates.clone(), data_dir.join("lessons.jsonl"));

        tracing::info!(
            data_dir = %data_dir.display(),
            templates = templates.len(),
            "Engine opened"
        );

        Ok(Self {
            config,
            policy,
            classifier: ClassifierCell::new(classifier),
            queue: QueueHandle::new(),
            history,
            outbox,
            templates,
            resources,
            context,
            reasoner: Reasoner::new(oracle),
            dispatcher,
            learner,
        })
    }

    /// Replace the executor backends.
    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.dispatcher.set_executors(executors);
        self
    }

    /// A cloneable ingestion handle feeding this engine's queue.
    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(self.classifier.clone(), self.queue.clone())
    }

    pub fn ingest(&self, event: RawEvent) -> ObservationId {
        self.ingestor().ingest(event)
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub fn config(&self) -> &EngineConfig {
        &self.policy.config
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn outbox(&self) -> &EscalationOutbox {
        &self.outbox
    }

    pub fn templates(&self) -> &Arc<TemplateLibrary> {
        &self.templates
    }

    pub fn lessons(&self) -> &Journal<Lesson> {
        self.learner.lessons()
    }

    pub fn novel_log(&self) -> &Journal<NovelActionEntry> {
        self.dispatcher.novel_log()
    }

    /// Run cycles until told to stop. With `Shutdown::Drain` the loop returns
    /// once the queue is empty.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<Shutdown>) {
        tracing::info!("Decision loop started");
        loop {
            let state = *shutdown.borrow();
            if state == Shutdown::Stop {
                break;
            }

            match self.run_once().await {
                Some(CycleReport::Requeued { .. }) => tokio::time::sleep(REQUEUE_BACKOFF).await,
                Some(_) => {}
                None if state == Shutdown::Drain => break,
                None => {
                    tokio::select! {
                        _ = self.queue.notified() => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                }
            }
        }
        tracing::info!(queued = self.queue.len(), "Decision loop stopped");
    }

    /// One cycle. `None` when the queue is empty.
    pub async fn run_once(&mut self) -> Option<CycleReport> {
        self.apply_reloads();

        // Give a non-critical head a moment to collect its batch-mates.
        let settle = {
            let queue = self.queue.lock();
            let head = queue.peek()?;
            let window = Duration::from_millis(self.policy.config.batch.settle_ms);
            match queue.head_age() {
                Some(age) if head.urgency != Urgency::Critical && age < window => Some(window - age),
                _ => None,
            }
        };
        if let Some(wait) = settle {
            tokio::time::sleep(wait).await;
        }

        let batch = {
            let mut queue = self.queue.lock();
            self.policy.batcher.next_batch(&mut queue)
        }?;

        if let [only] = batch.as_slice() {
            if only.urgency == Urgency::Noise {
                let mut noise = only.clone();
                noise.mark_processed(None);
                tracing::debug!(observation_id = %noise.id, path = ?noise.path, "Noise discarded");
                return Some(CycleReport::Discarded {
                    observation_id: noise.id,
                });
            }
        }

        Some(self.process_batch(batch).await)
    }

    /// Decide on one batch. A decision that cannot be made durable retries
    /// the cycle from context; once retries run out the batch goes back on
    /// the queue.
    pub async fn process_batch(&mut self, batch: Vec<Observation>) -> CycleReport {
        let retries = self.policy.config.storage.history_retries.max(1);
        let mut last_error = String::new();
        let mut memo = None;

        for attempt in 1..=retries {
            match self.cycle(&batch, &mut memo).await {
                Ok(report) => return report,
                Err(e) => {
                    tracing::error!(
                        attempt,
                        retries,
                        error = %e,
                        "Could not record decision"
                    );
                    last_error = e.to_string();
                }
            }
        }

        let observation_ids = batch.iter().map(|o| o.id).collect();
        tracing::error!(
            observations = batch.len(),
            error = %last_error,
            "Decision could not be recorded, batch requeued"
        );
        self.queue.push_all(batch);
        CycleReport::Requeued {
            observation_ids,
            error: last_error,
        }
    }

    async fn cycle(
        &self,
        batch: &[Observation],
        memo: &mut Option<PlanMemo>,
    ) -> std::result::Result<CycleReport, StoreError> {
        let policy = &self.policy;
        let config = &policy.config;

        let ctx = self.context.build(batch, &config.context).await;
        let reasoned = self.reasoner.reason(&ctx, &config.thresholds, &config.reasoner).await;
        let mut decision = reasoned.decision;
        if let Some(m) = memo.as_ref() {
            // The novel-action log already names this ID.
            decision.id = m.decision_id;
        }

        if !reasoned.safe_default {
            let stats = match batch.first() {
                Some(primary) => {
                    let key = PatternKey::new(
                        primary.category,
                        primary.observation_type,
                        decision.decision_type(),
                        decision.action().map(|a| a.action_type.as_str()),
                    );
                    self.history.pattern_stats(&key).unwrap_or_else(|e| {
                        tracing::warn!(pattern_key = %key, error = %e, "Pattern stats unavailable");
                        None
                    })
                }
                None => None,
            };
            decision.confidence = policy.calibrator.calibrate(decision.raw_confidence, stats.as_ref());
        }

        let (plan, blocked_action, planning_error) = self.gate_and_plan(&mut decision, memo).await;

        let mut reservation = None;
        let mut plan = plan;
        if let Some(p) = &plan {
            match self.resources.try_reserve(&ResourceRequest::for_steps(&p.steps)) {
                Ok(r) => reservation = Some(r),
                Err(shortage) => {
                    tracing::info!(
                        decision_id = %decision.id,
                        shortage = %shortage,
                        "Resources unavailable, deferring action"
                    );
                    decision.payload = DecisionPayload::Wait {
                        resume_conditions: vec![shortage.to_string()],
                        timeout_secs: Some(config.executors.defer_timeout_secs),
                    };
                    plan = None;
                }
            }
        }

        let decision_id = decision.id;
        let observations: Vec<Observation> = batch
            .iter()
            .cloned()
            .map(|mut o| {
                o.mark_processed(Some(decision_id));
                o
            })
            .collect();
        let record = DecisionRecord::seal(decision, observations);
        self.persist(&record, blocked_action)?;

        tracing::info!(
            decision_id = %decision_id,
            decision_type = %record.decision.decision_type(),
            confidence = record.decision.confidence,
            raw_confidence = record.decision.raw_confidence,
            observations = record.observations.len(),
            pattern_key = %record.pattern_key,
            "Decision recorded"
        );

        if let DecisionPayload::Wait {
            timeout_secs: Some(secs),
            ..
        } = &record.decision.payload
        {
            self.schedule_requeue(&record, Duration::from_secs(*secs));
        }

        let outcome = match (planning_error, &plan) {
            (Some(reason), _) => Some(Outcome::new(OutcomeKind::Rejected, reason, 0)),
            (None, Some(p)) => {
                if let Some(r) = reservation.as_mut() {
                    r.spend();
                }
                let outcome = self.dispatcher.execute(decision_id, p).await;
                drop(reservation);
                Some(outcome)
            }
            (None, None) => None,
        };

        let Some(outcome) = outcome else {
            return Ok(CycleReport::Decided {
                decision: Box::new(record.decision),
                outcome: None,
            });
        };

        let decision = match self.history.record_outcome(decision_id, &outcome) {
            Ok(updated) => {
                let report = self
                    .learner
                    .learn(&updated, plan.as_ref(), &outcome, &config.calibration);
                tracing::info!(
                    decision_id = %decision_id,
                    outcome = ?outcome.kind,
                    attempts = outcome.attempts,
                    learned_template = ?report.learned_template,
                    "Outcome recorded"
                );
                updated.decision
            }
            Err(e) => {
                tracing::error!(decision_id = %decision_id, error = %e, "Could not record outcome");
                record.decision
            }
        };

        Ok(CycleReport::Decided {
            decision: Box::new(decision),
            outcome: Some(outcome),
        })
    }

    /// Write the outbox entry of an ESCALATE, then append the record. If the
    /// append fails the entry is withdrawn, so neither outlives the other.
    fn persist(
        &self,
        record: &DecisionRecord,
        blocked_action: Option<ActionSpec>,
    ) -> std::result::Result<(), StoreError> {
        let decision = &record.decision;
        let escalated = match &decision.payload {
            DecisionPayload::Escalate { reason, priority } => {
                let escalation = Escalation {
                    decision_id: decision.id,
                    timestamp: Utc::now(),
                    priority: *priority,
                    reason: reason.clone(),
                    observation_ids: decision.observation_ids.clone(),
                    reasoning: decision.reasoning.clone(),
                    confidence: decision.confidence,
                    action: blocked_action,
                };
                Some((self.outbox.write(&escalation)?, escalation))
            }
            _ => None,
        };

        if let Err(e) = self.history.append(record) {
            if let Some((path, _)) = &escalated {
                if let Err(withdraw) = self.outbox.withdraw(path) {
                    tracing::error!(
                        decision_id = %decision.id,
                        path = %path.display(),
                        error = %withdraw,
                        "Could not withdraw escalation"
                    );
                }
            }
            return Err(e);
        }

        if let Some((path, escalation)) = escalated {
            tracing::warn!(
                decision_id = %decision.id,
                priority = escalation.priority,
                reason = %escalation.reason,
                path = %path.display(),
                "Decision escalated"
            );
        }
        Ok(())
    }

    /// Gate an ACT, then plan it and gate every derived step. A rejection
    /// turns the decision into an ESCALATE and hands back the blocked action.
    /// A planning failure is returned as the third element.
    async fn gate_and_plan(
        &self,
        decision: &mut Decision,
        memo: &mut Option<PlanMemo>,
    ) -> (Option<ExecutionPlan>, Option<ActionSpec>, Option<String>) {
        let Some(action) = decision.action().cloned() else {
            return (None, None, None);
        };
        let policy = &self.policy;
        let approved = self.approved_ids();

        let action = match policy.safety.gate(&action, &approved) {
            GateResult::Rejected { reason } => {
                self.escalate(decision, format!("safety check rejected action: {reason}"));
                return (None, Some(action), None);
            }
            GateResult::Passed {
                action: gated,
                sanitized,
            } => {
                if sanitized {
                    tracing::info!(decision_id = %decision.id, "Action sanitized");
                    decision.payload = DecisionPayload::Act {
                        action: gated.clone(),
                    };
                }
                gated
            }
        };

        let planned = match memo.as_ref().filter(|m| m.action == action) {
            Some(m) => m.planned.clone(),
            None => {
                let planned = self
                    .dispatcher
                    .plan(decision.id, &action, &policy.config.executors)
                    .await;
                *memo = Some(PlanMemo {
                    decision_id: decision.id,
                    action: action.clone(),
                    planned: planned.clone(),
                });
                planned
            }
        };
        let plan = match planned {
            Ok(plan) => plan,
            Err(reason) => {
                tracing::warn!(decision_id = %decision.id, reason = %reason, "Action could not be planned");
                return (None, None, Some(reason));
            }
        };

        let step_rejection = plan.steps.iter().find_map(|step| {
            match policy.safety.check_step(step, &approved) {
                SafetyVerdict::Rejected { reason } => Some(reason),
                SafetyVerdict::Allowed => None,
            }
        });
        if let Some(reason) = step_rejection {
            self.escalate(decision, format!("safety check rejected plan step: {reason}"));
            return (None, Some(action), None);
        }

        (Some(plan), None, None)
    }

    fn escalate(&self, decision: &mut Decision, reason: String) {
        tracing::warn!(decision_id = %decision.id, reason = %reason, "Action blocked");
        decision.payload = DecisionPayload::Escalate {
            reason,
            priority: self.policy.config.reasoner.default_escalation_priority,
        };
    }

    fn approved_ids(&self) -> HashSet<DecisionId> {
        match self.outbox.approved_ids() {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read escalation approvals");
                HashSet::new()
            }
        }
    }

    /// Fresh copies of a WAIT's observations go back on the queue once its
    /// timeout passes.
    fn schedule_requeue(&self, record: &DecisionRecord, after: Duration) {
        let copies: Vec<Observation> = record.observations.iter().map(Observation::requeued).collect();
        let queue = self.queue.clone();
        let decision_id = record.decision.id;
        tracing::debug!(
            decision_id = %decision_id,
            after_secs = after.as_secs(),
            observations = copies.len(),
            "Requeue scheduled"
        );
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            tracing::debug!(decision_id = %decision_id, "Wait elapsed, observations requeued");
            queue.push_all(copies);
        });
    }

    fn apply_reloads(&mut self) {
        if let Some(config) = self.config.reload_if_changed().cloned() {
            match Policy::build(config) {
                Ok((policy, classifier)) => {
                    self.resources.set_limits(&policy.config.executors);
                    self.classifier.replace(classifier);
                    self.policy = policy;
                    tracing::info!("Engine policy updated");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Reloaded configuration rejected, keeping previous policy")
                }
            }
        }
        match self.templates.reload_if_changed() {
            Ok(true) => tracing::info!(templates = self.templates.len(), "Template library reloaded"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Template reload failed"),
        }
    }
}
