//! Engine — the control loop that ties aggregator, evaluator, reconciler
//! and effector together.
//!
//! Every registered target lives in its own slot behind an async mutex.
//! A tick evaluates all slots concurrently (bounded by
//! `max_concurrency`); the slot lock serializes one target's evaluation,
//! reconciliation and effector call, while other targets proceed
//! independently.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use gridscale_core::{
    epoch_millis, AppliedAction, AuditEvent, AuditRecord, Capacity, EngineSettings, PolicyKind,
    ReasonCode, ScalableTarget, ScaleError, ScaleResult, ScalingPolicy, TargetId, TargetPhase,
    Timestamp,
};
use gridscale_metrics::MetricsAggregator;

use crate::effector::Effector;
use crate::evaluator::{evaluate, Observation};
use crate::reconciler::{reconcile, revert, Rejected};

/// A target together with the policy driving it.
#[derive(Debug, Clone)]
pub struct ManagedTarget {
    pub target: ScalableTarget,
    pub policy: ScalingPolicy,
}

/// What happened to one target during a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetOutcome {
    /// No samples in the window; evaluation skipped this cycle.
    Skipped,
    /// The evaluator proposed nothing.
    NoChange { reason: ReasonCode },
    /// The action passed reconciliation and the effector applied it.
    Applied(AppliedAction),
    /// The reconciler refused the decision.
    Rejected(Rejected),
    /// The effector call failed or timed out.
    Failed(ScaleError),
}

/// Per-target outcomes of one tick, ordered by target id.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub timestamp: Timestamp,
    pub outcomes: Vec<(TargetId, TargetOutcome)>,
}

impl TickReport {
    pub fn outcome(&self, target_id: &str) -> Option<&TargetOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == target_id)
            .map(|(_, outcome)| outcome)
    }

    pub fn applied(&self) -> impl Iterator<Item = &AppliedAction> {
        self.outcomes.iter().filter_map(|(_, outcome)| match outcome {
            TargetOutcome::Applied(action) => Some(action),
            _ => None,
        })
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, TargetOutcome::Failed(_)))
            .count()
    }
}

/// The autoscaling decision engine.
///
/// Cheap to clone; clones share targets, metrics and the effector.
#[derive(Clone)]
pub struct Engine {
    settings: EngineSettings,
    aggregator: MetricsAggregator,
    effector: Arc<dyn Effector>,
    targets: Arc<RwLock<HashMap<TargetId, Arc<Mutex<ManagedTarget>>>>>,
    audit: Option<mpsc::UnboundedSender<AuditRecord>>,
}

impl Engine {
    /// Create an engine with its own metrics aggregator.
    pub fn new(settings: EngineSettings, effector: Arc<dyn Effector>) -> Self {
        let aggregator = MetricsAggregator::new(settings.default_retention);
        Self {
            settings,
            aggregator,
            effector,
            targets: Arc::new(RwLock::new(HashMap::new())),
            audit: None,
        }
    }

    /// Share an existing aggregator instead of the engine's own.
    pub fn with_aggregator(mut self, aggregator: MetricsAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Stream every audit record to `tx`.
    pub fn with_audit(mut self, tx: mpsc::UnboundedSender<AuditRecord>) -> Self {
        self.audit = Some(tx);
        self
    }

    /// The aggregator samples are pushed into.
    pub fn aggregator(&self) -> &MetricsAggregator {
        &self.aggregator
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Register a target with its policy.
    ///
    /// Malformed policies are rejected with `InvalidPolicy` and the target
    /// stays unmanaged. An id that is already managed is refused with
    /// `AlreadyRegistered`; use [`Engine::replace_policy`] to change its
    /// policy.
    pub async fn register(
        &self,
        mut target: ScalableTarget,
        policy: ScalingPolicy,
    ) -> ScaleResult<()> {
        if let Err(e) = policy.validate(&target) {
            warn!(target_id = %target.id, error = %e, "policy rejected");
            return Err(e);
        }

        if let Some(clamped) = target.bounds.clamp(&target.capacity)
            && let Some(reason) = clamped.reason
        {
            warn!(
                target_id = %target.id,
                from = %target.capacity,
                to = %clamped.capacity,
                %reason,
                "initial capacity outside bounds"
            );
            target.capacity = clamped.capacity;
        }

        let mut targets = self.targets.write().await;
        if targets.contains_key(&target.id) {
            warn!(target_id = %target.id, "target already registered");
            return Err(ScaleError::AlreadyRegistered(target.id));
        }
        self.aggregator.set_retention(&target.id, policy.window).await;

        let id = target.id.clone();
        info!(
            target_id = %id,
            kind = ?target.kind,
            capacity = %target.capacity,
            metrics = ?policy.metrics(),
            cooldown_secs = policy.cooldown.as_secs(),
            "target registered"
        );
        targets.insert(id, Arc::new(Mutex::new(ManagedTarget { target, policy })));
        Ok(())
    }

    /// Replace a target's policy wholesale. Capacity and cooldown state
    /// are kept.
    pub async fn replace_policy(&self, target_id: &str, policy: ScalingPolicy) -> ScaleResult<()> {
        let slot = self.slot(target_id).await?;
        let mut managed = slot.lock().await;
        policy.validate(&managed.target)?;

        self.aggregator.set_retention(target_id, policy.window).await;
        managed.policy = policy;
        info!(%target_id, "policy replaced");
        Ok(())
    }

    /// Stop managing a target and drop its samples.
    pub async fn unregister(&self, target_id: &str) -> bool {
        let removed = self.targets.write().await.remove(target_id).is_some();
        if removed {
            self.aggregator.remove_target(target_id).await;
            info!(%target_id, "target unregistered");
        }
        removed
    }

    /// Record capacity observed in the external system (for example
    /// after a manual resize). The value is clamped into bounds.
    pub async fn observe_capacity(
        &self,
        target_id: &str,
        capacity: Capacity,
    ) -> ScaleResult<Capacity> {
        let slot = self.slot(target_id).await?;
        let mut managed = slot.lock().await;
        let clamped = managed.target.bounds.clamp(&capacity).ok_or_else(|| {
            ScaleError::invalid_policy(
                target_id,
                format!(
                    "observed {:?} capacity for a {:?} target",
                    capacity.kind(),
                    managed.target.kind
                ),
            )
        })?;

        if clamped.reason.is_some() {
            warn!(
                %target_id,
                observed = %capacity,
                stored = %clamped.capacity,
                "observed capacity outside bounds"
            );
        }
        managed.target.capacity = clamped.capacity;
        debug!(%target_id, capacity = %clamped.capacity, "capacity observed");
        Ok(clamped.capacity)
    }

    /// Snapshot of a managed target.
    pub async fn target(&self, target_id: &str) -> Option<ScalableTarget> {
        let slot = self.slot(target_id).await.ok()?;
        let managed = slot.lock().await;
        Some(managed.target.clone())
    }

    pub async fn policy(&self, target_id: &str) -> Option<ScalingPolicy> {
        let slot = self.slot(target_id).await.ok()?;
        let managed = slot.lock().await;
        Some(managed.policy.clone())
    }

    /// Whether a target is stable or cooling down at `now`.
    pub async fn phase(&self, target_id: &str, now: Timestamp) -> Option<TargetPhase> {
        let slot = self.slot(target_id).await.ok()?;
        let managed = slot.lock().await;
        Some(managed.target.phase(managed.policy.cooldown, now))
    }

    pub async fn target_ids(&self) -> Vec<TargetId> {
        let mut ids: Vec<_> = self.targets.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run one evaluation pass at wall-clock time.
    pub async fn tick(&self) -> TickReport {
        self.tick_at(epoch_millis()).await
    }

    /// Run one evaluation pass over every target as of `now`.
    ///
    /// Targets are processed concurrently; a failure in one target never
    /// affects the others.
    pub async fn tick_at(&self, now: Timestamp) -> TickReport {
        let slots: Vec<_> = self
            .targets
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let permits = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (id, slot) in slots {
            let engine = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let outcome = engine.process(&slot, now).await;
                (id, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => outcomes.push(result),
                Err(e) => error!(error = %e, "target evaluation task failed"),
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));

        let report = TickReport {
            timestamp: now,
            outcomes,
        };
        debug!(
            targets = report.outcomes.len(),
            applied = report.applied().count(),
            failed = report.failures(),
            "tick complete"
        );
        report
    }

    /// Run the control loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            max_concurrency = self.settings.max_concurrency,
            "autoscaling engine started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("autoscaling engine shutting down");
                    break;
                }
            }
        }
    }

    /// Evaluate, reconcile and apply one target.
    async fn process(&self, slot: &Mutex<ManagedTarget>, now: Timestamp) -> TargetOutcome {
        let mut guard = slot.lock().await;
        let ManagedTarget { target, policy } = &mut *guard;

        let observation = self.observe(policy, now).await;
        let decision = evaluate(target, policy, &observation, now);
        self.emit(AuditRecord::decision(&decision));

        if decision.is_noop() {
            return match decision.reason {
                ReasonCode::InsufficientData => TargetOutcome::Skipped,
                reason => TargetOutcome::NoChange { reason },
            };
        }

        let action = match reconcile(target, &decision, policy.cooldown, now) {
            Ok(action) => action,
            Err(rejected) => {
                if let Rejected::CooldownActive { remaining } = &rejected {
                    let err = ScaleError::CooldownActive {
                        target_id: target.id.clone(),
                        remaining: *remaining,
                    };
                    debug!(error = %err, "decision deferred");
                }
                self.emit(AuditRecord {
                    target_id: target.id.clone(),
                    event: AuditEvent::Rejected,
                    old: Some(target.capacity),
                    new: decision.proposed,
                    reason: rejected.reason(),
                    timestamp: now,
                    detail: None,
                });
                return TargetOutcome::Rejected(rejected);
            }
        };

        let applied = tokio::time::timeout(
            self.settings.effector_timeout,
            self.effector.apply(&action.target_id, &action.new),
        )
        .await;
        let failure = match applied {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(_) => Some(format!("timed out after {:?}", self.settings.effector_timeout)),
        };

        match failure {
            None => {
                info!(
                    target_id = %action.target_id,
                    from = %action.old,
                    to = %action.new,
                    reason = %action.reason,
                    "scaling action applied"
                );
                self.emit(AuditRecord::applied(&action));
                TargetOutcome::Applied(action)
            }
            Some(message) => {
                revert(target, &action);
                warn!(
                    target_id = %action.target_id,
                    to = %action.new,
                    error = %message,
                    "scaling action failed"
                );
                self.emit(AuditRecord {
                    target_id: action.target_id.clone(),
                    event: AuditEvent::Failed,
                    old: Some(action.old),
                    new: Some(action.new),
                    reason: ReasonCode::EffectorFailure,
                    timestamp: now,
                    detail: Some(message.clone()),
                });
                TargetOutcome::Failed(ScaleError::EffectorFailure {
                    target_id: action.target_id,
                    message,
                })
            }
        }
    }

    /// Gather this cycle's observation for a policy.
    async fn observe(&self, policy: &ScalingPolicy, now: Timestamp) -> Observation {
        let id = &policy.target_id;
        let observed = match &policy.kind {
            PolicyKind::VerticalRecommendation(v) => {
                let cpu = self
                    .aggregator
                    .usage_profile(id, &v.cpu_metric, policy.window, v.percentile, now)
                    .await;
                let memory = self
                    .aggregator
                    .usage_profile(id, &v.memory_metric, policy.window, v.percentile, now)
                    .await;
                cpu.and_then(|cpu| memory.map(|memory| Observation::Usage { cpu, memory }))
            }
            PolicyKind::TargetTracking | PolicyKind::Step { .. } => self
                .aggregator
                .windowed_statistic(id, &policy.metric, policy.window, policy.aggregation, now)
                .await
                .map(Observation::Statistic),
        };

        observed.unwrap_or_else(|e| {
            if e.is_informational() {
                debug!(target_id = %id, error = %e, "skipping evaluation");
            } else {
                warn!(target_id = %id, error = %e, "skipping evaluation");
            }
            Observation::NoData
        })
    }

    fn emit(&self, record: AuditRecord) {
        debug!(
            target_id = %record.target_id,
            event = ?record.event,
            old = ?record.old.map(|c| c.to_string()),
            new = ?record.new.map(|c| c.to_string()),
            reason = %record.reason,
            timestamp = record.timestamp,
            "audit"
        );
        if let Some(tx) = &self.audit {
            let _ = tx.send(record);
        }
    }

    async fn slot(&self, target_id: &str) -> ScaleResult<Arc<Mutex<ManagedTarget>>> {
        self.targets
            .read()
            .await
            .get(target_id)
            .cloned()
            .ok_or_else(|| ScaleError::UnknownTarget(target_id.to_string()))
    }
}
