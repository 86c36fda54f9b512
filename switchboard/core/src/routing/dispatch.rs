//! Resilient Dispatch
//!
//! One `route` call walks a small state machine:
//!
//! ```text
//!   cache hit? ──yes──► done (cached, confidence 1.0)
//!       │ no
//!       v
//!   SelectInitial  (experiment override, else candidates + preferences)
//!       │          admission gate, may swap in a cheaper backend
//!       v
//!   ┌► Attempt ──fatal──────────────────────────────► BackendFatal
//!   │     │ retryable / unknown
//!   │     │ success ─► quality gate
//!   │     │              accept ───────────────────► Accepted
//!   │     │              retry (once) ──► Attempt on the same backend
//!   │     v              fallback
//!   │  Escalate ◄───────────┘
//!   │     │ next fallback candidate, else a text-only backend
//!   └─────┘ nothing left or attempt budget spent ──► AllBackendsExhausted
//! ```
//!
//! Attempts within one dispatch are strictly sequential and never exceed
//! the policy's `max_retries`. Cancellation aborts the in-flight call and
//! stops escalation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use super::admission::{estimate_complexity, estimate_tokens, find_cheaper_alternative, reduce_prompt};
use super::cache::{fingerprint, CacheEntry};
use super::config::{BackendConfig, Capability, SelectionCriteria, TaskType, Urgency};
use super::experiment::{
    AssignmentContext, ExperimentAssignment, ExperimentResult, ExperimentType, VariantConfig,
};
use super::fallback::{FallbackChainBuilder, FallbackContext};
use super::metrics::DispatchOutcome;
use super::preference::InteractionOutcome;
use super::quality::{QualityAssessment, Recommendation};
use super::registry::RegistrySnapshot;
use super::router::Router;
use crate::backend::{BackendError, ErrorKind, InvokeOptions, InvokeRequest, InvokeResponse};
use crate::store::UsageRecord;

/// Framing prepended to prompts sent to text-only backends
pub const TEXT_ONLY_FRAMING: &str =
    "Answer in plain text only. Do not use tables, code blocks or other formatting.\n\n";

/// Confidence of an experiment-assigned or cached route
pub const CONFIDENCE_CERTAIN: f64 = 1.0;
/// Confidence of a route learned from the user's history
pub const CONFIDENCE_PREFERENCE: f64 = 0.9;
/// Confidence of a high-urgency most-reliable route
pub const CONFIDENCE_RELIABLE: f64 = 0.85;
/// Confidence of a priority-ordered route
pub const CONFIDENCE_PERFORMANCE: f64 = 0.8;
/// Confidence of a cheapest-first route
pub const CONFIDENCE_COST: f64 = 0.75;
/// Confidence of a degraded text-only answer
pub const CONFIDENCE_DEGRADED: f64 = 0.6;

// ============================================================================
// Cancellation
// ============================================================================

/// Cloneable cancellation handle for one or more dispatches
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Token that has not been cancelled
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancel every dispatch holding a clone of this token
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// ============================================================================
// Errors
// ============================================================================

/// One failed attempt inside an exhausted dispatch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub backend_id: String,
    pub reason: String,
}

impl std::fmt::Display for AttemptSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.backend_id, self.reason)
    }
}

fn join_attempts(attempts: &[AttemptSummary]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that cross the `route` boundary
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouteError {
    /// Nothing can serve the task type and no default is configured
    #[error("no backend available for task type {task_type}")]
    NoBackendAvailable { task_type: TaskType },

    /// Admission rejected the request and every cheaper alternative
    #[error("cost limit exceeded for tier {tier}: estimated {estimated_cost:.4}, remaining {remaining:.4}")]
    CostLimitExceeded {
        tier: String,
        estimated_cost: f64,
        remaining: f64,
    },

    /// A backend failed with a non-retryable error
    #[error("backend {backend_id} failed: {error}")]
    BackendFatal {
        backend_id: String,
        error: BackendError,
    },

    /// Every attempt failed or was rejected
    #[error("all backends exhausted after {} attempts (last: {last_backend}): {}", attempts.len(), join_attempts(attempts))]
    AllBackendsExhausted {
        last_backend: String,
        attempts: Vec<AttemptSummary>,
    },

    /// The caller cancelled the request
    #[error("request cancelled")]
    Cancelled,
}

impl RouteError {
    /// Stable snake_case name of the error kind
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoBackendAvailable { .. } => "no_backend_available",
            Self::CostLimitExceeded { .. } => "cost_limit_exceeded",
            Self::BackendFatal { .. } => "backend_fatal",
            Self::AllBackendsExhausted { .. } => "all_backends_exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

// ============================================================================
// Decision & Outcome
// ============================================================================

/// What drove the routing decision
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionFlags {
    pub user_preference: bool,
    pub ab_test_override: bool,
    pub performance_based: bool,
    pub cost_optimized: bool,
}

/// Which backend served the request and why
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Backend that produced the response
    pub backend_id: String,
    /// Human-readable reason
    pub reason: String,
    /// Up to two runner-up backends
    pub alternatives: Vec<String>,
    /// Routing confidence (0.0 - 1.0), separate from response quality
    pub confidence: f64,
    pub flags: DecisionFlags,
}

/// One backend call within a dispatch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub backend_id: String,
    pub started_at: DateTime<Utc>,
    /// The backend returned a response
    pub success: bool,
    /// Quality score, for successful attempts
    pub score: Option<f64>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub cost: f64,
    pub duration_ms: u64,
}

/// Successful result of one dispatch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteOutcome {
    pub decision: RoutingDecision,
    /// Response text
    pub content: String,
    /// Every attempt, in order (empty for cache hits)
    pub attempts: Vec<AttemptRecord>,
    /// Quality score of the accepted response
    pub quality: Option<f64>,
    /// Total spend across attempts
    pub cost: f64,
    pub cached: bool,
    /// Served by a text-only backend after the chain was exhausted
    pub degraded: bool,
    pub warning: Option<String>,
    /// Experiment assignments applied to this request
    pub assignments: Vec<ExperimentAssignment>,
}

impl RouteOutcome {
    fn from_cache(entry: CacheEntry) -> Self {
        Self {
            decision: RoutingDecision {
                backend_id: entry.backend_id,
                reason: "served from response cache".to_string(),
                alternatives: Vec::new(),
                confidence: CONFIDENCE_CERTAIN,
                flags: DecisionFlags::default(),
            },
            content: entry.response,
            attempts: Vec::new(),
            quality: entry.quality,
            cost: 0.0,
            cached: true,
            degraded: false,
            warning: None,
            assignments: Vec::new(),
        }
    }
}

// ============================================================================
// Dispatch State
// ============================================================================

/// Per-request working state
struct Dispatch<'a> {
    criteria: SelectionCriteria,
    user_id: &'a str,
    fingerprint: String,
    prompt: String,
    options: InvokeOptions,
    snapshot: Arc<RegistrySnapshot>,
    assignments: Vec<ExperimentAssignment>,
    attempts: Vec<AttemptRecord>,
    tried: FallbackContext,
    cancel: &'a CancelToken,
    started: Instant,
}

impl Dispatch<'_> {
    fn tier(&self) -> Option<&str> {
        self.criteria.tier.as_deref()
    }

    fn max_attempts(&self) -> usize {
        self.snapshot.policy.max_retries as usize
    }

    fn summaries(&self) -> Vec<AttemptSummary> {
        self.attempts
            .iter()
            .map(|a| AttemptSummary {
                backend_id: a.backend_id.clone(),
                reason: match (&a.error, a.score) {
                    (Some(error), _) => error.clone(),
                    (None, Some(score)) => format!("quality {score:.2} below threshold"),
                    (None, None) => "empty response".to_string(),
                },
            })
            .collect()
    }

    fn total_cost(&self) -> f64 {
        self.attempts.iter().map(|a| a.cost).sum()
    }
}

enum AttemptResult {
    Answered { response: InvokeResponse, cost: f64 },
    Failed { error: BackendError, kind: ErrorKind },
}

/// Prompt framed for a text-only backend
#[must_use]
pub fn text_only_prompt(prompt: &str) -> String {
    format!("{TEXT_ONLY_FRAMING}{prompt}")
}

// ============================================================================
// Router dispatch
// ============================================================================

impl Router {
    /// Route one request
    ///
    /// # Errors
    ///
    /// Returns a [`RouteError`] when no backend can serve the request, the
    /// tier budget rejects it, a backend fails fatally, or every attempt
    /// fails.
    pub async fn route(
        &self,
        prompt: &str,
        criteria: &SelectionCriteria,
        user_id: &str,
    ) -> Result<RouteOutcome, RouteError> {
        self.route_with_cancel(prompt, criteria, user_id, &CancelToken::new())
            .await
    }

    /// Route one request under a cancellation token
    ///
    /// # Errors
    ///
    /// As [`Router::route`], plus [`RouteError::Cancelled`].
    pub async fn route_with_cancel(
        &self,
        prompt: &str,
        criteria: &SelectionCriteria,
        user_id: &str,
        cancel: &CancelToken,
    ) -> Result<RouteOutcome, RouteError> {
        let started = Instant::now();
        let result = self.dispatch(prompt, criteria, user_id, cancel, started).await;

        let outcome = match &result {
            Ok(o) if o.cached => DispatchOutcome::CacheHit,
            Ok(o) if o.degraded => DispatchOutcome::Degraded,
            Ok(_) => DispatchOutcome::Accepted,
            Err(RouteError::Cancelled) => DispatchOutcome::Cancelled,
            Err(RouteError::AllBackendsExhausted { .. }) => DispatchOutcome::Exhausted,
            Err(_) => DispatchOutcome::Rejected,
        };
        self.metrics.record_dispatch(outcome, started.elapsed());

        match &result {
            Ok(o) => tracing::info!(
                backend = %o.decision.backend_id,
                attempts = o.attempts.len(),
                cached = o.cached,
                degraded = o.degraded,
                confidence = o.decision.confidence,
                "Request routed"
            ),
            Err(e @ RouteError::AllBackendsExhausted { .. }) => {
                tracing::error!(error = %e, "Dispatch exhausted");
            }
            Err(e) => tracing::warn!(kind = e.kind(), error = %e, "Dispatch failed"),
        }
        result
    }

    async fn dispatch(
        &self,
        prompt: &str,
        criteria: &SelectionCriteria,
        user_id: &str,
        cancel: &CancelToken,
        started: Instant,
    ) -> Result<RouteOutcome, RouteError> {
        let fingerprint = fingerprint(prompt, criteria.task_type);
        if let Some(entry) = self.cache.get(&fingerprint).await {
            tracing::debug!(fingerprint = %fingerprint, "Cache hit");
            return Ok(RouteOutcome::from_cache(entry));
        }
        if cancel.is_cancelled() {
            return Err(RouteError::Cancelled);
        }

        let mut criteria = criteria.clone();
        if criteria.complexity.is_none() {
            criteria.complexity = Some(estimate_complexity(prompt));
        }

        let reduction_target = criteria
            .tier
            .as_deref()
            .and_then(|t| self.admission.tier(t))
            .map_or(0.0, |t| t.token_reduction_target);
        let reduced = reduce_prompt(prompt, reduction_target);
        if reduced.saved() > 0 {
            tracing::debug!(
                saved_tokens = reduced.saved(),
                techniques = ?reduced.techniques,
                "Prompt reduced"
            );
        }

        let mut run = Dispatch {
            criteria,
            user_id,
            fingerprint,
            prompt: reduced.prompt,
            options: InvokeOptions::default(),
            snapshot: self.registry.snapshot(),
            assignments: Vec::new(),
            attempts: Vec::new(),
            tried: FallbackContext::new(),
            cancel,
            started,
        };

        let override_backend = self.apply_experiments(&mut run).await;
        let (backend, decision) = match override_backend {
            Some((backend, decision)) => (backend, decision),
            None => self.select_initial(&run)?,
        };
        let (backend, decision) = self.admit(&run, backend, decision)?;

        self.run_attempts(&mut run, backend, decision).await
    }

    // ------------------------------------------------------------------------
    // SelectInitial
    // ------------------------------------------------------------------------

    /// Resolve every experiment type and apply the non-model variants
    ///
    /// Returns the model override, if one is assigned and usable.
    async fn apply_experiments(
        &self,
        run: &mut Dispatch<'_>,
    ) -> Option<(BackendConfig, RoutingDecision)> {
        let context = AssignmentContext {
            tier: run.criteria.tier.clone(),
            task_type: Some(run.criteria.task_type),
        };

        let mut model_override = None;
        for kind in [
            ExperimentType::Model,
            ExperimentType::Prompt,
            ExperimentType::Parameter,
            ExperimentType::Feature,
        ] {
            let Some(assignment) = self.experiments.assign(run.user_id, kind, &context).await
            else {
                continue;
            };

            match &assignment.config {
                VariantConfig::Model { backend_id } => {
                    match run.snapshot.get(backend_id) {
                        Some(b)
                            if b.active
                                && b.capability == Capability::Full
                                && self.health.is_eligible(&b.id) =>
                        {
                            model_override = Some((
                                b.clone(),
                                RoutingDecision {
                                    backend_id: b.id.clone(),
                                    reason: format!(
                                        "experiment {} assigned variant {}",
                                        assignment.experiment_id, assignment.variant_id
                                    ),
                                    alternatives: Vec::new(),
                                    confidence: CONFIDENCE_CERTAIN,
                                    flags: DecisionFlags {
                                        ab_test_override: true,
                                        ..DecisionFlags::default()
                                    },
                                },
                            ));
                        }
                        _ => tracing::warn!(
                            experiment = %assignment.experiment_id,
                            backend = %backend_id,
                            "Experiment backend unusable, routing normally"
                        ),
                    }
                }
                config @ VariantConfig::Prompt { .. } => {
                    run.prompt = config.apply_prompt(&run.prompt);
                }
                VariantConfig::Parameter { parameters } => {
                    run.options
                        .parameters
                        .extend(parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                VariantConfig::Feature { flags } => {
                    run.options
                        .parameters
                        .insert("features".to_string(), serde_json::json!(flags));
                }
            }
            run.assignments.push(assignment);
        }
        model_override
    }

    /// Registry candidates minus unavailable backends
    ///
    /// A preferred backend that is currently unavailable does not block the
    /// request; ranking is redone as if no preference were given.
    fn eligible_candidates(
        &self,
        snapshot: &RegistrySnapshot,
        criteria: &SelectionCriteria,
    ) -> Result<Vec<BackendConfig>, RouteError> {
        let candidates: Vec<BackendConfig> = snapshot
            .select_candidates(criteria)
            .map_err(|_| RouteError::NoBackendAvailable {
                task_type: criteria.task_type,
            })?
            .into_iter()
            .filter(|b| self.health.is_eligible(&b.id))
            .collect();

        if candidates.is_empty() {
            if let Some(preferred) = criteria.preferred_backend.as_deref() {
                tracing::debug!(
                    backend = %preferred,
                    "Preferred backend unavailable, ranking without it"
                );
                let open = SelectionCriteria {
                    preferred_backend: None,
                    ..criteria.clone()
                };
                return self.eligible_candidates(snapshot, &open);
            }
        }
        Ok(candidates)
    }

    /// Rank health-eligible candidates and pick one
    fn select_initial(
        &self,
        run: &Dispatch<'_>,
    ) -> Result<(BackendConfig, RoutingDecision), RouteError> {
        let criteria = &run.criteria;
        let candidates = self.eligible_candidates(&run.snapshot, criteria)?;
        let Some(first) = candidates.first() else {
            return Err(RouteError::NoBackendAvailable {
                task_type: criteria.task_type,
            });
        };

        let mut flags = DecisionFlags::default();
        let (chosen, reason, confidence) = if criteria.preferred_backend.as_deref()
            == Some(first.id.as_str())
        {
            flags.user_preference = true;
            (first, "preferred backend requested".to_string(), CONFIDENCE_PREFERENCE)
        } else if criteria.cost_sensitive {
            flags.cost_optimized = true;
            (first, "cheapest eligible backend".to_string(), CONFIDENCE_COST)
        } else if let Some(chosen) = self
            .preferences
            .recommend(run.user_id, criteria.task_type, &candidates)
            .and_then(|id| candidates.iter().find(|b| b.id == id))
        {
            flags.user_preference = true;
            (chosen, "learned user preference".to_string(), CONFIDENCE_PREFERENCE)
        } else if criteria.urgency == Urgency::High {
            flags.performance_based = true;
            let chosen = candidates
                .iter()
                .max_by(|a, b| {
                    let ra = self.health.status(&a.id).reliability();
                    let rb = self.health.status(&b.id).reliability();
                    ra.total_cmp(&rb).then_with(|| b.id.cmp(&a.id))
                })
                .unwrap_or(first);
            (chosen, "most reliable backend for urgent request".to_string(), CONFIDENCE_RELIABLE)
        } else {
            flags.performance_based = true;
            (first, "highest priority eligible backend".to_string(), CONFIDENCE_PERFORMANCE)
        };

        let alternatives = candidates
            .iter()
            .filter(|b| b.id != chosen.id)
            .take(2)
            .map(|b| b.id.clone())
            .collect();

        Ok((
            chosen.clone(),
            RoutingDecision {
                backend_id: chosen.id.clone(),
                reason,
                alternatives,
                confidence,
                flags,
            },
        ))
    }

    /// Gate on estimated cost, substituting a cheaper backend if needed
    fn admit(
        &self,
        run: &Dispatch<'_>,
        backend: BackendConfig,
        mut decision: RoutingDecision,
    ) -> Result<(BackendConfig, RoutingDecision), RouteError> {
        let tokens = estimate_tokens(&run.prompt);
        let estimated_cost = backend.estimate_cost(tokens);
        let check = self.admission.check_budget(run.tier(), estimated_cost);
        if check.allowed {
            return Ok((backend, decision));
        }

        let policy = &run.snapshot.policy;
        let cheaper = find_cheaper_alternative(
            &run.snapshot.backends,
            &backend,
            run.criteria.task_type,
            |b| {
                b.capability == Capability::Full
                    && !policy.is_blacklisted(&b.id)
                    && self.health.is_eligible(&b.id)
            },
        );
        if let Some(cheaper) = cheaper {
            let cost = cheaper.estimate_cost(tokens);
            if self.admission.check_budget(run.tier(), cost).allowed {
                tracing::info!(
                    from = %backend.id,
                    to = %cheaper.id,
                    estimated_cost = cost,
                    "Substituted cheaper backend to stay within budget"
                );
                decision.alternatives = vec![backend.id.clone()];
                decision.backend_id = cheaper.id.clone();
                decision.reason = format!("cheaper alternative to {} within budget", backend.id);
                decision.confidence = CONFIDENCE_COST;
                decision.flags.cost_optimized = true;
                return Ok((cheaper.clone(), decision));
            }
        }

        Err(RouteError::CostLimitExceeded {
            tier: run.tier().unwrap_or("default").to_string(),
            estimated_cost,
            remaining: check.remaining,
        })
    }

    // ------------------------------------------------------------------------
    // Attempt / Evaluate / Escalate
    // ------------------------------------------------------------------------

    async fn run_attempts(
        &self,
        run: &mut Dispatch<'_>,
        initial: BackendConfig,
        mut decision: RoutingDecision,
    ) -> Result<RouteOutcome, RouteError> {
        let mut current = initial;
        let mut degraded = false;
        let mut retried_same = false;

        loop {
            let prompt = if degraded {
                text_only_prompt(&run.prompt)
            } else {
                run.prompt.clone()
            };

            match self.attempt(run, &current, &prompt).await? {
                AttemptResult::Failed { error, kind } => {
                    self.metrics.record_attempt(&current.id, false, false);
                    if kind == ErrorKind::Fatal {
                        self.record_experiment_results(run, false, 0.0).await;
                        return Err(RouteError::BackendFatal {
                            backend_id: current.id.clone(),
                            error,
                        });
                    }
                }
                AttemptResult::Answered { response, cost } if degraded => {
                    let usable = !response.content.trim().is_empty();
                    self.metrics.record_attempt(&current.id, true, !usable);
                    if usable {
                        decision.backend_id = current.id.clone();
                        decision.reason = format!(
                            "degraded to text-only backend after {} failed attempts",
                            run.attempts.len() - 1
                        );
                        decision.confidence = CONFIDENCE_DEGRADED;
                        return Ok(self.accept(run, &current, response, cost, None, decision).await);
                    }
                }
                AttemptResult::Answered { response, cost } => {
                    let assessment = self.quality.score(
                        &response.content,
                        &current.id,
                        run.criteria.rich_output,
                    );
                    if let Some(record) = run.attempts.last_mut() {
                        record.score = Some(assessment.score);
                    }
                    let accepted = assessment.recommendation == Recommendation::Accept;
                    self.metrics.record_attempt(&current.id, true, !accepted);

                    match assessment.recommendation {
                        Recommendation::Accept => {
                            if current.id != decision.backend_id {
                                decision.reason = format!(
                                    "fallback from {} after {} attempts",
                                    decision.backend_id,
                                    run.attempts.len() - 1
                                );
                                decision.backend_id = current.id.clone();
                            }
                            return Ok(self
                                .accept(run, &current, response, cost, Some(assessment), decision)
                                .await);
                        }
                        Recommendation::Retry
                            if !retried_same && run.attempts.len() < run.max_attempts() =>
                        {
                            retried_same = true;
                            tracing::debug!(
                                backend = %current.id,
                                score = assessment.score,
                                "Quality in retry band, retrying same backend"
                            );
                            continue;
                        }
                        _ => tracing::debug!(
                            backend = %current.id,
                            score = assessment.score,
                            "Response rejected by quality gate"
                        ),
                    }
                }
            }

            // Escalate
            if run.attempts.len() >= run.max_attempts() {
                return Err(self.exhausted(run, &current).await);
            }
            let Some((next, is_degraded)) = self.next_backend(run, &current, degraded) else {
                return Err(self.exhausted(run, &current).await);
            };

            self.metrics.record_escalation();
            tracing::warn!(
                from = %current.id,
                to = %next.id,
                attempt = run.attempts.len(),
                degraded = is_degraded,
                "Escalating to next backend"
            );

            let backoff = self
                .retry
                .backoff_for_attempt(u32::try_from(run.tried.fallback_count()).unwrap_or(u32::MAX));
            if !backoff.is_zero() {
                tokio::select! {
                    () = run.cancel.cancelled() => return Err(RouteError::Cancelled),
                    () = tokio::time::sleep(backoff) => {}
                }
            }

            current = next;
            degraded |= is_degraded;
            retried_same = false;
        }
    }

    /// Next fallback candidate, or a text-only backend once the chain is empty
    fn next_backend(
        &self,
        run: &Dispatch<'_>,
        failed: &BackendConfig,
        degraded: bool,
    ) -> Option<(BackendConfig, bool)> {
        let builder = FallbackChainBuilder::new(&run.snapshot);
        let eligible = |id: &str| self.health.is_eligible(id);

        if !degraded {
            let chain = builder.build_chain(
                failed,
                &run.criteria,
                run.snapshot.policy.fallback_strategy,
                &run.tried,
                eligible,
            );
            if let Some(next) = chain.first() {
                return Some(((*next).clone(), false));
            }
        }

        builder
            .degraded_chain(&run.criteria, &run.tried, eligible)
            .first()
            .map(|b| ((*b).clone(), true))
    }

    /// Call one backend under its timeout and the cancellation token
    async fn attempt(
        &self,
        run: &mut Dispatch<'_>,
        backend: &BackendConfig,
        prompt: &str,
    ) -> Result<AttemptResult, RouteError> {
        if run.cancel.is_cancelled() {
            return Err(RouteError::Cancelled);
        }
        run.tried.record(&backend.id);

        let started_at = Utc::now();
        let clock = Instant::now();
        let timeout = backend.timeout(run.snapshot.policy.default_timeout());
        tracing::debug!(
            backend = %backend.id,
            attempt = run.attempts.len() + 1,
            timeout_ms = timeout.as_millis() as u64,
            "Attempting backend"
        );

        let adapter = self.adapter(&backend.id);
        let result = match &adapter {
            Some(adapter) => {
                let request = InvokeRequest::new(prompt, backend.model.clone());
                tokio::select! {
                    biased;
                    () = run.cancel.cancelled() => {
                        tracing::debug!(backend = %backend.id, "Attempt cancelled");
                        return Err(RouteError::Cancelled);
                    }
                    result = tokio::time::timeout(timeout, adapter.invoke(&request, &run.options)) => {
                        result.unwrap_or_else(|_| Err(BackendError::timeout(timeout)))
                    }
                }
            }
            None => Err(BackendError::new(format!(
                "no adapter registered for backend {}",
                backend.id
            ))),
        };
        let elapsed = clock.elapsed();
        self.health
            .record_outcome(&backend.id, result.is_ok(), elapsed);

        let (attempt, record) = match result {
            Ok(response) => {
                let cost = response.cost.unwrap_or_else(|| {
                    let tokens = response.usage.map_or_else(
                        || estimate_tokens(prompt) + estimate_tokens(&response.content),
                        |u| u.total(),
                    );
                    backend.estimate_cost(tokens)
                });
                self.admission.record_spend(run.tier(), cost);
                let record = AttemptRecord {
                    backend_id: backend.id.clone(),
                    started_at,
                    success: true,
                    score: None,
                    error: None,
                    error_kind: None,
                    cost,
                    duration_ms: duration_ms(elapsed),
                };
                (AttemptResult::Answered { response, cost }, record)
            }
            Err(error) => {
                let kind = match adapter {
                    Some(_) => self.classifier.classify(&error),
                    None => ErrorKind::Unknown,
                };
                tracing::warn!(
                    backend = %backend.id,
                    error = %error,
                    kind = ?kind,
                    "Backend attempt failed"
                );
                let record = AttemptRecord {
                    backend_id: backend.id.clone(),
                    started_at,
                    success: false,
                    score: None,
                    error: Some(error.to_string()),
                    error_kind: Some(kind),
                    cost: 0.0,
                    duration_ms: duration_ms(elapsed),
                };
                (AttemptResult::Failed { error, kind }, record)
            }
        };

        self.log_usage(run, &record, prompt).await;
        run.attempts.push(record);
        Ok(attempt)
    }

    // ------------------------------------------------------------------------
    // Terminal states
    // ------------------------------------------------------------------------

    async fn accept(
        &self,
        run: &mut Dispatch<'_>,
        backend: &BackendConfig,
        response: InvokeResponse,
        cost: f64,
        assessment: Option<QualityAssessment>,
        decision: RoutingDecision,
    ) -> RouteOutcome {
        let degraded = assessment.is_none();
        let quality = assessment.as_ref().map(|a| a.score);

        if !degraded {
            let strategy = run
                .tier()
                .and_then(|t| self.admission.tier(t))
                .map_or(self.cache.config().strategy, |t| t.caching_strategy);
            self.cache
                .put_with_strategy(
                    &run.fingerprint,
                    &response.content,
                    &backend.id,
                    cost,
                    quality,
                    strategy,
                )
                .await;
        }

        let latency_ms = run.started.elapsed().as_secs_f64() * 1000.0;
        self.preferences
            .update(
                run.user_id,
                &backend.id,
                run.criteria.task_type,
                InteractionOutcome {
                    success: true,
                    latency_ms,
                    quality: quality.unwrap_or(0.0),
                },
            )
            .await;
        self.record_experiment_results(run, !degraded, quality.unwrap_or(0.0))
            .await;

        RouteOutcome {
            decision,
            content: response.content,
            cost: run.total_cost(),
            attempts: std::mem::take(&mut run.attempts),
            quality,
            cached: false,
            degraded,
            warning: degraded.then(|| {
                format!(
                    "degraded response from text-only backend {}; formatting and rich output unavailable",
                    backend.id
                )
            }),
            assignments: std::mem::take(&mut run.assignments),
        }
    }

    async fn exhausted(&self, run: &Dispatch<'_>, last: &BackendConfig) -> RouteError {
        self.record_experiment_results(run, false, 0.0).await;
        RouteError::AllBackendsExhausted {
            last_backend: last.id.clone(),
            attempts: run.summaries(),
        }
    }

    async fn record_experiment_results(&self, run: &Dispatch<'_>, converted: bool, quality: f64) {
        let response_time_ms = run.started.elapsed().as_secs_f64() * 1000.0;
        for assignment in &run.assignments {
            let result = ExperimentResult {
                experiment_id: assignment.experiment_id.clone(),
                variant_id: assignment.variant_id.clone(),
                user_id: run.user_id.to_string(),
                converted,
                quality,
                response_time_ms,
                cost: run.total_cost(),
                recorded_at: Utc::now(),
            };
            if let Err(e) = self.experiments.record_result(result).await {
                tracing::warn!(
                    experiment = %assignment.experiment_id,
                    error = %e,
                    "Failed to record experiment result"
                );
            }
        }
    }

    async fn log_usage(&self, run: &Dispatch<'_>, record: &AttemptRecord, prompt: &str) {
        let Some(log) = &self.usage_log else {
            return;
        };
        let usage = UsageRecord {
            backend_id: record.backend_id.clone(),
            task_type: run.criteria.task_type,
            tier: run.criteria.tier.clone(),
            success: record.success,
            latency_ms: record.duration_ms,
            cost: record.cost,
            prompt_tokens: estimate_tokens(prompt),
            fingerprint: run.fingerprint.clone(),
            timestamp: Utc::now(),
        };
        if let Err(e) = log.append(usage).await {
            tracing::warn!(backend = %record.backend_id, error = %e, "Failed to append usage record");
        }
    }
}

fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
