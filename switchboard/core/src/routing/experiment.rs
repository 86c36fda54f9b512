//! Experiment Override Resolution
//!
//! Deterministic, sticky assignment of users to experiment variants. An
//! active experiment of the requested type can override normal backend
//! selection (model experiments), rewrite the prompt (prompt experiments),
//! add provider parameters (parameter experiments) or toggle feature flags.
//!
//! ```text
//!   assign(user, type, ctx)
//!     │
//!     ├─ first active experiment of `type` the user is eligible for
//!     │     eligibility: tier list → allow-list → bucket(user) < percentage
//!     ├─ existing assignment?  ──yes──► return it unchanged
//!     └─ bucket(user + experiment) walks cumulative allocations ──► persist
//! ```
//!
//! Buckets come from the first four bytes of a SHA-256 digest, mod 100.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::config::TaskType;
use crate::store::{self, KvStore};

const EXPERIMENT_PREFIX: &str = "experiment/";
const ASSIGNMENT_PREFIX: &str = "experiment-assignment/";
const RESULT_PREFIX: &str = "experiment-result/";

/// Allowed deviation of the allocation sum from 100
pub const ALLOCATION_TOLERANCE: f64 = 0.01;

// ============================================================================
// Errors
// ============================================================================

/// Experiment management errors
#[derive(Debug, Error)]
pub enum ExperimentError {
    /// Variant allocations do not add up to 100
    #[error("variant allocations must sum to 100, got {total}")]
    AllocationSum {
        /// Actual sum
        total: f64,
    },

    /// A variant allocation is negative
    #[error("variant {variant} has a negative allocation")]
    NegativeAllocation {
        /// Offending variant name
        variant: String,
    },

    /// Experiment has no variants
    #[error("experiment has no variants")]
    NoVariants,

    /// A variant's config does not match the experiment type
    #[error("variant {variant} does not carry a {expected} config")]
    ConfigMismatch {
        /// Offending variant name
        variant: String,
        /// Experiment type
        expected: ExperimentType,
    },

    /// No experiment with this id
    #[error("unknown experiment: {0}")]
    UnknownExperiment(String),

    /// No variant with this id in the experiment
    #[error("unknown variant {variant} in experiment {experiment}")]
    UnknownVariant {
        /// Experiment id
        experiment: String,
        /// Variant id
        variant: String,
    },

    /// Durable store failure
    #[error("experiment store error: {0}")]
    Persistence(#[from] anyhow::Error),
}

// ============================================================================
// Experiment Model
// ============================================================================

/// What an experiment varies
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentType {
    /// Backend choice
    Model,
    /// Prompt template
    Prompt,
    /// Provider parameters
    Parameter,
    /// Feature flags
    Feature,
}

impl std::fmt::Display for ExperimentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Model => "model",
            Self::Prompt => "prompt",
            Self::Parameter => "parameter",
            Self::Feature => "feature",
        })
    }
}

/// Per-variant override payload
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VariantConfig {
    /// Route to this backend
    Model {
        /// Backend identifier
        backend_id: String,
    },
    /// Rewrite the prompt; `{prompt}` is replaced with the request text
    Prompt {
        /// Template text
        template: String,
    },
    /// Extra provider parameters
    Parameter {
        /// Parameter values
        parameters: BTreeMap<String, serde_json::Value>,
    },
    /// Enabled feature flags
    Feature {
        /// Flag names
        flags: Vec<String>,
    },
}

impl VariantConfig {
    /// Experiment type this config belongs to
    #[must_use]
    pub fn experiment_type(&self) -> ExperimentType {
        match self {
            Self::Model { .. } => ExperimentType::Model,
            Self::Prompt { .. } => ExperimentType::Prompt,
            Self::Parameter { .. } => ExperimentType::Parameter,
            Self::Feature { .. } => ExperimentType::Feature,
        }
    }

    /// Apply a prompt template (identity for other configs)
    #[must_use]
    pub fn apply_prompt(&self, prompt: &str) -> String {
        match self {
            Self::Prompt { template } if template.contains("{prompt}") => {
                template.replace("{prompt}", prompt)
            }
            Self::Prompt { template } => format!("{template}\n\n{prompt}"),
            _ => prompt.to_string(),
        }
    }
}

/// Variant as supplied at creation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariantDraft {
    /// Display name
    pub name: String,
    /// Share of traffic (0-100)
    pub allocation: f64,
    /// Override payload
    pub config: VariantConfig,
}

impl VariantDraft {
    /// Build a variant draft
    pub fn new(name: impl Into<String>, allocation: f64, config: VariantConfig) -> Self {
        Self {
            name: name.into(),
            allocation,
            config,
        }
    }
}

/// Stored variant
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    /// Generated identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Share of traffic (0-100)
    pub allocation: f64,
    /// Override payload
    pub config: VariantConfig,
}

/// Who may enter an experiment
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetAudience {
    /// Only these tiers (checked when the caller supplies a tier)
    pub tiers: Option<Vec<String>>,
    /// Only these users
    pub users: Option<Vec<String>>,
    /// Percentage rollout (0-100)
    pub percentage: Option<f64>,
}

/// Experiment lifecycle state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Not yet running
    #[default]
    Draft,
    /// Assigning users
    Active,
    /// Temporarily stopped
    Paused,
    /// Finished
    Completed,
}

/// Experiment as supplied at creation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDraft {
    /// Display name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// What the experiment varies
    pub kind: ExperimentType,
    /// Initial status
    pub status: ExperimentStatus,
    /// Variants in allocation order
    pub variants: Vec<VariantDraft>,
    /// Eligibility restrictions
    pub audience: Option<TargetAudience>,
}

impl ExperimentDraft {
    /// Draft with no variants yet
    pub fn new(name: impl Into<String>, kind: ExperimentType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind,
            status: ExperimentStatus::Draft,
            variants: Vec::new(),
            audience: None,
        }
    }

    /// Add a variant
    #[must_use]
    pub fn variant(mut self, variant: VariantDraft) -> Self {
        self.variants.push(variant);
        self
    }

    /// Start active
    #[must_use]
    pub fn active(mut self) -> Self {
        self.status = ExperimentStatus::Active;
        self
    }

    /// Restrict eligibility
    #[must_use]
    pub fn with_audience(mut self, audience: TargetAudience) -> Self {
        self.audience = Some(audience);
        self
    }
}

/// Stored experiment
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    /// Generated identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// What the experiment varies
    pub kind: ExperimentType,
    /// Lifecycle state
    pub status: ExperimentStatus,
    /// Variants in allocation order
    pub variants: Vec<Variant>,
    /// Eligibility restrictions
    pub audience: Option<TargetAudience>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    fn is_eligible(&self, user_id: &str, context: &AssignmentContext) -> bool {
        let Some(audience) = &self.audience else {
            return true;
        };

        if let (Some(tiers), Some(tier)) = (&audience.tiers, &context.tier) {
            if !tiers.contains(tier) {
                return false;
            }
        }

        if let Some(users) = &audience.users {
            return users.iter().any(|u| u == user_id);
        }

        if let Some(percentage) = audience.percentage {
            return f64::from(bucket(user_id)) < percentage;
        }

        true
    }

    fn select_variant(&self, user_id: &str) -> Option<&Variant> {
        let bucket = f64::from(bucket(&format!("{user_id}{}", self.id)));
        let mut accumulated = 0.0;
        for variant in &self.variants {
            accumulated += variant.allocation;
            if bucket < accumulated {
                return Some(variant);
            }
        }
        self.variants.last()
    }
}

/// Caller context consulted for eligibility
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AssignmentContext {
    /// User's budget tier
    pub tier: Option<String>,
    /// Request task type
    pub task_type: Option<TaskType>,
}

/// Sticky (user, experiment) → variant binding
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentAssignment {
    /// Experiment id
    pub experiment_id: String,
    /// Variant id
    pub variant_id: String,
    /// User id
    pub user_id: String,
    /// Variant payload at assignment time
    pub config: VariantConfig,
    /// When the assignment was made
    pub assigned_at: DateTime<Utc>,
}

/// Observed outcome of one request under an experiment
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    /// Experiment id
    pub experiment_id: String,
    /// Variant id
    pub variant_id: String,
    /// User id
    pub user_id: String,
    /// Whether the user converted
    pub converted: bool,
    /// Quality score
    pub quality: f64,
    /// Response time in milliseconds
    pub response_time_ms: f64,
    /// Request cost
    pub cost: f64,
    /// When the result was recorded
    pub recorded_at: DateTime<Utc>,
}

// ============================================================================
// Analysis
// ============================================================================

/// Coarse performance verdict for a variant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantVerdict {
    /// Score > 0.8: consider adopting
    Excellent,
    /// Score > 0.6: keep collecting data
    Good,
    /// Otherwise
    NeedsWork,
}

/// Per-variant figures
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariantAnalysis {
    /// Variant id
    pub variant_id: String,
    /// Results recorded
    pub sample_size: usize,
    /// Converted fraction
    pub conversion_rate: f64,
    /// Mean quality
    pub avg_quality: f64,
    /// Mean response time
    pub avg_response_time_ms: f64,
    /// Mean cost
    pub avg_cost: f64,
    /// `1 - 1.96·sqrt(p(1-p)/n)` for n ≥ 30, else 0
    pub confidence: f64,
    /// confidence ≥ 0.95 and n ≥ 100
    pub significant: bool,
    /// None when there are no samples
    pub verdict: Option<VariantVerdict>,
}

/// Experiment-wide analysis
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentAnalysis {
    /// The experiment analysed
    pub experiment: Experiment,
    /// One entry per variant, in declared order
    pub variants: Vec<VariantAnalysis>,
    /// Best significant variant by 0.5·conversion + 0.5·quality
    pub winner: Option<String>,
}

fn confidence(sample_size: usize, rate: f64) -> f64 {
    if sample_size < 30 {
        return 0.0;
    }
    let standard_error = (rate * (1.0 - rate) / sample_size as f64).sqrt();
    (1.0 - 1.96 * standard_error).clamp(0.0, 1.0)
}

fn analyze_variant(variant: &Variant, results: &[&ExperimentResult]) -> VariantAnalysis {
    let n = results.len();
    if n == 0 {
        return VariantAnalysis {
            variant_id: variant.id.clone(),
            sample_size: 0,
            conversion_rate: 0.0,
            avg_quality: 0.0,
            avg_response_time_ms: 0.0,
            avg_cost: 0.0,
            confidence: 0.0,
            significant: false,
            verdict: None,
        };
    }

    let mean = |f: fn(&ExperimentResult) -> f64| results.iter().map(|r| f(r)).sum::<f64>() / n as f64;
    let conversion_rate = mean(|r| if r.converted { 1.0 } else { 0.0 });
    let avg_quality = mean(|r| r.quality);
    let avg_cost = mean(|r| r.cost);
    let confidence = confidence(n, conversion_rate);

    let score = conversion_rate * 0.4 + avg_quality * 0.4 - avg_cost * 0.2;
    let verdict = if score > 0.8 {
        VariantVerdict::Excellent
    } else if score > 0.6 {
        VariantVerdict::Good
    } else {
        VariantVerdict::NeedsWork
    };

    VariantAnalysis {
        variant_id: variant.id.clone(),
        sample_size: n,
        conversion_rate,
        avg_quality,
        avg_response_time_ms: mean(|r| r.response_time_ms),
        avg_cost,
        confidence,
        significant: confidence >= 0.95 && n >= 100,
        verdict: Some(verdict),
    }
}

/// Hash bucket in [0, 100)
#[must_use]
pub fn bucket(input: &str) -> u32 {
    let digest = Sha256::digest(input.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 100
}

// ============================================================================
// Resolver
// ============================================================================

/// Experiment registry and sticky assignment table
pub struct ExperimentResolver {
    experiments: RwLock<Vec<Arc<Experiment>>>,
    assignments: DashMap<(String, String), ExperimentAssignment>,
    results: DashMap<String, Mutex<Vec<ExperimentResult>>>,
    store: Option<Arc<dyn KvStore>>,
}

impl std::fmt::Debug for ExperimentResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentResolver")
            .field("experiments", &self.experiments.read().len())
            .field("assignments", &self.assignments.len())
            .finish_non_exhaustive()
    }
}

impl Default for ExperimentResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperimentResolver {
    /// Memory-only resolver
    #[must_use]
    pub fn new() -> Self {
        Self {
            experiments: RwLock::new(Vec::new()),
            assignments: DashMap::new(),
            results: DashMap::new(),
            store: None,
        }
    }

    /// Persist experiments, assignments and results
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Load experiments, assignments and results from the store
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be scanned.
    pub async fn restore(&self) -> Result<usize, ExperimentError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut experiments: Vec<Experiment> = store
            .scan_prefix(EXPERIMENT_PREFIX)
            .await?
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_value(value) {
                Ok(exp) => Some(exp),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping malformed experiment");
                    None
                }
            })
            .collect();
        experiments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let count = experiments.len();
        *self.experiments.write() = experiments.into_iter().map(Arc::new).collect();

        for (_, value) in store.scan_prefix(ASSIGNMENT_PREFIX).await? {
            if let Ok(a) = serde_json::from_value::<ExperimentAssignment>(value) {
                self.assignments
                    .insert((a.experiment_id.clone(), a.user_id.clone()), a);
            }
        }

        for (_, value) in store.scan_prefix(RESULT_PREFIX).await? {
            if let Ok(r) = serde_json::from_value::<ExperimentResult>(value) {
                self.results
                    .entry(r.experiment_id.clone())
                    .or_default()
                    .lock()
                    .push(r);
            }
        }

        tracing::info!(experiments = count, "Restored experiments");
        Ok(count)
    }

    /// Validate and register an experiment
    ///
    /// # Errors
    ///
    /// Fails if the variant list is empty, a config does not match the
    /// experiment type, or allocations do not sum to 100 ± 0.01.
    pub async fn create(&self, draft: ExperimentDraft) -> Result<Experiment, ExperimentError> {
        if draft.variants.is_empty() {
            return Err(ExperimentError::NoVariants);
        }
        for v in &draft.variants {
            if v.config.experiment_type() != draft.kind {
                return Err(ExperimentError::ConfigMismatch {
                    variant: v.name.clone(),
                    expected: draft.kind,
                });
            }
            if v.allocation < 0.0 {
                return Err(ExperimentError::NegativeAllocation {
                    variant: v.name.clone(),
                });
            }
        }
        let total: f64 = draft.variants.iter().map(|v| v.allocation).sum();
        if (total - 100.0).abs() > ALLOCATION_TOLERANCE {
            return Err(ExperimentError::AllocationSum { total });
        }

        let now = Utc::now();
        let experiment = Experiment {
            id: format!("exp_{}", uuid::Uuid::new_v4().simple()),
            name: draft.name,
            description: draft.description,
            kind: draft.kind,
            status: draft.status,
            variants: draft
                .variants
                .into_iter()
                .map(|v| Variant {
                    id: format!("var_{}", uuid::Uuid::new_v4().simple()),
                    name: v.name,
                    allocation: v.allocation,
                    config: v.config,
                })
                .collect(),
            audience: draft.audience,
            created_at: now,
            updated_at: now,
        };

        self.persist_experiment(&experiment).await?;
        self.experiments.write().push(Arc::new(experiment.clone()));

        tracing::info!(
            experiment = %experiment.id,
            kind = %experiment.kind,
            variants = experiment.variants.len(),
            "Created experiment"
        );
        Ok(experiment)
    }

    async fn persist_experiment(&self, experiment: &Experiment) -> Result<(), ExperimentError> {
        if let Some(store) = &self.store {
            let key = format!("{EXPERIMENT_PREFIX}{}", experiment.id);
            store::save_json(store.as_ref(), &key, experiment).await?;
        }
        Ok(())
    }

    /// Look up an experiment
    #[must_use]
    pub fn get(&self, experiment_id: &str) -> Option<Arc<Experiment>> {
        self.experiments
            .read()
            .iter()
            .find(|e| e.id == experiment_id)
            .cloned()
    }

    /// Change an experiment's lifecycle state
    ///
    /// # Errors
    ///
    /// Fails for unknown experiments or when the store write fails.
    pub async fn update_status(
        &self,
        experiment_id: &str,
        status: ExperimentStatus,
    ) -> Result<Experiment, ExperimentError> {
        let updated = {
            let mut experiments = self.experiments.write();
            let slot = experiments
                .iter_mut()
                .find(|e| e.id == experiment_id)
                .ok_or_else(|| ExperimentError::UnknownExperiment(experiment_id.to_string()))?;
            let mut exp = Experiment::clone(slot);
            exp.status = status;
            exp.updated_at = Utc::now();
            *slot = Arc::new(exp.clone());
            exp
        };

        self.persist_experiment(&updated).await?;
        tracing::info!(experiment = %experiment_id, status = ?status, "Experiment status changed");
        Ok(updated)
    }

    /// Assign (or recall) the user's variant in the first eligible active
    /// experiment of `kind`
    pub async fn assign(
        &self,
        user_id: &str,
        kind: ExperimentType,
        context: &AssignmentContext,
    ) -> Option<ExperimentAssignment> {
        let experiment = self
            .experiments
            .read()
            .iter()
            .find(|e| {
                e.kind == kind
                    && e.status == ExperimentStatus::Active
                    && e.is_eligible(user_id, context)
            })
            .cloned()?;

        let key = (experiment.id.clone(), user_id.to_string());
        if let Some(existing) = self.assignments.get(&key) {
            return Some(existing.clone());
        }

        let store_key = format!("{ASSIGNMENT_PREFIX}{}/{user_id}", experiment.id);
        if let Some(store) = &self.store {
            match store::load_json::<ExperimentAssignment>(store.as_ref(), &store_key).await {
                Ok(Some(stored)) => {
                    return Some(self.assignments.entry(key).or_insert(stored).clone());
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(user = %user_id, error = %e, "Assignment read failed"),
            }
        }

        let variant = experiment.select_variant(user_id)?;
        let candidate = ExperimentAssignment {
            experiment_id: experiment.id.clone(),
            variant_id: variant.id.clone(),
            user_id: user_id.to_string(),
            config: variant.config.clone(),
            assigned_at: Utc::now(),
        };

        let (assignment, fresh) = match self.assignments.entry(key) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                entry.insert(candidate.clone());
                (candidate, true)
            }
        };

        if fresh {
            tracing::debug!(
                user = %user_id,
                experiment = %assignment.experiment_id,
                variant = %assignment.variant_id,
                "Assigned experiment variant"
            );
            if let Some(store) = &self.store {
                if let Err(e) = store::save_json(store.as_ref(), &store_key, &assignment).await {
                    tracing::warn!(user = %user_id, error = %e, "Assignment write failed");
                }
            }
        }

        Some(assignment)
    }

    /// Record an outcome for analysis
    ///
    /// # Errors
    ///
    /// Fails for unknown experiments or variants.
    pub async fn record_result(&self, result: ExperimentResult) -> Result<(), ExperimentError> {
        let experiment = self
            .get(&result.experiment_id)
            .ok_or_else(|| ExperimentError::UnknownExperiment(result.experiment_id.clone()))?;
        if !experiment.variants.iter().any(|v| v.id == result.variant_id) {
            return Err(ExperimentError::UnknownVariant {
                experiment: result.experiment_id.clone(),
                variant: result.variant_id.clone(),
            });
        }

        if let Some(store) = &self.store {
            let key = format!(
                "{RESULT_PREFIX}{}/{}",
                result.experiment_id,
                uuid::Uuid::new_v4().simple()
            );
            if let Err(e) = store::save_json(store.as_ref(), &key, &result).await {
                tracing::warn!(experiment = %result.experiment_id, error = %e, "Result write failed");
            }
        }

        self.results
            .entry(result.experiment_id.clone())
            .or_default()
            .lock()
            .push(result);
        Ok(())
    }

    /// Per-variant figures and the winning variant, if any
    ///
    /// # Errors
    ///
    /// Fails for unknown experiments.
    pub fn analyze(&self, experiment_id: &str) -> Result<ExperimentAnalysis, ExperimentError> {
        let experiment = self
            .get(experiment_id)
            .ok_or_else(|| ExperimentError::UnknownExperiment(experiment_id.to_string()))?;

        let results: Vec<ExperimentResult> = self
            .results
            .get(experiment_id)
            .map(|r| r.lock().clone())
            .unwrap_or_default();

        let mut by_variant: HashMap<&str, Vec<&ExperimentResult>> = HashMap::new();
        for r in &results {
            by_variant.entry(r.variant_id.as_str()).or_default().push(r);
        }

        let variants: Vec<VariantAnalysis> = experiment
            .variants
            .iter()
            .map(|v| {
                analyze_variant(
                    v,
                    by_variant.get(v.id.as_str()).map_or(&[][..], Vec::as_slice),
                )
            })
            .collect();

        let winner = variants
            .iter()
            .filter(|v| v.significant)
            .max_by(|a, b| {
                let score = |v: &VariantAnalysis| v.conversion_rate * 0.5 + v.avg_quality * 0.5;
                score(a).total_cmp(&score(b))
            })
            .map(|v| v.variant_id.clone());

        Ok(ExperimentAnalysis {
            experiment: Experiment::clone(&experiment),
            variants,
            winner,
        })
    }

    /// All experiments in creation order
    #[must_use]
    pub fn experiments(&self) -> Vec<Arc<Experiment>> {
        self.experiments.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    fn model(backend: &str) -> VariantConfig {
        VariantConfig::Model {
            backend_id: backend.to_string(),
        }
    }

    fn split_draft() -> ExperimentDraft {
        ExperimentDraft::new("split", ExperimentType::Model)
            .variant(VariantDraft::new("control", 50.0, model("a")))
            .variant(VariantDraft::new("treatment", 50.0, model("b")))
            .active()
    }

    fn result(exp: &Experiment, variant: usize, converted: bool, quality: f64) -> ExperimentResult {
        ExperimentResult {
            experiment_id: exp.id.clone(),
            variant_id: exp.variants[variant].id.clone(),
            user_id: "u".to_string(),
            converted,
            quality,
            response_time_ms: 100.0,
            cost: 0.01,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_allocation_must_sum_to_100() {
        let resolver = ExperimentResolver::new();
        let draft = ExperimentDraft::new("bad", ExperimentType::Model)
            .variant(VariantDraft::new("a", 60.0, model("a")))
            .variant(VariantDraft::new("b", 30.0, model("b")));
        assert!(matches!(
            resolver.create(draft).await,
            Err(ExperimentError::AllocationSum { .. })
        ));

        let within_tolerance = ExperimentDraft::new("ok", ExperimentType::Model)
            .variant(VariantDraft::new("a", 33.333, model("a")))
            .variant(VariantDraft::new("b", 33.333, model("b")))
            .variant(VariantDraft::new("c", 33.333, model("c")));
        assert!(resolver.create(within_tolerance).await.is_ok());
    }

    #[tokio::test]
    async fn test_config_must_match_type() {
        let resolver = ExperimentResolver::new();
        let draft = ExperimentDraft::new("mixed", ExperimentType::Prompt)
            .variant(VariantDraft::new("a", 100.0, model("a")));
        assert!(matches!(
            resolver.create(draft).await,
            Err(ExperimentError::ConfigMismatch { .. })
        ));
        assert!(matches!(
            resolver
                .create(ExperimentDraft::new("empty", ExperimentType::Model))
                .await,
            Err(ExperimentError::NoVariants)
        ));
    }

    #[tokio::test]
    async fn test_assignment_is_sticky() {
        let resolver = ExperimentResolver::new();
        resolver.create(split_draft()).await.unwrap();
        let ctx = AssignmentContext::default();

        let first = resolver
            .assign("user-1", ExperimentType::Model, &ctx)
            .await
            .unwrap();
        for _ in 0..10 {
            let again = resolver
                .assign("user-1", ExperimentType::Model, &ctx)
                .await
                .unwrap();
            assert_eq!(again.variant_id, first.variant_id);
            assert_eq!(again.assigned_at, first.assigned_at);
        }
    }

    #[tokio::test]
    async fn test_only_active_matching_type() {
        let resolver = ExperimentResolver::new();
        let exp = resolver
            .create(ExperimentDraft {
                status: ExperimentStatus::Draft,
                ..split_draft()
            })
            .await
            .unwrap();
        let ctx = AssignmentContext::default();

        assert!(resolver.assign("u", ExperimentType::Model, &ctx).await.is_none());

        resolver
            .update_status(&exp.id, ExperimentStatus::Active)
            .await
            .unwrap();
        assert!(resolver.assign("u", ExperimentType::Model, &ctx).await.is_some());
        assert!(resolver.assign("u", ExperimentType::Prompt, &ctx).await.is_none());

        resolver
            .update_status(&exp.id, ExperimentStatus::Paused)
            .await
            .unwrap();
        assert!(resolver.assign("u", ExperimentType::Model, &ctx).await.is_none());
    }

    #[tokio::test]
    async fn test_audience_rules() {
        let resolver = ExperimentResolver::new();
        resolver
            .create(split_draft().with_audience(TargetAudience {
                tiers: Some(vec!["pro".to_string()]),
                users: Some(vec!["alice".to_string()]),
                percentage: None,
            }))
            .await
            .unwrap();

        let pro = AssignmentContext {
            tier: Some("pro".to_string()),
            task_type: None,
        };
        let free = AssignmentContext {
            tier: Some("free".to_string()),
            task_type: None,
        };
        assert!(resolver.assign("alice", ExperimentType::Model, &pro).await.is_some());
        assert!(resolver.assign("alice", ExperimentType::Model, &free).await.is_none());
        assert!(resolver.assign("bob", ExperimentType::Model, &pro).await.is_none());
    }

    #[tokio::test]
    async fn test_percentage_rollout() {
        let resolver = ExperimentResolver::new();
        resolver
            .create(split_draft().with_audience(TargetAudience {
                percentage: Some(30.0),
                ..TargetAudience::default()
            }))
            .await
            .unwrap();
        let ctx = AssignmentContext::default();

        let mut enrolled = 0;
        for i in 0..1000 {
            let user = format!("user-{i}");
            let assigned = resolver.assign(&user, ExperimentType::Model, &ctx).await;
            assert_eq!(assigned.is_some(), bucket(&user) < 30);
            if assigned.is_some() {
                enrolled += 1;
            }
        }
        assert!((200..400).contains(&enrolled), "enrolled {enrolled}");
    }

    #[tokio::test]
    async fn test_variant_split_roughly_follows_allocation() {
        let resolver = ExperimentResolver::new();
        let exp = resolver
            .create(
                ExperimentDraft::new("skewed", ExperimentType::Model)
                    .variant(VariantDraft::new("small", 10.0, model("a")))
                    .variant(VariantDraft::new("large", 90.0, model("b")))
                    .active(),
            )
            .await
            .unwrap();
        let ctx = AssignmentContext::default();

        let mut small = 0;
        for i in 0..1000 {
            let a = resolver
                .assign(&format!("u{i}"), ExperimentType::Model, &ctx)
                .await
                .unwrap();
            if a.variant_id == exp.variants[0].id {
                small += 1;
            }
        }
        assert!((50..160).contains(&small), "small {small}");
    }

    #[tokio::test]
    async fn test_sticky_across_restart() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let first = ExperimentResolver::new().with_store(store.clone());
        first.create(split_draft()).await.unwrap();
        let ctx = AssignmentContext::default();
        let before = first
            .assign("carol", ExperimentType::Model, &ctx)
            .await
            .unwrap();

        let second = ExperimentResolver::new().with_store(store);
        assert_eq!(second.restore().await.unwrap(), 1);
        let after = second
            .assign("carol", ExperimentType::Model, &ctx)
            .await
            .unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_analysis_and_winner() {
        let resolver = ExperimentResolver::new();
        let exp = resolver.create(split_draft()).await.unwrap();

        for i in 0..120 {
            resolver
                .record_result(result(&exp, 0, i % 100 == 0, 0.7))
                .await
                .unwrap();
            resolver
                .record_result(result(&exp, 1, i % 2 == 0, 0.9))
                .await
                .unwrap();
        }

        let analysis = resolver.analyze(&exp.id).unwrap();
        assert_eq!(analysis.variants.len(), 2);
        assert_eq!(analysis.variants[0].sample_size, 120);

        // Control converts rarely: tight interval, significant
        assert!(analysis.variants[0].significant);
        // 50% conversion: 1 - 1.96*sqrt(0.25/120) ≈ 0.91
        assert!(!analysis.variants[1].significant);
        assert_eq!(analysis.winner.as_deref(), Some(exp.variants[0].id.as_str()));
    }

    #[tokio::test]
    async fn test_small_samples_have_no_confidence() {
        let resolver = ExperimentResolver::new();
        let exp = resolver.create(split_draft()).await.unwrap();
        for _ in 0..10 {
            resolver
                .record_result(result(&exp, 0, true, 0.9))
                .await
                .unwrap();
        }
        let analysis = resolver.analyze(&exp.id).unwrap();
        assert!(analysis.variants[0].confidence.abs() < f64::EPSILON);
        assert_eq!(analysis.variants[1].verdict, None);
        assert_eq!(analysis.variants[0].verdict, Some(VariantVerdict::Good));
        assert!(analysis.winner.is_none());
    }

    #[tokio::test]
    async fn test_record_result_unknown_experiment() {
        let resolver = ExperimentResolver::new();
        let err = resolver
            .record_result(ExperimentResult {
                experiment_id: "missing".to_string(),
                variant_id: "v".to_string(),
                user_id: "u".to_string(),
                converted: false,
                quality: 0.0,
                response_time_ms: 0.0,
                cost: 0.0,
                recorded_at: Utc::now(),
            })
            .await;
        assert!(matches!(err, Err(ExperimentError::UnknownExperiment(_))));
    }

    #[test]
    fn test_prompt_template() {
        let cfg = VariantConfig::Prompt {
            template: "Answer briefly: {prompt}".to_string(),
        };
        assert_eq!(cfg.apply_prompt("why?"), "Answer briefly: why?");
        assert_eq!(model("a").apply_prompt("why?"), "why?");
    }
}
