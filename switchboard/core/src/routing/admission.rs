//! Cost-Aware Admission Control
//!
//! Gates each request on its tier's remaining daily and monthly budget and
//! shrinks prompts before the estimate is taken.
//!
//! | Tier  | Daily | Monthly | Admit fraction | Caching    | Reduction |
//! |-------|-------|---------|----------------|------------|-----------|
//! | tier1 | 1     | 10      | 0.1 (aggr.)    | aggressive | 0.3       |
//! | tier2 | 5     | 50      | 0.25           | moderate   | 0.2       |
//! | tier3 | 50    | 500     | 0.5            | minimal    | 0.1       |
//!
//! A request is admitted only if `estimated_cost <= remaining * fraction`,
//! where `remaining` is the smaller of the daily and monthly remainders.
//! Requests without a tier, or with a tier that has no configured budget,
//! are not constrained.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::cache::CachingStrategy;
use super::config::{BackendConfig, Complexity, TaskType};
use super::sweep::SweepHandle;
use crate::store::{Alert, AlertKind, AlertSink, UsageLog};

/// Admit fraction applied to every aggressive tier
pub const AGGRESSIVE_ADMIT_FRACTION: f64 = 0.1;

/// How often spend projections are checked
pub const PROJECTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

const SUMMARIZE_MIN_CHARS: usize = 1000;
const SUMMARIZE_MIN_LINES: usize = 10;
const SUMMARIZE_HEAD: usize = 5;
const SUMMARIZE_TAIL: usize = 3;
const SUMMARIZE_MIN_TARGET: f64 = 0.2;

static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid blank-run regex"));
static HORIZONTAL_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("valid whitespace regex"));

// ============================================================================
// Tier Budgets
// ============================================================================

/// Spend ceilings and cost posture of one user tier
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TierBudget {
    /// Tier name as carried in selection criteria
    pub name: String,
    /// Daily spend ceiling
    pub daily_budget: f64,
    /// Monthly spend ceiling
    pub monthly_budget: f64,
    /// Share of the remaining budget one request may use
    pub admit_fraction: f64,
    /// Aggressive tiers always use [`AGGRESSIVE_ADMIT_FRACTION`]
    pub aggressive: bool,
    /// Cache lifetime for this tier's responses
    pub caching_strategy: CachingStrategy,
    /// Desired prompt reduction (0-1); summarization needs > 0.2
    pub token_reduction_target: f64,
    /// Projected/budget ratio that raises a spend alert
    pub alert_threshold: f64,
}

impl TierBudget {
    /// Entry tier: tight budget, aggressive savings
    #[must_use]
    pub fn tier1() -> Self {
        Self {
            name: "tier1".to_string(),
            daily_budget: 1.0,
            monthly_budget: 10.0,
            admit_fraction: AGGRESSIVE_ADMIT_FRACTION,
            aggressive: true,
            caching_strategy: CachingStrategy::Aggressive,
            token_reduction_target: 0.3,
            alert_threshold: 0.7,
        }
    }

    /// Middle tier
    #[must_use]
    pub fn tier2() -> Self {
        Self {
            name: "tier2".to_string(),
            daily_budget: 5.0,
            monthly_budget: 50.0,
            admit_fraction: 0.25,
            aggressive: false,
            caching_strategy: CachingStrategy::Moderate,
            token_reduction_target: 0.2,
            alert_threshold: 0.8,
        }
    }

    /// Top tier: generous budget, minimal caching
    #[must_use]
    pub fn tier3() -> Self {
        Self {
            name: "tier3".to_string(),
            daily_budget: 50.0,
            monthly_budget: 500.0,
            admit_fraction: 0.5,
            aggressive: false,
            caching_strategy: CachingStrategy::Minimal,
            token_reduction_target: 0.1,
            alert_threshold: 0.9,
        }
    }

    /// The three built-in tiers
    #[must_use]
    pub fn presets() -> Vec<Self> {
        vec![Self::tier1(), Self::tier2(), Self::tier3()]
    }

    /// Effective admit fraction
    #[must_use]
    pub fn fraction(&self) -> f64 {
        if self.aggressive {
            AGGRESSIVE_ADMIT_FRACTION
        } else {
            self.admit_fraction
        }
    }
}

/// Result of a budget check
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BudgetCheck {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Smaller of the daily and monthly remainders; infinite when unconstrained
    pub remaining: f64,
}

impl BudgetCheck {
    fn unconstrained() -> Self {
        Self {
            allowed: true,
            remaining: f64::INFINITY,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct SpendLedger {
    day: NaiveDate,
    daily: f64,
    month: (i32, u32),
    monthly: f64,
}

impl SpendLedger {
    fn at(now: DateTime<Utc>) -> Self {
        Self {
            day: now.date_naive(),
            daily: 0.0,
            month: (now.year(), now.month()),
            monthly: 0.0,
        }
    }

    /// Reset whichever windows `now` has moved past
    fn roll(&mut self, now: DateTime<Utc>) {
        let month = (now.year(), now.month());
        if month != self.month {
            self.month = month;
            self.monthly = 0.0;
        }
        let day = now.date_naive();
        if day != self.day {
            self.day = day;
            self.daily = 0.0;
        }
    }
}

// ============================================================================
// Admission Control
// ============================================================================

/// Per-tier spend tracking and budget gate
pub struct AdmissionControl {
    tiers: HashMap<String, TierBudget>,
    ledgers: DashMap<String, SpendLedger>,
    usage: Option<Arc<dyn UsageLog>>,
    alerts: Arc<dyn AlertSink>,
}

impl std::fmt::Debug for AdmissionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionControl")
            .field("tiers", &self.tiers.keys().collect::<Vec<_>>())
            .field("ledgers", &self.ledgers.len())
            .finish_non_exhaustive()
    }
}

impl AdmissionControl {
    /// Create with the given tier budgets
    pub fn new(tiers: Vec<TierBudget>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            tiers: tiers.into_iter().map(|t| (t.name.clone(), t)).collect(),
            ledgers: DashMap::new(),
            usage: None,
            alerts,
        }
    }

    /// Usage log consulted by monthly analysis
    #[must_use]
    pub fn with_usage_log(mut self, usage: Arc<dyn UsageLog>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Budget for a tier, if configured
    #[must_use]
    pub fn tier(&self, name: &str) -> Option<&TierBudget> {
        self.tiers.get(name)
    }

    /// Check a request's estimated cost against its tier's budget
    #[must_use]
    pub fn check_budget(&self, tier: Option<&str>, estimated_cost: f64) -> BudgetCheck {
        self.check_budget_at(tier, estimated_cost, Utc::now())
    }

    /// [`check_budget`](Self::check_budget) at an explicit instant
    #[must_use]
    pub fn check_budget_at(
        &self,
        tier: Option<&str>,
        estimated_cost: f64,
        now: DateTime<Utc>,
    ) -> BudgetCheck {
        let Some(budget) = tier.and_then(|t| self.tiers.get(t)) else {
            return BudgetCheck::unconstrained();
        };

        let (daily, monthly) = match self.ledgers.get_mut(&budget.name) {
            Some(mut ledger) => {
                ledger.roll(now);
                (ledger.daily, ledger.monthly)
            }
            None => (0.0, 0.0),
        };

        let remaining = (budget.daily_budget - daily)
            .min(budget.monthly_budget - monthly)
            .max(0.0);
        let allowed = estimated_cost <= remaining * budget.fraction();

        if !allowed {
            tracing::warn!(
                tier = %budget.name,
                estimated_cost = estimated_cost,
                remaining = remaining,
                "Budget check rejected request"
            );
        }

        BudgetCheck { allowed, remaining }
    }

    /// Add actual spend to a tier's ledger
    pub fn record_spend(&self, tier: Option<&str>, cost: f64) {
        self.record_spend_at(tier, cost, Utc::now());
    }

    /// [`record_spend`](Self::record_spend) at an explicit instant
    pub fn record_spend_at(&self, tier: Option<&str>, cost: f64, now: DateTime<Utc>) {
        let Some(name) = tier.filter(|t| self.tiers.contains_key(*t)) else {
            return;
        };
        let mut ledger = self
            .ledgers
            .entry(name.to_string())
            .or_insert_with(|| SpendLedger::at(now));
        ledger.roll(now);
        ledger.daily += cost;
        ledger.monthly += cost;
    }

    /// Spend so far today and this month
    #[must_use]
    pub fn spent(&self, tier: &str) -> (f64, f64) {
        self.ledgers
            .get(tier)
            .map_or((0.0, 0.0), |l| (l.daily, l.monthly))
    }

    /// Cost report for the month containing `now`
    ///
    /// `tier = None` covers all traffic and carries no budget.
    ///
    /// # Errors
    ///
    /// Returns an error if the usage log cannot be read.
    pub async fn analyze_monthly(
        &self,
        tier: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<MonthlyCostReport> {
        let start = month_start(now);
        let records = match &self.usage {
            Some(log) => log.since(start).await?,
            None => Vec::new(),
        };
        let records: Vec<_> = records
            .into_iter()
            .filter(|r| r.timestamp <= now)
            .filter(|r| tier.is_none() || r.tier.as_deref() == tier)
            .collect();

        let budget = tier.and_then(|t| self.tiers.get(t));
        Ok(MonthlyCostReport::build(&records, budget, now))
    }

    /// Raise a spend alert for every tier whose projection crosses
    /// `monthly_budget * alert_threshold`
    ///
    /// # Errors
    ///
    /// Returns an error if the usage log cannot be read.
    pub async fn check_spend_projection(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Alert>> {
        let mut raised = Vec::new();
        let mut names: Vec<&String> = self.tiers.keys().collect();
        names.sort();

        for name in names {
            let Some(budget) = self.tiers.get(name) else {
                continue;
            };
            let report = self.analyze_monthly(Some(name), now).await?;
            let limit = budget.monthly_budget * budget.alert_threshold;
            if report.projected_spend > limit {
                let alert = Alert::new(
                    AlertKind::SpendProjection {
                        tier: name.clone(),
                        projected: report.projected_spend,
                        budget: budget.monthly_budget,
                    },
                    format!(
                        "projected monthly spend {:.2} for {name} exceeds {:.0}% of budget {:.2}",
                        report.projected_spend,
                        budget.alert_threshold * 100.0,
                        budget.monthly_budget
                    ),
                );
                self.alerts.alert(alert.clone()).await;
                raised.push(alert);
            }
        }

        Ok(raised)
    }

    /// Start the periodic spend projection check
    pub fn spawn_projection_sweeper(self: &Arc<Self>, period: Duration) -> SweepHandle {
        let admission = Arc::clone(self);
        SweepHandle::spawn("spend-projection", period, move || {
            let admission = Arc::clone(&admission);
            async move {
                if let Err(e) = admission.check_spend_projection(Utc::now()).await {
                    tracing::warn!(error = %e, "Spend projection check failed");
                }
            }
        })
    }
}

/// Cheapest eligible backend for the same task type that is cheaper than
/// `current`
pub fn find_cheaper_alternative<'a>(
    candidates: &'a [BackendConfig],
    current: &BackendConfig,
    task_type: TaskType,
    is_eligible: impl Fn(&BackendConfig) -> bool,
) -> Option<&'a BackendConfig> {
    candidates
        .iter()
        .filter(|b| b.id != current.id)
        .filter(|b| b.active && b.supports(task_type))
        .filter(|b| b.cost_per_unit < current.cost_per_unit)
        .filter(|b| is_eligible(b))
        .min_by(|a, b| {
            a.cost_per_unit
                .total_cmp(&b.cost_per_unit)
                .then_with(|| a.id.cmp(&b.id))
        })
}

// ============================================================================
// Token Estimation
// ============================================================================

/// Rough token count: one token per four characters
#[must_use]
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

/// Complexity tier from the estimated token count
#[must_use]
pub fn estimate_complexity(prompt: &str) -> Complexity {
    match estimate_tokens(prompt) {
        0..=99 => Complexity::Simple,
        100..=499 => Complexity::Medium,
        _ => Complexity::Complex,
    }
}

// ============================================================================
// Prompt Reduction
// ============================================================================

/// Transformation applied by [`reduce_prompt`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionTechnique {
    /// Repeated sentences removed
    Deduplicate,
    /// Runs of spaces and tabs collapsed
    Whitespace,
    /// Long prompt cut to head and tail lines
    Summarize,
    /// Three or more newlines collapsed to one blank line
    BlankLines,
}

/// Outcome of prompt reduction
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptReduction {
    /// Reduced prompt
    pub prompt: String,
    /// Estimated tokens before
    pub original_tokens: u32,
    /// Estimated tokens after
    pub reduced_tokens: u32,
    /// Techniques that changed the prompt
    pub techniques: Vec<ReductionTechnique>,
}

impl PromptReduction {
    /// Tokens saved
    #[must_use]
    pub fn saved(&self) -> u32 {
        self.original_tokens.saturating_sub(self.reduced_tokens)
    }
}

/// Shrink a prompt before cost estimation
///
/// Summarization only runs when `token_reduction_target > 0.2` and keeps
/// its result only when it is under 80% of the input.
#[must_use]
pub fn reduce_prompt(prompt: &str, token_reduction_target: f64) -> PromptReduction {
    let mut techniques = Vec::new();
    let mut text = prompt.to_string();

    let deduped = dedupe_sentences(&text);
    if deduped.len() < text.len() {
        text = deduped;
        techniques.push(ReductionTechnique::Deduplicate);
    }

    let collapsed = HORIZONTAL_SPACE.replace_all(text.trim(), " ").into_owned();
    if collapsed.len() < text.len() {
        text = collapsed;
        techniques.push(ReductionTechnique::Whitespace);
    }

    if BLANK_RUNS.is_match(&text) {
        text = BLANK_RUNS.replace_all(&text, "\n\n").into_owned();
        techniques.push(ReductionTechnique::BlankLines);
    }

    if text.len() > SUMMARIZE_MIN_CHARS && token_reduction_target > SUMMARIZE_MIN_TARGET {
        if let Some(summary) = summarize(&text) {
            if (summary.len() as f64) < text.len() as f64 * 0.8 {
                text = summary;
                techniques.push(ReductionTechnique::Summarize);
            }
        }
    }

    PromptReduction {
        original_tokens: estimate_tokens(prompt),
        reduced_tokens: estimate_tokens(&text),
        prompt: text,
        techniques,
    }
}

/// Drop repeated sentences, keeping each sentence's terminator
fn dedupe_sentences(text: &str) -> String {
    let mut seen = HashSet::new();
    let mut out = String::with_capacity(text.len());
    let mut start = 0;
    let mut dropped = false;

    let mut push = |sentence: &str, out: &mut String| {
        let key = sentence.trim();
        if key.is_empty() || seen.insert(key.to_string()) {
            out.push_str(sentence);
            false
        } else {
            true
        }
    };

    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            let end = i + c.len_utf8();
            dropped |= push(&text[start..end], &mut out);
            start = end;
        }
    }
    dropped |= push(&text[start..], &mut out);

    if dropped {
        out
    } else {
        text.to_string()
    }
}

fn summarize(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= SUMMARIZE_MIN_LINES {
        return None;
    }
    let head = lines[..SUMMARIZE_HEAD].join("\n");
    let tail = lines[lines.len() - SUMMARIZE_TAIL..].join("\n");
    Some(format!("{head}\n...\n{tail}"))
}

// ============================================================================
// Monthly Analysis
// ============================================================================

/// Spend attributed to one backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostDriver {
    /// Backend id
    pub backend_id: String,
    /// Spend this month
    pub cost: f64,
    /// Share of total spend (0-100)
    pub percentage: f64,
}

/// Kind of savings opportunity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavingsKind {
    /// Repeated requests that a cache would have served
    Caching,
    /// Simple prompts sent to expensive backends
    CheaperBackend,
    /// Long prompts worth reducing
    PromptReduction,
    /// Busy hours worth batching
    Batching,
}

/// Estimated savings for one technique
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavingsOpportunity {
    /// Technique
    pub kind: SavingsKind,
    /// Estimated monthly savings
    pub potential_savings: f64,
}

/// Monthly cost analysis
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonthlyCostReport {
    /// Spend since the start of the month
    pub current_spend: f64,
    /// Spend extrapolated to the whole month
    pub projected_spend: f64,
    /// Monthly budget, when analysing a single tier
    pub budget: Option<f64>,
    /// Top five backends by spend
    pub top_drivers: Vec<CostDriver>,
    /// Savings opportunities, largest first
    pub savings: Vec<SavingsOpportunity>,
    /// Human-readable recommendations
    pub recommendations: Vec<String>,
}

impl MonthlyCostReport {
    fn build(
        records: &[crate::store::UsageRecord],
        budget: Option<&TierBudget>,
        now: DateTime<Utc>,
    ) -> Self {
        let current_spend: f64 = records.iter().map(|r| r.cost).sum();
        let days_passed = f64::from(now.day());
        let projected_spend = current_spend / days_passed * f64::from(days_in_month(now));

        let mut per_backend: HashMap<&str, f64> = HashMap::new();
        for r in records {
            *per_backend.entry(r.backend_id.as_str()).or_default() += r.cost;
        }
        let mut drivers: Vec<CostDriver> = per_backend
            .into_iter()
            .map(|(id, cost)| CostDriver {
                backend_id: id.to_string(),
                cost,
                percentage: if current_spend > 0.0 {
                    cost / current_spend * 100.0
                } else {
                    0.0
                },
            })
            .collect();
        drivers.sort_by(|a, b| {
            b.cost
                .total_cmp(&a.cost)
                .then_with(|| a.backend_id.cmp(&b.backend_id))
        });
        drivers.truncate(5);

        let savings = savings_opportunities(records);
        let mut report = Self {
            current_spend,
            projected_spend,
            budget: budget.map(|b| b.monthly_budget),
            top_drivers: drivers,
            savings,
            recommendations: Vec::new(),
        };
        report.recommendations = report.recommend(budget);
        report
    }

    fn recommend(&self, budget: Option<&TierBudget>) -> Vec<String> {
        let mut out = Vec::new();

        if let Some(b) = budget {
            if self.projected_spend > b.monthly_budget && b.monthly_budget > 0.0 {
                let over = (self.projected_spend - b.monthly_budget) / b.monthly_budget * 100.0;
                out.push(format!(
                    "Projected monthly spend exceeds the budget by {over:.1}%"
                ));
            }
        }

        if let Some(top) = self.top_drivers.first().filter(|d| d.percentage > 50.0) {
            out.push(format!(
                "{} accounts for {:.1}% of spend; consider a cheaper alternative",
                top.backend_id, top.percentage
            ));
        }

        if !self.savings.is_empty() {
            let total: f64 = self.savings.iter().map(|s| s.potential_savings).sum();
            out.push(format!("Optimizations could save {total:.2} per month"));
            for s in self.savings.iter().take(3) {
                out.push(format!("  - {:?}: {:.2}", s.kind, s.potential_savings));
            }
        }

        if budget.is_some_and(|b| b.caching_strategy == CachingStrategy::Minimal) {
            out.push(
                "Switching to moderate or aggressive caching would save more".to_string(),
            );
        }

        out
    }
}

fn savings_opportunities(records: &[crate::store::UsageRecord]) -> Vec<SavingsOpportunity> {
    let mut out = Vec::new();

    let mut repeats: HashMap<&str, usize> = HashMap::new();
    for r in records {
        *repeats.entry(r.fingerprint.as_str()).or_default() += 1;
    }
    let caching: f64 = repeats
        .values()
        .filter(|&&n| n > 1)
        .map(|&n| (n - 1) as f64 * 0.001)
        .sum();
    if caching > 0.0 {
        out.push(SavingsOpportunity {
            kind: SavingsKind::Caching,
            potential_savings: caching,
        });
    }

    let simple_expensive: Vec<_> = records
        .iter()
        .filter(|r| r.prompt_tokens < 100 && r.cost > 0.01)
        .collect();
    if !simple_expensive.is_empty() {
        out.push(SavingsOpportunity {
            kind: SavingsKind::CheaperBackend,
            potential_savings: simple_expensive.iter().map(|r| r.cost * 0.7).sum(),
        });
    }

    let long: Vec<_> = records.iter().filter(|r| r.prompt_tokens > 500).collect();
    if !long.is_empty() {
        out.push(SavingsOpportunity {
            kind: SavingsKind::PromptReduction,
            potential_savings: long.iter().map(|r| r.cost * 0.2).sum(),
        });
    }

    let mut by_hour: HashMap<u32, usize> = HashMap::new();
    for r in records {
        *by_hour.entry(r.timestamp.hour()).or_default() += 1;
    }
    if by_hour.values().any(|&n| n > 10) {
        out.push(SavingsOpportunity {
            kind: SavingsKind::Batching,
            potential_savings: records.len() as f64 * 0.0005,
        });
    }

    out.sort_by(|a, b| b.potential_savings.total_cmp(&a.potential_savings));
    out
}

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

fn days_in_month(now: DateTime<Utc>) -> u32 {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|next| next.pred_opt())
        .map_or(30, |last| last.day())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::test_utils::MemoryAlertSink;
    use crate::store::{MemoryUsageLog, UsageRecord};

    fn admission() -> (AdmissionControl, Arc<MemoryAlertSink>) {
        let sink = Arc::new(MemoryAlertSink::new());
        (AdmissionControl::new(TierBudget::presets(), sink.clone()), sink)
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn record(backend: &str, cost: f64, tokens: u32, fp: &str, ts: DateTime<Utc>) -> UsageRecord {
        UsageRecord {
            backend_id: backend.to_string(),
            task_type: TaskType::General,
            tier: Some("tier2".to_string()),
            success: true,
            latency_ms: 100,
            cost,
            prompt_tokens: tokens,
            fingerprint: fp.to_string(),
            timestamp: ts,
        }
    }

    #[test]
    fn test_unconstrained_without_tier() {
        let (admission, _) = admission();
        assert!(admission.check_budget(None, 1_000.0).allowed);
        assert!(admission.check_budget(Some("enterprise"), 1_000.0).allowed);
    }

    #[test]
    fn test_aggressive_fraction() {
        let (admission, _) = admission();
        let now = at(10, 12);

        // tier1: remaining 1.0 daily, fraction 0.1
        let ok = admission.check_budget_at(Some("tier1"), 0.1, now);
        assert!(ok.allowed);
        assert!((ok.remaining - 1.0).abs() < 1e-9);
        assert!(!admission.check_budget_at(Some("tier1"), 0.11, now).allowed);

        // tier2: remaining 5.0, fraction 0.25
        assert!(admission.check_budget_at(Some("tier2"), 1.25, now).allowed);
        assert!(!admission.check_budget_at(Some("tier2"), 1.3, now).allowed);
    }

    #[test]
    fn test_never_admits_over_fraction() {
        let (admission, _) = admission();
        let now = at(10, 12);
        for step in 0..50 {
            let cost = f64::from(step) * 0.05;
            let check = admission.check_budget_at(Some("tier2"), cost, now);
            if check.allowed {
                assert!(cost <= check.remaining * 0.25);
            }
            admission.record_spend_at(Some("tier2"), 0.07, now);
        }
    }

    #[test]
    fn test_remaining_is_min_of_daily_and_monthly() {
        let (admission, _) = admission();
        admission.record_spend_at(Some("tier1"), 9.5, at(1, 12));
        // New day resets daily, monthly leaves 0.5
        let check = admission.check_budget_at(Some("tier1"), 0.0, at(2, 12));
        assert!((check.remaining - 0.5).abs() < 1e-9);
        assert_eq!(admission.spent("tier1"), (0.0, 9.5));
    }

    #[test]
    fn test_month_rollover_resets() {
        let (admission, _) = admission();
        admission.record_spend_at(Some("tier1"), 10.0, at(31, 23));
        assert!(!admission.check_budget_at(Some("tier1"), 0.01, at(31, 23)).allowed);

        let april = Utc.with_ymd_and_hms(2026, 4, 1, 0, 5, 0).unwrap();
        assert!(admission.check_budget_at(Some("tier1"), 0.01, april).allowed);
    }

    #[test]
    fn test_find_cheaper_alternative() {
        let backends = vec![
            BackendConfig::new("pricey", "p", "m").with_cost(0.002),
            BackendConfig::new("mid", "p", "m").with_cost(0.001),
            BackendConfig::new("cheap", "q", "m").with_cost(0.0005),
            BackendConfig::new("cheapest-down", "q", "m").with_cost(0.0001),
            BackendConfig::new("vision", "q", "m")
                .with_cost(0.00001)
                .with_task_types([TaskType::Vision]),
        ];
        let found = find_cheaper_alternative(&backends, &backends[0], TaskType::General, |b| {
            b.id != "cheapest-down"
        });
        assert_eq!(found.map(|b| b.id.as_str()), Some("cheap"));

        assert!(
            find_cheaper_alternative(&backends, &backends[3], TaskType::General, |_| true)
                .is_none()
        );
    }

    #[test]
    fn test_estimates() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_complexity(&"a".repeat(396)), Complexity::Simple);
        assert_eq!(estimate_complexity(&"a".repeat(400)), Complexity::Medium);
        assert_eq!(estimate_complexity(&"a".repeat(2000)), Complexity::Complex);
    }

    #[test]
    fn test_reduce_prompt_dedupes_and_collapses() {
        let reduced = reduce_prompt("Sum column A.  Sum column A. Then   chart it!\n\n\n\nThanks", 0.1);
        assert_eq!(reduced.prompt, "Sum column A. Then chart it!\n\nThanks");
        assert_eq!(
            reduced.techniques,
            vec![
                ReductionTechnique::Deduplicate,
                ReductionTechnique::Whitespace,
                ReductionTechnique::BlankLines
            ]
        );
        assert!(reduced.saved() > 0);
    }

    #[test]
    fn test_summarize_only_with_high_target() {
        let prompt: String = (0..40)
            .map(|i| format!("line number {i} with some extra words in it"))
            .collect::<Vec<_>>()
            .join("\n");

        let light = reduce_prompt(&prompt, 0.2);
        assert!(!light.techniques.contains(&ReductionTechnique::Summarize));

        let heavy = reduce_prompt(&prompt, 0.3);
        assert!(heavy.techniques.contains(&ReductionTechnique::Summarize));
        assert_eq!(heavy.prompt.lines().count(), 9);
        assert!(heavy.prompt.contains("\n...\n"));
    }

    #[test]
    fn test_untouched_prompt() {
        let reduced = reduce_prompt("What is the total?", 0.3);
        assert_eq!(reduced.prompt, "What is the total?");
        assert!(reduced.techniques.is_empty());
    }

    #[tokio::test]
    async fn test_monthly_report() {
        let log = Arc::new(MemoryUsageLog::new());
        let now = at(10, 12);
        for i in 0..12 {
            log.append(record("big", 0.5, 50, "same", at(5, 9)))
                .await
                .unwrap();
            log.append(record("small", 0.01, 600, &format!("fp{i}"), at(6, 14)))
                .await
                .unwrap();
        }
        // Previous month is ignored
        log.append(record("big", 100.0, 50, "old", Utc.with_ymd_and_hms(2026, 2, 27, 0, 0, 0).unwrap()))
            .await
            .unwrap();

        let sink = Arc::new(MemoryAlertSink::new());
        let admission =
            AdmissionControl::new(TierBudget::presets(), sink.clone()).with_usage_log(log);
        let report = admission.analyze_monthly(Some("tier2"), now).await.unwrap();

        assert!((report.current_spend - 6.12).abs() < 1e-9);
        assert!((report.projected_spend - 6.12 / 10.0 * 31.0).abs() < 1e-9);
        assert_eq!(report.top_drivers[0].backend_id, "big");
        assert!(report.top_drivers[0].percentage > 90.0);

        let kinds: Vec<SavingsKind> = report.savings.iter().map(|s| s.kind).collect();
        assert_eq!(kinds[0], SavingsKind::CheaperBackend);
        assert!(kinds.contains(&SavingsKind::Caching));
        assert!(kinds.contains(&SavingsKind::PromptReduction));
        assert!(kinds.contains(&SavingsKind::Batching));
        assert!(report.recommendations.iter().any(|r| r.contains("big")));
    }

    #[tokio::test]
    async fn test_spend_projection_alert() {
        let log = Arc::new(MemoryUsageLog::new());
        log.append(record("big", 20.0, 50, "a", at(2, 9))).await.unwrap();

        let sink = Arc::new(MemoryAlertSink::new());
        let admission =
            AdmissionControl::new(TierBudget::presets(), sink.clone()).with_usage_log(log);

        let raised = admission.check_spend_projection(at(5, 12)).await.unwrap();
        assert_eq!(raised.len(), 1);
        assert!(matches!(
            &raised[0].kind,
            AlertKind::SpendProjection { tier, .. } if tier == "tier2"
        ));
        assert_eq!(sink.alerts().len(), 1);
    }
}
