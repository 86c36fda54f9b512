//! Response Quality Assessment
//!
//! Pure scoring of a backend response. The score starts from a per-backend
//! trust prior and collects bonuses for observable signs of a useful answer:
//!
//! | Signal                                  | Bonus       |
//! |-----------------------------------------|-------------|
//! | structure (code fence, list, steps)     | +0.10       |
//! | detail (> 200 chars)                    | +0.05       |
//! | domain vocabulary (1 / 3 / 5+ terms)    | +0.05/0.08/0.10 |
//! | rich output: recognition language       | +0.05       |
//! | rich output: concrete references        | +0.05       |
//! | rich output: numeric data               | +0.05       |
//! | rich output: actionable verbs           | +0.05       |
//! | rich output: UI element mentions        | +0.03       |
//!
//! The total is clamped to [0, 1] and mapped to a [`Recommendation`]:
//! accept at 0.85, retry at 0.70, otherwise fall back.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Score at or above which a response is accepted
pub const ACCEPT_THRESHOLD: f64 = 0.85;

/// Score at or above which the same backend is retried once
pub const RETRY_THRESHOLD: f64 = 0.70;

static NUMBERED_LIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*\d+\.\s+").expect("valid numbered-list regex")
});
static BULLET_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*[-*]\s+").expect("valid bullet-list regex"));
static STEP_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bstep\s*\d+").expect("valid step-marker regex"));

static RECOGNITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(detected|found|identified|appears|visible|screenshot|shows)\b")
        .expect("valid recognition regex")
});
static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z]{1,3}[0-9]{1,5}\b|(?i)\b(top|bottom|left|right|center|upper|lower)\b")
        .expect("valid reference regex")
});
static NUMERIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+(\.\d+)?%|\$[\d,]+|\b\d{2,}\b").expect("valid numeric regex")
});
static ACTIONABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(modify|change|add|delete|remove|click|select|enter|replace|update)\b")
        .expect("valid actionable regex")
});
static UI_ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(ribbon|menu|tab|button|dialog|toolbar|panel)\b")
        .expect("valid ui-element regex")
});

const GENERIC_ERRORS: &[&str] = &[
    "cannot process",
    "unable to analyze",
    "error occurred",
    "could not recognize",
];

// ============================================================================
// Configuration
// ============================================================================

/// Quality assessor settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Trust prior per backend id
    pub base_scores: HashMap<String, f64>,
    /// Prior for backends without an entry
    pub default_base_score: f64,
    /// Domain vocabulary counted for the expertise bonus
    pub domain_terms: Vec<String>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            base_scores: HashMap::new(),
            default_base_score: 0.7,
            domain_terms: [
                "cell",
                "formula",
                "chart",
                "worksheet",
                "column",
                "row",
                "pivot",
                "function",
                "range",
                "reference",
                "conditional",
                "filter",
                "sort",
                "macro",
                "vlookup",
                "sumif",
                "index",
                "match",
                "countif",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        }
    }
}

// ============================================================================
// Assessment
// ============================================================================

/// What the dispatcher should do with a scored response
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// Good enough to return
    Accept,
    /// Borderline; try the same backend once more
    Retry,
    /// Move on to another backend
    Fallback,
}

impl Recommendation {
    /// Map a score to a recommendation
    #[must_use]
    pub fn for_score(score: f64) -> Self {
        if score >= ACCEPT_THRESHOLD {
            Self::Accept
        } else if score >= RETRY_THRESHOLD {
            Self::Retry
        } else {
            Self::Fallback
        }
    }
}

/// Per-signal contributions to a score
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Backend trust prior
    pub base: f64,
    /// Structural markers
    pub structure: f64,
    /// Length/detail
    pub detail: f64,
    /// Domain vocabulary
    pub expertise: f64,
    /// Rich-output signals
    pub rich_output: f64,
}

/// Scored response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    /// Final score (0.0 - 1.0)
    pub score: f64,
    /// Component contributions
    pub breakdown: ScoreBreakdown,
    /// Suggested action
    pub recommendation: Recommendation,
    /// Human-readable notes
    pub details: Vec<String>,
}

impl QualityAssessment {
    fn flat(score: f64, detail: String) -> Self {
        Self {
            score,
            breakdown: ScoreBreakdown {
                base: 0.5,
                ..Default::default()
            },
            recommendation: Recommendation::Fallback,
            details: vec![detail],
        }
    }
}

/// Response scorer
#[derive(Clone, Debug, Default)]
pub struct QualityAssessor {
    config: QualityConfig,
}

impl QualityAssessor {
    /// Create an assessor
    #[must_use]
    pub fn new(mut config: QualityConfig) -> Self {
        for term in &mut config.domain_terms {
            *term = term.to_lowercase();
        }
        Self { config }
    }

    /// Trust prior for a backend
    #[must_use]
    pub fn base_score(&self, backend_id: &str) -> f64 {
        self.config
            .base_scores
            .get(backend_id)
            .copied()
            .unwrap_or(self.config.default_base_score)
    }

    /// Score a response
    #[must_use]
    pub fn score(&self, response: &str, backend_id: &str, rich_output: bool) -> QualityAssessment {
        if response.trim().is_empty() {
            return QualityAssessment::flat(0.5, "empty response".to_string());
        }

        let mut details = Vec::new();
        let mut breakdown = ScoreBreakdown {
            base: self.base_score(backend_id),
            ..Default::default()
        };

        if has_structure(response) {
            breakdown.structure = 0.1;
            details.push("structured response".to_string());
        }

        if response.chars().count() > 200 {
            breakdown.detail = 0.05;
            details.push("detailed response (200+ chars)".to_string());
        }

        let terms = self.count_domain_terms(response);
        breakdown.expertise = match terms {
            0 => 0.0,
            1..=2 => 0.05,
            3..=4 => 0.08,
            _ => 0.1,
        };
        if terms > 0 {
            details.push(format!("{terms} domain terms"));
        }

        if rich_output {
            let (bonus, notes) = rich_output_signals(response);
            breakdown.rich_output = bonus;
            details.extend(notes);
        }

        let score = (breakdown.base
            + breakdown.structure
            + breakdown.detail
            + breakdown.expertise
            + breakdown.rich_output)
            .clamp(0.0, 1.0);

        QualityAssessment {
            score,
            breakdown,
            recommendation: Recommendation::for_score(score),
            details,
        }
    }

    fn count_domain_terms(&self, response: &str) -> usize {
        let lower = response.to_lowercase();
        self.config
            .domain_terms
            .iter()
            .filter(|term| lower.contains(term.as_str()))
            .count()
    }
}

fn has_structure(content: &str) -> bool {
    content.contains("```")
        || NUMBERED_LIST.is_match(content)
        || BULLET_LIST.is_match(content)
        || STEP_MARKER.is_match(content)
}

fn rich_output_signals(content: &str) -> (f64, Vec<String>) {
    let checks: [(&Regex, f64, &str); 5] = [
        (&RECOGNITION, 0.05, "recognition language"),
        (&REFERENCE, 0.05, "concrete references"),
        (&NUMERIC, 0.05, "numeric data"),
        (&ACTIONABLE, 0.05, "actionable advice"),
        (&UI_ELEMENT, 0.03, "UI element mentions"),
    ];

    let mut bonus = 0.0;
    let mut notes = Vec::new();
    for (re, value, note) in checks {
        if re.is_match(content) {
            bonus += value;
            notes.push(note.to_string());
        }
    }
    (bonus, notes)
}

// ============================================================================
// Helpers
// ============================================================================

/// Score a backend error message (always recommends fallback)
#[must_use]
pub fn assess_error(message: &str) -> QualityAssessment {
    let lower = message.to_lowercase();
    let generic = GENERIC_ERRORS.iter().any(|g| lower.contains(g));
    QualityAssessment::flat(
        if generic { 0.3 } else { 0.5 },
        format!("error: {message}"),
    )
}

/// Blend a score with average user satisfaction (0-1) at 50% weight
#[must_use]
pub fn adjust_with_feedback(score: f64, satisfaction: f64) -> f64 {
    const WEIGHT: f64 = 0.5;
    (score * (1.0 - WEIGHT) + score * satisfaction.clamp(0.0, 1.0) * WEIGHT).clamp(0.0, 1.0)
}

/// Highest-scoring assessment
#[must_use]
pub fn best(assessments: &[QualityAssessment]) -> Option<&QualityAssessment> {
    assessments
        .iter()
        .reduce(|best, a| if a.score > best.score { a } else { best })
}

/// Mean score (0 for an empty slice)
#[must_use]
pub fn average(assessments: &[QualityAssessment]) -> f64 {
    if assessments.is_empty() {
        return 0.0;
    }
    assessments.iter().map(|a| a.score).sum::<f64>() / assessments.len() as f64
}

/// Human-readable label for a score
#[must_use]
pub fn label(score: f64) -> &'static str {
    if score >= 0.9 {
        "very high"
    } else if score >= 0.8 {
        "high"
    } else if score >= 0.7 {
        "medium"
    } else if score >= 0.6 {
        "low"
    } else {
        "very low"
    }
}
