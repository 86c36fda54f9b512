//! End-to-end routing scenarios
//!
//! Drives a fully wired [`Router`] over scripted backends and checks the
//! decisions, fallbacks and side effects a caller can observe.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use switchboard_core::backend::BackendError;
use switchboard_core::routing::test_utils::{
    backend_map, router_config, Reply, ScriptedBackend, GOOD_RESPONSE, MEDIOCRE_RESPONSE,
    POOR_RESPONSE,
};
use switchboard_core::routing::{
    ExperimentDraft, ExperimentType, FallbackStrategy, HealthStatus, InteractionOutcome,
    VariantConfig, VariantDraft,
};
use switchboard_core::store::{MemoryUsageLog, UsageLog};
use switchboard_core::{
    BackendConfig, ErrorKind, RouteError, Router, RouterConfig, SelectionCriteria, TaskType, Urgency,
};

// ============================================================================
// Helpers
// ============================================================================

fn build(config: RouterConfig, backends: &[Arc<ScriptedBackend>]) -> Router {
    Router::builder(config)
        .backends(backend_map(backends))
        .build()
        .unwrap()
}

fn general() -> SelectionCriteria {
    SelectionCriteria::new(TaskType::General)
}

fn failing(id: &str, status: u16) -> Arc<ScriptedBackend> {
    Arc::new(ScriptedBackend::new(id).failing(BackendError::with_status(status, "upstream error")))
}

// ============================================================================
// Selection
// ============================================================================

#[tokio::test]
async fn test_cost_sensitive_request_picks_cheapest() {
    let a = Arc::new(ScriptedBackend::new("a"));
    let b = Arc::new(ScriptedBackend::new("b"));
    let router = build(
        router_config(vec![
            BackendConfig::new("a", "anthropic", "small").with_cost(0.0007),
            BackendConfig::new("b", "openai", "large").with_cost(0.0015),
        ]),
        &[a.clone(), b.clone()],
    );

    let outcome = router
        .route("summarize the report", &general().cost_sensitive(), "u1")
        .await
        .unwrap();

    assert_eq!(outcome.decision.backend_id, "a");
    assert!(outcome.decision.flags.cost_optimized);
    assert_eq!(outcome.decision.alternatives, vec!["b".to_string()]);
    assert_eq!(b.calls(), 0);
}

#[tokio::test]
async fn test_preferred_backend_is_honored() {
    let a = Arc::new(ScriptedBackend::new("a"));
    let b = Arc::new(ScriptedBackend::new("b"));
    let router = build(
        router_config(vec![
            BackendConfig::new("a", "p", "m").with_priority(0),
            BackendConfig::new("b", "p", "m").with_priority(1),
        ]),
        &[a.clone(), b.clone()],
    );

    let outcome = router
        .route("hello", &general().with_preferred_backend("b"), "u1")
        .await
        .unwrap();

    assert_eq!(outcome.decision.backend_id, "b");
    assert!(outcome.decision.flags.user_preference);
    assert_eq!(a.calls(), 0);
}

#[tokio::test]
async fn test_learned_preference_steers_selection() {
    let x = Arc::new(ScriptedBackend::new("x"));
    let y = Arc::new(ScriptedBackend::new("y"));
    let router = build(
        router_config(vec![
            BackendConfig::new("y", "p", "m").with_priority(0),
            BackendConfig::new("x", "p", "m").with_priority(1),
        ]),
        &[x.clone(), y.clone()],
    );

    for _ in 0..5 {
        router
            .preferences()
            .update(
                "u1",
                "x",
                TaskType::General,
                InteractionOutcome {
                    success: true,
                    latency_ms: 300.0,
                    quality: 0.9,
                },
            )
            .await;
    }

    let outcome = router.route("hello", &general(), "u1").await.unwrap();
    assert_eq!(outcome.decision.backend_id, "x");
    assert!(outcome.decision.flags.user_preference);

    // Other users still get the priority order
    let outcome = router.route("hello", &general(), "u2").await.unwrap();
    assert_eq!(outcome.decision.backend_id, "y");
}

#[tokio::test]
async fn test_text_only_backend_never_selected_first() {
    let plain = Arc::new(ScriptedBackend::new("plain"));
    let full = Arc::new(ScriptedBackend::new("full"));
    let router = build(
        router_config(vec![
            BackendConfig::new("plain", "p", "m").text_only().with_priority(0),
            BackendConfig::new("full", "p", "m").with_priority(1),
        ]),
        &[plain.clone(), full.clone()],
    );

    let outcome = router.route("hello", &general(), "u1").await.unwrap();
    assert_eq!(outcome.decision.backend_id, "full");
    assert_eq!(plain.calls(), 0);
}

#[tokio::test]
async fn test_unsupported_task_type_has_no_backend() {
    let a = Arc::new(ScriptedBackend::new("a"));
    let router = build(router_config(vec![BackendConfig::new("a", "p", "m")]), &[a]);

    let err = router
        .route("write code", &SelectionCriteria::new(TaskType::Code), "u1")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RouteError::NoBackendAvailable {
            task_type: TaskType::Code
        }
    );
    assert_eq!(err.kind(), "no_backend_available");
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_unavailable_backend_excluded_from_selection_and_chain() {
    let a = Arc::new(ScriptedBackend::new("a"));
    let b = failing("b", 503);
    let c = Arc::new(ScriptedBackend::new("c"));
    let mut config = router_config(vec![
        BackendConfig::new("a", "p", "m").with_priority(0),
        BackendConfig::new("b", "p", "m").with_priority(1),
        BackendConfig::new("c", "p", "m").with_priority(2),
    ]);
    config.policy.fallback_strategy = FallbackStrategy::AnyAvailable;
    let router = build(config, &[a.clone(), b.clone(), c.clone()]);

    for i in 0..10 {
        router
            .health()
            .record_outcome("a", i >= 6, Duration::from_millis(100));
    }
    router.health().recompute_all().await;
    assert_eq!(router.health().status("a").status, HealthStatus::Unavailable);

    let outcome = router.route("hello", &general(), "u1").await.unwrap();

    assert_eq!(outcome.decision.backend_id, "c");
    let tried: Vec<&str> = outcome.attempts.iter().map(|a| a.backend_id.as_str()).collect();
    assert_eq!(tried, vec!["b", "c"]);
    assert_eq!(a.calls(), 0);
}

#[tokio::test]
async fn test_unavailable_preferred_backend_routes_elsewhere() {
    let a = Arc::new(ScriptedBackend::new("a"));
    let b = Arc::new(ScriptedBackend::new("b"));
    let router = build(
        router_config(vec![
            BackendConfig::new("a", "p", "m").with_priority(0),
            BackendConfig::new("b", "p", "m").with_priority(1),
        ]),
        &[a.clone(), b.clone()],
    );

    for _ in 0..10 {
        router
            .health()
            .record_outcome("a", false, Duration::from_millis(100));
    }
    router.health().recompute_all().await;
    assert_eq!(router.health().status("a").status, HealthStatus::Unavailable);

    let outcome = router
        .route("hello", &general().with_preferred_backend("a"), "u1")
        .await
        .unwrap();

    assert_eq!(outcome.decision.backend_id, "b");
    assert!(!outcome.decision.flags.user_preference);
    assert_eq!(a.calls(), 0);
}

#[tokio::test]
async fn test_blacklisted_preferred_backend_is_ignored() {
    let a = Arc::new(ScriptedBackend::new("a"));
    let b = Arc::new(ScriptedBackend::new("b"));
    let mut config = router_config(vec![
        BackendConfig::new("a", "p", "m").with_priority(0),
        BackendConfig::new("b", "p", "m").with_priority(1),
    ]);
    config.policy.blacklist.insert("b".to_string());
    let router = build(config, &[a.clone(), b.clone()]);

    let outcome = router
        .route("hello", &general().with_preferred_backend("b"), "u1")
        .await
        .unwrap();

    assert_eq!(outcome.decision.backend_id, "a");
    assert_eq!(b.calls(), 0);
}

// ============================================================================
// Quality and Fallback
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_timeout_with_status_like_digits_escalates() {
    let slow = Arc::new(ScriptedBackend::new("slow").hanging());
    let fast = Arc::new(ScriptedBackend::new("fast"));
    let router = build(
        router_config(vec![
            BackendConfig::new("slow", "p", "m")
                .with_priority(0)
                .with_timeout(Duration::from_millis(4010)),
            BackendConfig::new("fast", "p", "m").with_priority(1),
        ]),
        &[slow.clone(), fast.clone()],
    );

    let outcome = router.route("hello", &general(), "u1").await.unwrap();

    assert_eq!(outcome.decision.backend_id, "fast");
    assert_eq!(outcome.attempts[0].error_kind, Some(ErrorKind::Retryable));
    assert_eq!(fast.calls(), 1);
}

#[tokio::test]
async fn test_poor_answer_falls_back_within_provider() {
    let a = Arc::new(ScriptedBackend::new("a").replying(POOR_RESPONSE));
    let b = Arc::new(ScriptedBackend::new("b"));
    let c = Arc::new(ScriptedBackend::new("c"));
    let mut config = router_config(vec![
        BackendConfig::new("a", "openai", "m").with_priority(0),
        BackendConfig::new("b", "anthropic", "m").with_priority(1),
        BackendConfig::new("c", "openai", "m").with_priority(2),
    ]);
    config.policy.fallback_strategy = FallbackStrategy::SameProvider;
    let router = build(config, &[a.clone(), b.clone(), c.clone()]);

    let outcome = router.route("hello", &general(), "u1").await.unwrap();

    assert_eq!(outcome.decision.backend_id, "c");
    assert_eq!(outcome.attempts.len(), 2);
    assert_eq!(outcome.content, GOOD_RESPONSE);
    assert_eq!(b.calls(), 0);
    assert_eq!(router.metrics().summary().escalations, 1);
}

#[tokio::test]
async fn test_mediocre_answer_retried_then_accepted() {
    let a = Arc::new(
        ScriptedBackend::new("a")
            .then(Reply::Text(MEDIOCRE_RESPONSE.to_string()))
            .replying(GOOD_RESPONSE),
    );
    let router = build(router_config(vec![BackendConfig::new("a", "p", "m")]), &[a.clone()]);

    let outcome = router.route("hello", &general(), "u1").await.unwrap();

    assert_eq!(outcome.decision.backend_id, "a");
    assert_eq!(outcome.attempts.len(), 2);
    assert!(outcome.quality.unwrap() >= 0.85);
    assert_eq!(a.calls(), 2);
}

#[tokio::test]
async fn test_attempts_never_exceed_max_retries() {
    let backends: Vec<Arc<ScriptedBackend>> = (0..4).map(|i| failing(&format!("b{i}"), 500)).collect();
    let mut config = router_config(
        (0..4)
            .map(|i| BackendConfig::new(format!("b{i}"), "p", "m").with_priority(i))
            .collect(),
    );
    config.policy.max_retries = 2;
    config.policy.fallback_strategy = FallbackStrategy::AnyAvailable;
    config.policy.text_only_fallback = false;
    let router = build(config, &backends);

    let err = router.route("hello", &general(), "u1").await.unwrap_err();

    match err {
        RouteError::AllBackendsExhausted { attempts, .. } => assert_eq!(attempts.len(), 2),
        other => panic!("expected exhaustion, got {other:?}"),
    }
    let calls: usize = backends.iter().map(|b| b.calls()).sum();
    assert_eq!(calls, 2);
    assert_eq!(router.metrics().summary().exhausted, 1);
}

#[tokio::test]
async fn test_fatal_error_stops_dispatch() {
    let a = failing("a", 403);
    let b = Arc::new(ScriptedBackend::new("b"));
    let router = build(
        router_config(vec![
            BackendConfig::new("a", "p", "m").with_priority(0),
            BackendConfig::new("b", "p", "m").with_priority(1),
        ]),
        &[a, b.clone()],
    );

    let err = router.route("hello", &general(), "u1").await.unwrap_err();
    assert!(matches!(err, RouteError::BackendFatal { ref backend_id, .. } if backend_id == "a"));
    assert_eq!(err.kind(), "backend_fatal");
    assert_eq!(b.calls(), 0);
}

#[tokio::test]
async fn test_high_urgency_prefers_reliable_backend() {
    let a = Arc::new(ScriptedBackend::new("a"));
    let b = Arc::new(ScriptedBackend::new("b"));
    let router = build(
        router_config(vec![
            BackendConfig::new("a", "p", "m").with_priority(0),
            BackendConfig::new("b", "p", "m").with_priority(1),
        ]),
        &[a, b],
    );

    for i in 0..10 {
        router.health().record_outcome("a", i % 4 != 0, Duration::from_millis(50));
        router.health().record_outcome("b", true, Duration::from_millis(50));
    }
    router.health().recompute_all().await;

    let outcome = router
        .route("hello", &general().with_urgency(Urgency::High), "u1")
        .await
        .unwrap();
    assert_eq!(outcome.decision.backend_id, "b");
}

// ============================================================================
// Cache
// ============================================================================

#[tokio::test]
async fn test_repeated_prompt_served_from_cache() {
    let a = Arc::new(ScriptedBackend::new("a").with_cost(0.05));
    let router = build(router_config(vec![BackendConfig::new("a", "p", "m")]), &[a.clone()]);

    let first = router.route("total the column", &general(), "u1").await.unwrap();
    assert!(!first.cached);

    let second = router.route("total the column", &general(), "u2").await.unwrap();
    assert!(second.cached);
    assert_eq!(second.content, first.content);
    assert!(second.attempts.is_empty());
    assert_eq!(a.calls(), 1);
    assert_eq!(router.metrics().summary().cache_hits, 1);
    assert!(router.cache().stats().hits >= 1);
}

#[tokio::test]
async fn test_cheap_responses_not_cached() {
    let a = Arc::new(ScriptedBackend::new("a").with_cost(0.001));
    let router = build(router_config(vec![BackendConfig::new("a", "p", "m")]), &[a.clone()]);

    router.route("hello", &general(), "u1").await.unwrap();
    let again = router.route("hello", &general(), "u1").await.unwrap();

    assert!(!again.cached);
    assert_eq!(a.calls(), 2);
}

// ============================================================================
// Admission
// ============================================================================

const LONG_PROMPT: &str = "Compare the quarterly revenue figures across every region. \
Explain which product lines drove growth and which ones declined. \
Then propose a budget allocation for next year with a short justification for each line.";

#[tokio::test]
async fn test_budget_substitutes_cheaper_backend() {
    let pricey = Arc::new(ScriptedBackend::new("pricey"));
    let cheap = Arc::new(ScriptedBackend::new("cheap"));
    let router = build(
        router_config(vec![
            BackendConfig::new("pricey", "p", "m").with_cost(10.0).with_priority(0),
            BackendConfig::new("cheap", "p", "m").with_cost(0.001).with_priority(1),
        ]),
        &[pricey.clone(), cheap.clone()],
    );
    router.admission().record_spend(Some("tier1"), 0.95);

    let outcome = router
        .route(LONG_PROMPT, &general().with_tier("tier1"), "u1")
        .await
        .unwrap();

    assert_eq!(outcome.decision.backend_id, "cheap");
    assert!(outcome.decision.flags.cost_optimized);
    assert_eq!(pricey.calls(), 0);
}

#[tokio::test]
async fn test_budget_rejects_when_nothing_cheaper() {
    let pricey = Arc::new(ScriptedBackend::new("pricey"));
    let router = build(
        router_config(vec![BackendConfig::new("pricey", "p", "m").with_cost(10.0)]),
        &[pricey.clone()],
    );
    router.admission().record_spend(Some("tier1"), 0.95);

    let err = router
        .route(LONG_PROMPT, &general().with_tier("tier1"), "u1")
        .await
        .unwrap_err();

    match err {
        RouteError::CostLimitExceeded { tier, .. } => assert_eq!(tier, "tier1"),
        other => panic!("expected cost limit, got {other:?}"),
    }
    assert_eq!(pricey.calls(), 0);
    assert_eq!(router.metrics().summary().rejected, 1);
}

#[tokio::test]
async fn test_unknown_tier_is_unconstrained() {
    let pricey = Arc::new(ScriptedBackend::new("pricey"));
    let router = build(
        router_config(vec![BackendConfig::new("pricey", "p", "m").with_cost(10.0)]),
        &[pricey],
    );

    let outcome = router
        .route(LONG_PROMPT, &general().with_tier("platinum"), "u1")
        .await
        .unwrap();
    assert_eq!(outcome.decision.backend_id, "pricey");
}

// ============================================================================
// Experiments
// ============================================================================

#[tokio::test]
async fn test_model_experiment_overrides_selection() {
    let a = Arc::new(ScriptedBackend::new("a"));
    let b = Arc::new(ScriptedBackend::new("b"));
    let router = build(
        router_config(vec![
            BackendConfig::new("a", "p", "m").with_priority(0),
            BackendConfig::new("b", "p", "m").with_priority(1),
        ]),
        &[a.clone(), b.clone()],
    );
    let experiment = router
        .experiments()
        .create(
            ExperimentDraft::new("try-b", ExperimentType::Model)
                .variant(VariantDraft::new(
                    "b-only",
                    100.0,
                    VariantConfig::Model {
                        backend_id: "b".to_string(),
                    },
                ))
                .active(),
        )
        .await
        .unwrap();

    let outcome = router.route("hello", &general(), "u1").await.unwrap();

    assert_eq!(outcome.decision.backend_id, "b");
    assert!(outcome.decision.flags.ab_test_override);
    assert!((outcome.decision.confidence - 1.0).abs() < f64::EPSILON);
    assert_eq!(outcome.assignments.len(), 1);
    assert_eq!(a.calls(), 0);

    let analysis = router.experiments().analyze(&experiment.id).unwrap();
    assert_eq!(analysis.variants[0].sample_size, 1);
    assert!((analysis.variants[0].conversion_rate - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_prompt_experiment_rewrites_prompt() {
    let a = Arc::new(ScriptedBackend::new("a"));
    let router = build(router_config(vec![BackendConfig::new("a", "p", "m")]), &[a.clone()]);
    router
        .experiments()
        .create(
            ExperimentDraft::new("polite", ExperimentType::Prompt)
                .variant(VariantDraft::new(
                    "please",
                    100.0,
                    VariantConfig::Prompt {
                        template: "Please help: {prompt}".to_string(),
                    },
                ))
                .active(),
        )
        .await
        .unwrap();

    router.route("sort this list", &general(), "u1").await.unwrap();
    assert_eq!(a.last_prompt().as_deref(), Some("Please help: sort this list"));
}

// ============================================================================
// Usage Log, Reload, Concurrency
// ============================================================================

#[tokio::test]
async fn test_every_attempt_reaches_usage_log() {
    let a = failing("a", 503);
    let b = Arc::new(ScriptedBackend::new("b"));
    let log = Arc::new(MemoryUsageLog::new());
    let mut config = router_config(vec![
        BackendConfig::new("a", "p", "m").with_priority(0),
        BackendConfig::new("b", "p", "m").with_priority(1),
    ]);
    config.policy.fallback_strategy = FallbackStrategy::AnyAvailable;
    let router = Router::builder(config)
        .backends(backend_map(&[a, b]))
        .usage_log(log.clone())
        .build()
        .unwrap();

    router
        .route("hello", &general().with_tier("tier2"), "u1")
        .await
        .unwrap();

    let records = log.since(chrono::DateTime::<chrono::Utc>::MIN_UTC).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].backend_id, "a");
    assert!(!records[0].success);
    assert_eq!(records[1].backend_id, "b");
    assert!(records[1].success);
    assert_eq!(records[1].tier.as_deref(), Some("tier2"));
}

#[tokio::test]
async fn test_reload_routes_to_new_backends() {
    let a = Arc::new(ScriptedBackend::new("a"));
    let router = build(router_config(vec![BackendConfig::new("a", "p", "m")]), &[a.clone()]);
    router.route("hello", &general(), "u1").await.unwrap();

    let b = Arc::new(ScriptedBackend::new("b"));
    router
        .reload(
            vec![BackendConfig::new("b", "p", "m")],
            switchboard_core::RoutingPolicy::default(),
            backend_map(&[b.clone()]),
        )
        .unwrap();

    let outcome = router.route("something else", &general(), "u1").await.unwrap();
    assert_eq!(outcome.decision.backend_id, "b");
    assert_eq!(a.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispatches() {
    let a = Arc::new(ScriptedBackend::new("a").with_delay(Duration::from_millis(5)));
    let b = Arc::new(
        ScriptedBackend::new("b")
            .failing(BackendError::with_status(503, "busy"))
            .with_delay(Duration::from_millis(1)),
    );
    let mut config = router_config(vec![
        BackendConfig::new("b", "p", "m").with_priority(0),
        BackendConfig::new("a", "p", "m").with_priority(1),
    ]);
    config.policy.fallback_strategy = FallbackStrategy::AnyAvailable;
    let router = Arc::new(build(config, &[a.clone(), b.clone()]));

    let handles = (0..50).map(|i| {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            router
                .route(&format!("question {i}"), &general(), &format!("user-{i}"))
                .await
        })
    });

    for result in futures::future::join_all(handles).await {
        let outcome = result.unwrap().unwrap();
        assert_eq!(outcome.decision.backend_id, "a");
    }

    let summary = router.metrics().summary();
    assert_eq!(summary.dispatches, 50);
    assert_eq!(summary.accepted, 50);
    assert_eq!(a.calls(), 50);
    assert_eq!(b.calls(), 50);
}
