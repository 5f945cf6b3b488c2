//! 协同内核集成测试：通过公开 API 驱动完整流程

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use council::capability::{
    BreakerState, CapabilityDescriptor, CapabilityRole, DecisionResult, DiagnosisAnswer,
    InvocationError, Payload,
};
use council::config::AppConfig;
use council::consensus::Resolution;
use council::core::{CouncilContext, CouncilError};
use council::learning::compute_reward;
use council::llm::{Script, ScriptedService};
use council::memory::{ContextBundle, ContextLabel};

fn config(max_failures: u32) -> AppConfig {
    let mut config = AppConfig::default();
    config.breaker.max_failures = max_failures;
    config.breaker.cooldown_ms = 30_000;
    config.breaker.half_open_tests = 2;
    config.breaker.overrides.clear();
    config
}

fn catalog() -> Vec<CapabilityDescriptor> {
    vec![
        CapabilityDescriptor::new("triage", CapabilityRole::Triage).with_priority(5),
        CapabilityDescriptor::new("dx_a", CapabilityRole::Diagnosis).with_priority(4),
        CapabilityDescriptor::new("dx_b", CapabilityRole::Diagnosis).with_priority(4),
        CapabilityDescriptor::new("dx_c", CapabilityRole::Diagnosis).with_priority(3),
    ]
}

fn context(service: Arc<ScriptedService>, max_failures: u32) -> Arc<CouncilContext> {
    CouncilContext::builder(service)
        .with_config(config(max_failures))
        .with_capabilities(catalog())
        .with_seed(42)
        .build()
        .unwrap()
}

fn diagnosis(id: &str, primary: &str, confidence: f64) -> DecisionResult {
    DecisionResult::succeeded(
        id,
        "chest pain",
        Payload::Diagnosis(DiagnosisAnswer {
            primary: primary.to_string(),
            differentials: Vec::new(),
        }),
        confidence,
        400,
    )
}

#[tokio::test(start_paused = true)]
async fn test_breaker_lifecycle_through_invoker() {
    let service = Arc::new(ScriptedService::new().failing("dx_a", "upstream down"));
    let ctx = context(service.clone(), 3);
    let bundle = ContextBundle::default();
    let invoke = || {
        ctx.invoker()
            .invoke("dx_a", "x", &bundle, CancellationToken::new())
    };

    for _ in 0..3 {
        let r = invoke().await;
        assert!(matches!(r.error, Some(InvocationError::Service { .. })));
    }
    assert_eq!(ctx.breakers().state("dx_a"), Some(BreakerState::Open));

    // 冷却期内直接拒绝，不调用服务
    let rejected = invoke().await;
    assert!(matches!(rejected.error, Some(InvocationError::Unavailable { .. })));
    assert_eq!(service.calls_for("dx_a"), 3);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(ctx.sweep_now(), 1);
    assert_eq!(ctx.breakers().state("dx_a"), Some(BreakerState::HalfOpen));

    service.set(
        "dx_a",
        Script::Reply {
            answer: json!({"primary": "angina"}),
            confidence: 80.0,
            delay: Duration::ZERO,
        },
    );
    assert!(invoke().await.success);
    assert_eq!(ctx.breakers().state("dx_a"), Some(BreakerState::HalfOpen));
    assert!(invoke().await.success);
    assert_eq!(ctx.breakers().state("dx_a"), Some(BreakerState::Closed));
}

#[tokio::test]
async fn test_no_capability_available_makes_zero_calls() {
    let service = Arc::new(ScriptedService::new().reply("triage", json!({"urgency": "high"}), 90.0));
    let ctx = context(service.clone(), 3);
    for id in ["dx_a", "dx_b", "dx_c"] {
        ctx.set_enabled(id, false).unwrap();
    }

    let err = ctx.session().process("chest pain").await.unwrap_err();
    assert!(matches!(err, CouncilError::NoCapabilityAvailable { .. }));
    assert_eq!(service.call_count(), 0);
}

#[test]
fn test_majority_consensus_with_dissent() {
    let ctx = context(Arc::new(ScriptedService::new()), 3);
    let round = ctx.consensus().vote(
        "what is the diagnosis?",
        &[
            diagnosis("dx_a", "Angina", 90.0),
            diagnosis("dx_b", "angina ", 85.0),
            diagnosis("dx_c", "reflux", 40.0),
        ],
        ContextLabel::Diagnostic,
    );

    assert!(round.consensus_reached);
    assert_eq!(round.resolution, Resolution::Quorum);
    // (1.35 + 1.275) / (1.35 + 1.275 + 0.6)
    assert!((round.ratio - 0.814).abs() < 0.01);
    assert_eq!(round.confidence, 71.0);
    match round.final_decision {
        Some(Payload::Diagnosis(d)) => assert_eq!(d.primary.to_lowercase().trim(), "angina"),
        other => panic!("unexpected decision: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_phase_barrier() {
    let service = Arc::new(
        ScriptedService::new()
            .reply_after("triage", json!({"urgency": "medium"}), 85.0, Duration::from_millis(300))
            .reply_after("dx_a", json!({"primary": "flu"}), 80.0, Duration::from_millis(10))
            .reply_after("dx_b", json!({"primary": "flu"}), 75.0, Duration::from_millis(200))
            .reply_after("dx_c", json!({"primary": "cold"}), 60.0, Duration::from_millis(50)),
    );
    let ctx = context(service.clone(), 3);
    let outcome = ctx.session().process("fever and cough").await.unwrap();
    assert_eq!(outcome.results.len(), 4);

    let records = service.records();
    let triage_done = records
        .iter()
        .filter(|r| r.capability_id == "triage")
        .filter_map(|r| r.finished)
        .max()
        .unwrap();
    let dx_started = records
        .iter()
        .filter(|r| r.capability_id.starts_with("dx_"))
        .map(|r| r.started)
        .min()
        .unwrap();
    assert!(triage_done < dx_started);

    let dx = outcome.round_for(CapabilityRole::Diagnosis).unwrap();
    assert_eq!(dx.votes.len(), 3);
}

#[tokio::test]
async fn test_cancelled_session_does_not_touch_breakers() {
    let service = Arc::new(
        ScriptedService::new()
            .reply("triage", json!({"urgency": "low"}), 80.0)
            .hanging("dx_a")
            .hanging("dx_b")
            .hanging("dx_c"),
    );
    let ctx = context(service, 1);
    let session = Arc::new(ctx.session());

    let running = {
        let session = session.clone();
        tokio::spawn(async move { session.process("sore throat").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.cancel();

    let err = running.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    for id in ["dx_a", "dx_b", "dx_c"] {
        assert_eq!(ctx.breakers().state(id), Some(BreakerState::Closed));
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancelling_one_call_leaves_siblings_running() {
    let service = Arc::new(
        ScriptedService::new()
            .hanging("dx_a")
            .reply_after("dx_b", json!({"primary": "flu"}), 80.0, Duration::from_millis(100))
            .reply_after("dx_c", json!({"primary": "flu"}), 70.0, Duration::from_millis(150)),
    );
    let ctx = context(service, 1);
    let bundle = ContextBundle::default();
    let parent = CancellationToken::new();
    let tokens: Vec<CancellationToken> = (0..3).map(|_| parent.child_token()).collect();

    let canceller = {
        let token = tokens[0].clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        })
    };
    let calls = ["dx_a", "dx_b", "dx_c"]
        .iter()
        .zip(tokens.iter().cloned())
        .map(|(id, token)| ctx.invoker().invoke(id, "fever", &bundle, token));
    let results = join_all(calls).await;
    canceller.await.unwrap();

    assert_eq!(results[0].error, Some(InvocationError::Cancelled));
    assert!(results[1].success);
    assert!(results[2].success);
    assert!(!parent.is_cancelled());
    assert_eq!(ctx.breakers().state("dx_a"), Some(BreakerState::Closed));
}

#[tokio::test]
async fn test_toggle_resets_breaker() {
    let service = Arc::new(ScriptedService::new().failing("dx_a", "boom"));
    let ctx = context(service, 1);
    ctx.invoker()
        .invoke("dx_a", "x", &ContextBundle::default(), CancellationToken::new())
        .await;
    assert_eq!(ctx.breakers().state("dx_a"), Some(BreakerState::Open));

    ctx.set_enabled("dx_a", false).unwrap();
    ctx.set_enabled("dx_a", true).unwrap();
    assert_eq!(ctx.breakers().state("dx_a"), Some(BreakerState::Closed));
    assert!(ctx.registry().is_enabled("dx_a"));
}

#[tokio::test]
async fn test_memory_feeds_forward_across_inputs() {
    let service = Arc::new(
        ScriptedService::new()
            .reply("triage", json!({"urgency": "medium"}), 85.0)
            .reply("dx_a", json!({"primary": "migraine"}), 88.0)
            .reply("dx_b", json!({"primary": "migraine"}), 82.0)
            .reply("dx_c", json!({"primary": "migraine"}), 70.0),
    );
    let ctx = context(service, 3);
    let session = ctx.session();
    for _ in 0..3 {
        session.process("throbbing headache and nausea").await.unwrap();
    }

    assert_eq!(ctx.memory().episode_count(), 12);
    assert!(ctx.memory().insight_count() >= 1);
    let bundle = ctx.memory().get_relevant_context("dx_a");
    assert!(!bundle.insights.is_empty());
    assert!(!bundle.recent_inputs.is_empty());

    session.reset();
    // reset 只清短期与工作记忆
    let bundle = ctx.memory().get_relevant_context("dx_a");
    assert!(bundle.recent_inputs.is_empty());
    assert_eq!(ctx.memory().episode_count(), 12);
    assert!(ctx.memory().insight_count() >= 1);
}

#[test]
fn test_exploration_decays_to_floor() {
    let ctx = context(Arc::new(ScriptedService::new()), 3);
    assert_eq!(ctx.learner().exploration_rate(), 0.15);
    for _ in 0..50 {
        ctx.learner()
            .on_result(&diagnosis("dx_a", "flu", 85.0), ContextLabel::Routine);
    }
    assert!((ctx.learner().exploration_rate() - 0.05).abs() < 1e-9);
    let priority = ctx.metrics().dynamic_priority("dx_a").unwrap();
    assert!((1.0..=10.0).contains(&priority));
}

#[test]
fn test_reward_sign() {
    let fast_confident = diagnosis("dx_a", "flu", 95.0);
    assert!(compute_reward(&fast_confident, ContextLabel::Routine, CapabilityRole::Diagnosis) >= 1.8);

    let failed = DecisionResult::failed(
        "dx_a",
        "x",
        InvocationError::Timeout { after_ms: 30_000 },
        30_000,
    );
    assert!(compute_reward(&failed, ContextLabel::Routine, CapabilityRole::Diagnosis) < 0.0);
}
