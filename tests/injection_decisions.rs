//! Decision-engine behavior across rounds: cooldown, anti-repetition,
//! loop-streak eligibility, and statistical convergence of the
//! probabilistic path.

mod common;

use std::sync::Arc;

use faultline::catalog::ScenarioCatalog;
use faultline::harness::ChatRequest;
use faultline::injector::{Decision, FailureInjector};
use faultline::scenario::default_scenarios;
use faultline::session::SessionState;
use faultline::stores::MemoryStateStore;

use common::*;

fn injector_with(scenarios: Vec<&str>, seed: u64) -> FailureInjector {
    let catalog = ScenarioCatalog::new();
    for scenario in default_scenarios() {
        if scenarios.contains(&scenario.name.as_str()) {
            catalog.register(scenario).expect("register stock scenario");
        }
    }
    FailureInjector::with_seed(catalog, Arc::new(MemoryStateStore::new()), seed)
}

fn injected_mode(decision: Decision) -> Option<String> {
    match decision {
        Decision::PassThrough => None,
        Decision::Injected(injection) => Some(injection.mode),
    }
}

#[tokio::test]
async fn forced_injection_ignores_active_cooldown() {
    let catalog = ScenarioCatalog::with_defaults();
    let injector = FailureInjector::with_seed(catalog, Arc::new(MemoryStateStore::new()), 7);
    let config = probabilistic(1.0, 1000);
    let mut session = SessionState::default();

    let first = injector
        .decide("s1", &mut session, "hi", Some("auth_error"), &config)
        .await
        .expect("forced decide");
    assert_eq!(injected_mode(first).as_deref(), Some("auth_error"));

    // Well inside the cooldown window; forcing still works.
    let second = injector
        .decide("s1", &mut session, "hi", Some("hallucination"), &config)
        .await
        .expect("forced decide");
    assert_eq!(injected_mode(second).as_deref(), Some("hallucination"));

    // The probabilistic path stays blocked for the same session.
    let third = injector
        .decide("s1", &mut session, "hi", None, &config)
        .await
        .expect("probabilistic decide");
    assert_eq!(third, Decision::PassThrough);
    assert_eq!(session.failure_count, 2);
}

#[tokio::test]
async fn cooldown_blocks_probabilistic_rounds_after_a_win() {
    let catalog = ScenarioCatalog::new();
    catalog
        .register(quality_scenario("always_canned", 1.0))
        .expect("register");
    let injector = FailureInjector::with_seed(catalog, Arc::new(MemoryStateStore::new()), 7);
    let config = probabilistic(1.0, 1000);
    let mut session = SessionState::default();

    let first = injector
        .decide("s1", &mut session, "hi", None, &config)
        .await
        .expect("decide");
    assert!(first.is_injected(), "certain scenario must win round one");

    for round in 0..50 {
        let decision = injector
            .decide("s1", &mut session, "hi", None, &config)
            .await
            .expect("decide");
        assert_eq!(decision, Decision::PassThrough, "round {round} beat cooldown");
    }
}

#[tokio::test]
async fn anti_repetition_alternates_between_two_certain_scenarios() {
    let catalog = ScenarioCatalog::new();
    catalog
        .register(quality_scenario("canned_a", 1.0))
        .expect("register");
    catalog
        .register(quality_scenario("canned_b", 1.0))
        .expect("register");
    let injector = FailureInjector::with_seed(catalog, Arc::new(MemoryStateStore::new()), 7);
    let config = probabilistic(1.0, 0);
    let mut session = SessionState::default();

    let mut modes = Vec::new();
    for _ in 0..6 {
        let decision = injector
            .decide("s1", &mut session, "hi", None, &config)
            .await
            .expect("decide");
        modes.push(injected_mode(decision).expect("certain scenarios always fire"));
    }
    assert_eq!(
        modes,
        vec!["canned_a", "canned_b", "canned_a", "canned_b", "canned_a", "canned_b"],
    );
}

#[tokio::test]
async fn sole_enabled_scenario_in_its_category_may_repeat() {
    let catalog = ScenarioCatalog::new();
    catalog
        .register(quality_scenario("canned_solo", 1.0))
        .expect("register");
    let injector = FailureInjector::with_seed(catalog, Arc::new(MemoryStateStore::new()), 7);
    let config = probabilistic(1.0, 0);
    let mut session = SessionState::default();

    for _ in 0..5 {
        let decision = injector
            .decide("s1", &mut session, "hi", None, &config)
            .await
            .expect("decide");
        assert_eq!(injected_mode(decision).as_deref(), Some("canned_solo"));
    }
}

#[tokio::test]
async fn loop_streak_resets_below_threshold_and_sticks_at_it() {
    let injector = injector_with(vec!["infinite_loop"], 7);
    // Multiplier clamps the loop probability to 1.0, so eligibility is the
    // only thing standing between a trigger turn and an injection.
    let config = probabilistic(10.0, 0);
    let mut session = SessionState::default();

    // Two trigger turns, a neutral one, two more triggers: the streak never
    // reaches three consecutive, so nothing fires.
    let messages = [
        "it's not working",
        "still not working",
        "thanks, that helped",
        "hmm, not working again",
        "it's still broken",
    ];
    for message in messages {
        let decision = injector
            .decide("s1", &mut session, message, None, &config)
            .await
            .expect("decide");
        assert_eq!(decision, Decision::PassThrough, "fired early on {message:?}");
    }

    // Third consecutive trigger turn reaches the threshold.
    let decision = injector
        .decide("s1", &mut session, "same problem as before", None, &config)
        .await
        .expect("decide");
    assert_eq!(injected_mode(decision).as_deref(), Some("infinite_loop"));

    // At the threshold the streak is sticky: a neutral follow-up leaves the
    // scenario eligible and it fires again.
    let decision = injector
        .decide("s1", &mut session, "what do you suggest instead?", None, &config)
        .await
        .expect("decide");
    assert_eq!(injected_mode(decision).as_deref(), Some("infinite_loop"));
    assert_eq!(session.streak("infinite_loop"), 3);
}

#[tokio::test]
async fn livelock_win_stamps_the_session_stuck_once() {
    let injector = injector_with(vec!["stuck_pattern"], 7);
    let config = probabilistic(1.0, 0);
    let mut session = SessionState::default();

    let decision = injector
        .decide("s1", &mut session, "hi", Some("stuck_pattern"), &config)
        .await
        .expect("forced decide");
    let Decision::Injected(injection) = decision else {
        panic!("forced stuck_pattern must inject");
    };
    assert_eq!(injection.metadata["livelock"], serde_json::json!(true));
    let stamped = session.stuck_since.expect("livelock stamps stuck_since");

    // A second livelock win keeps the original stamp.
    injector
        .decide("s1", &mut session, "hi", Some("stuck_pattern"), &config)
        .await
        .expect("forced decide");
    assert_eq!(session.stuck_since, Some(stamped));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn convergence_tracks_configured_probability() {
    let catalog = ScenarioCatalog::new();
    catalog
        .register(quality_scenario("rare_canned", 0.05))
        .expect("register");
    let injector = FailureInjector::with_seed(catalog, Arc::new(MemoryStateStore::new()), 1234);
    let config = probabilistic(1.0, 0);

    let mut hits = 0_u32;
    for i in 0..10_000 {
        let mut session = SessionState::default();
        let decision = injector
            .decide(&format!("conv-{i}"), &mut session, "hi", None, &config)
            .await
            .expect("decide");
        if decision.is_injected() {
            hits += 1;
        }
    }
    // Binomial(10_000, 0.05): mean 500, sigma ~21.8.
    assert!(
        (400..=600).contains(&hits),
        "hit count {hits} strayed from the configured 5% rate"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_multiplier_doubles_the_effective_rate() {
    let catalog = ScenarioCatalog::new();
    catalog
        .register(quality_scenario("rare_canned", 0.05))
        .expect("register");
    let injector = FailureInjector::with_seed(catalog, Arc::new(MemoryStateStore::new()), 1234);
    let config = probabilistic(2.0, 0);

    let mut hits = 0_u32;
    for i in 0..10_000 {
        let mut session = SessionState::default();
        let decision = injector
            .decide(&format!("conv-{i}"), &mut session, "hi", None, &config)
            .await
            .expect("decide");
        if decision.is_injected() {
            hits += 1;
        }
    }
    // Effective rate 0.10: mean 1000, sigma ~30.
    assert!(
        (870..=1130).contains(&hits),
        "hit count {hits} strayed from the doubled 10% rate"
    );
}

#[tokio::test]
async fn zero_multiplier_silences_every_scenario() {
    let catalog = ScenarioCatalog::with_defaults();
    let injector = FailureInjector::with_seed(catalog, Arc::new(MemoryStateStore::new()), 7);
    let config = probabilistic(0.0, 0);

    for i in 0..500 {
        let mut session = SessionState::default();
        let decision = injector
            .decide(&format!("mute-{i}"), &mut session, "hi", None, &config)
            .await
            .expect("decide");
        assert_eq!(decision, Decision::PassThrough);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn seeded_harnesses_replay_identical_failure_sequences() {
    let mut runs = Vec::new();
    for _ in 0..2 {
        let harness = chaos_harness(99, 2.0, 0);
        shrink_timeout_delay(&harness);

        let backend = faultline::backend::SimulatedBackend::new();
        let mut modes = Vec::new();
        for i in 0..40 {
            let response = harness
                .process(
                    ChatRequest::new("replay", format!("message number {i}")),
                    &backend,
                )
                .await
                .expect("process");
            modes.push(response.failure_mode);
        }
        runs.push(modes);
    }
    assert_eq!(runs[0], runs[1]);
}
