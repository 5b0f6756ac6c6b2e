//! Failure Drill: End-to-End Harness Walkthrough
//!
//! This demonstration exercises the full injection pipeline against the
//! built-in simulated backend. It covers clean passthrough traffic, forced
//! failure modes, checkpoint rollback, probabilistic injection, recovery
//! tracking, and the audit analytics views.
//!
//! What You'll See:
//! 1. Passthrough Traffic: natural answers with a clean audit trail
//! 2. Forced Injection: deterministic failure modes on demand
//! 3. Scenario Tuning: shrinking the api_timeout delay at runtime
//! 4. Checkpoint Rollback: rewinding a session to a tagged snapshot
//! 5. Probabilistic Mode: seeded random injection with cooldown disabled
//! 6. Recovery Tracking: attempts logged against a failed interaction
//! 7. Analytics: failure counts, status distribution, health snapshot
//!
//! Running This Demo:
//! ```bash
//! cargo run --example failure_drill
//! ```

use chrono::Duration;
use miette::{IntoDiagnostic, Result, miette};
use serde_json::json;
use tracing::info;
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use faultline::backend::SimulatedBackend;
use faultline::config::{HarnessConfig, InjectionConfig};
use faultline::harness::{ChatRequest, Harness};
use faultline::scenario::{DelayRange, IntegrationParams, ScenarioParams};

fn init_tracing() {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,faultline=info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn init_miette() {
    // Pretty panic reports
    miette::set_panic_hook();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_miette();
    drill().await
}

async fn drill() -> Result<()> {
    info!("\n╔══════════════════════════════════════════════════════════╗");
    info!("║                      Failure Drill                       ║");
    info!("║            Injection Pipeline, End to End                ║");
    info!("╚══════════════════════════════════════════════════════════╝\n");

    let harness = Harness::in_memory(HarnessConfig::default()).with_injection_seed(2024);
    let backend = SimulatedBackend::new();

    // ✅ STEP 1: Clean passthrough traffic
    info!("💬 Step 1: Passthrough traffic (probabilistic mode off)");

    let first = harness
        .process(
            ChatRequest::new("drill-session", "How do I rotate my API credentials?"),
            &backend,
        )
        .await?;
    info!("   ✓ Status: {} (natural: {})", first.status, first.natural_status);
    info!("   ✓ Injection applied: {}", first.failure_injection_applied);
    info!("   ✓ Response: {}", first.response);

    let second = harness
        .process(
            ChatRequest::new("drill-session", "And where do I find the audit log?"),
            &backend,
        )
        .await?;
    info!("   ✓ Second turn recorded, {} tokens", second.token_count);

    // ✅ STEP 2: Forced hallucination against an ephemeral test session
    info!("\n🎭 Step 2: Forcing a hallucination");

    let forced = harness
        .test_failure("hallucination", "What does the premium plan include?", &backend)
        .await?;
    info!("   ✓ Test session: {}", forced.session_id);
    info!("   ✓ Observed status: {}", forced.status);
    info!("   ✓ Natural status:  {}", forced.natural_status);
    info!("   ✓ Injected answer: {}", forced.response);
    info!(
        "   ✓ Genuine answer (preserved): {}",
        forced
            .natural_response
            .as_deref()
            .unwrap_or("<missing — this would be a bug>")
    );

    // ✅ STEP 3: Tune api_timeout down to drill-friendly delays, then force it
    info!("\n⏱️  Step 3: Forcing a (shortened) api_timeout");

    harness
        .update_scenario(
            "api_timeout",
            ScenarioParams::Integration(IntegrationParams {
                probability: 0.1,
                error_message: "External API request timed out".to_string(),
                delay_range: Some(DelayRange {
                    min_secs: 0.2,
                    max_secs: 0.5,
                }),
            }),
        )
        .await?;
    info!("   ✓ api_timeout delay range shrunk to 0.2s..=0.5s");

    let timed_out = harness
        .process(
            ChatRequest::new("drill-session", "Can you fetch my usage report?")
                .with_failure_mode("api_timeout"),
            &backend,
        )
        .await?;
    info!("   ✓ Observed status: {}", timed_out.status);
    info!("   ✓ Took {}ms end to end", timed_out.processing_time_ms);
    info!("   ✓ Message: {}", timed_out.response);

    // ✅ STEP 4: Checkpoint, damage, rollback
    info!("\n📸 Step 4: Checkpoint rollback");

    let checkpoint = harness
        .checkpoints()
        .capture("drill-session", "before_incident")
        .await?;
    info!(
        "   ✓ Captured {:?} with {} turns",
        checkpoint.tag,
        checkpoint.state.turns.len()
    );

    harness
        .process(
            ChatRequest::new("drill-session", "Please escalate this ticket.")
                .with_failure_mode("service_unavailable"),
            &backend,
        )
        .await?;
    info!("   ✓ Injected a service_unavailable turn on top");

    let restored = harness
        .rollback_session("drill-session", "before_incident")
        .await?;
    info!(
        "   ✓ Rolled back to {} turns (checkpoint stays restorable)",
        restored.state.turns.len()
    );

    // ✅ STEP 5: Probabilistic mode with the cooldown disabled
    info!("\n🎲 Step 5: Probabilistic injection (seeded, cooldown off)");

    let chaos_config = HarnessConfig::default().with_injection(
        InjectionConfig::default()
            .with_probabilistic(true)
            .with_rate_multiplier(2.0)
            .with_cooldown(Duration::seconds(0)),
    );
    let chaos = Harness::in_memory(chaos_config).with_injection_seed(7);

    let mut injected_modes = Vec::new();
    for turn in 0..30 {
        let response = chaos
            .process(
                ChatRequest::new("chaos-session", format!("Status update number {turn}, please.")),
                &backend,
            )
            .await?;
        if let Some(mode) = response.failure_mode {
            injected_modes.push(mode);
        }
    }
    info!(
        "   ✓ {} of 30 turns were injected: {:?}",
        injected_modes.len(),
        injected_modes
    );

    // ✅ STEP 6: Recovery tracking against the timeout interaction
    info!("\n🛠️  Step 6: Recovery tracking");

    let interaction_id = timed_out
        .metadata
        .get("interaction_id")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| miette!("interaction id missing from response metadata"))?
        .to_string();

    harness
        .recovery()
        .record_attempt(
            &interaction_id,
            "retry",
            false,
            None,
            Some("first retry hit the same simulated timeout"),
        )
        .await?;
    harness
        .recovery()
        .record_attempt(
            &interaction_id,
            "rollback",
            true,
            Some(json!({ "checkpoint": "before_incident" })),
            None,
        )
        .await?;

    let status = harness.recovery().recovery_status(&interaction_id).await?;
    info!(
        "   ✓ {} attempts, recovered: {}, winning strategy: {:?}",
        status.attempts, status.recovered, status.successful_strategy
    );

    // ✅ STEP 7: Analytics and health
    info!("\n📈 Step 7: Analytics");

    let analytics = harness.failure_analytics(24).await?;
    info!(
        "   ✓ {} interactions in the last 24h",
        analytics.total_interactions
    );
    info!("   ✓ Failure counts: {:?}", analytics.failure_counts);
    info!("   ✓ Status distribution: {:?}", analytics.status_distribution);
    info!(
        "   ✓ Average processing time: {:.1}ms",
        analytics.average_processing_time_ms
    );

    let history = harness.session_history("drill-session", 10).await?;
    info!("   ✓ drill-session history holds {} records", history.len());
    let json_history = serde_json::to_string_pretty(&history).into_diagnostic()?;
    info!("   ✓ Newest record:\n{}", json_history.lines().take(8).collect::<Vec<_>>().join("\n"));

    let health = harness.health().await;
    info!(
        "   ✓ Health: {} ({}/{} scenarios enabled, up {}s)",
        health.status, health.enabled_scenario_count, health.scenario_count, health.uptime_secs
    );

    info!("\n╔══════════════════════════════════════════════════════════╗");
    info!("║                   Failure Drill Complete                 ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    info!("\n✅ Covered:");
    info!("   • Passthrough vs forced vs probabilistic decisions");
    info!("   • Natural responses preserved alongside injected ones");
    info!("   • Runtime scenario tuning through the catalog");
    info!("   • Checkpoint capture and repeatable rollback");
    info!("   • Recovery attempts tied to audit records");
    info!("   • Failure analytics over the audit trail");

    Ok(())
}
