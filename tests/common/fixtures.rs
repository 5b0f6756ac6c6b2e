#![allow(dead_code)]

use chrono::Duration;

use faultline::config::{HarnessConfig, InjectionConfig};
use faultline::harness::Harness;
use faultline::scenario::{
    DelayRange, FailureScenario, IntegrationParams, OutputQualityParams, ScenarioParams,
};

/// Injection config with the probabilistic path switched on.
pub fn probabilistic(rate_multiplier: f64, cooldown_secs: i64) -> InjectionConfig {
    InjectionConfig::default()
        .with_probabilistic(true)
        .with_rate_multiplier(rate_multiplier)
        .with_cooldown(Duration::seconds(cooldown_secs))
}

/// In-memory harness over the stock catalog with a fixed injection seed.
pub fn seeded_harness(seed: u64) -> Harness {
    Harness::in_memory(HarnessConfig::default()).with_injection_seed(seed)
}

/// Seeded harness with probabilistic injection dialed up for chaos runs.
pub fn chaos_harness(seed: u64, rate_multiplier: f64, cooldown_secs: i64) -> Harness {
    let config =
        HarnessConfig::default().with_injection(probabilistic(rate_multiplier, cooldown_secs));
    Harness::in_memory(config).with_injection_seed(seed)
}

/// Rewrites `api_timeout` to a sub-10ms delay. Tests that can hit it
/// probabilistically call this so a win does not wait out the production
/// 5-15s window in real time.
pub fn shrink_timeout_delay(harness: &Harness) {
    harness
        .catalog()
        .update(
            "api_timeout",
            ScenarioParams::Integration(IntegrationParams {
                probability: 0.1,
                error_message: "External API request timed out".into(),
                delay_range: Some(DelayRange {
                    min_secs: 0.001,
                    max_secs: 0.01,
                }),
            }),
        )
        .expect("update api_timeout");
}

/// Minimal output-quality scenario with a single canned response, so tests
/// can tell exactly which scenario produced a given payload.
pub fn quality_scenario(name: &str, probability: f64) -> FailureScenario {
    FailureScenario::new(
        name,
        &format!("canned degradation '{name}'"),
        ScenarioParams::OutputQuality(OutputQualityParams {
            probability,
            responses: vec![format!("canned:{name}")],
        }),
    )
}
