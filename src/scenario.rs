/*!
Failure scenario definitions: categories, typed parameter bags, and the
built-in catalog.

Every scenario belongs to one of four categories, and the shape of its
parameter bag follows the category. Parameters are validated whenever a
scenario enters the catalog (registration or update) so decision-time code can
rely on them unconditionally: probabilities are clamped-range checked, canned
template sets are non-empty, delay ranges are ordered, and livelock thresholds
are unsatisfiable by construction.

[`default_scenarios`] seeds the catalog with the eleven stock failure modes.
*/

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The four failure categories, in decision-priority order.
///
/// The declaration order here is load-bearing: the probabilistic decision path
/// evaluates scenarios category by category in exactly this order (derived
/// `Ord`), so output-quality scenarios always get the first draw and resource
/// scenarios the last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Plausible-but-wrong answers: hallucination, broken reasoning, topic drift.
    OutputQuality,
    /// Conversational pathologies: clarification loops, perfectionist stalls.
    Behavioral,
    /// Simulated upstream faults: timeouts, auth failures, 503s.
    Integration,
    /// Simulated resource exhaustion: token limits, memory, rate limits.
    Resource,
}

impl FailureCategory {
    /// All categories in decision-priority order.
    pub const ALL: [FailureCategory; 4] = [
        FailureCategory::OutputQuality,
        FailureCategory::Behavioral,
        FailureCategory::Integration,
        FailureCategory::Resource,
    ];

    /// Stable snake_case name, matching the serialized form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::OutputQuality => "output_quality",
            FailureCategory::Behavioral => "behavioral",
            FailureCategory::Integration => "integration",
            FailureCategory::Resource => "resource",
        }
    }

    /// Parses the snake_case name produced by [`FailureCategory::as_str`].
    #[must_use]
    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "output_quality" => Some(FailureCategory::OutputQuality),
            "behavioral" => Some(FailureCategory::Behavioral),
            "integration" => Some(FailureCategory::Integration),
            "resource" => Some(FailureCategory::Resource),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected scenario parameters. Raised at registration/update time, before
/// any catalog state changes.
#[derive(Debug, Clone, PartialEq, Error, Diagnostic)]
pub enum ValidationError {
    #[error("scenario name may not be empty")]
    #[diagnostic(
        code(faultline::scenario::empty_name),
        help("Give the scenario a unique, non-empty name.")
    )]
    EmptyName,

    #[error("probability {value} is outside [0, 1]")]
    #[diagnostic(
        code(faultline::scenario::probability_out_of_range),
        help("Base probabilities must lie in [0, 1]; the rate multiplier is applied later.")
    )]
    ProbabilityOutOfRange { value: f64 },

    #[error("canned response set may not be empty")]
    #[diagnostic(
        code(faultline::scenario::empty_responses),
        help("Output-quality and behavioral scenarios need at least one template to emit.")
    )]
    EmptyResponses,

    #[error("error message may not be empty")]
    #[diagnostic(code(faultline::scenario::empty_error_message))]
    EmptyErrorMessage,

    #[error("delay range {min_secs}s..={max_secs}s is invalid")]
    #[diagnostic(
        code(faultline::scenario::invalid_delay_range),
        help("Delay bounds must be finite, positive, and ordered min <= max.")
    )]
    InvalidDelayRange { min_secs: f64, max_secs: f64 },

    #[error("max_iterations must be at least 1")]
    #[diagnostic(code(faultline::scenario::zero_iterations))]
    ZeroIterations,

    #[error("trigger phrase set may not be empty")]
    #[diagnostic(
        code(faultline::scenario::empty_trigger_phrases),
        help("Loop detection needs at least one phrase to match against inbound messages.")
    )]
    EmptyTriggerPhrases,

    #[error("confidence value {value} is outside [0, 1]")]
    #[diagnostic(code(faultline::scenario::confidence_out_of_range))]
    ConfidenceOutOfRange { value: f64 },

    #[error("confidence {confidence} does not stay below perfectionism threshold {threshold}")]
    #[diagnostic(
        code(faultline::scenario::satisfiable_livelock),
        help(
            "A livelock scenario must be unsatisfiable by construction: \
             keep confidence strictly below the perfectionism threshold."
        )
    )]
    SatisfiableLivelock { confidence: f64, threshold: f64 },

    #[error("limit must be positive")]
    #[diagnostic(code(faultline::scenario::zero_limit))]
    ZeroLimit,
}

/// Loop-detection parameters for behavioral scenarios.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoopParams {
    /// Consecutive trigger-phrase turns required before the mode may fire.
    pub max_iterations: u32,
    /// Case-insensitive substrings matched against inbound user messages.
    pub trigger_phrases: Vec<String>,
}

/// Livelock parameters for behavioral scenarios. Validation guarantees
/// `confidence < perfectionism_threshold`, so the bar is never met and the
/// scenario withholds progress until the session is reset.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LivelockParams {
    pub confidence: f64,
    pub perfectionism_threshold: f64,
}

/// Synthetic delay bounds in seconds, inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputQualityParams {
    pub probability: f64,
    /// Plausible-but-false statements substituted for the genuine answer.
    pub responses: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BehavioralParams {
    pub probability: f64,
    /// Clarification requests or refusals emitted in place of progress.
    pub responses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_detection: Option<LoopParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub livelock: Option<LivelockParams>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntegrationParams {
    pub probability: f64,
    pub error_message: String,
    /// Present on timeout-style scenarios: the synthetic wait the caller must
    /// honor without blocking a worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_range: Option<DelayRange>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceParams {
    pub probability: f64,
    pub error_message: String,
    /// Configured ceiling (tokens, requests, ...) echoed into payload metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

/// Category-shaped scenario parameters.
///
/// Serialized form is internally tagged on `category`, so a persisted
/// parameter bag is self-describing:
///
/// ```
/// use faultline::scenario::{ScenarioParams, OutputQualityParams};
///
/// let params = ScenarioParams::OutputQuality(OutputQualityParams {
///     probability: 0.3,
///     responses: vec!["made up".into()],
/// });
/// let json = serde_json::to_value(&params).unwrap();
/// assert_eq!(json["category"], "output_quality");
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum ScenarioParams {
    OutputQuality(OutputQualityParams),
    Behavioral(BehavioralParams),
    Integration(IntegrationParams),
    Resource(ResourceParams),
}

impl ScenarioParams {
    /// The category this parameter bag belongs to.
    #[must_use]
    pub fn category(&self) -> FailureCategory {
        match self {
            ScenarioParams::OutputQuality(_) => FailureCategory::OutputQuality,
            ScenarioParams::Behavioral(_) => FailureCategory::Behavioral,
            ScenarioParams::Integration(_) => FailureCategory::Integration,
            ScenarioParams::Resource(_) => FailureCategory::Resource,
        }
    }

    /// Base probability before the global rate multiplier is applied.
    #[must_use]
    pub fn probability(&self) -> f64 {
        match self {
            ScenarioParams::OutputQuality(p) => p.probability,
            ScenarioParams::Behavioral(p) => p.probability,
            ScenarioParams::Integration(p) => p.probability,
            ScenarioParams::Resource(p) => p.probability,
        }
    }

    /// Canned response templates, for categories that substitute text.
    #[must_use]
    pub fn responses(&self) -> Option<&[String]> {
        match self {
            ScenarioParams::OutputQuality(p) => Some(&p.responses),
            ScenarioParams::Behavioral(p) => Some(&p.responses),
            _ => None,
        }
    }

    /// Loop-detection parameters, if this is a loop scenario.
    #[must_use]
    pub fn loop_detection(&self) -> Option<&LoopParams> {
        match self {
            ScenarioParams::Behavioral(p) => p.loop_detection.as_ref(),
            _ => None,
        }
    }

    /// Livelock parameters, if this is a stuck scenario.
    #[must_use]
    pub fn livelock(&self) -> Option<LivelockParams> {
        match self {
            ScenarioParams::Behavioral(p) => p.livelock,
            _ => None,
        }
    }

    /// Validates the bag against its category's schema.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let p = self.probability();
        if !(0.0..=1.0).contains(&p) || !p.is_finite() {
            return Err(ValidationError::ProbabilityOutOfRange { value: p });
        }
        match self {
            ScenarioParams::OutputQuality(params) => {
                if params.responses.is_empty() {
                    return Err(ValidationError::EmptyResponses);
                }
            }
            ScenarioParams::Behavioral(params) => {
                if params.responses.is_empty() {
                    return Err(ValidationError::EmptyResponses);
                }
                if let Some(loop_params) = &params.loop_detection {
                    if loop_params.max_iterations == 0 {
                        return Err(ValidationError::ZeroIterations);
                    }
                    if loop_params.trigger_phrases.is_empty() {
                        return Err(ValidationError::EmptyTriggerPhrases);
                    }
                }
                if let Some(livelock) = params.livelock {
                    for value in [livelock.confidence, livelock.perfectionism_threshold] {
                        if !(0.0..=1.0).contains(&value) || !value.is_finite() {
                            return Err(ValidationError::ConfidenceOutOfRange { value });
                        }
                    }
                    if livelock.confidence >= livelock.perfectionism_threshold {
                        return Err(ValidationError::SatisfiableLivelock {
                            confidence: livelock.confidence,
                            threshold: livelock.perfectionism_threshold,
                        });
                    }
                }
            }
            ScenarioParams::Integration(params) => {
                if params.error_message.is_empty() {
                    return Err(ValidationError::EmptyErrorMessage);
                }
                if let Some(range) = params.delay_range {
                    let ordered = range.min_secs > 0.0
                        && range.min_secs <= range.max_secs
                        && range.min_secs.is_finite()
                        && range.max_secs.is_finite();
                    if !ordered {
                        return Err(ValidationError::InvalidDelayRange {
                            min_secs: range.min_secs,
                            max_secs: range.max_secs,
                        });
                    }
                }
            }
            ScenarioParams::Resource(params) => {
                if params.error_message.is_empty() {
                    return Err(ValidationError::EmptyErrorMessage);
                }
                if params.limit == Some(0) {
                    return Err(ValidationError::ZeroLimit);
                }
            }
        }
        Ok(())
    }
}

/// A named, runtime-mutable failure scenario.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureScenario {
    /// Unique name; the identifier used by forced injection and audit records.
    pub name: String,
    /// Human-readable summary of what the scenario simulates.
    pub description: String,
    pub params: ScenarioParams,
    /// Disabled scenarios stay listable but are never selected.
    pub enabled: bool,
}

impl FailureScenario {
    /// Creates an enabled scenario.
    #[must_use]
    pub fn new(name: &str, description: &str, params: ScenarioParams) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            params,
            enabled: true,
        }
    }

    /// Sets the enabled flag, builder style.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn category(&self) -> FailureCategory {
        self.params.category()
    }

    #[must_use]
    pub fn probability(&self) -> f64 {
        self.params.probability()
    }

    /// Validates name and parameters.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        self.params.validate()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// The eleven stock scenarios the engine ships with.
///
/// Probabilities, template texts, delay bounds, and thresholds follow the
/// long-standing defaults; tweak per deployment through the catalog's update
/// operations rather than by editing this table.
#[must_use]
pub fn default_scenarios() -> Vec<FailureScenario> {
    vec![
        FailureScenario::new(
            "hallucination",
            "Confidently asserts fabricated facts in place of the genuine answer.",
            ScenarioParams::OutputQuality(OutputQualityParams {
                probability: 0.3,
                responses: strings(&[
                    "Our premium service includes quantum encryption and time-travel backup features.",
                    "According to the recent study by the Institute of Digital Wellness (which doesn't exist), 95% of users prefer this approach.",
                    "This feature was actually invented by Steve Jobs in 2025 during his posthumous innovation period.",
                    "The algorithm uses advanced AI trained on data from parallel universes to ensure accuracy.",
                ]),
            }),
        ),
        FailureScenario::new(
            "incorrect_reasoning",
            "Draws confident conclusions from broken causal logic.",
            ScenarioParams::OutputQuality(OutputQualityParams {
                probability: 0.25,
                responses: strings(&[
                    "Since you're having login issues, you should definitely delete your account and create a new one.",
                    "The best way to fix network connectivity is to increase your password complexity.",
                    "If the application is slow, try using it on a different day of the week.",
                    "This error occurs because your computer's time zone is incompatible with our servers.",
                ]),
            }),
        ),
        FailureScenario::new(
            "off_topic",
            "Drifts away from the question into unrelated chatter.",
            ScenarioParams::OutputQuality(OutputQualityParams {
                probability: 0.2,
                responses: strings(&[
                    "That reminds me of a great recipe for chocolate chip cookies! Would you like me to share it?",
                    "Speaking of your technical issue, have you considered taking up meditation? It really helps with stress.",
                    "You know, the weather has been quite unpredictable lately. How's the weather where you are?",
                    "This is similar to my favorite movie plot. Have you seen The Matrix? It's all about questioning reality.",
                ]),
            }),
        ),
        FailureScenario::new(
            "infinite_loop",
            "Keeps asking for clarification instead of making progress once the \
             user has repeated themselves enough times.",
            ScenarioParams::Behavioral(BehavioralParams {
                probability: 0.2,
                responses: strings(&[
                    "Could you please clarify what you mean by that?",
                    "I need a bit more information to help you better.",
                    "Can you provide more details about your specific situation?",
                    "To better assist you, could you elaborate on your request?",
                ]),
                loop_detection: Some(LoopParams {
                    max_iterations: 3,
                    trigger_phrases: strings(&[
                        "not working",
                        "doesn't work",
                        "same problem",
                        "still broken",
                        "try again",
                    ]),
                }),
                livelock: None,
            }),
        ),
        FailureScenario::new(
            "stuck_pattern",
            "Withholds any definitive action because its confidence can never \
             reach the perfectionism bar; terminal for the session until reset.",
            ScenarioParams::Behavioral(BehavioralParams {
                probability: 0.15,
                responses: strings(&[
                    "I'm not comfortable making assumptions about your specific use case.",
                    "This seems like it might require specialized knowledge that I don't possess.",
                    "I'd rather not guess at the solution - you should contact a human expert.",
                    "This is beyond my capabilities and I cannot provide useful assistance.",
                ]),
                loop_detection: None,
                livelock: Some(LivelockParams {
                    confidence: 0.6,
                    perfectionism_threshold: 0.95,
                }),
            }),
        ),
        FailureScenario::new(
            "api_timeout",
            "Simulates an upstream API that never answers within the deadline.",
            ScenarioParams::Integration(IntegrationParams {
                probability: 0.1,
                error_message: "External API request timed out".to_string(),
                delay_range: Some(DelayRange {
                    min_secs: 5.0,
                    max_secs: 15.0,
                }),
            }),
        ),
        FailureScenario::new(
            "auth_error",
            "Simulates rejected credentials against an upstream dependency.",
            ScenarioParams::Integration(IntegrationParams {
                probability: 0.08,
                error_message: "Authentication failed: Invalid API key".to_string(),
                delay_range: None,
            }),
        ),
        FailureScenario::new(
            "service_unavailable",
            "Simulates an upstream dependency answering 503.",
            ScenarioParams::Integration(IntegrationParams {
                probability: 0.12,
                error_message: "Service temporarily unavailable: 503 Service Unavailable"
                    .to_string(),
                delay_range: None,
            }),
        ),
        FailureScenario::new(
            "token_limit",
            "Simulates running out of context-window budget.",
            ScenarioParams::Resource(ResourceParams {
                probability: 0.05,
                error_message: "Token limit exceeded".to_string(),
                limit: Some(1000),
            }),
        ),
        FailureScenario::new(
            "memory_exhaustion",
            "Simulates the service running out of memory mid-request.",
            ScenarioParams::Resource(ResourceParams {
                probability: 0.03,
                error_message: "Memory limit exceeded: Unable to process request".to_string(),
                limit: None,
            }),
        ),
        FailureScenario::new(
            "rate_limiting",
            "Simulates the caller being throttled.",
            ScenarioParams::Resource(ResourceParams {
                probability: 0.07,
                error_message: "Rate limit exceeded: Please try again later".to_string(),
                limit: None,
            }),
        ),
    ]
}
