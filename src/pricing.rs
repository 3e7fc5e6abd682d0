//! Cost computation from model pricing and usage.
//!
//! Estimated cost gates admission before a call; actual cost is recomputed
//! from reported usage afterwards. Both are deterministic given the same
//! pricing and usage inputs.

use crate::config::{ModelSpec, UnitType};
use crate::types::{GenConfig, TokenUsage};

/// Conservative input-token estimate for a text payload.
///
/// One token per three characters over-counts for most Latin-script text and
/// roughly matches CJK, which keeps the pre-check estimate an upper bound.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() as u64) / 3 + 1
}

/// Estimated cost of a pending call, used for the budget pre-check.
pub fn estimated_cost(spec: &ModelSpec, input_tokens: u64, options: &GenConfig) -> f64 {
    let p = &spec.pricing;
    match spec.unit_type {
        UnitType::Token => {
            let input = input_tokens as f64 / 1_000_000.0 * p.input_per_1m;
            let output =
                f64::from(options.effective_max_output_tokens()) / 1_000_000.0 * p.output_per_1m;
            input + output
        }
        UnitType::Image => {
            // One image per call; actuals refine this after the response.
            p.per_image.unwrap_or(0.0)
        }
        UnitType::AudioSecond => {
            // Without a duration hint, assume a minute of audio.
            p.per_second.unwrap_or(0.0) * 60.0
        }
        UnitType::Character => {
            // TTS-style billing; chars reconstructed from the token estimate.
            input_tokens as f64 * 3.0 / 1_000_000.0 * p.per_character.unwrap_or(0.0)
        }
    }
}

/// Actual cost computed from reported usage.
///
/// Callers fall back to the pre-check estimate when `usage.known` is false;
/// this function assumes the usage is trustworthy.
pub fn actual_cost(spec: &ModelSpec, usage: &TokenUsage) -> f64 {
    let p = &spec.pricing;
    match spec.unit_type {
        UnitType::Token => {
            usage.input_tokens as f64 / 1_000_000.0 * p.input_per_1m
                + usage.output_tokens as f64 / 1_000_000.0 * p.output_per_1m
        }
        UnitType::Image => {
            p.per_image.unwrap_or(0.0) * f64::from(usage.images.unwrap_or(0))
        }
        UnitType::AudioSecond => {
            p.per_second.unwrap_or(0.0) * usage.audio_seconds.unwrap_or(0.0)
        }
        UnitType::Character => {
            usage.tts_characters.unwrap_or(0) as f64 / 1_000_000.0
                * p.per_character.unwrap_or(0.0)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Property-based tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::config::Pricing;
    use proptest::prelude::*;

    fn usage_strategy() -> impl Strategy<Value = TokenUsage> {
        (0u64..1_000_000, 0u64..1_000_000).prop_map(|(input, output)| TokenUsage::tokens(input, output))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Cost is non-negative, finite, and doubles with doubled usage.
        #[test]
        fn prop_actual_cost_scales_linearly(
            usage in usage_strategy(),
            input_rate in 0.0f64..100.0,
            output_rate in 0.0f64..100.0,
        ) {
            let spec = ModelSpec {
                pricing: Pricing {
                    input_per_1m: input_rate,
                    output_per_1m: output_rate,
                    ..Default::default()
                },
                ..Default::default()
            };

            let cost = actual_cost(&spec, &usage);
            prop_assert!(cost >= 0.0);
            prop_assert!(cost.is_finite());

            let doubled = TokenUsage::tokens(usage.input_tokens * 2, usage.output_tokens * 2);
            let double_cost = actual_cost(&spec, &doubled);
            prop_assert!((double_cost - cost * 2.0).abs() < 1e-9);
        }

        /// Recomputing cost from the same usage is deterministic.
        #[test]
        fn prop_actual_cost_is_deterministic(usage in usage_strategy()) {
            let spec = ModelSpec {
                pricing: Pricing {
                    input_per_1m: 1.2,
                    output_per_1m: 6.0,
                    ..Default::default()
                },
                ..Default::default()
            };
            prop_assert_eq!(actual_cost(&spec, &usage), actual_cost(&spec, &usage));
        }

        /// The text estimator never under-counts relative to chars/4 (the
        /// common provider rule of thumb), keeping estimates an upper bound.
        #[test]
        fn prop_estimate_tokens_is_conservative(text in ".{0,400}") {
            let est = estimate_tokens(&text);
            let chars = text.chars().count() as u64;
            prop_assert!(est >= chars / 4);
            prop_assert!(est <= chars + 1);
        }
    }
}
