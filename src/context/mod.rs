//! Context window monitoring.
//!
//! Watches the observed prompt-token usage reported on each terminal agent
//! event and decides when to warn the client and when to trigger history
//! compaction.

mod compactor;

pub use compactor::{is_summary_message, CompactReport, CompactionStrategy, Compactor};

/// Input/output budgets for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLimits {
    pub context_window: u64,
    pub max_output_tokens: u64,
}

/// Resolve limits from a model name. Unknown models get the conservative
/// default most large hosted models share today.
pub fn limits_for(model: &str) -> ModelLimits {
    let name = model.to_ascii_lowercase();
    if name.contains("haiku") {
        ModelLimits {
            context_window: 200_000,
            max_output_tokens: 8_192,
        }
    } else if name.contains("mini") || name.contains("small") {
        ModelLimits {
            context_window: 128_000,
            max_output_tokens: 16_000,
        }
    } else {
        ModelLimits {
            context_window: 200_000,
            max_output_tokens: 16_000,
        }
    }
}

/// Safety margin kept below the effective window before auto-compaction.
const COMPACT_MARGIN: u64 = 13_000;
/// Cap on how much of the window is reserved for the model's own output.
const OUTPUT_RESERVE_CAP: u64 = 20_000;

/// Derived trigger points for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextThresholds {
    pub context_window: u64,
    pub output_reserve: u64,
    pub effective_window: u64,
    pub auto_compact: u64,
    pub warning: u64,
}

impl ContextThresholds {
    /// Compute thresholds, honoring an optional override expressed as a
    /// percentage of the effective window. The override can lower the
    /// trigger but never push it past the safety margin.
    pub fn for_model(limits: ModelLimits, override_percent: Option<f64>) -> Self {
        let output_reserve = limits.max_output_tokens.min(OUTPUT_RESERVE_CAP);
        let effective_window = limits.context_window.saturating_sub(output_reserve);
        let ceiling = effective_window.saturating_sub(COMPACT_MARGIN);
        let auto_compact = match override_percent {
            Some(pct) => {
                let requested = (effective_window as f64 * (pct / 100.0)) as u64;
                requested.min(ceiling)
            }
            None => ceiling,
        };
        let warning = (limits.context_window as f64 * 0.85).floor() as u64;
        Self {
            context_window: limits.context_window,
            output_reserve,
            effective_window,
            auto_compact,
            warning,
        }
    }
}

/// What the monitor wants done after seeing a usage report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextCheck {
    pub input_tokens: u64,
    pub usage_percent: f64,
    pub warn: bool,
    pub compact: bool,
}

/// Compare observed usage against the thresholds.
pub fn check_usage(
    thresholds: &ContextThresholds,
    input_tokens: u64,
    auto_compact_enabled: bool,
) -> ContextCheck {
    let usage_percent = if thresholds.context_window == 0 {
        0.0
    } else {
        (input_tokens as f64 / thresholds.context_window as f64 * 1000.0).round() / 10.0
    };
    ContextCheck {
        input_tokens,
        usage_percent,
        warn: input_tokens >= thresholds.warning,
        compact: auto_compact_enabled && input_tokens >= thresholds.auto_compact,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_arithmetic() {
        // 200k window, 16k output cap: reserve 16k, effective 184k,
        // auto-compact 171k, warning 170k.
        let thresholds = ContextThresholds::for_model(
            ModelLimits {
                context_window: 200_000,
                max_output_tokens: 16_000,
            },
            None,
        );
        assert_eq!(thresholds.output_reserve, 16_000);
        assert_eq!(thresholds.effective_window, 184_000);
        assert_eq!(thresholds.auto_compact, 171_000);
        assert_eq!(thresholds.warning, 170_000);
    }

    #[test]
    fn test_output_reserve_is_capped() {
        let thresholds = ContextThresholds::for_model(
            ModelLimits {
                context_window: 200_000,
                max_output_tokens: 64_000,
            },
            None,
        );
        assert_eq!(thresholds.output_reserve, 20_000);
        assert_eq!(thresholds.effective_window, 180_000);
    }

    #[test]
    fn test_override_percent_clamped_to_margin() {
        let limits = ModelLimits {
            context_window: 200_000,
            max_output_tokens: 16_000,
        };
        // 50% of effective window: a genuinely lower trigger.
        let low = ContextThresholds::for_model(limits, Some(50.0));
        assert_eq!(low.auto_compact, 92_000);

        // 99% would land inside the margin; it is clamped to the ceiling.
        let high = ContextThresholds::for_model(limits, Some(99.0));
        assert_eq!(high.auto_compact, 171_000);
    }

    #[test]
    fn test_check_usage_warning_and_compaction() {
        let thresholds = ContextThresholds::for_model(
            ModelLimits {
                context_window: 200_000,
                max_output_tokens: 16_000,
            },
            None,
        );

        let quiet = check_usage(&thresholds, 100_000, true);
        assert!(!quiet.warn);
        assert!(!quiet.compact);

        let warn_only = check_usage(&thresholds, 170_500, true);
        assert!(warn_only.warn);
        assert!(!warn_only.compact);

        let both = check_usage(&thresholds, 190_000, true);
        assert!(both.warn);
        assert!(both.compact);
        assert_eq!(both.usage_percent, 95.0);

        let disabled = check_usage(&thresholds, 190_000, false);
        assert!(disabled.warn);
        assert!(!disabled.compact);
    }

    #[test]
    fn test_limits_catalog_defaults() {
        let unknown = limits_for("some-new-model");
        assert_eq!(unknown.context_window, 200_000);
        let haiku = limits_for("claude-haiku-x");
        assert_eq!(haiku.max_output_tokens, 8_192);
    }
}
