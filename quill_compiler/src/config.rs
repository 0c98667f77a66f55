//! Translator configuration aggregated from defaults and environment variables.
//!
//! A single struct that captures every translation setting, resolved once and
//! then read without per-instruction cost.

// =============================================================================
// Translator Configuration
// =============================================================================

/// Complete translator configuration.
///
/// Immutable after construction; the translator only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatorConfig {
    /// Narrow call and operator results through overload resolution.
    pub specialize: bool,

    /// Treat unknown global names as the builtins they shadow.
    pub assume_builtins: bool,

    /// Expand `SETUP_WITH` into explicit hook lookups and calls.
    pub desugar_with: bool,

    /// Override for the dataflow step bound.
    pub max_dataflow_steps: Option<u64>,

    /// Environment variables were ignored (`QUILL_IGNORE_ENVIRONMENT`).
    pub ignore_environment: bool,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            specialize: true,
            assume_builtins: true,
            desugar_with: true,
            max_dataflow_steps: None,
            ignore_environment: false,
        }
    }
}

impl TranslatorConfig {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Resolve configuration through an arbitrary variable lookup.
    ///
    /// Every other variable is skipped when `QUILL_IGNORE_ENVIRONMENT` is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let env_bool = |var: &str| lookup(var).is_some_and(|v| !v.is_empty() && v != "0");

        if env_bool("QUILL_IGNORE_ENVIRONMENT") {
            return Self {
                ignore_environment: true,
                ..defaults
            };
        }

        Self {
            specialize: defaults.specialize && !env_bool("QUILL_NO_SPECIALIZE"),
            assume_builtins: defaults.assume_builtins && !env_bool("QUILL_NO_BUILTINS"),
            desugar_with: defaults.desugar_with && !env_bool("QUILL_NO_WITH_DESUGAR"),
            max_dataflow_steps: lookup("QUILL_MAX_DATAFLOW_STEPS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|&n| n > 0),
            ignore_environment: false,
        }
    }

    /// Enable or disable specialization.
    pub fn with_specialize(mut self, on: bool) -> Self {
        self.specialize = on;
        self
    }

    /// Enable or disable builtin name assumptions.
    pub fn with_assume_builtins(mut self, on: bool) -> Self {
        self.assume_builtins = on;
        self
    }

    /// Enable or disable `with` desugaring.
    pub fn with_desugar_with(mut self, on: bool) -> Self {
        self.desugar_with = on;
        self
    }

    /// Override the dataflow step bound.
    pub fn with_max_dataflow_steps(mut self, steps: u64) -> Self {
        self.max_dataflow_steps = Some(steps);
        self
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: FxHashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = TranslatorConfig::from_lookup(lookup(&[]));
        assert_eq!(config, TranslatorConfig::default());
        assert!(config.specialize);
        assert!(config.desugar_with);
    }

    #[test]
    fn test_env_flags_disable_features() {
        let config = TranslatorConfig::from_lookup(lookup(&[
            ("QUILL_NO_SPECIALIZE", "1"),
            ("QUILL_NO_WITH_DESUGAR", "yes"),
            ("QUILL_MAX_DATAFLOW_STEPS", "500"),
        ]));
        assert!(!config.specialize);
        assert!(config.assume_builtins);
        assert!(!config.desugar_with);
        assert_eq!(config.max_dataflow_steps, Some(500));
    }

    #[test]
    fn test_zero_and_empty_are_false() {
        let config = TranslatorConfig::from_lookup(lookup(&[
            ("QUILL_NO_SPECIALIZE", "0"),
            ("QUILL_NO_BUILTINS", ""),
            ("QUILL_MAX_DATAFLOW_STEPS", "0"),
        ]));
        assert!(config.specialize);
        assert!(config.assume_builtins);
        assert_eq!(config.max_dataflow_steps, None);
    }

    #[test]
    fn test_ignore_environment_blocks_env_vars() {
        let config = TranslatorConfig::from_lookup(lookup(&[
            ("QUILL_IGNORE_ENVIRONMENT", "1"),
            ("QUILL_NO_SPECIALIZE", "1"),
        ]));
        assert!(config.ignore_environment);
        assert!(config.specialize);
    }

    #[test]
    fn test_builder_setters() {
        let config = TranslatorConfig::default()
            .with_specialize(false)
            .with_max_dataflow_steps(10);
        assert!(!config.specialize);
        assert_eq!(config.max_dataflow_steps, Some(10));
    }
}
