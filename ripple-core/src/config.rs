//! Engine Configuration
//!
//! Settings that change how a [`Runtime`](crate::reactive::Runtime) settles
//! batches. Every field has a default, so a configuration file only needs to
//! name the settings it overrides.
//!
//! ```rust,ignore
//! let config = EngineConfig::from_json(r#"{ "derivation_policy": "eager" }"#)?;
//! let runtime = Runtime::with_config(config)?;
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Default number of settle passes a single commit may take.
pub const DEFAULT_MAX_REBATCH_PASSES: usize = 25;

/// When affected derivations are recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivationPolicy {
    /// Invalidate on commit, recompute on the next `get()`.
    #[default]
    Lazy,

    /// Invalidate on commit and recompute every previously-computed
    /// derivation in dependency order before effects run.
    Eager,
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Extra settle passes a commit may take after its first one before it
    /// aborts with `RunawayBatch`.
    pub max_rebatch_passes: usize,

    /// Recompute policy for invalidated derivations.
    pub derivation_policy: DerivationPolicy,

    /// Log a warning when a computation reads a cell it did not declare.
    pub warn_undeclared_reads: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rebatch_passes: DEFAULT_MAX_REBATCH_PASSES,
            derivation_policy: DerivationPolicy::Lazy,
            warn_undeclared_reads: true,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_rebatch_passes == 0 {
            return Err(EngineError::Config(
                "max_rebatch_passes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_rebatch_passes, 25);
        assert_eq!(config.derivation_policy, DerivationPolicy::Lazy);
        assert!(config.warn_undeclared_reads);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{ "derivation_policy": "eager" }"#).unwrap();
        assert_eq!(config.derivation_policy, DerivationPolicy::Eager);
        assert_eq!(config.max_rebatch_passes, DEFAULT_MAX_REBATCH_PASSES);
    }

    #[test]
    fn zero_passes_is_rejected() {
        let err = EngineConfig::from_json(r#"{ "max_rebatch_passes": 0 }"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = EngineConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, EngineError::ConfigParse(_)));
    }
}
