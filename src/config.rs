//! K-FAC configuration
//!
//! Everything the preconditioner needs per run: damping schedules, the
//! Kronecker moving-average decay, the factor update interval, how inverse
//! work is distributed across ranks, which layers to leave alone and the
//! wire strategies used by the collective exchange.

use crate::error::KfacError;
use crate::KfacResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Initial damping value used when no damping list is given
pub const DAMPING_DEFAULT: f64 = 3e-2;
/// Damping warmup length used when the configured value is zero
pub const DAMPING_WARMUP_STEPS_DEFAULT: usize = 100;
/// Kronecker factor moving-average decay used when the configured value is zero
pub const KRONECKER_DECAY_DEFAULT: f64 = 0.99;

// ═══════════════════════════════════════════════════════════════════════════
// STRATEGIES AND WIRE MODES
// ═══════════════════════════════════════════════════════════════════════════

/// How blocks are assigned to the rank that computes their inverse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InverseStrategy {
    /// One round-robin counter shared by every block kind
    All,
    /// One round-robin counter per block family (fc/conv, batch-norm)
    Each,
    /// Every inverse is computed on rank 0
    Root,
}

impl InverseStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            InverseStrategy::All => "all",
            InverseStrategy::Each => "each",
            InverseStrategy::Root => "root",
        }
    }
}

impl Default for InverseStrategy {
    fn default() -> Self {
        InverseStrategy::All
    }
}

impl FromStr for InverseStrategy {
    type Err = KfacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "all" => Ok(InverseStrategy::All),
            "each" => Ok(InverseStrategy::Each),
            "root" => Ok(InverseStrategy::Root),
            other => Err(KfacError::Config(format!(
                "Invalid inverse strategy type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for InverseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Wire strategy used to sum per-rank Kronecker factors onto their owners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceScatterMode {
    /// Sum everything everywhere, then keep the owned sub-ranges
    AllReduce,
    /// Owner-sorted packing and a variable-count reduce-scatter
    ReduceScatter,
    /// One reduce per block, rooted at the block's owner
    Reduce,
}

impl Default for ReduceScatterMode {
    fn default() -> Self {
        ReduceScatterMode::AllReduce
    }
}

impl FromStr for ReduceScatterMode {
    type Err = KfacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "allreduce" | "all_reduce" => Ok(ReduceScatterMode::AllReduce),
            "reduce_scatter" | "reducescatter" => Ok(ReduceScatterMode::ReduceScatter),
            "reduce" => Ok(ReduceScatterMode::Reduce),
            other => Err(KfacError::Config(format!(
                "Invalid reduce-scatter mode: {}",
                other
            ))),
        }
    }
}

/// Wire strategy used to distribute preconditioned gradients from their owners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllgatherMode {
    /// Owners write into a zeroed buffer which is then summed everywhere
    AllReduce,
    /// Owner-sorted packing and a variable-count allgather
    Allgather,
    /// One broadcast per block, rooted at the block's owner
    Broadcast,
}

impl Default for AllgatherMode {
    fn default() -> Self {
        AllgatherMode::AllReduce
    }
}

impl FromStr for AllgatherMode {
    type Err = KfacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "allreduce" | "all_reduce" => Ok(AllgatherMode::AllReduce),
            "allgather" | "all_gather" => Ok(AllgatherMode::Allgather),
            "broadcast" => Ok(AllgatherMode::Broadcast),
            other => Err(KfacError::Config(format!("Invalid allgather mode: {}", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

/// Complete K-FAC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KfacConfig {
    /// Damping for the activation factor of fc/conv blocks (1 or 2 values)
    pub damping_act: Vec<f64>,
    /// Damping for the error factor of fc/conv blocks (1 or 2 values)
    pub damping_err: Vec<f64>,
    /// Damping for the scale half of batch-norm blocks (1 or 2 values)
    pub damping_bn_act: Vec<f64>,
    /// Damping for the bias half of batch-norm blocks (1 or 2 values)
    pub damping_bn_err: Vec<f64>,
    /// Steps over which two-value damping lists decay toward their target
    pub damping_warmup_steps: usize,
    /// Moving-average decay of the Kronecker factors
    pub kronecker_decay: f64,
    /// Factor update interval (1 value, or start/end of a linear ramp)
    pub update_intervals: Vec<usize>,
    /// Steps over which a two-value update interval ramps
    pub update_interval_steps: usize,
    /// Assignment of inverse work to ranks
    pub inverse_strategy: InverseStrategy,
    /// Layer names excluded from preconditioning
    pub disable_layers: Vec<String>,
    /// Scale applied to every preconditioned gradient
    pub learning_rate_factor: f64,
    /// Balance fc/conv factor scales with the trace-ratio pi correction
    pub use_pi: bool,
    /// Log phase timings
    pub print_time: bool,
    /// Log full factor and inverse matrices
    pub print_matrix: bool,
    /// Log factor and inverse summaries (shape, trace, norm)
    pub print_matrix_summary: bool,
    /// Wire strategy for factor reduction
    pub reduce_scatter_mode: ReduceScatterMode,
    /// Wire strategy for preconditioned-gradient distribution
    pub allgather_mode: AllgatherMode,
    /// Run per-block local-factor and inverse work on the rayon pool
    pub parallel_blocks: bool,
}

impl Default for KfacConfig {
    fn default() -> Self {
        Self {
            damping_act: vec![DAMPING_DEFAULT],
            damping_err: vec![DAMPING_DEFAULT],
            damping_bn_act: vec![DAMPING_DEFAULT],
            damping_bn_err: vec![DAMPING_DEFAULT],
            damping_warmup_steps: DAMPING_WARMUP_STEPS_DEFAULT,
            kronecker_decay: KRONECKER_DECAY_DEFAULT,
            update_intervals: vec![1],
            update_interval_steps: 0,
            inverse_strategy: InverseStrategy::All,
            disable_layers: Vec::new(),
            learning_rate_factor: 1.0,
            use_pi: false,
            print_time: false,
            print_matrix: false,
            print_matrix_summary: false,
            reduce_scatter_mode: ReduceScatterMode::AllReduce,
            allgather_mode: AllgatherMode::AllReduce,
            parallel_blocks: true,
        }
    }
}

impl KfacConfig {
    /// Damping that starts high and relaxes over the first few hundred steps
    pub fn warmup_damping() -> Self {
        Self {
            damping_act: vec![1e-1, 1e-3],
            damping_err: vec![1e-1, 1e-3],
            damping_bn_act: vec![1e-1, 1e-3],
            damping_bn_err: vec![1e-1, 1e-3],
            damping_warmup_steps: 200,
            ..Self::default()
        }
    }

    /// Infrequent factor refreshes that ramp from every 10 to every 100 steps
    pub fn sparse_updates() -> Self {
        Self {
            update_intervals: vec![10, 100],
            update_interval_steps: 1000,
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> KfacResult<Self> {
        let config: KfacConfig = serde_json::from_str(json)
            .map_err(|e| KfacError::SerializationError(e.to_string()))?;
        let config = config.normalized();
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file in JSON format
    pub fn from_json_file(path: impl AsRef<Path>) -> KfacResult<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> KfacResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| KfacError::SerializationError(e.to_string()))
    }

    /// Replace "unset" zero values with their defaults
    pub fn normalized(mut self) -> Self {
        if self.damping_warmup_steps == 0 {
            self.damping_warmup_steps = DAMPING_WARMUP_STEPS_DEFAULT;
        }
        if self.kronecker_decay == 0.0 {
            self.kronecker_decay = KRONECKER_DECAY_DEFAULT;
        }
        if self.learning_rate_factor == 0.0 {
            self.learning_rate_factor = 1.0;
        }
        for list in [
            &mut self.damping_act,
            &mut self.damping_err,
            &mut self.damping_bn_act,
            &mut self.damping_bn_err,
        ] {
            if list.is_empty() {
                list.push(DAMPING_DEFAULT);
            }
        }
        if self.update_intervals.is_empty() {
            self.update_intervals.push(1);
        }
        self
    }

    /// Check every value for consistency
    pub fn validate(&self) -> KfacResult<()> {
        let dampings = [
            ("damping_act", &self.damping_act),
            ("damping_err", &self.damping_err),
            ("damping_bn_act", &self.damping_bn_act),
            ("damping_bn_err", &self.damping_bn_err),
        ];
        for (name, params) in dampings {
            if params.is_empty() || params.len() > 2 {
                return Err(KfacError::Config(format!(
                    "The length of damping vectors should be 1 or 2 ({} has {})",
                    name,
                    params.len()
                )));
            }
            // zero damping leaves rank-deficient factors singular
            if params.iter().any(|d| !d.is_finite() || *d <= 0.0) {
                return Err(KfacError::Config(format!(
                    "{} must contain finite positive values, got {:?}",
                    name, params
                )));
            }
        }

        if self.update_intervals.is_empty() || self.update_intervals.len() > 2 {
            return Err(KfacError::Config(format!(
                "The length of update interval vectors should be 1 or 2 (got {})",
                self.update_intervals.len()
            )));
        }
        if self.update_intervals.iter().any(|i| *i == 0) {
            return Err(KfacError::Config(
                "update intervals must be at least 1".to_string(),
            ));
        }
        if self.damping_warmup_steps == 0 {
            return Err(KfacError::Config(
                "damping_warmup_steps must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.kronecker_decay) {
            return Err(KfacError::Config(format!(
                "kronecker_decay must lie in [0, 1), got {}",
                self.kronecker_decay
            )));
        }
        if !self.learning_rate_factor.is_finite() || self.learning_rate_factor <= 0.0 {
            return Err(KfacError::Config(format!(
                "learning_rate_factor must be positive, got {}",
                self.learning_rate_factor
            )));
        }
        Ok(())
    }

    /// Whether a layer has been excluded by name
    pub fn is_disabled(&self, layer_name: &str) -> bool {
        self.disable_layers.iter().any(|n| n == layer_name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LIST PARSING
// ═══════════════════════════════════════════════════════════════════════════

/// Parse a whitespace- or comma-separated list
pub fn parse_list<T: FromStr>(s: &str) -> KfacResult<Vec<T>> {
    s.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|tok| !tok.is_empty())
        .map(|tok| {
            tok.parse::<T>()
                .map_err(|_| KfacError::Config(format!("Cannot parse list element '{}'", tok)))
        })
        .collect()
}

/// Parse a damping list; an empty string yields the default damping
pub fn parse_damping_params(s: &str) -> KfacResult<Vec<f64>> {
    if s.trim().is_empty() {
        return Ok(vec![DAMPING_DEFAULT]);
    }
    let params = parse_list::<f64>(s)?;
    if params.len() > 2 {
        return Err(KfacError::Config(
            "The length of damping vectors should be 1 or 2.".to_string(),
        ));
    }
    Ok(params)
}

/// Parse an update-interval list; an empty string yields `[1]`
pub fn parse_update_intervals(s: &str) -> KfacResult<Vec<usize>> {
    if s.trim().is_empty() {
        return Ok(vec![1]);
    }
    let intervals = parse_list::<usize>(s)?;
    if intervals.len() > 2 {
        return Err(KfacError::Config(
            "The length of update interval vectors should be 1 or 2.".to_string(),
        ));
    }
    Ok(intervals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = KfacConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.damping_act, vec![DAMPING_DEFAULT]);
        assert_eq!(config.inverse_strategy, InverseStrategy::All);
    }

    #[test]
    fn test_inverse_strategy_parsing() {
        assert_eq!("".parse::<InverseStrategy>().unwrap(), InverseStrategy::All);
        assert_eq!("each".parse::<InverseStrategy>().unwrap(), InverseStrategy::Each);
        assert_eq!("root".parse::<InverseStrategy>().unwrap(), InverseStrategy::Root);
        let err = "spread".parse::<InverseStrategy>().unwrap_err();
        assert!(err.to_string().contains("Invalid inverse strategy type: spread"));
    }

    #[test]
    fn test_damping_list_too_long() {
        assert!(parse_damping_params("0.1 0.01 0.001").is_err());
        assert_eq!(parse_damping_params("").unwrap(), vec![DAMPING_DEFAULT]);
        assert_eq!(parse_damping_params("0.1,0.01").unwrap(), vec![0.1, 0.01]);

        let config = KfacConfig {
            damping_err: vec![1.0, 0.5, 0.25],
            ..KfacConfig::default()
        };
        assert!(matches!(config.validate(), Err(KfacError::Config(_))));
    }

    #[test]
    fn test_zero_damping_is_rejected() {
        for damping in [vec![0.0], vec![0.1, 0.0], vec![-1e-3]] {
            let config = KfacConfig {
                damping_bn_err: damping,
                ..KfacConfig::default()
            };
            assert!(matches!(config.validate(), Err(KfacError::Config(_))));
        }
    }

    #[test]
    fn test_update_interval_parsing() {
        assert_eq!(parse_update_intervals("").unwrap(), vec![1]);
        assert_eq!(parse_update_intervals("1 5").unwrap(), vec![1, 5]);
        assert!(parse_update_intervals("1 5 9").is_err());
        assert!(parse_update_intervals("x").is_err());
    }

    #[test]
    fn test_json_round_trip_normalizes_zeros() {
        let json = r#"{
            "damping_act": [0.1, 0.001],
            "kronecker_decay": 0.0,
            "learning_rate_factor": 0.0,
            "inverse_strategy": "each",
            "disable_layers": ["fc3"]
        }"#;
        let config = KfacConfig::from_json_str(json).unwrap();
        assert_eq!(config.kronecker_decay, KRONECKER_DECAY_DEFAULT);
        assert_eq!(config.learning_rate_factor, 1.0);
        assert_eq!(config.inverse_strategy, InverseStrategy::Each);
        assert!(config.is_disabled("fc3"));
        assert!(!config.is_disabled("fc1"));

        let back = KfacConfig::from_json_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(back.damping_act, vec![0.1, 0.001]);
    }

    #[test]
    fn test_wire_modes_parse() {
        assert_eq!(
            "reduce_scatter".parse::<ReduceScatterMode>().unwrap(),
            ReduceScatterMode::ReduceScatter
        );
        assert_eq!("broadcast".parse::<AllgatherMode>().unwrap(), AllgatherMode::Broadcast);
        assert!("gossip".parse::<AllgatherMode>().is_err());
    }
}
