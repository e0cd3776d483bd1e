//! Rule definitions.
//!
//! - `RuleType`: closed set of pattern families
//! - `RuleParameters`: one typed parameter struct per family
//! - `ScoringModel`: versioned component weights for the probability score
//! - `RuleDefinition`: one immutable version of a rule

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Breakout,
    Crp,
    Technical,
    Volume,
    Composite,
}

impl RuleType {
    pub const ALL: [RuleType; 5] = [
        RuleType::Breakout,
        RuleType::Crp,
        RuleType::Technical,
        RuleType::Volume,
        RuleType::Composite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Breakout => "breakout",
            RuleType::Crp => "crp",
            RuleType::Technical => "technical",
            RuleType::Volume => "volume",
            RuleType::Composite => "composite",
        }
    }

    /// Bar columns a rule of this type reads from the data source.
    pub fn required_fields(&self) -> &'static [&'static str] {
        &[
            "symbol",
            "timestamp",
            "open",
            "high",
            "low",
            "close",
            "volume",
            "date_partition",
        ]
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "breakout" => Ok(RuleType::Breakout),
            "crp" => Ok(RuleType::Crp),
            "technical" => Ok(RuleType::Technical),
            "volume" => Ok(RuleType::Volume),
            "composite" => Ok(RuleType::Composite),
            other => Err(format!("unknown rule type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Draft,
    Validated,
    Enabled,
    Disabled,
    Archived,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Draft => "draft",
            RuleStatus::Validated => "validated",
            RuleStatus::Enabled => "enabled",
            RuleStatus::Disabled => "disabled",
            RuleStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "draft" => Ok(RuleStatus::Draft),
            "validated" => Ok(RuleStatus::Validated),
            "enabled" => Ok(RuleStatus::Enabled),
            "disabled" => Ok(RuleStatus::Disabled),
            "archived" => Ok(RuleStatus::Archived),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakoutParams {
    pub volume_multiplier_min: f64,
    pub volume_multiplier_max: Option<f64>,
    pub price_move_pct_min: Option<f64>,
    pub price_move_pct_max: Option<f64>,
    pub trailing_days: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrpParams {
    pub close_threshold_pct: f64,
    pub range_threshold_pct: f64,
    pub volume_multiplier_min: Option<f64>,
    pub trailing_days: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TechnicalParams {
    pub rsi_period: u32,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub macd_fast: u32,
    pub macd_slow: u32,
    pub band_period: u32,
    pub band_std_dev: f64,
}

impl Default for TechnicalParams {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            macd_fast: 12,
            macd_slow: 26,
            band_period: 20,
            band_std_dev: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeParams {
    pub volume_multiplier_min: f64,
    pub volume_multiplier_max: Option<f64>,
    pub trailing_days: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeParams {
    pub volume_multiplier_min: f64,
    pub close_threshold_pct: f64,
    pub range_threshold_pct: f64,
    pub trailing_days: u32,
}

pub const DEFAULT_TRAILING_DAYS: u32 = 20;

/// Typed parameters, one variant per rule type.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleParameters {
    Breakout(BreakoutParams),
    Crp(CrpParams),
    Technical(TechnicalParams),
    Volume(VolumeParams),
    Composite(CompositeParams),
}

impl RuleParameters {
    pub fn rule_type(&self) -> RuleType {
        match self {
            RuleParameters::Breakout(_) => RuleType::Breakout,
            RuleParameters::Crp(_) => RuleType::Crp,
            RuleParameters::Technical(_) => RuleType::Technical,
            RuleParameters::Volume(_) => RuleType::Volume,
            RuleParameters::Composite(_) => RuleType::Composite,
        }
    }

    /// Number of prior trading days the rule's query looks back over.
    pub fn lookback_days(&self) -> u32 {
        match self {
            RuleParameters::Breakout(p) => p.trailing_days,
            RuleParameters::Crp(p) => p.trailing_days,
            RuleParameters::Volume(p) => p.trailing_days,
            RuleParameters::Composite(p) => p.trailing_days,
            RuleParameters::Technical(p) => (p.rsi_period + 1).max(p.macd_slow).max(p.band_period),
        }
    }
}

/// How raw rows become signals: threshold, cap and exit levels.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalPolicy {
    pub min_probability: f64,
    pub max_results_per_day: Option<usize>,
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
}

impl Default for SignalPolicy {
    fn default() -> Self {
        Self {
            min_probability: 50.0,
            max_results_per_day: None,
            stop_loss_pct: None,
            take_profit_pct: None,
        }
    }
}

/// A component score feeding the probability score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreComponent {
    Volume,
    PriceMove,
    Breakout,
    CloseStrength,
    ClosePosition,
    RangeTightness,
    Momentum,
    Rsi,
    Macd,
    Band,
}

impl ScoreComponent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreComponent::Volume => "volume",
            ScoreComponent::PriceMove => "price_move",
            ScoreComponent::Breakout => "breakout",
            ScoreComponent::CloseStrength => "close_strength",
            ScoreComponent::ClosePosition => "close_position",
            ScoreComponent::RangeTightness => "range_tightness",
            ScoreComponent::Momentum => "momentum",
            ScoreComponent::Rsi => "rsi",
            ScoreComponent::Macd => "macd",
            ScoreComponent::Band => "band",
        }
    }

    /// Name of the score column the query emits for this component.
    pub fn column(&self) -> String {
        format!("{}_score", self.as_str())
    }
}

impl FromStr for ScoreComponent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "volume" => Ok(ScoreComponent::Volume),
            "price_move" => Ok(ScoreComponent::PriceMove),
            "breakout" => Ok(ScoreComponent::Breakout),
            "close_strength" => Ok(ScoreComponent::CloseStrength),
            "close_position" => Ok(ScoreComponent::ClosePosition),
            "range_tightness" => Ok(ScoreComponent::RangeTightness),
            "momentum" => Ok(ScoreComponent::Momentum),
            "rsi" => Ok(ScoreComponent::Rsi),
            "macd" => Ok(ScoreComponent::Macd),
            "band" => Ok(ScoreComponent::Band),
            other => Err(format!("unknown score component '{other}'")),
        }
    }
}

pub const SCORING_MODEL_VERSION: u32 = 1;

/// Weighted sum of component scores. Weights are fractions summing to 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringModel {
    pub version: u32,
    pub weights: Vec<(ScoreComponent, f64)>,
}

impl ScoringModel {
    /// Version-1 weights per rule type.
    pub fn default_for(rule_type: RuleType) -> Self {
        use ScoreComponent::*;
        let weights = match rule_type {
            RuleType::Breakout => vec![
                (Volume, 0.40),
                (PriceMove, 0.30),
                (Breakout, 0.20),
                (CloseStrength, 0.10),
            ],
            RuleType::Crp => vec![
                (ClosePosition, 0.35),
                (RangeTightness, 0.30),
                (Volume, 0.20),
                (Momentum, 0.15),
            ],
            RuleType::Technical => vec![(Rsi, 0.35), (Band, 0.25), (Macd, 0.20), (Volume, 0.20)],
            RuleType::Volume => vec![(Volume, 0.70), (CloseStrength, 0.30)],
            RuleType::Composite => vec![
                (Volume, 0.30),
                (ClosePosition, 0.25),
                (RangeTightness, 0.20),
                (Breakout, 0.15),
                (Momentum, 0.10),
            ],
        };
        Self {
            version: SCORING_MODEL_VERSION,
            weights,
        }
    }

    /// Components a rule type is allowed to weight.
    pub fn components_for(rule_type: RuleType) -> Vec<ScoreComponent> {
        Self::default_for(rule_type)
            .weights
            .into_iter()
            .map(|(c, _)| c)
            .collect()
    }

    pub fn total_weight(&self) -> f64 {
        self.weights.iter().map(|(_, w)| w).sum()
    }

    pub fn weight(&self, component: ScoreComponent) -> f64 {
        self.weights
            .iter()
            .find(|(c, _)| *c == component)
            .map(|(_, w)| *w)
            .unwrap_or(0.0)
    }
}

/// Intraday timing of a rule.
///
/// Ordering: `signal_window_start < signal_window_end <= cutoff_time
/// <= performance_start_time < performance_end_time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub signal_window_start: NaiveTime,
    pub signal_window_end: NaiveTime,
    pub cutoff_time: NaiveTime,
    pub performance_start_time: NaiveTime,
    pub performance_end_time: NaiveTime,
}

impl TimeWindow {
    pub fn window_minutes(&self) -> i64 {
        (self.signal_window_end - self.signal_window_start).num_minutes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UniverseFilter {
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub min_volume: Option<i64>,
}

impl UniverseFilter {
    /// Filters that prune rows before aggregation.
    pub fn selective_filter_count(&self) -> usize {
        let price = self.min_price.is_some() || self.max_price.is_some();
        usize::from(price) + usize::from(self.min_volume.is_some())
    }
}

/// One immutable version of a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDefinition {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub status: RuleStatus,
    pub parameters: RuleParameters,
    pub policy: SignalPolicy,
    pub scoring: ScoringModel,
    pub time_window: TimeWindow,
    pub universe_filter: UniverseFilter,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RuleDefinition {
    pub fn rule_type(&self) -> RuleType {
        self.parameters.rule_type()
    }

    /// Hex digest identifying the rule's parameter set, independent of id,
    /// name, version and status.
    pub fn parameter_hash(&self) -> String {
        let canonical = crate::domain::rule_document::parameters_to_value(self).to_string();
        blake3::hash(canonical.as_bytes()).to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_type_round_trips_through_str() {
        for rule_type in RuleType::ALL {
            assert_eq!(rule_type.as_str().parse::<RuleType>(), Ok(rule_type));
        }
        assert!("momentum".parse::<RuleType>().is_err());
    }

    #[test]
    fn rule_type_parse_is_case_insensitive() {
        assert_eq!("CRP".parse::<RuleType>(), Ok(RuleType::Crp));
    }

    #[test]
    fn default_weights_sum_to_one() {
        for rule_type in RuleType::ALL {
            let model = ScoringModel::default_for(rule_type);
            assert!(
                (model.total_weight() - 1.0).abs() < 1e-9,
                "{rule_type} weights sum to {}",
                model.total_weight()
            );
            assert_eq!(model.version, SCORING_MODEL_VERSION);
        }
    }

    #[test]
    fn weight_lookup_defaults_to_zero() {
        let model = ScoringModel::default_for(RuleType::Volume);
        assert!((model.weight(ScoreComponent::Volume) - 0.70).abs() < 1e-12);
        assert_eq!(model.weight(ScoreComponent::Rsi), 0.0);
    }

    #[test]
    fn score_component_columns() {
        assert_eq!(ScoreComponent::ClosePosition.column(), "close_position_score");
        assert_eq!(
            "range_tightness".parse::<ScoreComponent>(),
            Ok(ScoreComponent::RangeTightness)
        );
    }

    #[test]
    fn technical_lookback_covers_longest_indicator() {
        let params = RuleParameters::Technical(TechnicalParams::default());
        assert_eq!(params.lookback_days(), 26);

        let params = RuleParameters::Technical(TechnicalParams {
            rsi_period: 30,
            ..TechnicalParams::default()
        });
        assert_eq!(params.lookback_days(), 31);
    }

    #[test]
    fn selective_filters_counted() {
        assert_eq!(UniverseFilter::default().selective_filter_count(), 0);
        let filter = UniverseFilter {
            min_price: Some(5.0),
            max_price: None,
            min_volume: Some(10_000),
        };
        assert_eq!(filter.selective_filter_count(), 2);
    }

    #[test]
    fn status_parse() {
        assert_eq!("Enabled".parse::<RuleStatus>(), Ok(RuleStatus::Enabled));
        assert!("live".parse::<RuleStatus>().is_err());
    }
}
