//! Service configuration
//!
//! Loaded from a YAML file. Every section falls back to its defaults, so a
//! partial file (or no file at all) yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TriageError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub thresholds: ThresholdConfig,
    pub scoring: ScoringConfig,
    pub queue: QueueConfig,
    pub alerts: AlertConfig,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
    pub journal_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            path: "./data".to_string(),
            journal_enabled: true,
        }
    }
}

/// Named cutoffs used by the rule-based classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    // ESI 1: immediate life threat
    pub critical_bp_systolic_low: f64,
    pub critical_bp_systolic_high: f64,
    pub critical_heart_rate_low: f64,
    pub critical_heart_rate_high: f64,
    pub critical_o2_saturation_low: f64,
    pub critical_respiratory_rate_low: f64,

    // ESI 2: high risk
    pub high_risk_bp_systolic_low: f64,
    pub high_risk_o2_saturation_low: f64,
    pub severe_pain: u8,
    pub high_risk_keywords: Vec<String>,

    // ESI 3: urgent but stable
    pub urgent_pain: u8,
    pub urgent_bp_systolic_high: f64,
    pub urgent_heart_rate_high: f64,
    pub elderly_age: u32,
    pub fall_keywords: Vec<String>,

    // ESI 4: less urgent
    pub minor_pain: u8,
    pub minor_keywords: Vec<String>,

    /// Pain level at which "severe_pain" is added as an explanatory reason.
    pub reason_pain: u8,
    /// Ages at or below this count as an age risk factor.
    pub infant_max_age: u32,

    pub confidence: [f64; 5],
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        ThresholdConfig {
            critical_bp_systolic_low: 80.0,
            critical_bp_systolic_high: 200.0,
            critical_heart_rate_low: 40.0,
            critical_heart_rate_high: 150.0,
            critical_o2_saturation_low: 85.0,
            critical_respiratory_rate_low: 8.0,

            high_risk_bp_systolic_low: 90.0,
            high_risk_o2_saturation_low: 92.0,
            severe_pain: 8,
            high_risk_keywords: vec![
                "chest pain".to_string(),
                "stroke".to_string(),
                "heart attack".to_string(),
            ],

            urgent_pain: 6,
            urgent_bp_systolic_high: 160.0,
            urgent_heart_rate_high: 100.0,
            elderly_age: 65,
            fall_keywords: vec!["fall".to_string(), "injury".to_string()],

            minor_pain: 3,
            minor_keywords: vec!["fever".to_string(), "infection".to_string()],

            reason_pain: 7,
            infant_max_age: 2,

            confidence: [0.95, 0.90, 0.80, 0.70, 0.60],
        }
    }
}

/// Priority score policy. Only the ordering contract is fixed; the numbers
/// are tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Base weight per ESI level, index 0 is ESI 1.
    pub base_weights: [f64; 5],
    pub wait_points_per_minute: f64,
    pub wait_cap: f64,
    pub infant_max_age: u32,
    pub infant_bonus: f64,
    pub elderly_min_age: u32,
    pub elderly_bonus: f64,
    pub pain_points_per_level: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        ScoringConfig {
            base_weights: [1000.0, 500.0, 200.0, 50.0, 10.0],
            wait_points_per_minute: 0.5,
            wait_cap: 100.0,
            infant_max_age: 2,
            infant_bonus: 10.0,
            elderly_min_age: 65,
            elderly_bonus: 5.0,
            pain_points_per_level: 2.0,
        }
    }
}

impl ScoringConfig {
    /// Largest non-base contribution any patient can accumulate.
    pub fn max_bonus(&self) -> f64 {
        self.wait_cap + self.infant_bonus.max(self.elderly_bonus) + self.pain_points_per_level * 10.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub refresh_interval_secs: u64,
    /// Estimated treatment minutes per ESI level, index 0 is ESI 1.
    pub treatment_minutes: [i64; 5],
    pub default_list_limit: usize,
    pub max_list_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            refresh_interval_secs: 5,
            treatment_minutes: [0, 10, 30, 60, 120],
            default_list_limit: 50,
            max_list_limit: 100,
        }
    }
}

impl QueueConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub critical_backlog: usize,
    pub overcrowding: usize,
    pub repeat_interval_secs: i64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        AlertConfig {
            critical_backlog: 3,
            overcrowding: 30,
            repeat_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: Option<String>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let weights = &self.scoring.base_weights;
        if weights.windows(2).any(|pair| pair[0] <= pair[1]) {
            return Err(TriageError::Config(
                "scoring.base_weights must be strictly decreasing from ESI 1 to ESI 5".to_string(),
            ));
        }
        if self.scoring.wait_cap < 0.0 || self.scoring.wait_points_per_minute < 0.0 {
            return Err(TriageError::Config(
                "scoring wait parameters must be non-negative".to_string(),
            ));
        }
        if weights[1] + self.scoring.max_bonus() >= weights[0] {
            return Err(TriageError::Config(
                "an ESI 2 patient could outscore ESI 1; lower wait_cap or bonuses".to_string(),
            ));
        }
        if self.thresholds.confidence.iter().any(|c| !(0.0..=1.0).contains(c)) {
            return Err(TriageError::Config(
                "thresholds.confidence values must lie in [0, 1]".to_string(),
            ));
        }
        if self.queue.default_list_limit > self.queue.max_list_limit {
            return Err(TriageError::Config(
                "queue.default_list_limit exceeds queue.max_list_limit".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .map_err(|e| TriageError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    let config: Config = serde_yaml::from_str(&content)
        .map_err(|e| TriageError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}
