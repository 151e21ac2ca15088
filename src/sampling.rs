//! Dataset reduction strategies.
//!
//! Every strategy returns the selected ids in their original relative order
//! together with a [`SampleReport`] stating the true coverage and per-stratum
//! composition of the selection.

use rand::rngs::StdRng;
use rand::seq::index::sample as sample_indices;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::info;

use crate::catalog::ItemProfile;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SamplingStrategy {
    #[default]
    Exhaustive,
    ComplexityWeighted,
    StratifiedClustering,
}

impl fmt::Display for SamplingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SamplingStrategy::Exhaustive => "exhaustive",
            SamplingStrategy::ComplexityWeighted => "complexity-weighted",
            SamplingStrategy::StratifiedClustering => "stratified-clustering",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityWeights {
    #[serde(default = "default_message_weight")]
    pub message_count: f64,
    #[serde(default = "default_role_weight")]
    pub role_messages: f64,
    /// Applied per 100 characters of average message length
    #[serde(default = "default_length_weight")]
    pub average_length: f64,
    /// Applied per hour between first and last message
    #[serde(default = "default_span_weight")]
    pub span_hours: f64,
}

impl Default for ComplexityWeights {
    fn default() -> Self {
        Self {
            message_count: default_message_weight(),
            role_messages: default_role_weight(),
            average_length: default_length_weight(),
            span_hours: default_span_weight(),
        }
    }
}

impl ComplexityWeights {
    pub fn score(&self, profile: &ItemProfile) -> f64 {
        self.message_count * profile.message_count as f64
            + self.role_messages * profile.role_message_count as f64
            + self.average_length * profile.average_message_chars() / 100.0
            + self.span_hours * profile.span_hours()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default)]
    pub strategy: SamplingStrategy,
    /// Participant role whose messages count toward complexity
    #[serde(default = "default_designated_role")]
    pub designated_role: String,
    #[serde(default)]
    pub weights: ComplexityWeights,
    /// Share of the ranked list kept unconditionally
    #[serde(default = "default_top_fraction")]
    pub top_fraction: f64,
    /// Share of the remainder drawn at random
    #[serde(default = "default_random_fraction")]
    pub random_fraction: f64,
    #[serde(default = "default_stratum_fraction")]
    pub stratum_fraction: f64,
    #[serde(default = "default_stratum_min")]
    pub stratum_min: usize,
    #[serde(default = "default_stratum_max")]
    pub stratum_max: usize,
    /// Makes the random part of every strategy reproducible
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            strategy: SamplingStrategy::default(),
            designated_role: default_designated_role(),
            weights: ComplexityWeights::default(),
            top_fraction: default_top_fraction(),
            random_fraction: default_random_fraction(),
            stratum_fraction: default_stratum_fraction(),
            stratum_min: default_stratum_min(),
            stratum_max: default_stratum_max(),
            seed: None,
        }
    }
}

impl SamplingConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("top_fraction", self.top_fraction),
            ("random_fraction", self.random_fraction),
            ("stratum_fraction", self.stratum_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::Config(format!(
                    "sampling.{} must be between 0 and 1, got {}",
                    name, value
                )));
            }
        }
        if self.stratum_min > self.stratum_max {
            return Err(PipelineError::Config(format!(
                "sampling.stratum_min ({}) exceeds stratum_max ({})",
                self.stratum_min, self.stratum_max
            )));
        }
        Ok(())
    }
}

/// Fixed message-count buckets used for stratification and reporting
pub const STRATA: [(&str, usize, usize); 4] = [
    ("short", 0, 5),
    ("medium", 6, 20),
    ("long", 21, 50),
    ("very-long", 51, usize::MAX),
];

pub fn stratum_of(message_count: usize) -> usize {
    STRATA
        .iter()
        .position(|(_, low, high)| (*low..=*high).contains(&message_count))
        .unwrap_or(STRATA.len() - 1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumReport {
    pub name: String,
    pub population: usize,
    pub selected: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleReport {
    pub strategy: SamplingStrategy,
    pub total_items: usize,
    pub selected_items: usize,
    pub coverage_percentage: f64,
    /// Items chosen by rank rather than by chance
    pub deterministic_items: usize,
    pub strata: Vec<StratumReport>,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub ids: Vec<String>,
    pub report: SampleReport,
}

pub struct DatasetSampler {
    config: SamplingConfig,
}

impl DatasetSampler {
    pub fn new(config: SamplingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    fn rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    pub fn sample(&self, profiles: &[ItemProfile]) -> Sample {
        let (selected, deterministic) = match self.config.strategy {
            SamplingStrategy::Exhaustive => {
                let all: Vec<usize> = (0..profiles.len()).collect();
                let n = all.len();
                (all, n)
            }
            SamplingStrategy::ComplexityWeighted => self.complexity_weighted(profiles),
            SamplingStrategy::StratifiedClustering => (self.stratified(profiles), 0),
        };

        let report = self.report(profiles, &selected, deterministic);
        info!(
            strategy = %report.strategy,
            selected = report.selected_items,
            total = report.total_items,
            "Sampled {:.1}% of work items",
            report.coverage_percentage
        );

        Sample {
            ids: selected.iter().map(|&i| profiles[i].id.clone()).collect(),
            report,
        }
    }

    /// Positions of the selection in ascending order, plus how many were
    /// chosen by rank
    fn complexity_weighted(&self, profiles: &[ItemProfile]) -> (Vec<usize>, usize) {
        let scores: Vec<f64> = profiles.iter().map(|p| self.config.weights.score(p)).collect();
        let mut ranked: Vec<usize> = (0..profiles.len()).collect();
        // Stable sort keeps original order among equal scores
        ranked.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));

        let top_n = fraction_of(ranked.len(), self.config.top_fraction);
        let (top, rest) = ranked.split_at(top_n);

        let random_n = fraction_of(rest.len(), self.config.random_fraction);
        let mut rng = self.rng();
        let mut selected: Vec<usize> = top.to_vec();
        selected.extend(sample_indices(&mut rng, rest.len(), random_n).into_iter().map(|i| rest[i]));
        selected.sort_unstable();

        (selected, top_n)
    }

    fn stratified(&self, profiles: &[ItemProfile]) -> Vec<usize> {
        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); STRATA.len()];
        for (i, profile) in profiles.iter().enumerate() {
            buckets[stratum_of(profile.message_count)].push(i);
        }

        let mut rng = self.rng();
        let mut selected = Vec::new();
        for bucket in buckets.iter().filter(|b| !b.is_empty()) {
            let amount = fraction_of(bucket.len(), self.config.stratum_fraction)
                .clamp(self.config.stratum_min, self.config.stratum_max)
                .min(bucket.len());
            selected.extend(sample_indices(&mut rng, bucket.len(), amount).into_iter().map(|i| bucket[i]));
        }
        selected.sort_unstable();
        selected
    }

    fn report(&self, profiles: &[ItemProfile], selected: &[usize], deterministic: usize) -> SampleReport {
        let mut strata: Vec<StratumReport> = STRATA
            .iter()
            .map(|(name, _, _)| StratumReport {
                name: name.to_string(),
                population: 0,
                selected: 0,
            })
            .collect();
        for profile in profiles {
            strata[stratum_of(profile.message_count)].population += 1;
        }
        for &i in selected {
            strata[stratum_of(profiles[i].message_count)].selected += 1;
        }

        SampleReport {
            strategy: self.config.strategy,
            total_items: profiles.len(),
            selected_items: selected.len(),
            coverage_percentage: if profiles.is_empty() {
                0.0
            } else {
                selected.len() as f64 / profiles.len() as f64 * 100.0
            },
            deterministic_items: deterministic,
            strata,
            seed: self.config.seed,
        }
    }
}

fn fraction_of(len: usize, fraction: f64) -> usize {
    ((len as f64 * fraction).round() as usize).min(len)
}

// Default value functions
fn default_message_weight() -> f64 { 1.0 }
fn default_role_weight() -> f64 { 1.5 }
fn default_length_weight() -> f64 { 1.0 }
fn default_span_weight() -> f64 { 0.5 }
fn default_designated_role() -> String { "user".to_string() }
fn default_top_fraction() -> f64 { 0.6 }
fn default_random_fraction() -> f64 { 0.2 }
fn default_stratum_fraction() -> f64 { 0.1 }
fn default_stratum_min() -> usize { 1 }
fn default_stratum_max() -> usize { 50 }
