use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use tracing::{info, warn};

use crate::collaborators::Consolidator;
use crate::error::Result;
use crate::types::{
    AnalysisResult, ConsolidatedInsight, Highlight, InsightSource, InsightType, RankedValue,
};

/// Categorical list fields that get ranked
const LIST_FIELDS: [&str; 4] = ["recommendations", "trends", "issues", "topics"];

fn list_field<'a>(result: &'a AnalysisResult, field: &str) -> &'a [String] {
    match field {
        "recommendations" => &result.recommendations,
        "trends" => &result.trends,
        "issues" => &result.issues,
        "topics" => &result.topics,
        _ => &[],
    }
}

/// Exact-string counts in first-seen order. A value counts once per result.
fn count_values<'a>(results: impl Iterator<Item = &'a AnalysisResult>, field: &str) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for result in results {
        let mut seen_here: HashSet<&str> = HashSet::new();
        for value in list_field(result, field) {
            if !seen_here.insert(value.as_str()) {
                continue;
            }
            match positions.get(value) {
                Some(&position) => counts[position].1 += 1,
                None => {
                    positions.insert(value.clone(), counts.len());
                    counts.push((value.clone(), 1));
                }
            }
        }
    }
    counts
}

fn percentage(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 * 100.0 / total as f64
    }
}

pub struct ResultAggregator {
    top_k: usize,
    consolidator: Option<Arc<dyn Consolidator>>,
}

impl ResultAggregator {
    pub fn new(top_k: usize) -> Self {
        Self {
            top_k,
            consolidator: None,
        }
    }

    pub fn with_consolidator(mut self, consolidator: Arc<dyn Consolidator>) -> Self {
        self.consolidator = Some(consolidator);
        self
    }

    /// Consolidate through the collaborator when there is one, falling back
    /// to the local summary when it is missing or fails.
    pub async fn aggregate(&self, results: &[AnalysisResult]) -> ConsolidatedInsight {
        match &self.consolidator {
            Some(consolidator) => match consolidator.consolidate(results).await {
                Ok(insight) => {
                    info!(consolidator = consolidator.name(), "Results consolidated");
                    insight
                }
                Err(e) => {
                    warn!("Consolidator failed, using local summary: {}", e);
                    self.local_summary(results)
                }
            },
            None => {
                info!("No consolidator configured, using local summary");
                self.local_summary(results)
            }
        }
    }

    /// Frequency ranking and scalar aggregates computed without any collaborator
    pub fn local_summary(&self, results: &[AnalysisResult]) -> ConsolidatedInsight {
        let total = results.len();
        let rank = |field: &str| -> Vec<RankedValue> {
            let mut counts = count_values(results.iter(), field);
            // Stable: equal counts keep first-seen order
            counts.sort_by(|a, b| b.1.cmp(&a.1));
            counts
                .into_iter()
                .take(self.top_k)
                .map(|(value, count)| RankedValue {
                    value,
                    count,
                    percentage: percentage(count, total),
                })
                .collect()
        };

        let top_recommendations = rank("recommendations");
        let top_trends = rank("trends");
        let top_issues = rank("issues");
        let top_topics = rank("topics");

        let score_means = score_means(results);
        let sentiment_distribution = sentiment_distribution(results);
        let highlights = self.detect_highlights(results);

        let summary = describe(total, &top_issues, &top_recommendations, &sentiment_distribution);

        ConsolidatedInsight {
            total_results: total,
            top_recommendations,
            top_trends,
            top_issues,
            top_topics,
            score_means,
            sentiment_distribution,
            highlights,
            summary,
            source: InsightSource::LocalFallback,
            generated_at: Utc::now(),
        }
    }

    fn detect_highlights(&self, results: &[AnalysisResult]) -> Vec<Highlight> {
        let mut highlights = Vec::new();
        for field in LIST_FIELDS {
            highlights.extend(detect_common_patterns(results, field));
            highlights.extend(detect_emerging(results, field));
        }
        highlights
    }
}

fn score_means(results: &[AnalysisResult]) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for result in results {
        for (name, value) in &result.scores {
            if value.is_finite() {
                let entry = sums.entry(name.clone()).or_insert((0.0, 0));
                entry.0 += value;
                entry.1 += 1;
            }
        }
    }
    sums.into_iter()
        .map(|(name, (sum, count))| (name, sum / count as f64))
        .collect()
}

/// Share of each sentiment label among results that carry one
fn sentiment_distribution(results: &[AnalysisResult]) -> BTreeMap<String, f64> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for sentiment in results.iter().filter_map(|r| r.sentiment.as_deref()) {
        *counts.entry(sentiment.to_string()).or_insert(0) += 1;
    }
    let labelled: usize = counts.values().sum();
    counts
        .into_iter()
        .map(|(label, count)| (label, percentage(count, labelled)))
        .collect()
}

fn detect_common_patterns(results: &[AnalysisResult], field: &str) -> Vec<Highlight> {
    let mut counts = count_values(results.iter(), field);
    counts.sort_by(|a, b| b.1.cmp(&a.1));

    let mut highlights = Vec::new();
    if let Some((value, count)) = counts.first() {
        if *count > results.len() / 3 && results.len() >= 3 {
            let share = percentage(*count, results.len());
            highlights.push(Highlight {
                insight_type: InsightType::CommonPattern,
                field: field.to_string(),
                title: "Common Pattern Detected".to_string(),
                description: format!("'{}' appears in {:.0}% of results", value, share),
                confidence: 0.8,
                supporting_data: serde_json::json!({
                    "value": value,
                    "count": count,
                    "percentage": share,
                }),
            });
        }
    }
    highlights
}

/// Values whose count in the second half of the results more than doubles
/// the first half
fn detect_emerging(results: &[AnalysisResult], field: &str) -> Vec<Highlight> {
    let middle = results.len() / 2;
    let first_counts: HashMap<String, usize> = count_values(results[..middle].iter(), field)
        .into_iter()
        .collect();

    count_values(results[middle..].iter(), field)
        .into_iter()
        .filter_map(|(value, second_count)| {
            let first_count = first_counts.get(&value).copied().unwrap_or(0);
            if second_count > first_count * 2 && second_count > 5 {
                Some(Highlight {
                    insight_type: InsightType::EmergingTrend,
                    field: field.to_string(),
                    title: "Emerging Trend".to_string(),
                    description: format!("'{}' is appearing more frequently", value),
                    confidence: 0.7,
                    supporting_data: serde_json::json!({
                        "value": value,
                        "first_half_count": first_count,
                        "second_half_count": second_count,
                        "increase_factor": second_count as f32 / (first_count as f32).max(1.0),
                    }),
                })
            } else {
                None
            }
        })
        .collect()
}

fn describe(
    total: usize,
    issues: &[RankedValue],
    recommendations: &[RankedValue],
    sentiment: &BTreeMap<String, f64>,
) -> String {
    if total == 0 {
        return "No analysis results to summarize.".to_string();
    }
    let mut parts = vec![format!("{} results analyzed.", total)];
    if let Some(issue) = issues.first() {
        parts.push(format!(
            "Most frequent issue: '{}' ({:.1}%).",
            issue.value, issue.percentage
        ));
    }
    if let Some(recommendation) = recommendations.first() {
        parts.push(format!(
            "Most frequent recommendation: '{}' ({:.1}%).",
            recommendation.value, recommendation.percentage
        ));
    }
    if let Some((label, share)) = sentiment
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
    {
        parts.push(format!("Dominant sentiment: {} ({:.1}%).", label, share));
    }
    parts.join(" ")
}

// ============================================================================
// Export Functions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Json,
    Csv,
}

pub fn export_insight(insight: &ConsolidatedInsight, format: ExportFormat) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_vec_pretty(insight)?),
        ExportFormat::Csv => export_to_csv(insight),
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn export_to_csv(insight: &ConsolidatedInsight) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    writeln!(buffer, "section,value,count,percentage")?;

    let sections = [
        ("recommendation", &insight.top_recommendations),
        ("trend", &insight.top_trends),
        ("issue", &insight.top_issues),
        ("topic", &insight.top_topics),
    ];
    for (section, values) in sections {
        for ranked in values.iter() {
            writeln!(
                buffer,
                "{},{},{},{:.2}",
                section,
                csv_field(&ranked.value),
                ranked.count,
                ranked.percentage
            )?;
        }
    }
    for (name, mean) in &insight.score_means {
        writeln!(buffer, "score_mean,{},,{:.4}", csv_field(name), mean)?;
    }
    for (label, share) in &insight.sentiment_distribution {
        writeln!(buffer, "sentiment,{},,{:.2}", csv_field(label), share)?;
    }

    Ok(buffer)
}
