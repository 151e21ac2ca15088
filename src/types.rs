use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(
        default,
        alias = "SenderID",
        alias = "senderId",
        alias = "participant_id",
        alias = "user_id",
        deserialize_with = "lenient_optional_string"
    )]
    pub sender_id: Option<String>,
    #[serde(
        default,
        alias = "Role",
        alias = "SenderType",
        alias = "sender_type",
        alias = "from",
        deserialize_with = "lenient_optional_string"
    )]
    pub role: Option<String>,
    #[serde(
        default,
        alias = "Message",
        alias = "message",
        alias = "text",
        alias = "Content",
        alias = "body",
        deserialize_with = "lenient_string"
    )]
    pub content: String,
    #[serde(
        default,
        alias = "Timestamp",
        alias = "created_at",
        alias = "CreatedAt",
        alias = "sent_at",
        alias = "time",
        deserialize_with = "lenient_timestamp"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            sender_id: None,
            role: Some(role.to_string()),
            content: content.to_string(),
            timestamp: None,
        }
    }
}

/// The unit of independent analysis: every message sharing one grouping key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub messages: Vec<Message>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages_from_role(&self, role: &str) -> usize {
        self.messages
            .iter()
            .filter(|m| {
                m.role
                    .as_deref()
                    .map(|r| r.eq_ignore_ascii_case(role))
                    .unwrap_or(false)
            })
            .count()
    }

    pub fn total_content_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.messages.iter().filter_map(|m| m.timestamp).min()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.messages.iter().filter_map(|m| m.timestamp).max()
    }
}

/// One work item's structured output from the analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,
    /// Numeric fields such as quality or satisfaction scores
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub trends: Vec<String>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default = "Utc::now")]
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            sentiment: None,
            scores: BTreeMap::new(),
            recommendations: Vec::new(),
            trends: Vec::new(),
            issues: Vec::new(),
            topics: Vec::new(),
            summary: None,
            analyzed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedValue {
    pub value: String,
    pub count: usize,
    /// Share of results mentioning the value
    pub percentage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightSource {
    Collaborator,
    LocalFallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsightType {
    CommonPattern,
    EmergingTrend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub insight_type: InsightType,
    pub field: String,
    pub title: String,
    pub description: String,
    pub confidence: f32,
    pub supporting_data: serde_json::Value,
}

/// Ranked aggregate over many analysis results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedInsight {
    pub total_results: usize,
    #[serde(default)]
    pub top_recommendations: Vec<RankedValue>,
    #[serde(default)]
    pub top_trends: Vec<RankedValue>,
    #[serde(default)]
    pub top_issues: Vec<RankedValue>,
    #[serde(default)]
    pub top_topics: Vec<RankedValue>,
    #[serde(default)]
    pub score_means: BTreeMap<String, f64>,
    /// Percentage of results per sentiment label
    #[serde(default)]
    pub sentiment_distribution: BTreeMap<String, f64>,
    #[serde(default)]
    pub highlights: Vec<Highlight>,
    #[serde(default)]
    pub summary: String,
    #[serde(default = "default_insight_source")]
    pub source: InsightSource,
    #[serde(default = "Utc::now")]
    pub generated_at: DateTime<Utc>,
}

fn default_insight_source() -> InsightSource {
    InsightSource::Collaborator
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
    })
}

/// Ids and roles arrive as strings or numbers; anything else reads as absent
fn lenient_optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(parse_timestamp))
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, or epoch seconds / milliseconds
pub fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(Utc.from_utc_datetime(&naive));
                }
            }
            s.parse::<i64>().ok().and_then(epoch_to_datetime)
        }
        serde_json::Value::Number(n) => n.as_i64().and_then(epoch_to_datetime),
        _ => None,
    }
}

fn epoch_to_datetime(value: i64) -> Option<DateTime<Utc>> {
    // Anything past 1e11 cannot be seconds in a realistic range
    if value.abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}
