//! Machine-readable outcome of one run, written alongside the artifacts so
//! callers can reconcile partial downloads.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::{Analysis, Tone};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Downloaded,
    SkippedExists,
    Failed,
}

/// One record per model file the orchestrator attempted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutcome {
    pub tone_id: u64,
    pub tone_title: String,
    pub file_name: String,
    pub status: OutcomeStatus,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// No candidates were found by any query: a terminal outcome for the
    /// request, not an error.
    EmptyPool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub request: String,
    pub analysis: Analysis,
    pub pool_size: usize,
    pub selected_tones: Vec<Map<String, Value>>,
    pub downloaded_count: usize,
    pub model_items: Vec<ModelOutcome>,
    pub output_dir: String,
    pub started_at: String,
    pub finished_at: String,
}

impl RunReport {
    pub fn downloaded(&self) -> usize {
        self.model_items
            .iter()
            .filter(|item| item.status == OutcomeStatus::Downloaded)
            .count()
    }
}

/// Compact overview of a selected tone for the report (the full record goes
/// into the tone directory's `info.json`).
pub fn tone_overview(tone: &Tone) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert("id".to_string(), Value::from(tone.id));
    row.insert("title".to_string(), Value::String(tone.title.clone()));
    row.insert(
        "description".to_string(),
        tone.description
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    row.insert("gear".to_string(), Value::String(tone.gear.clone()));
    row.insert(
        "platform".to_string(),
        tone.platform.clone().map(Value::String).unwrap_or(Value::Null),
    );
    row.insert(
        "downloads_count".to_string(),
        Value::from(tone.downloads_count),
    );
    row.insert(
        "author".to_string(),
        Value::String(tone.user.username.clone()),
    );
    row.insert(
        "url".to_string(),
        tone.extra.get("url").cloned().unwrap_or(Value::Null),
    );
    row
}

pub fn write_report(path: &Path, report: &RunReport) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use crate::catalog::Tone;

    use super::{
        tone_overview, write_report, ModelOutcome, OutcomeStatus, RunReport, RunStatus,
    };

    fn sample_report() -> RunReport {
        RunReport {
            run_id: "run-abc".to_string(),
            status: RunStatus::Completed,
            request: "Van Halen brown sound".to_string(),
            analysis: serde_json::from_value(json!({
                "search_queries": ["5150"],
                "gear_type": "amp",
                "description": "brown sound",
                "fallback_queries": [],
            }))
            .expect("analysis fixture"),
            pool_size: 12,
            selected_tones: Vec::new(),
            downloaded_count: 1,
            model_items: vec![
                ModelOutcome {
                    tone_id: 1,
                    tone_title: "5150 Lead".to_string(),
                    file_name: "lead.nam".to_string(),
                    status: OutcomeStatus::Downloaded,
                    path: "/tmp/out/5150 Lead_1/lead.nam".to_string(),
                    size_mb: Some(12.34),
                    error: None,
                },
                ModelOutcome {
                    tone_id: 1,
                    tone_title: "5150 Lead".to_string(),
                    file_name: "rhythm.nam".to_string(),
                    status: OutcomeStatus::Failed,
                    path: "/tmp/out/5150 Lead_1/rhythm.nam".to_string(),
                    size_mb: None,
                    error: Some("connection reset".to_string()),
                },
            ],
            output_dir: "/tmp/out".to_string(),
            started_at: "2026-02-19T00:00:00+00:00".to_string(),
            finished_at: "2026-02-19T00:01:00+00:00".to_string(),
        }
    }

    #[test]
    fn statuses_serialize_as_snake_case_strings() -> anyhow::Result<()> {
        let value = serde_json::to_value(sample_report())?;
        assert_eq!(value["status"], json!("completed"));
        assert_eq!(value["model_items"][0]["status"], json!("downloaded"));
        assert_eq!(value["model_items"][1]["status"], json!("failed"));
        // Absent optionals are omitted entirely.
        assert!(value["model_items"][0].get("error").is_none());
        assert!(value["model_items"][1].get("size_mb").is_none());
        Ok(())
    }

    #[test]
    fn write_report_round_trips() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("run").join("summary.json");
        let report = sample_report();
        write_report(&path, &report)?;

        let parsed: RunReport = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(parsed, report);
        assert_eq!(parsed.downloaded(), 1);
        Ok(())
    }

    #[test]
    fn tone_overview_reads_url_from_extra_fields() {
        let tone: Tone = serde_json::from_value(json!({
            "id": 9,
            "title": "Clean DI",
            "gear": "amp",
            "downloads_count": 3,
            "user": {"username": "er2g"},
            "url": "https://example.com/tones/9",
        }))
        .expect("tone fixture");
        let row = tone_overview(&tone);
        assert_eq!(row["author"], json!("er2g"));
        assert_eq!(row["url"], json!("https://example.com/tones/9"));
        assert_eq!(row["description"], Value::Null);
    }
}
