use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::selection::{contains_boost_signal, is_boost_or_preamp_pedal};

/// Longest description excerpt shown to the language model per candidate.
const DESCRIPTION_PREVIEW_CHARS: usize = 160;

/// Equipment category used by catalog filters and the selection rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gear {
    Amp,
    Ir,
    Pedal,
    Other,
}

impl Gear {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "amp" => Self::Amp,
            "ir" => Self::Ir,
            "pedal" => Self::Pedal,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ToneAuthor {
    #[serde(default)]
    pub username: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One catalog item ("tone"). Unknown fields are kept in `extra` so the
/// on-disk `info.json` snapshot is a lossless copy of the catalog record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tone {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub gear: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub downloads_count: u64,
    #[serde(default)]
    pub user: ToneAuthor,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Tone {
    pub fn gear_kind(&self) -> Gear {
        Gear::parse(&self.gear)
    }

    /// Title and description joined for keyword scans.
    pub fn search_text(&self) -> String {
        format!(
            "{}\n{}",
            self.title,
            self.description.as_deref().unwrap_or_default()
        )
    }
}

/// One downloadable file ("model") belonging to a tone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToneModel {
    pub name: String,
    #[serde(default)]
    pub size: Option<String>,
    pub model_url: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Search plan derived from the user request by the language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub search_queries: Vec<String>,
    #[serde(default)]
    pub gear_type: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub fallback_queries: Vec<String>,
}

/// Candidate row as presented to the language model for selection. The
/// boost flags are precomputed so the model sees the same redundancy signal
/// the arbitrator enforces afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToneSummary {
    pub index: usize,
    pub title: String,
    pub description: String,
    pub gear: String,
    pub platform: Option<String>,
    pub downloads: u64,
    pub contains_boost_in_chain: bool,
    pub is_preamp_or_boost_pedal: bool,
}

impl ToneSummary {
    pub fn from_tone(index: usize, tone: &Tone) -> Self {
        let description = tone
            .description
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .unwrap_or("No description");
        Self {
            index,
            title: tone.title.clone(),
            description: single_line_preview(description, DESCRIPTION_PREVIEW_CHARS),
            gear: tone.gear.clone(),
            platform: tone.platform.clone(),
            downloads: tone.downloads_count,
            contains_boost_in_chain: contains_boost_signal(tone),
            is_preamp_or_boost_pedal: is_boost_or_preamp_pedal(tone),
        }
    }
}

fn single_line_preview(text: &str, max_chars: usize) -> String {
    text.replace('\r', " ")
        .replace('\n', " ")
        .chars()
        .take(max_chars)
        .collect()
}
