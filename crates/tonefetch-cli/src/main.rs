use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Parser;
use serde_json::{json, Value};

use tonefetch_engine::{Credentials, RunConfig, SmartDownloader};

const TONE3000_KEY_ENV: &str = "TONE3000_API_KEY";
const GEMINI_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Parser)]
#[command(name = "tonefetch", version, about = "LLM-assisted TONE3000 tone downloader")]
struct Cli {
    /// Free-text tone request, e.g. "Van Halen brown sound".
    request: String,
    /// Download directory.
    #[arg(long, default_value = "./smart_downloaded_tones")]
    out: PathBuf,
    /// Maximum tones to download.
    #[arg(long, default_value_t = 3)]
    max_tones: usize,
    /// Maximum candidate tones shown to the language model.
    #[arg(long, default_value_t = 15)]
    max_results: usize,
    /// TONE3000 API key; falls back to $TONE3000_API_KEY, then the keys file.
    #[arg(long)]
    tone3000_key: Option<String>,
    /// Gemini API key; falls back to $GEMINI_API_KEY, then the keys file.
    #[arg(long)]
    gemini_key: Option<String>,
    /// KEY=value credential file.
    #[arg(long, default_value = "keys.txt")]
    keys_file: PathBuf,
    /// Events file override (defaults to events.jsonl in the output dir).
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(()) => {}
        Err(err) => {
            let payload = json!({ "ok": false, "error": format!("{err:#}") });
            println!("{payload}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    if cli.request.trim().is_empty() {
        bail!("request text is required");
    }
    let credentials = resolve_credentials(&cli)?;

    let mut config = RunConfig::new(cli.request, cli.out);
    config.max_tones = cli.max_tones;
    config.max_candidates = cli.max_results;
    config.events_path = cli.events;

    let mut downloader = SmartDownloader::new(config, credentials)?;
    let report = downloader.run()?;

    let mut payload = serde_json::to_value(&report)?;
    if let Some(object) = payload.as_object_mut() {
        object.insert("ok".to_string(), Value::Bool(true));
    }
    println!("{}", serde_json::to_string(&payload)?);
    Ok(())
}

fn resolve_credentials(cli: &Cli) -> Result<Credentials> {
    let file_keys = read_keys_file(&cli.keys_file);
    let tone3000_api_key = cli
        .tone3000_key
        .as_deref()
        .and_then(non_empty)
        .or_else(|| non_empty_env(TONE3000_KEY_ENV))
        .or_else(|| file_keys.get(TONE3000_KEY_ENV).cloned());
    let gemini_api_key = cli
        .gemini_key
        .as_deref()
        .and_then(non_empty)
        .or_else(|| non_empty_env(GEMINI_KEY_ENV))
        .or_else(|| file_keys.get(GEMINI_KEY_ENV).cloned());

    match (tone3000_api_key, gemini_api_key) {
        (Some(tone3000_api_key), Some(gemini_api_key)) => Ok(Credentials {
            tone3000_api_key,
            gemini_api_key,
        }),
        _ => bail!(
            "missing API keys; provide both TONE3000 and Gemini keys via flags, \
             environment, or {}",
            cli.keys_file.display()
        ),
    }
}

/// Parses `KEY=value` lines; `#` comments and blank lines are ignored and
/// surrounding quotes on values are stripped. A missing file is simply an
/// empty key set.
fn read_keys_file(path: &Path) -> HashMap<String, String> {
    let Ok(content) = fs::read_to_string(path) else {
        return HashMap::new();
    };
    let mut keys = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches(['\'', '"']);
            keys.insert(key.trim().to_string(), value.to_string());
        }
    }
    keys
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().as_deref().and_then(non_empty)
}
