use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Value};
use uuid::Uuid;

use tonefetch_contracts::catalog::{Analysis, Tone, ToneModel, ToneSummary};
use tonefetch_contracts::error::PipelineError;
use tonefetch_contracts::events::{EventFields, EventLog};
use tonefetch_contracts::extract;
use tonefetch_contracts::files::{normalize_model_file_name, tone_dir_name};
use tonefetch_contracts::pool::{build_pool, PoolOutcome, ToneSearch};
use tonefetch_contracts::report::{
    tone_overview, write_report, ModelOutcome, OutcomeStatus, RunReport, RunStatus,
};
use tonefetch_contracts::selection::{arbitrate, clamp_indices};

const TONE3000_API_BASE: &str = "https://www.tone3000.com/api/v1";
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_MODEL: &str = "gemini-2.5-flash";
const HTTP_TIMEOUT_SECONDS: u64 = 120;

const SEARCH_RESULT_HARD_CAP: usize = 25;
const MODELS_PAGE_SIZE: usize = 100;
const MAX_MODEL_SELECTIONS: usize = 5;
const DOWNLOAD_CHUNK_BYTES: usize = 8192;
const GEMINI_MAX_OUTPUT_TOKENS: u64 = 1024;
const ERROR_BODY_PREVIEW_CHARS: usize = 512;

/// Process-level configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub request: String,
    pub output_dir: PathBuf,
    /// Maximum tones to download.
    pub max_tones: usize,
    /// Maximum candidates shown to the language model.
    pub max_candidates: usize,
    /// Events file override; defaults to `events.jsonl` in the output dir.
    pub events_path: Option<PathBuf>,
}

impl RunConfig {
    pub fn new(request: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            request: request.into(),
            output_dir: output_dir.into(),
            max_tones: 3,
            max_candidates: 15,
            events_path: None,
        }
    }
}

/// Service credentials, passed explicitly so the pipeline holds no ambient
/// global state.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub tone3000_api_key: String,
    pub gemini_api_key: String,
}

/// Blocking client for the TONE3000 catalog API.
pub struct Tone3000Client {
    api_base: String,
    http: HttpClient,
    access_token: Option<String>,
    refresh_token: Option<String>,
}

impl Tone3000Client {
    pub fn new() -> Result<Self> {
        Self::with_api_base(TONE3000_API_BASE)
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
            .build()
            .context("failed to build TONE3000 HTTP client")?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            http,
            access_token: None,
            refresh_token: None,
        })
    }

    /// Exchanges the long-lived API key for session tokens. Token refresh is
    /// out of scope; a run lives well inside one session.
    pub fn authenticate(&mut self, api_key: &str) -> Result<(), PipelineError> {
        let response = self
            .http
            .post(format!("{}/auth/session", self.api_base))
            .json(&json!({ "api_key": api_key }))
            .send()
            .map_err(|err| transport_error("tone3000", err))?;
        let payload = response_json_or_error("tone3000", response)?;

        let access_token = payload
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| PipelineError::ServiceRequestFailed {
                service: "tone3000",
                status: 200,
                detail: "session response missing access_token".to_string(),
            })?;
        self.access_token = Some(access_token.to_string());
        self.refresh_token = payload
            .get("refresh_token")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    /// The session's refresh token, if the service issued one. Kept for
    /// callers that outlive a single run; this client never refreshes.
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    fn bearer_token(&self) -> Result<&str, PipelineError> {
        self.access_token
            .as_deref()
            .ok_or(PipelineError::AuthenticationMissing)
    }

    pub fn search_tones(
        &self,
        query: &str,
        gear: Option<&str>,
        page_size: usize,
    ) -> Result<Vec<Tone>, PipelineError> {
        let token = self.bearer_token()?;
        let page_size = page_size.min(SEARCH_RESULT_HARD_CAP);
        let mut params = vec![
            ("query".to_string(), query.to_string()),
            ("page_size".to_string(), page_size.to_string()),
            ("sort".to_string(), "downloads-all-time".to_string()),
        ];
        if let Some(gear) = gear {
            params.push(("gear".to_string(), gear.to_string()));
        }

        let response = self
            .http
            .get(format!("{}/tones/search", self.api_base))
            .query(&params)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .map_err(|err| transport_error("tone3000", err))?;
        let payload = response_json_or_error("tone3000", response)?;
        data_rows(payload, "tone3000")
    }

    pub fn get_models(&self, tone_id: u64) -> Result<Vec<ToneModel>, PipelineError> {
        let token = self.bearer_token()?;
        let response = self
            .http
            .get(format!("{}/models", self.api_base))
            .query(&[
                ("tone_id".to_string(), tone_id.to_string()),
                ("page_size".to_string(), MODELS_PAGE_SIZE.to_string()),
            ])
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .map_err(|err| transport_error("tone3000", err))?;
        let payload = response_json_or_error("tone3000", response)?;
        data_rows(payload, "tone3000")
    }

    /// Streams a model payload to `dest` in fixed-size chunks. The file
    /// handle is scoped to this call and closed on every exit path.
    pub fn download_model(&self, model_url: &str, dest: &Path) -> Result<u64, PipelineError> {
        let file_name = dest
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "model".to_string());
        let download_failed = |detail: String| PipelineError::DownloadFailed {
            name: file_name.clone(),
            detail,
        };

        let token = self.bearer_token()?;
        let mut response = self
            .http
            .get(model_url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .map_err(|err| download_failed(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(download_failed(format!(
                "status {}: {}",
                status.as_u16(),
                truncate_text(&body, ERROR_BODY_PREVIEW_CHARS)
            )));
        }

        let mut file = File::create(dest).map_err(|err| download_failed(err.to_string()))?;
        let mut buffer = [0u8; DOWNLOAD_CHUNK_BYTES];
        let mut written: u64 = 0;
        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|err| download_failed(err.to_string()))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .map_err(|err| download_failed(err.to_string()))?;
            written += read as u64;
        }
        Ok(written)
    }
}

impl ToneSearch for Tone3000Client {
    fn search(
        &self,
        query: &str,
        gear: Option<&str>,
        page_size: usize,
    ) -> Result<Vec<Tone>, PipelineError> {
        self.search_tones(query, gear, page_size)
    }
}

/// Blocking client for Gemini text generation with JSON output.
pub struct GeminiClient {
    api_base: String,
    model: String,
    api_key: String,
    http: HttpClient,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_api_base(GEMINI_API_BASE, api_key)
    }

    pub fn with_api_base(api_base: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
            .build()
            .context("failed to build Gemini HTTP client")?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            model: GEMINI_MODEL.to_string(),
            api_key: api_key.into(),
            http,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }

    /// Generates a JSON object from `prompt`.
    ///
    /// Explicit two-attempt state machine: attempt one sends the prompt
    /// as-is; if the response text cannot be recovered as a JSON object,
    /// attempt two resends with a stricter instruction appended. Transport
    /// and HTTP failures are fatal immediately; only extraction failures
    /// earn the retry.
    pub fn generate_json(
        &self,
        prompt: &str,
        schema: &Value,
    ) -> Result<serde_json::Map<String, Value>, PipelineError> {
        let mut last_error: Option<PipelineError> = None;
        for attempt in 0..2 {
            let attempt_prompt = if attempt == 0 {
                prompt.to_string()
            } else {
                stricter_attempt_prompt(prompt)
            };
            let payload = json!({
                "contents": [{
                    "role": "user",
                    "parts": [{ "text": attempt_prompt }],
                }],
                "generationConfig": {
                    "temperature": 0,
                    "maxOutputTokens": GEMINI_MAX_OUTPUT_TOKENS,
                    "responseMimeType": "application/json",
                    "responseSchema": schema,
                },
            });

            let response = self
                .http
                .post(self.endpoint())
                .query(&[("key", self.api_key.as_str())])
                .json(&payload)
                .send()
                .map_err(|err| transport_error("gemini", err))?;
            let body = response_json_or_error("gemini", response)?;
            let text = candidate_text(&Value::Object(body));

            match extract::json_object(&text) {
                Ok(object) => return Ok(object),
                Err(err) => last_error = Some(err),
            }
        }

        Err(last_error.unwrap_or(PipelineError::MalformedResponse {
            detail: "empty model response".to_string(),
        }))
    }
}

/// One run of the analyze → search → select → download pipeline.
pub struct SmartDownloader {
    catalog: Tone3000Client,
    llm: GeminiClient,
    config: RunConfig,
    events: EventLog,
    run_id: String,
}

impl SmartDownloader {
    /// Authenticates against the catalog and prepares the run. Network I/O
    /// happens here (session exchange), so construction can fail like any
    /// other service call.
    pub fn new(config: RunConfig, credentials: Credentials) -> Result<Self> {
        let run_id = format!("run-{}", Uuid::new_v4().simple());
        let events_path = config
            .events_path
            .clone()
            .unwrap_or_else(|| config.output_dir.join("events.jsonl"));
        let events = EventLog::new(events_path, run_id.clone());

        let mut catalog = Tone3000Client::new()?;
        catalog
            .authenticate(&credentials.tone3000_api_key)
            .context("TONE3000 authentication failed")?;
        let llm = GeminiClient::new(credentials.gemini_api_key)?;

        Ok(Self {
            catalog,
            llm,
            config,
            events,
            run_id,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run(&mut self) -> Result<RunReport> {
        fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!(
                "failed to create output directory {}",
                self.config.output_dir.display()
            )
        })?;
        let started_at = now_utc_iso();
        self.events.emit(
            "run_started",
            fields(json!({
                "request": self.config.request.clone(),
                "out_dir": self.config.output_dir.to_string_lossy(),
            })),
        )?;

        let analysis = self.analyze_request().context("request analysis failed")?;
        self.events.emit(
            "analysis_completed",
            fields(serde_json::to_value(&analysis).unwrap_or(Value::Null)),
        )?;

        let pool = build_pool(
            &self.catalog,
            &analysis,
            self.config.max_candidates,
            self.config.max_candidates,
        )
        .context("candidate pool construction failed")?;
        self.emit_pool_events(&pool)?;

        if pool.tones.is_empty() {
            self.events.emit("run_empty", EventFields::new())?;
            let report = self.build_report(
                RunStatus::EmptyPool,
                analysis,
                0,
                Vec::new(),
                Vec::new(),
                started_at,
            );
            write_report(&self.config.output_dir.join("summary.json"), &report)?;
            return Ok(report);
        }

        let candidates = shortlist(&pool.tones, self.config.max_candidates);
        let summaries: Vec<ToneSummary> = candidates
            .iter()
            .enumerate()
            .map(|(index, tone)| ToneSummary::from_tone(index, tone))
            .collect();
        let raw_indices = self
            .select_tones(&summaries)
            .context("tone selection failed")?;
        let final_indices = arbitrate(&candidates, &raw_indices, self.config.max_tones);
        self.events.emit(
            "tones_selected",
            fields(json!({
                "raw_indices": raw_indices.clone(),
                "final_indices": final_indices.clone(),
                "titles": final_indices
                    .iter()
                    .map(|&index| candidates[index].title.clone())
                    .collect::<Vec<_>>(),
            })),
        )?;

        let mut model_items: Vec<ModelOutcome> = Vec::new();
        let mut selected_tones = Vec::new();
        for &index in &final_indices {
            let tone = &candidates[index];
            selected_tones.push(tone_overview(tone));
            self.process_tone(tone, &mut model_items)
                .with_context(|| format!("processing tone '{}' failed", tone.title))?;
        }

        let report = self.build_report(
            RunStatus::Completed,
            analysis,
            pool.tones.len(),
            selected_tones,
            model_items,
            started_at,
        );
        write_report(&self.config.output_dir.join("summary.json"), &report)?;
        self.events.emit(
            "run_completed",
            fields(json!({
                "downloaded_count": report.downloaded_count,
                "total_items": report.model_items.len(),
            })),
        )?;
        Ok(report)
    }

    fn analyze_request(&self) -> Result<Analysis, PipelineError> {
        let prompt = analysis_prompt(&self.config.request);
        let object = self.llm.generate_json(&prompt, &analysis_schema())?;
        serde_json::from_value(Value::Object(object)).map_err(|err| {
            PipelineError::MalformedResponse {
                detail: format!("analysis object did not match the expected shape: {err}"),
            }
        })
    }

    fn select_tones(&self, summaries: &[ToneSummary]) -> Result<Vec<i64>, PipelineError> {
        let prompt = selection_prompt(&self.config.request, summaries, self.config.max_tones);
        let object = self.llm.generate_json(&prompt, &indices_schema())?;
        Ok(selected_indices(&object))
    }

    fn select_models(&self, tone: &Tone, models: &[ToneModel]) -> Result<Vec<i64>, PipelineError> {
        let prompt = model_filter_prompt(&self.config.request, tone, models);
        let object = self.llm.generate_json(&prompt, &indices_schema())?;
        Ok(selected_indices(&object))
    }

    /// Downloads the selected models of one tone into its artifact
    /// directory. Catalog and model-selection failures are fatal; an
    /// individual download failure is recorded and skipped over.
    fn process_tone(&self, tone: &Tone, model_items: &mut Vec<ModelOutcome>) -> Result<()> {
        let tone_dir = self
            .config
            .output_dir
            .join(tone_dir_name(&tone.title, tone.id));
        fs::create_dir_all(&tone_dir)?;
        fs::write(
            tone_dir.join("info.json"),
            serde_json::to_string_pretty(tone)?,
        )?;

        let models = self
            .catalog
            .get_models(tone.id)
            .context("model listing failed")?;
        let raw_indices = self
            .select_models(tone, &models)
            .context("model selection failed")?;
        let indices = clamp_indices(models.len(), &raw_indices, MAX_MODEL_SELECTIONS);

        for &index in &indices {
            let model = &models[index];
            let file_name = normalize_model_file_name(&model.name, tone.platform.as_deref());
            let target = tone_dir.join(&file_name);
            let outcome = fetch_model_file(&target, |path| {
                self.catalog.download_model(&model.model_url, path)
            });

            let item = match outcome {
                Ok(FetchOutcome::SkippedExists(bytes)) => {
                    self.events.emit(
                        "model_skipped",
                        fields(json!({
                            "tone_id": tone.id,
                            "file_name": file_name.clone(),
                        })),
                    )?;
                    model_outcome(
                        tone,
                        &file_name,
                        &target,
                        OutcomeStatus::SkippedExists,
                        Some(megabytes(bytes)),
                        None,
                    )
                }
                Ok(FetchOutcome::Downloaded(bytes)) => {
                    self.events.emit(
                        "model_downloaded",
                        fields(json!({
                            "tone_id": tone.id,
                            "file_name": file_name.clone(),
                            "size_mb": megabytes(bytes),
                        })),
                    )?;
                    model_outcome(
                        tone,
                        &file_name,
                        &target,
                        OutcomeStatus::Downloaded,
                        Some(megabytes(bytes)),
                        None,
                    )
                }
                Err(err) => {
                    self.events.emit(
                        "model_failed",
                        fields(json!({
                            "tone_id": tone.id,
                            "file_name": file_name.clone(),
                            "error": err.to_string(),
                        })),
                    )?;
                    model_outcome(
                        tone,
                        &file_name,
                        &target,
                        OutcomeStatus::Failed,
                        None,
                        Some(err.to_string()),
                    )
                }
            };
            model_items.push(item);
        }
        Ok(())
    }

    fn emit_pool_events(&self, pool: &PoolOutcome) -> Result<()> {
        for stat in &pool.queries {
            self.events.emit(
                "search_completed",
                fields(serde_json::to_value(stat).unwrap_or(Value::Null)),
            )?;
        }
        self.events.emit(
            "pool_built",
            fields(json!({ "pool_size": pool.tones.len() })),
        )?;
        Ok(())
    }

    fn build_report(
        &self,
        status: RunStatus,
        analysis: Analysis,
        pool_size: usize,
        selected_tones: Vec<serde_json::Map<String, Value>>,
        model_items: Vec<ModelOutcome>,
        started_at: String,
    ) -> RunReport {
        let downloaded_count = model_items
            .iter()
            .filter(|item| item.status == OutcomeStatus::Downloaded)
            .count();
        RunReport {
            run_id: self.run_id.clone(),
            status,
            request: self.config.request.clone(),
            analysis,
            pool_size,
            selected_tones,
            downloaded_count,
            model_items,
            output_dir: self.config.output_dir.to_string_lossy().to_string(),
            started_at,
            finished_at: now_utc_iso(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum FetchOutcome {
    Downloaded(u64),
    SkippedExists(u64),
}

/// Idempotent fetch: an existing target is never re-fetched; a failed fetch
/// removes its partial file so a re-run retries instead of skipping a
/// truncated artifact.
fn fetch_model_file<F>(target: &Path, fetch: F) -> Result<FetchOutcome, PipelineError>
where
    F: FnOnce(&Path) -> Result<u64, PipelineError>,
{
    if target.exists() {
        let bytes = fs::metadata(target).map(|meta| meta.len()).unwrap_or(0);
        return Ok(FetchOutcome::SkippedExists(bytes));
    }
    match fetch(target) {
        Ok(bytes) => Ok(FetchOutcome::Downloaded(bytes)),
        Err(err) => {
            let _ = fs::remove_file(target);
            Err(err)
        }
    }
}

fn model_outcome(
    tone: &Tone,
    file_name: &str,
    target: &Path,
    status: OutcomeStatus,
    size_mb: Option<f64>,
    error: Option<String>,
) -> ModelOutcome {
    ModelOutcome {
        tone_id: tone.id,
        tone_title: tone.title.clone(),
        file_name: file_name.to_string(),
        status,
        path: target.to_string_lossy().to_string(),
        size_mb,
        error,
    }
}

/// Popularity shortlist shown to the language model: the pool sorted by
/// download count descending (stable, so ties keep first-seen order),
/// truncated to `max_candidates`.
fn shortlist(tones: &[Tone], max_candidates: usize) -> Vec<Tone> {
    let mut sorted = tones.to_vec();
    sorted.sort_by_key(|tone| std::cmp::Reverse(tone.downloads_count));
    sorted.truncate(max_candidates);
    sorted
}

fn analysis_prompt(request: &str) -> String {
    format!(
        r#"The user wants this guitar tone: "{request}"

Work out which gear and search terms fit the request.
Rules:
- Only pick popular gear that is likely to exist in a tone catalog.
- `search_queries`: at most 3 short search terms.
- `fallback_queries`: at most 3 alternative or similar-tone terms.
- `gear_type`: "amp", "ir", "pedal" or null.
- Keep every string on a single line (no newlines).

Return only JSON, no extra commentary:
{{"search_queries": ["term1", "term2"], "gear_type": "amp", "description": "one-line summary of the tone", "fallback_queries": ["alt1", "alt2"]}}"#
    )
}

fn selection_prompt(request: &str, summaries: &[ToneSummary], max_selections: usize) -> String {
    let rows = serde_json::to_string(summaries).unwrap_or_else(|_| "[]".to_string());
    format!(
        r#"The user wants this guitar tone: "{request}"

Candidate tones:
{rows}

Pick the {max_selections} most suitable tones. Consider:
- Does the description match the request?
- Is the download count high (popular)?
- How relevant are the title and description?
- If the user named a specific artist or song, which candidate is closest?
- If an amp capture already has a boost/overdrive in its chain (e.g. TS/SD-1/Klon), do not also pick a preamp/boost pedal (avoid redundancy).
- Only pick listed index numbers.

Return only JSON with the INDEX numbers of your picks:
{{"selected_indices": [0, 2, 5]}}"#
    )
}

fn model_filter_prompt(request: &str, tone: &Tone, models: &[ToneModel]) -> String {
    let rows: Vec<Value> = models
        .iter()
        .enumerate()
        .map(|(index, model)| {
            json!({
                "index": index,
                "name": model.name,
                "size": model.size,
            })
        })
        .collect();
    let rows = serde_json::to_string(&rows).unwrap_or_else(|_| "[]".to_string());
    format!(
        r#"The user wants this guitar tone: "{request}"
Tone: "{title}"
Description: "{description}"

Available model files for this tone:
{rows}

Pick only the models the user actually needs. For example:
- For a "clean" request skip CRUNCH or HIGH GAIN channels.
- For a "high gain" request skip the CLEAN channel.
- If one channel exists at several gain levels, pick the closest match to the request.
- "RED" usually means high-gain, "CRUNCH" mid-gain, "CLEAN" clean.
- A "standard" size is enough; pick "nano" or "feather" only when performance matters.
- If there are only 1-2 models and they look relevant, pick them all.

Pick at most {MAX_MODEL_SELECTIONS} models.

Return only JSON with the INDEX numbers of your picks:
{{"selected_indices": [0, 2]}}"#,
        title = tone.title,
        description = tone.description.as_deref().unwrap_or_default(),
    )
}

fn stricter_attempt_prompt(prompt: &str) -> String {
    format!(
        "{prompt}\n\nIMPORTANT: Your previous response was invalid JSON. \
         Return ONLY valid JSON that matches the required schema. \
         Do not include newlines inside string values."
    )
}

fn analysis_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "search_queries": {"type": "array", "items": {"type": "string"}, "max_items": 3},
            "gear_type": {"type": "string", "enum": ["amp", "ir", "pedal"], "nullable": true},
            "description": {"type": "string"},
            "fallback_queries": {"type": "array", "items": {"type": "string"}, "max_items": 3},
        },
        "required": ["search_queries", "gear_type", "description", "fallback_queries"],
    })
}

fn indices_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "selected_indices": {"type": "array", "items": {"type": "integer"}, "min_items": 1},
        },
        "required": ["selected_indices"],
    })
}

/// Concatenated text parts of the first candidate in a Gemini response.
fn candidate_text(payload: &Value) -> String {
    let parts = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("")
}

fn selected_indices(object: &serde_json::Map<String, Value>) -> Vec<i64> {
    object
        .get("selected_indices")
        .and_then(Value::as_array)
        .map(|rows| rows.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

fn data_rows<T: serde::de::DeserializeOwned>(
    payload: serde_json::Map<String, Value>,
    service: &'static str,
) -> Result<Vec<T>, PipelineError> {
    let rows = payload
        .get("data")
        .cloned()
        .ok_or_else(|| PipelineError::ServiceRequestFailed {
            service,
            status: 200,
            detail: "response payload missing data rows".to_string(),
        })?;
    serde_json::from_value(rows).map_err(|err| PipelineError::ServiceRequestFailed {
        service,
        status: 200,
        detail: format!("data rows did not match the expected shape: {err}"),
    })
}

fn transport_error(service: &'static str, err: reqwest::Error) -> PipelineError {
    PipelineError::ServiceRequestFailed {
        service,
        status: err.status().map(|status| status.as_u16()).unwrap_or(0),
        detail: err.to_string(),
    }
}

fn response_json_or_error(
    service: &'static str,
    response: HttpResponse,
) -> Result<serde_json::Map<String, Value>, PipelineError> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|err| transport_error(service, err))?;
    if !status.is_success() {
        return Err(PipelineError::ServiceRequestFailed {
            service,
            status: status.as_u16(),
            detail: truncate_text(&body, ERROR_BODY_PREVIEW_CHARS),
        });
    }
    match serde_json::from_str::<Value>(&body) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) | Err(_) => Err(PipelineError::ServiceRequestFailed {
            service,
            status: status.as_u16(),
            detail: "invalid JSON payload".to_string(),
        }),
    }
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn fields(value: Value) -> EventFields {
    value.as_object().cloned().unwrap_or_default()
}

fn megabytes(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use tonefetch_contracts::catalog::{Tone, ToneSummary};
    use tonefetch_contracts::error::PipelineError;

    use super::{
        analysis_prompt, analysis_schema, candidate_text, fetch_model_file, indices_schema,
        megabytes, model_filter_prompt, selected_indices, selection_prompt, shortlist,
        stricter_attempt_prompt, truncate_text, FetchOutcome,
    };

    fn tone(id: u64, title: &str, downloads: u64) -> Tone {
        serde_json::from_value(json!({
            "id": id,
            "title": title,
            "gear": "amp",
            "downloads_count": downloads,
        }))
        .expect("tone fixture")
    }

    #[test]
    fn candidate_text_joins_all_parts_of_the_first_candidate() {
        let payload = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "{\"selected"},
                        {"inlineData": {"data": "ignored"}},
                        {"text": "_indices\": [0]}"},
                    ],
                },
            }],
        });
        assert_eq!(candidate_text(&payload), "{\"selected_indices\": [0]}");
        assert_eq!(candidate_text(&json!({})), "");
        assert_eq!(candidate_text(&json!({"candidates": []})), "");
    }

    #[test]
    fn selected_indices_keeps_integers_only() {
        let object = json!({"selected_indices": [0, 2, "x", 5.5, -1]})
            .as_object()
            .cloned()
            .expect("object");
        assert_eq!(selected_indices(&object), vec![0, 2, -1]);

        let empty = json!({"other": 1}).as_object().cloned().expect("object");
        assert!(selected_indices(&empty).is_empty());
    }

    #[test]
    fn shortlist_sorts_by_downloads_and_truncates() {
        let tones = vec![
            tone(1, "low", 10),
            tone(2, "high", 500),
            tone(3, "mid-a", 100),
            tone(4, "mid-b", 100),
        ];
        let top = shortlist(&tones, 3);
        let titles: Vec<&str> = top.iter().map(|t| t.title.as_str()).collect();
        // Stable sort keeps mid-a before mid-b.
        assert_eq!(titles, vec!["high", "mid-a", "mid-b"]);
    }

    #[test]
    fn fetch_skips_existing_files_without_calling_fetch() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let target = temp.path().join("existing.nam");
        std::fs::write(&target, b"already here")?;

        let outcome = fetch_model_file(&target, |_| {
            panic!("fetch must not run for an existing file")
        })?;
        assert_eq!(outcome, FetchOutcome::SkippedExists(12));
        assert_eq!(std::fs::read(&target)?, b"already here");
        Ok(())
    }

    #[test]
    fn fetch_reports_written_bytes_on_success() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let target = temp.path().join("fresh.nam");
        let outcome = fetch_model_file(&target, |path| {
            std::fs::write(path, b"payload").map_err(|err| PipelineError::DownloadFailed {
                name: "fresh.nam".to_string(),
                detail: err.to_string(),
            })?;
            Ok(7)
        })?;
        assert_eq!(outcome, FetchOutcome::Downloaded(7));
        Ok(())
    }

    #[test]
    fn fetch_removes_the_partial_file_on_failure() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let target = temp.path().join("broken.nam");
        let result = fetch_model_file(&target, |path| {
            std::fs::write(path, b"partial").expect("partial write");
            Err(PipelineError::DownloadFailed {
                name: "broken.nam".to_string(),
                detail: "connection reset".to_string(),
            })
        });
        assert!(result.is_err());
        // The truncated artifact must not satisfy the exists check next run.
        assert!(!target.exists());
        Ok(())
    }

    #[test]
    fn prompts_embed_their_inputs() -> anyhow::Result<()> {
        let prompt = analysis_prompt("Van Halen brown sound");
        assert!(prompt.contains("Van Halen brown sound"));
        assert!(prompt.contains("search_queries"));

        let summary = ToneSummary::from_tone(0, &tone(1, "5150 Lead", 900));
        let prompt = selection_prompt("brown sound", &[summary], 3);
        assert!(prompt.contains("5150 Lead"));
        assert!(prompt.contains("Pick the 3 most suitable tones"));

        let owner = tone(1, "5150 Lead", 900);
        let models = vec![serde_json::from_value(json!({
            "name": "Lead Channel",
            "size": "standard",
            "model_url": "https://example.com/m/1",
        }))?];
        let prompt = model_filter_prompt("brown sound", &owner, &models);
        assert!(prompt.contains("Lead Channel"));
        assert!(prompt.contains("at most 5 models"));
        Ok(())
    }

    #[test]
    fn stricter_prompt_appends_the_retry_instruction() {
        let amended = stricter_attempt_prompt("base prompt");
        assert!(amended.starts_with("base prompt"));
        assert!(amended.contains("invalid JSON"));
        assert!(amended.contains("newlines"));
    }

    #[test]
    fn schemas_require_their_fields() {
        let analysis = analysis_schema();
        assert_eq!(
            analysis["required"],
            json!(["search_queries", "gear_type", "description", "fallback_queries"])
        );
        let indices = indices_schema();
        assert_eq!(indices["required"], json!(["selected_indices"]));
    }

    #[test]
    fn megabytes_rounds_to_two_decimals() {
        assert_eq!(megabytes(0), 0.0);
        assert_eq!(megabytes(1024 * 1024), 1.0);
        assert_eq!(megabytes(12_345_678), 11.77);
    }

    #[test]
    fn truncate_text_appends_an_ellipsis_only_when_needed() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("0123456789", 10), "0123456789");
        assert_eq!(truncate_text("0123456789x", 10), "0123456789…");
    }
}
