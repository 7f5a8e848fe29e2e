//! Code generation oracle: the language model behind questions and charts.
//!
//! The [`CodeOracle`] trait is the seam between the pipeline and whatever
//! turns natural language into sandbox fragments. Two implementations ship:
//!
//! - **[`DisabledOracle`]** — every call fails with
//!   [`Error::CodeGeneration`]; useful offline and as the default.
//! - **[`OpenAiOracle`]** — calls an OpenAI-compatible
//!   `POST {url}/chat/completions` endpoint.
//!
//! # Retry Strategy
//!
//! The HTTP client uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (other) → fail immediately
//! - Network errors → retry
//!
//! Backoff: 1s, 2s, 4s, 8s, ... capped at 32s.
//!
//! Fragments come back as free text; [`extract_code`] pulls the first
//! fenced block out of it. Nothing about a fragment is trusted: the sandbox
//! validates what it binds.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::OracleConfig;
use crate::error::{Error, Result};
use crate::sandbox::ResultShape;

/// Longest result rendering handed to the summariser.
const SUMMARY_PREVIEW_CHARS: usize = 4000;

/// What a user message is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Intent {
    #[serde(rename = "greeting")]
    Greeting,
    #[serde(rename = "data_query")]
    DataAnalysis,
    #[serde(rename = "visualization")]
    ChartRequest,
    #[serde(rename = "out_of_scope")]
    OutOfScope,
    #[serde(rename = "conversational")]
    Conversation,
}

impl Intent {
    pub fn label(&self) -> &'static str {
        match self {
            Intent::Greeting => "greeting",
            Intent::DataAnalysis => "data_query",
            Intent::ChartRequest => "visualization",
            Intent::OutOfScope => "out_of_scope",
            Intent::Conversation => "conversational",
        }
    }

    /// Find an intent label in a model reply. Replies that name none are
    /// general conversation.
    pub fn from_reply(reply: &str) -> Intent {
        let reply = reply.trim().to_lowercase();
        [
            Intent::Greeting,
            Intent::DataAnalysis,
            Intent::ChartRequest,
            Intent::OutOfScope,
            Intent::Conversation,
        ]
        .into_iter()
        .find(|i| reply.contains(i.label()))
        .unwrap_or(Intent::Conversation)
    }
}

/// Turns questions and chart requests into sandbox fragments, and results
/// back into prose.
///
/// `schemas` is the session's schema map: composite key → schema summary
/// (columns, dtypes, row count, sample rows, statistics, `has_data`).
#[async_trait]
pub trait CodeOracle: Send + Sync {
    async fn classify(&self, message: &str, schemas: &Value) -> Result<Intent>;

    async fn generate_analysis_code(&self, question: &str, schemas: &Value) -> Result<String>;

    async fn generate_chart_code(&self, request: &str, schemas: &Value) -> Result<String>;

    async fn summarize_result(&self, question: &str, result: &ResultShape) -> Result<String>;

    /// Reply to a message that needs no data: greetings, small talk and
    /// out-of-scope questions.
    async fn respond(&self, intent: Intent, message: &str) -> Result<String>;
}

/// Build the oracle selected by `config.provider`.
pub fn build_oracle(config: &OracleConfig) -> Result<Arc<dyn CodeOracle>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledOracle)),
        "openai" => Ok(Arc::new(OpenAiOracle::new(config)?)),
        other => Err(Error::CodeGeneration(format!("unknown oracle provider '{}'", other))),
    }
}

/// Canned reply used when the oracle cannot produce one.
pub fn fallback_reply(intent: Intent, message: &str) -> String {
    let lower = message.to_lowercase();
    let greets = lower
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
        .any(|t| matches!(t, "hi" | "hello" | "hey"));
    let reply = match intent {
        Intent::OutOfScope => {
            "I'm focused on helping you analyze your data. Could you ask me something about your uploaded files instead?"
        }
        _ if greets => "Hello! I'm here to help you analyze your data. How can I assist you today?",
        _ => "I'm here to help you with your data analysis. What would you like to know?",
    };
    reply.to_string()
}

// ============ Disabled ============

/// Oracle for deployments without a language model.
pub struct DisabledOracle;

fn disabled() -> Error {
    Error::CodeGeneration("no code generation oracle is configured".to_string())
}

#[async_trait]
impl CodeOracle for DisabledOracle {
    async fn classify(&self, _message: &str, _schemas: &Value) -> Result<Intent> {
        Err(disabled())
    }

    async fn generate_analysis_code(&self, _question: &str, _schemas: &Value) -> Result<String> {
        Err(disabled())
    }

    async fn generate_chart_code(&self, _request: &str, _schemas: &Value) -> Result<String> {
        Err(disabled())
    }

    async fn summarize_result(&self, _question: &str, _result: &ResultShape) -> Result<String> {
        Err(disabled())
    }

    async fn respond(&self, _intent: Intent, _message: &str) -> Result<String> {
        Err(disabled())
    }
}

// ============ OpenAI-compatible ============

/// Oracle backed by an OpenAI-compatible chat completions API.
///
/// The API key is read from the environment variable named by
/// `oracle.api_key_env` (default `OPENAI_API_KEY`) when the oracle is built.
pub struct OpenAiOracle {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAiOracle {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::CodeGeneration("oracle.model required for openai provider".to_string()))?;

        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            Error::CodeGeneration(format!("{} environment variable not set", config.api_key_env))
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::CodeGeneration(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.url.trim_end_matches('/')),
            model,
            api_key,
            max_retries: config.max_retries,
        })
    }

    /// One chat completion with retry/backoff. Returns the first choice's text.
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response
                            .json()
                            .await
                            .map_err(|e| Error::CodeGeneration(e.to_string()))?;
                        return parse_completion(&json);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        tracing::warn!(attempt, status = %status, "Oracle request failed, retrying");
                        last_err = Some(Error::CodeGeneration(format!(
                            "oracle API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(Error::CodeGeneration(format!(
                        "oracle API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Oracle request failed, retrying");
                    last_err = Some(Error::CodeGeneration(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::CodeGeneration("oracle failed after retries".to_string())))
    }
}

/// Text of `choices[0].message.content`.
fn parse_completion(json: &Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| Error::CodeGeneration("invalid completion response: missing choices[0].message.content".to_string()))
}

#[async_trait]
impl CodeOracle for OpenAiOracle {
    async fn classify(&self, message: &str, schemas: &Value) -> Result<Intent> {
        let reply = self.complete(CLASSIFY_SYSTEM, &classify_prompt(message, schemas)).await?;
        Ok(Intent::from_reply(&reply))
    }

    async fn generate_analysis_code(&self, question: &str, schemas: &Value) -> Result<String> {
        let prompt = format!(
            "{}\n\nQuestion: {}\n\nAssign the answer to the global `result`.",
            schema_context(schemas),
            question
        );
        let reply = self.complete(&analysis_system(), &prompt).await?;
        Ok(extract_code(&reply))
    }

    async fn generate_chart_code(&self, request: &str, schemas: &Value) -> Result<String> {
        let prompt = format!(
            "{}\n\nChart request: {}\n\nAssign the figure to the global `fig`.",
            schema_context(schemas),
            request
        );
        let reply = self.complete(&chart_system(), &prompt).await?;
        Ok(extract_code(&reply))
    }

    async fn summarize_result(&self, question: &str, result: &ResultShape) -> Result<String> {
        let prompt = format!(
            "The user asked: \"{}\"\n\nThe data analysis returned ({}): {}",
            question,
            result.kind(),
            result.preview(SUMMARY_PREVIEW_CHARS)
        );
        self.complete(SUMMARY_SYSTEM, &prompt).await
    }

    async fn respond(&self, intent: Intent, message: &str) -> Result<String> {
        let system = match intent {
            Intent::OutOfScope => OUT_OF_SCOPE_SYSTEM,
            _ => CONVERSATION_SYSTEM,
        };
        self.complete(system, &format!("User message: \"{}\"", message)).await
    }
}

// ============ Prompts ============

const CLASSIFY_SYSTEM: &str = "You classify messages sent to a spreadsheet analysis assistant. \
Categories: greeting (salutations, thanks, small talk), data_query (questions that need the \
uploaded data analysed), visualization (requests for charts, graphs, plots), out_of_scope \
(unrelated to data analysis), conversational (anything else). Respond with ONLY one word: \
greeting, data_query, visualization, out_of_scope, or conversational.";

const SUMMARY_SYSTEM: &str = "You are a friendly data analysis assistant. Answer the user's \
question clearly and concisely from the analysis result you are given. Do not mention code, \
table variables or the analysis engine.";

const CONVERSATION_SYSTEM: &str = "You are a friendly assistant for a spreadsheet analysis \
tool. Reply warmly in two or three sentences. Do not reveal details about uploaded files unless \
asked, and do not mention code.";

const OUT_OF_SCOPE_SYSTEM: &str = "You are an assistant for a spreadsheet analysis tool. The \
user asked something outside data analysis. Politely decline in one or two sentences and \
suggest asking about their uploaded data.";

/// Reference for the Lua environment fragments run in.
const SANDBOX_API: &str = r#"Fragments are Lua 5.4 with only the string, table, math and utf8 libraries.
There is no io, os, require, load or file access.

Globals:
- tables["<key>"]: a frame per table. Fields: name, source, columns (list), dtypes (map),
  rows (list of records keyed by column; missing cells are nil), has_data.
- frame methods (call with colon): column(c) (non-missing values), values(c) (aligned, missing
  as null), filter(fn(row)), select(c1, c2, ...), with_column(name, fn(row)), sort_by(c, desc),
  head(n), group_by(c) -> list of {key, frame}, aggregate(by, {col = "sum"|"mean"|"min"|"max"|
  "count"|"median"|"nunique"|"first"|"last"|fn(values)}), sum(c), mean(c), min(c), max(c),
  median(c), count([c]), unique(c), records().
- frame.new(columns, rows), frame.from_records(list), frame.sum/mean/min/max/median/count/unique(list).
- chart.bar(x, y, opts), chart.line(x, y, opts), chart.scatter(x, y, opts), chart.pie(labels,
  values, opts), chart.histogram(x, opts), chart.box(y, opts): Plotly traces; opts are merged
  into the trace. chart.figure(trace_or_traces, layout) builds {data, layout}; a string
  layout.title becomes {text = ...}.
- json.encode(v), json.parse(s), null, print(...), log.info/warn/error/debug(msg).

Integer division is //. Use tostring() before concatenating numbers.
Return ONLY the Lua code in one ```lua fenced block."#;

fn analysis_system() -> String {
    format!(
        "You write Lua fragments that answer questions about spreadsheet tables.\n\n{}\n\n\
         Store the final answer in the global `result`: a frame, a list of records, a list of \
         values, a number, a string or a boolean. Pick the most relevant table from the \
         column names when the question does not name one.",
        SANDBOX_API
    )
}

fn chart_system() -> String {
    format!(
        "You write Lua fragments that build charts from spreadsheet tables.\n\n{}\n\n\
         Store the figure in the global `fig` (use chart.figure), or a JSON-encoded Plotly \
         figure in `chart_json`. Pick the most relevant table from the column names when the \
         request does not name one.",
        SANDBOX_API
    )
}

fn classify_prompt(message: &str, schemas: &Value) -> String {
    let keys: Vec<&str> = schemas
        .as_object()
        .map(|m| m.keys().map(String::as_str).take(5).collect())
        .unwrap_or_default();
    if keys.is_empty() {
        format!("User message: \"{}\"", message)
    } else {
        format!(
            "User message: \"{}\"\n\nAvailable data: {} table(s) - {}",
            message,
            schemas.as_object().map(|m| m.len()).unwrap_or(0),
            keys.join(", ")
        )
    }
}

/// Describe every table for a code generation prompt.
pub fn schema_context(schemas: &Value) -> String {
    let Some(tables) = schemas.as_object() else {
        return "No tables are available.".to_string();
    };
    let mut out = Vec::new();
    for (key, info) in tables {
        out.push(format!("Table: tables[\"{}\"]", key));
        if info.get("has_data").and_then(Value::as_bool) == Some(false) {
            out.push("  (raw data unavailable: rows is empty)".to_string());
        }
        if let Some(dtypes) = info.get("dtypes").and_then(Value::as_object) {
            let cols: Vec<String> = info
                .get("columns")
                .and_then(Value::as_array)
                .map(|cols| {
                    cols.iter()
                        .filter_map(Value::as_str)
                        .map(|c| {
                            let dtype = dtypes.get(c).and_then(Value::as_str).unwrap_or("object");
                            format!("{} ({})", c, dtype)
                        })
                        .collect()
                })
                .unwrap_or_default();
            out.push(format!("  Columns: {}", cols.join(", ")));
        }
        if let Some(n) = info.get("row_count") {
            out.push(format!("  Row count: {}", n));
        }
        if let Some(rows) = info.get("sample_rows").and_then(Value::as_array) {
            if !rows.is_empty() {
                out.push("  Sample rows:".to_string());
                for (i, row) in rows.iter().take(3).enumerate() {
                    out.push(format!("    Row {}: {}", i + 1, row));
                }
            }
        }
    }
    out.join("\n")
}

/// Pull the code out of a model reply: the first fenced block if there is
/// one (any language tag), else the whole reply.
pub fn extract_code(reply: &str) -> String {
    let Some(start) = reply.find("```") else {
        return reply.trim().to_string();
    };
    let after = &reply[start + 3..];
    // Skip the language tag line.
    let body = match after.find('\n') {
        Some(nl) => &after[nl + 1..],
        None => return reply.trim().trim_matches('`').trim().to_string(),
    };
    match body.find("```") {
        Some(end) => body[..end].trim().to_string(),
        None => body.trim().to_string(),
    }
}
