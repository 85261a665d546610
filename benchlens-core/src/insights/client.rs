//! Insight text collaborator.
//!
//! The collaborator writes the insight text. It receives a prompt carrying
//! the current period, the entity's baseline, the platform aggregate and the
//! computed deviations, and answers with `{"insights": [...]}`.

use crate::benchmark::Comparison;
use crate::config::{EntityTypeConfig, LlmConfig, LlmProvider, Thresholds};
use crate::types::{AggregateSnapshot, DashboardPeriodMetrics, EntityBaseline, InsightCandidate};
use crate::{Error, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You are a benchmarking analytics engine. Respond ONLY with valid JSON of the form {\"insights\": [...]} and no additional text.";

/// Completion interface for insight text.
pub trait InsightClient: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String>;
}

/// Create the default HTTP-backed client.
pub fn create_insight_client(llm: &LlmConfig) -> Result<Box<dyn InsightClient>> {
    Ok(Box::new(HttpInsightClient::new(llm)?))
}

/// Everything the prompt is built from.
pub struct PromptInput<'a> {
    pub entity_type: &'a str,
    pub type_config: &'a EntityTypeConfig,
    pub current: &'a DashboardPeriodMetrics,
    pub baseline: &'a EntityBaseline,
    pub aggregate: Option<&'a AggregateSnapshot>,
    pub comparison: &'a Comparison,
    pub thresholds: &'a Thresholds,
}

/// Render the generation prompt.
pub fn build_prompt(input: &PromptInput<'_>) -> String {
    let pretty = |value: &Value| serde_json::to_string_pretty(value).unwrap_or_default();

    let dashboard = json!({
        "parameters": input.current.period,
        "queries": input.current.queries,
    });
    let baseline = json!(input.baseline.queries);
    let aggregate = match input.aggregate {
        Some(snapshot) => json!(snapshot),
        None => json!({}),
    };
    let deviations = json!(input.comparison.deviations);

    let query_notes: String = input
        .type_config
        .queries
        .iter()
        .filter_map(|(name, spec)| {
            spec.description
                .as_ref()
                .map(|d| format!("- {name}: {d}\n"))
        })
        .collect();

    let t = input.thresholds;
    format!(
        r#"Analyze this {entity_type}'s current performance against its own history and the platform benchmark.

CURRENT DASHBOARD DATA:
{dashboard}

{entity_type_upper} LIFETIME/HISTORICAL DATA:
{baseline}

PLATFORM BENCHMARKS (all {entity_type}s):
{aggregate}

COMPUTED DEVIATIONS (percent; null means the reference was zero or missing):
{deviations}

QUERIES:
{query_notes}
Provide {target} insights in the following JSON format:
{{
  "insights": [
    {{
      "title": "Brief insight title",
      "observation": "What the data shows",
      "recommendation": "Specific actionable recommendation",
      "priority": "high|medium|low",
      "comparison_type": "self|benchmark|both",
      "metrics": ["relevant metric names"]
    }}
  ]
}}

comparison_type is "self" for current vs own history, "benchmark" for current vs platform, "both" when both tell the story.

Prioritization Rules:
- HIGH: deviations of at least {self_high}% from self OR {benchmark_high}% from benchmark
- MEDIUM: deviations of at least {self_medium}% from self OR {benchmark_medium}% from benchmark
- LOW: minor deviations or positive confirmations

Cite metrics by the names used in COMPUTED DEVIATIONS. Respond ONLY with valid JSON, no additional text.
"#,
        entity_type = input.entity_type,
        entity_type_upper = input.entity_type.to_uppercase(),
        dashboard = pretty(&dashboard),
        baseline = pretty(&baseline),
        aggregate = pretty(&aggregate),
        deviations = pretty(&deviations),
        query_notes = query_notes,
        target = input.type_config.target_insights,
        self_high = t.self_high,
        benchmark_high = t.benchmark_high,
        self_medium = t.self_medium,
        benchmark_medium = t.benchmark_medium,
    )
}

/// SHA-256 of a prompt, hex encoded.
pub fn prompt_hash(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Candidates parsed from one response.
#[derive(Debug, Clone, Default)]
pub struct ParsedCandidates {
    pub candidates: Vec<InsightCandidate>,
    /// Elements that were not insight-shaped objects
    pub malformed: usize,
}

/// Parse a collaborator response into candidates.
///
/// Accepts bare JSON, fenced JSON, or JSON embedded in prose. Each element of
/// `insights` is parsed on its own so one malformed element only drops itself.
pub fn parse_candidates(raw: &str) -> Result<ParsedCandidates> {
    let parsed = match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value) => value,
        Err(_) => {
            let extracted = extract_json_object(raw)?;
            serde_json::from_str::<Value>(&extracted)
                .map_err(|e| Error::Llm(format!("response is not valid JSON: {e}")))?
        }
    };

    let elements = match parsed {
        Value::Object(mut map) => match map.remove("insights") {
            Some(Value::Array(items)) => items,
            Some(_) => return Err(Error::Llm("`insights` must be an array".to_string())),
            None => return Err(Error::Llm("response missing `insights` array".to_string())),
        },
        Value::Array(items) => items,
        _ => {
            return Err(Error::Llm(
                "response must be a JSON object with `insights`".to_string(),
            ))
        }
    };

    let mut result = ParsedCandidates::default();
    for (index, element) in elements.into_iter().enumerate() {
        match serde_json::from_value::<InsightCandidate>(element) {
            Ok(candidate) => result.candidates.push(candidate),
            Err(e) => {
                tracing::warn!(index, error = %e, "Skipping malformed insight element");
                result.malformed += 1;
            }
        }
    }
    Ok(result)
}

fn extract_json_object(raw: &str) -> Result<String> {
    let start = raw
        .find('{')
        .ok_or_else(|| Error::Llm("response did not contain a JSON object".to_string()))?;
    let end = raw
        .rfind('}')
        .ok_or_else(|| Error::Llm("response did not contain a JSON object".to_string()))?;
    if end <= start {
        return Err(Error::Llm("response JSON bounds are invalid".to_string()));
    }
    Ok(raw[start..=end].to_string())
}

struct HttpInsightClient {
    model: String,
    provider: LlmProvider,
    endpoint: String,
    api_key: Option<String>,
    temperature: f64,
    max_tokens: u32,
    runtime: tokio::runtime::Runtime,
    http: reqwest::Client,
}

impl HttpInsightClient {
    fn new(config: &LlmConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| config.provider.default_endpoint().to_string());
        let api_key = config.api_key.clone().or_else(|| {
            config
                .provider
                .api_key_env()
                .and_then(|var| std::env::var(var).ok())
        });

        if config.provider != LlmProvider::Ollama && api_key.is_none() {
            return Err(Error::Config(
                "llm.api_key (or provider env var) is required".to_string(),
            ));
        }

        // Batch generation calls `complete` from several threads at once.
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| Error::Llm(format!("failed to build tokio runtime: {e}")))?;
        let timeout_secs = config.timeout_secs.max(1);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| Error::Llm(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            model: config.model.clone(),
            provider: config.provider,
            endpoint,
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            runtime,
            http,
        })
    }

    async fn post(&self, label: &str, url: String, headers: HeaderMap, body: Value) -> Result<Value> {
        let resp = self
            .http
            .post(url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("{label} request failed: {e}")))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Llm(format!("{label} read body failed: {e}")))?;
        if !status.is_success() {
            return Err(Error::Llm(format!(
                "{label} returned {}: {}",
                status.as_u16(),
                text
            )));
        }
        serde_json::from_str(&text)
            .map_err(|e| Error::Llm(format!("{label} returned invalid JSON: {e}")))
    }

    fn bearer_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!(
                "Bearer {}",
                self.api_key.as_deref().unwrap_or_default()
            ))
            .map_err(|e| Error::Llm(format!("invalid auth header: {e}")))?,
        );
        Ok(headers)
    }
}

impl InsightClient for HttpInsightClient {
    fn complete(&self, prompt: &str) -> Result<String> {
        self.runtime.block_on(async {
            match self.provider {
                LlmProvider::Ollama => {
                    let url = format!("{}/api/generate", self.endpoint.trim_end_matches('/'));
                    let mut headers = HeaderMap::new();
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                    let json = self
                        .post(
                            "ollama",
                            url,
                            headers,
                            json!({
                                "model": self.model,
                                "system": SYSTEM_PROMPT,
                                "prompt": prompt,
                                "stream": false,
                                "format": "json",
                                "options": { "temperature": self.temperature },
                            }),
                        )
                        .await?;
                    json.get("response")
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string)
                        .ok_or_else(|| {
                            Error::Llm("ollama response missing string field `response`".to_string())
                        })
                }
                LlmProvider::Claude => {
                    let url = format!("{}/v1/messages", self.endpoint.trim_end_matches('/'));
                    let mut headers = HeaderMap::new();
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                    headers.insert(
                        "x-api-key",
                        HeaderValue::from_str(self.api_key.as_deref().unwrap_or_default())
                            .map_err(|e| Error::Llm(format!("invalid claude api key header: {e}")))?,
                    );
                    headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));

                    let json = self
                        .post(
                            "claude",
                            url,
                            headers,
                            json!({
                                "model": self.model,
                                "max_tokens": self.max_tokens,
                                "temperature": self.temperature,
                                "system": SYSTEM_PROMPT,
                                "messages": [{ "role": "user", "content": prompt }],
                            }),
                        )
                        .await?;
                    json.get("content")
                        .and_then(|v| v.as_array())
                        .and_then(|arr| arr.first())
                        .and_then(|v| v.get("text"))
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string)
                        .ok_or_else(|| {
                            Error::Llm("claude response missing content[0].text".to_string())
                        })
                }
                LlmProvider::OpenAI | LlmProvider::OpenRouter => {
                    let label = match self.provider {
                        LlmProvider::OpenRouter => "openrouter",
                        _ => "openai",
                    };
                    let url = format!(
                        "{}/v1/chat/completions",
                        self.endpoint.trim_end_matches('/')
                    );
                    let json = self
                        .post(
                            label,
                            url,
                            self.bearer_headers()?,
                            json!({
                                "model": self.model,
                                "temperature": self.temperature,
                                "max_tokens": self.max_tokens,
                                "messages": [
                                    { "role": "system", "content": SYSTEM_PROMPT },
                                    { "role": "user", "content": prompt }
                                ]
                            }),
                        )
                        .await?;
                    json.get("choices")
                        .and_then(|v| v.as_array())
                        .and_then(|arr| arr.first())
                        .and_then(|v| v.get("message"))
                        .and_then(|v| v.get("content"))
                        .and_then(|v| v.as_str())
                        .map(|s| s.trim().to_string())
                        .ok_or_else(|| {
                            Error::Llm(format!(
                                "{label} response missing choices[0].message.content"
                            ))
                        })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::{compare, Comparison};
    use crate::config::{BenchmarkReference, Config};
    use crate::types::{DashboardPeriod, QueryRows};
    use chrono::NaiveDate;

    fn dashboard() -> DashboardPeriodMetrics {
        let mut queries = QueryRows::new();
        queries.insert(
            "performance_overview".to_string(),
            vec![json!({"vendor_id": 7, "total_sales": 5000, "total_buyers": 12})
                .as_object()
                .cloned()
                .unwrap()],
        );
        DashboardPeriodMetrics {
            entity_type: "seller".to_string(),
            entity_id: "7".to_string(),
            period: DashboardPeriod {
                start_date: NaiveDate::from_ymd_opt(2025, 11, 14).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2026, 2, 12).unwrap(),
                top_n: Some(20),
            },
            queries,
            source: None,
        }
    }

    #[test]
    fn prompt_carries_deviations_thresholds_and_target() {
        let config = Config::default();
        let seller = config.entity_type("seller").unwrap();
        let current = dashboard();
        let baseline = EntityBaseline::empty("seller", "7");
        let comparison: Comparison = compare(seller, &current, &baseline, None, BenchmarkReference::Mean);

        let prompt = build_prompt(&PromptInput {
            entity_type: "seller",
            type_config: seller,
            current: &current,
            baseline: &baseline,
            aggregate: None,
            comparison: &comparison,
            thresholds: &config.benchmark.thresholds,
        });

        assert!(prompt.contains("Provide 6 insights"));
        assert!(prompt.contains("at least 30% from self OR 50% from benchmark"));
        assert!(prompt.contains("\"total_sales\""));
        assert!(prompt.contains("2025-11-14"));
        assert!(prompt.contains("SELLER LIFETIME/HISTORICAL DATA"));
        assert_eq!(prompt_hash(&prompt).len(), 64);
        assert_eq!(prompt_hash(&prompt), prompt_hash(&prompt.clone()));
    }

    #[test]
    fn parse_accepts_fenced_json() {
        let raw = "```json\n{\"insights\": [{\"title\": \"Revenue up strongly\", \"priority\": \"high\"}]}\n```";
        let parsed = parse_candidates(raw).unwrap();
        assert_eq!(parsed.candidates.len(), 1);
        assert_eq!(parsed.candidates[0].priority.as_deref(), Some("high"));
        assert_eq!(parsed.malformed, 0);
    }

    #[test]
    fn parse_drops_only_malformed_elements() {
        let raw = r#"{"insights": [
            {"title": "Fine candidate here", "metrics": ["total_sales"]},
            "not an object",
            {"title": 42},
            {"title": "Another fine candidate", "metrics": "total_sales"}
        ]}"#;
        let parsed = parse_candidates(raw).unwrap();
        assert_eq!(parsed.candidates.len(), 1);
        assert_eq!(parsed.malformed, 3);
    }

    #[test]
    fn parse_rejects_unusable_responses() {
        assert!(matches!(parse_candidates("I cannot help with that"), Err(Error::Llm(_))));
        assert!(matches!(parse_candidates("{\"data\": []}"), Err(Error::Llm(_))));
        assert!(matches!(parse_candidates("{\"insights\": 3}"), Err(Error::Llm(_))));
        assert!(matches!(parse_candidates("{ broken"), Err(Error::Llm(_))));
    }

    #[test]
    fn http_client_requires_api_key_for_hosted_providers() {
        let config = LlmConfig {
            provider: LlmProvider::Claude,
            model: "m".to_string(),
            endpoint: None,
            api_key: None,
            timeout_secs: 5,
            temperature: 0.3,
            max_tokens: 100,
        };
        if std::env::var("ANTHROPIC_API_KEY").is_err() {
            assert!(matches!(create_insight_client(&config), Err(Error::Config(_))));
        }
    }
}
