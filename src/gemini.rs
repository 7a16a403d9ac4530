//! Gemini API client
//!
//! Implements the `LanguageModel` seam over the generateContent and
//! streamGenerateContent endpoints. Uses a long-lived reqwest::Client for
//! connection pooling.

use futures::{pin_mut, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::OrchestratorConfig;
use crate::error::OrchestrationError;
use crate::llm::{ChatMessage, ChatRole, LanguageModel, ModelTurn, ToolCallRequest, ToolDecl};
use crate::Result;

/// Longest we wait between stream chunks before declaring the model gone.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(config: &OrchestratorConfig) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key: config.gemini_api_key.clone(),
            model: config.gemini_model.clone(),
            base_url: config.gemini_base_url.clone(),
        }
    }

    fn ensure_key(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(OrchestrationError::Model(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }
        Ok(())
    }

    fn endpoint(&self, verb: &str) -> String {
        format!(
            "{}/models/{}:{}?key={}",
            self.base_url, self.model, verb, self.api_key
        )
    }

    fn build_request(
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDecl],
    ) -> GenerateRequest {
        let contents = messages
            .iter()
            .map(|message| Content {
                role: Some(
                    match message.role {
                        ChatRole::User => "user",
                        ChatRole::Assistant => "model",
                    }
                    .to_string(),
                ),
                parts: vec![Part {
                    text: Some(message.content.clone()),
                    function_call: None,
                }],
            })
            .collect();

        let tools = if tools.is_empty() {
            None
        } else {
            Some(vec![ToolSection {
                function_declarations: tools
                    .iter()
                    .map(|tool| FunctionDecl {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    })
                    .collect(),
            }])
        };

        GenerateRequest {
            contents,
            system_instruction: Some(SystemInstruction {
                parts: vec![Part {
                    text: Some(system.to_string()),
                    function_call: None,
                }],
            }),
            tools,
            generation_config: GenerationConfig {
                temperature: 0.3,
                top_p: 0.9,
                max_output_tokens: 4096,
            },
        }
    }
}

#[async_trait::async_trait]
impl LanguageModel for GeminiClient {
    async fn complete(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDecl],
    ) -> Result<ModelTurn> {
        self.ensure_key()?;

        let request = Self::build_request(system, messages, tools);
        debug!(model = %self.model, tool_count = tools.len(), "calling Gemini generateContent");

        let response = self
            .client
            .post(self.endpoint("generateContent"))
            .timeout(Duration::from_secs(60))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                OrchestrationError::Model(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(OrchestrationError::Model(format!(
                "Gemini API error: {}",
                error_text
            )));
        }

        let body: GenerateResponse = response.json().await.map_err(|e| {
            OrchestrationError::Model(format!("Gemini parse error: {}", e))
        })?;

        parse_turn(&body)
    }

    async fn stream_text(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tx: mpsc::Sender<String>,
    ) -> Result<String> {
        self.ensure_key()?;

        let request = Self::build_request(system, messages, &[]);
        info!(model = %self.model, "calling Gemini streamGenerateContent");

        let response = self
            .client
            .post(format!("{}&alt=sse", self.endpoint("streamGenerateContent")))
            .json(&request)
            .send()
            .await
            .map_err(|e| OrchestrationError::Model(format!("Gemini stream error: {}", e)))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(OrchestrationError::Model(format!(
                "Gemini stream error: {}",
                error_text
            )));
        }

        drain_sse(response.bytes_stream(), &tx, STREAM_IDLE_TIMEOUT).await
    }
}

/// Consume an SSE byte stream, forwarding text fragments as they arrive
/// and returning the concatenated text. Each chunk read is bounded by
/// `idle`; a stalled upstream must not hang the request forever.
async fn drain_sse<S, B, E>(
    stream: S,
    tx: &mpsc::Sender<String>,
    idle: Duration,
) -> Result<String>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    pin_mut!(stream);
    let mut buffer = String::new();
    let mut full = String::new();

    loop {
        let chunk = match tokio::time::timeout(idle, stream.next()).await {
            Err(_) => {
                return Err(OrchestrationError::Model(format!(
                    "Gemini stream stalled for {}s",
                    idle.as_secs()
                )))
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                return Err(OrchestrationError::Model(format!(
                    "Gemini stream read: {}",
                    e
                )))
            }
            Ok(Some(Ok(chunk))) => chunk,
        };
        buffer.push_str(&String::from_utf8_lossy(chunk.as_ref()));

        while let Some(newline) = buffer.find('\n') {
            let line: String = buffer.drain(..=newline).collect();
            if let Some(fragment) = extract_stream_fragment(line.trim_end()) {
                full.push_str(&fragment);
                // Listener loss stops forwarding, not generation.
                let _ = tx.send(fragment).await;
            }
        }
    }
    if let Some(fragment) = extract_stream_fragment(buffer.trim_end()) {
        full.push_str(&fragment);
        let _ = tx.send(fragment).await;
    }

    Ok(full)
}

/// Pull the text fragment out of one `data:` SSE line, if any.
fn extract_stream_fragment(line: &str) -> Option<String> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }
    let parsed: GenerateResponse = serde_json::from_str(payload).ok()?;
    let candidate = parsed.candidates.first()?;
    let content = candidate.content.as_ref()?;
    let text: String = content
        .parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn parse_turn(body: &GenerateResponse) -> Result<ModelTurn> {
    let candidate = body.candidates.first().ok_or_else(|| {
        OrchestrationError::Model("No response from Gemini API".to_string())
    })?;
    let content = candidate.content.as_ref().ok_or_else(|| {
        OrchestrationError::Model(format!(
            "Empty candidate (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        ))
    })?;

    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();
    for part in &content.parts {
        if let Some(text) = &part.text {
            text_parts.push(text.as_str());
        }
        if let Some(call) = &part.function_call {
            tool_calls.push(ToolCallRequest {
                name: call.name.clone(),
                arguments: call.args.clone(),
            });
        }
    }

    if tool_calls.is_empty() {
        let text = text_parts.join("");
        if text.is_empty() {
            return Err(OrchestrationError::Model(
                "Gemini returned neither text nor tool calls".to_string(),
            ));
        }
        Ok(ModelTurn::text(text))
    } else {
        Ok(ModelTurn::calls(tool_calls))
    }
}

//
// ================= Wire models =================
//

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolSection>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolSection {
    function_declarations: Vec<FunctionDecl>,
}

#[derive(Debug, Serialize)]
struct FunctionDecl {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    max_output_tokens: i32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_tool_declarations() {
        let tools = vec![ToolDecl {
            name: "search_news".to_string(),
            description: "Search recent news".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"query": {"type": "string"}}
            }),
        }];
        let request =
            GeminiClient::build_request("system prompt", &[ChatMessage::user("hi")], &tools);
        let json = serde_json::to_string(&request).unwrap();

        assert!(json.contains("functionDeclarations"));
        assert!(json.contains("search_news"));
        assert!(json.contains("systemInstruction"));
        assert!(json.contains(r#""role":"user""#));
    }

    #[test]
    fn assistant_role_maps_to_model() {
        let request =
            GeminiClient::build_request("s", &[ChatMessage::assistant("earlier answer")], &[]);
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""role":"model""#));
    }

    #[test]
    fn response_with_function_call_becomes_tool_calls() {
        let raw = r#"{
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{"functionCall": {"name": "market_price", "args": {"code": "005930"}}}]
                },
                "finishReason": "STOP"
            }]
        }"#;
        let body: GenerateResponse = serde_json::from_str(raw).unwrap();
        let turn = parse_turn(&body).unwrap();
        assert!(turn.has_tool_calls());
        assert_eq!(turn.tool_calls[0].name, "market_price");
        assert_eq!(turn.tool_calls[0].arguments["code"], "005930");
        assert!(turn.text.is_none());
    }

    #[test]
    fn response_with_text_becomes_final_turn() {
        let raw = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Samsung closed up "}, {"text": "1.2% today."}]},
                "finishReason": "STOP"
            }]
        }"#;
        let body: GenerateResponse = serde_json::from_str(raw).unwrap();
        let turn = parse_turn(&body).unwrap();
        assert_eq!(turn.text.as_deref(), Some("Samsung closed up 1.2% today."));
        assert!(!turn.has_tool_calls());
    }

    #[test]
    fn empty_candidates_is_an_error() {
        let body: GenerateResponse = serde_json::from_str(r#"{"candidates": []}"#).unwrap();
        assert!(parse_turn(&body).is_err());
    }

    #[test]
    fn stream_fragment_extraction() {
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"hel"}]}}]}"#;
        assert_eq!(extract_stream_fragment(line).as_deref(), Some("hel"));

        assert!(extract_stream_fragment("").is_none());
        assert!(extract_stream_fragment("event: ping").is_none());
        assert!(extract_stream_fragment("data:").is_none());
    }

    fn sse_chunk(text: &str) -> std::result::Result<Vec<u8>, String> {
        Ok(format!(
            "data: {{\"candidates\":[{{\"content\":{{\"parts\":[{{\"text\":\"{}\"}}]}}}}]}}\n",
            text
        )
        .into_bytes())
    }

    #[tokio::test]
    async fn drain_forwards_fragments_and_returns_full_text() {
        let chunks = vec![sse_chunk("hel"), sse_chunk("lo")];
        let (tx, mut rx) = mpsc::channel(8);

        let full = drain_sse(futures::stream::iter(chunks), &tx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(full, "hello");

        drop(tx);
        let mut forwarded = Vec::new();
        while let Some(fragment) = rx.recv().await {
            forwarded.push(fragment);
        }
        assert_eq!(forwarded, vec!["hel", "lo"]);
    }

    #[tokio::test]
    async fn stalled_stream_errors_instead_of_hanging() {
        // one chunk arrives, then the upstream goes silent
        let stream = futures::stream::iter(vec![sse_chunk("par")])
            .chain(futures::stream::pending());
        let (tx, _rx) = mpsc::channel(8);

        let err = drain_sse(stream, &tx, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stalled"));
    }

    #[tokio::test]
    async fn stream_read_error_is_reported() {
        let chunks: Vec<std::result::Result<Vec<u8>, String>> =
            vec![sse_chunk("ok"), Err("connection reset".to_string())];
        let (tx, _rx) = mpsc::channel(8);

        let err = drain_sse(futures::stream::iter(chunks), &tx, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }
}
