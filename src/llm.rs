//! Language-model collaborator seam
//!
//! One trait covers both interaction shapes the pipeline needs: a complete
//! turn that may request tool calls, and incremental token delivery for
//! answer composition. `ScriptedModel` replays canned turns for tests and
//! the offline demo.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::error::OrchestrationError;
use crate::Result;

//
// ================= Messages =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Declared tool surface passed to the model (name + JSON schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDecl {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One tool call the model asked for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Model output: terminal text, requested tool calls, or both (text
/// accompanying calls is treated as reasoning noise and ignored).
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ModelTurn {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            text: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            text: None,
            tool_calls: calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

//
// ================= Trait =================
//

#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    /// One reasoning step: returns either a final text or tool calls.
    async fn complete(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDecl],
    ) -> Result<ModelTurn>;

    /// Token-streaming completion for answer composition; fragments go out
    /// through `tx` as they arrive, the full text is returned.
    async fn stream_text(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tx: mpsc::Sender<String>,
    ) -> Result<String>;
}

/// Parse a structured JSON reply, tolerating markdown code fences and
/// leading prose around the object.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let trimmed = raw.trim();

    let unfenced = if trimmed.starts_with("```") {
        let inner = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```");
        inner.trim()
    } else {
        trimmed
    };

    if let Ok(parsed) = serde_json::from_str(unfenced) {
        return Ok(parsed);
    }

    // Second chance: extract the outermost object.
    let start = unfenced.find('{');
    let end = unfenced.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            return serde_json::from_str(&unfenced[start..=end]).map_err(|e| {
                OrchestrationError::Model(format!("structured reply parse failed: {}", e))
            });
        }
    }

    Err(OrchestrationError::Model(format!(
        "no JSON object in model reply: {}",
        truncate(unfenced, 120)
    )))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

//
// ================= Scripted model =================
//

/// One canned response; `delay` simulates model latency.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub response: ScriptedResponse,
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Turn(ModelTurn),
    Fail(String),
}

impl ScriptedTurn {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            response: ScriptedResponse::Turn(ModelTurn::text(content)),
            delay: None,
        }
    }

    pub fn calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            response: ScriptedResponse::Turn(ModelTurn::calls(calls)),
            delay: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            response: ScriptedResponse::Fail(message.into()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Replays scripted turns. Two modes: a global FIFO, or keyed queues
/// matched against the system prompt (for concurrent specialists each
/// carrying their identity in the prompt).
pub struct ScriptedModel {
    sequential: Mutex<VecDeque<ScriptedTurn>>,
    keyed: Mutex<HashMap<String, VecDeque<ScriptedTurn>>>,
    completions: AtomicUsize,
}

impl ScriptedModel {
    pub fn sequential(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            sequential: Mutex::new(turns.into()),
            keyed: Mutex::new(HashMap::new()),
            completions: AtomicUsize::new(0),
        }
    }

    pub fn keyed() -> Self {
        Self {
            sequential: Mutex::new(VecDeque::new()),
            keyed: Mutex::new(HashMap::new()),
            completions: AtomicUsize::new(0),
        }
    }

    /// Queue turns for calls whose system prompt contains `key`.
    pub async fn insert(&self, key: impl Into<String>, turns: Vec<ScriptedTurn>) {
        let mut keyed = self.keyed.lock().await;
        keyed.insert(key.into(), turns.into());
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    async fn next_turn(&self, system: &str) -> Result<ScriptedTurn> {
        {
            let mut keyed = self.keyed.lock().await;
            let matched = keyed
                .iter_mut()
                .find(|(key, _)| system.contains(key.as_str()))
                .map(|(_, queue)| queue.pop_front());
            if let Some(Some(turn)) = matched {
                return Ok(turn);
            }
            if !keyed.is_empty() {
                return Err(OrchestrationError::Model(format!(
                    "no scripted turn for system prompt: {}",
                    truncate(system, 80)
                )));
            }
        }

        let mut queue = self.sequential.lock().await;
        queue.pop_front().ok_or_else(|| {
            OrchestrationError::Model("scripted model exhausted".to_string())
        })
    }

    async fn play(&self, system: &str) -> Result<ModelTurn> {
        let scripted = self.next_turn(system).await?;
        if let Some(delay) = scripted.delay {
            tokio::time::sleep(delay).await;
        }
        self.completions.fetch_add(1, Ordering::SeqCst);
        match scripted.response {
            ScriptedResponse::Turn(turn) => Ok(turn),
            ScriptedResponse::Fail(message) => Err(OrchestrationError::Model(message)),
        }
    }
}

#[async_trait::async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(
        &self,
        system: &str,
        _messages: &[ChatMessage],
        _tools: &[ToolDecl],
    ) -> Result<ModelTurn> {
        self.play(system).await
    }

    async fn stream_text(
        &self,
        system: &str,
        _messages: &[ChatMessage],
        tx: mpsc::Sender<String>,
    ) -> Result<String> {
        let turn = self.play(system).await?;
        let text = turn.text.unwrap_or_default();
        for word in text.split_inclusive(' ') {
            if tx.send(word.to_string()).await.is_err() {
                break;
            }
        }
        Ok(text)
    }
}
