use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    functions::{FunctionCall, ToolCall},
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse},
    LLMError,
};

/// One canned adapter outcome.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    /// Assistant message carrying `(tool name, arguments)` calls without ids.
    ToolCalls(Vec<(String, Value)>),
    Transient(String),
    Fatal(String),
    Malformed(String),
    /// Sleeps before answering with the text; used to exercise call timeouts.
    Delayed(Duration, String),
}

impl ScriptedReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        Self::ToolCalls(vec![(name.into(), arguments)])
    }
}

/// Replays a fixed queue of replies in order, regardless of the request.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = ScriptedReply>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(|t| ScriptedReply::Text(t.into())))
    }

    /// Number of `complete` calls served so far, including failures.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    fn next_reply(&self) -> Option<ScriptedReply> {
        self.replies
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .next_reply()
            .ok_or_else(|| LLMError::Fatal("no more scripted responses".to_string()))?;

        let message = match reply {
            ScriptedReply::Text(text) => ChatMessage::assistant(text),
            ScriptedReply::ToolCalls(calls) => {
                let calls = calls
                    .into_iter()
                    .map(|(name, arguments)| ToolCall::new(FunctionCall::new(name, arguments)))
                    .collect();
                ChatMessage::assistant(String::new()).with_tool_calls(calls)
            }
            ScriptedReply::Transient(message) => return Err(LLMError::Transient(message)),
            ScriptedReply::Fatal(message) => return Err(LLMError::Fatal(message)),
            ScriptedReply::Malformed(message) => return Err(LLMError::MalformedResponse(message)),
            ScriptedReply::Delayed(delay, text) => {
                tokio::time::sleep(delay).await;
                ChatMessage::assistant(text)
            }
        };

        Ok(CompletionResponse {
            message,
            usage: None,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn is_deterministic(&self) -> bool {
        true
    }
}
