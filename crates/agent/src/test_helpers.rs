//! Shared test helpers: a scripted provider and a few small tools.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use toolweave_core::{
    ChunkReceiver, InvocationContext, Message, Provider, ProviderError, ProviderRequest,
    ProviderResponse, StreamChunk, Tool, ToolCallDelta, ToolCallRequest, ToolError, ToolOutput,
    Usage,
};

/// A mock provider that returns a sequence of scripted responses.
///
/// Each call to `complete` or `stream` consumes the next entry. Streams split
/// content and tool-call arguments across several chunks. Running past the
/// end of the script is a non-retryable provider error.
pub struct SequentialMockProvider {
    responses: Mutex<Vec<Result<ProviderResponse, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    call_count: AtomicUsize,
    stream_delay: Option<Duration>,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self::scripted(responses.into_iter().map(Ok).collect())
    }

    /// Script that may include provider failures.
    pub fn scripted(responses: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            stream_delay: None,
        }
    }

    /// Create a provider that returns a single text response (no tool calls).
    pub fn single_text(text: &str) -> Self {
        Self::new(vec![make_text_response(text)])
    }

    /// Create a provider that first returns tool calls, then a final answer.
    pub fn tool_then_answer(
        tool_calls: Vec<ToolCallRequest>,
        thought: &str,
        answer: &str,
    ) -> Self {
        Self::new(vec![
            make_tool_call_response(tool_calls, thought),
            make_text_response(answer),
        ])
    }

    /// Pause between streamed chunks.
    pub fn with_stream_delay(mut self, delay: Duration) -> Self {
        self.stream_delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().clone()
    }

    fn next(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let index = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);
        let responses = self.responses.lock();
        match responses.get(index) {
            Some(response) => response.clone(),
            None => Err(ProviderError::ApiError {
                status_code: 400,
                message: format!(
                    "SequentialMockProvider: no more responses (call #{index}, have {})",
                    responses.len()
                ),
            }),
        }
    }
}

#[async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.next(request)
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let response = self.next(request)?;
        let chunks = split_into_chunks(&response);
        let delay = self.stream_delay;
        let (tx, rx) = tokio::sync::mpsc::channel(4);

        tokio::spawn(async move {
            for chunk in chunks {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// Content in two halves, then each tool call as a header delta plus two
/// argument fragments, then a final usage chunk.
fn split_into_chunks(response: &ProviderResponse) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    let content = &response.message.content;
    if !content.is_empty() {
        let mid = content
            .char_indices()
            .map(|(i, _)| i)
            .nth(content.chars().count() / 2)
            .unwrap_or(0);
        let (head, tail) = content.split_at(mid);
        for part in [head, tail] {
            if !part.is_empty() {
                chunks.push(StreamChunk::text(part));
            }
        }
    }

    for (index, call) in response.message.tool_calls.iter().enumerate() {
        let args = &call.arguments;
        let mid = args.len() / 2;
        let mid = (mid..=args.len())
            .find(|i| args.is_char_boundary(*i))
            .unwrap_or(args.len());
        chunks.push(StreamChunk {
            tool_calls: vec![ToolCallDelta {
                index,
                id: Some(call.id.clone()),
                name: Some(call.name.clone()),
                arguments: args[..mid].to_string(),
            }],
            ..Default::default()
        });
        chunks.push(StreamChunk {
            tool_calls: vec![ToolCallDelta {
                index,
                arguments: args[mid..].to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
    }

    chunks.push(StreamChunk {
        done: true,
        usage: response.usage,
        ..Default::default()
    });
    chunks
}

fn mock_usage() -> Option<Usage> {
    Some(Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    })
}

/// Create a simple text response (no tool calls).
pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: mock_usage(),
        model: "mock-model".into(),
    }
}

/// Create a response with tool calls and optional thought content.
pub fn make_tool_call_response(tool_calls: Vec<ToolCallRequest>, thought: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_with_tools(thought, tool_calls),
        usage: mock_usage(),
        model: "mock-model".into(),
    }
}

/// Helper to create a tool call.
pub fn make_tool_call(name: &str, args: serde_json::Value) -> ToolCallRequest {
    make_tool_call_with_id(&format!("call_{name}"), name, args)
}

pub fn make_tool_call_with_id(id: &str, name: &str, args: serde_json::Value) -> ToolCallRequest {
    ToolCallRequest::new(id, name, args.to_string())
}

/// Returns `arguments.text`.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echoes back the input"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }
    async fn execute(
        &self,
        arguments: serde_json::Value,
        _ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        Ok(arguments["text"].as_str().unwrap_or("").into())
    }
}

/// Always fails with the configured reason.
pub struct FailingTool {
    pub reason: String,
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "failing"
    }
    fn description(&self) -> &str {
        "Always fails"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }
    async fn execute(
        &self,
        _arguments: serde_json::Value,
        _ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "failing".into(),
            reason: self.reason.clone(),
        })
    }
}

/// Sleeps for `arguments.ms` milliseconds, then reports how long it slept.
/// Records the order in which invocations finish.
#[derive(Default)]
pub struct SlowTool {
    pub finished: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> &str {
        "Sleeps before answering"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "ms": { "type": "integer" } }
        })
    }
    async fn execute(
        &self,
        arguments: serde_json::Value,
        _ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        let ms = arguments["ms"].as_u64().unwrap_or(10);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        self.finished.lock().push(ms);
        Ok(format!("slept {ms}ms").into())
    }
}
