//! Streaming pipeline.
//!
//! `run_stream` executes the same loop as `run` on a spawned task that
//! writes [`StreamEvent`]s into a bounded queue. The caller reads the other
//! end through an [`EventStream`]. The producer blocks when the queue is
//! full and closes it exactly once, after `message_stop` or `error`.
//!
//! Event order for one run:
//!
//! ```text
//! message_start
//!   (content_delta* tool_use* content_complete? tool_result*)   per tool round
//!   content_delta* content_complete                             final round
//!   content_delta*  (replayed, buffered mode only)
//! message_stop | error
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use toolweave_core::{
    ChunkReceiver, Error, EventForwarder, InvocationContext, Result, StreamEvent, ToolCallDelta,
    ToolCallRequest, ToolResult, Usage,
};
use tracing::debug;

use crate::orchestrator::{Orchestrator, RunOutput};

/// Consumer half of a streaming run.
///
/// `recv` returns `None` once the producer has closed the queue. Dropping
/// the stream cancels the run at its next emission.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self { rx }
    }

    /// The next event, or `None` when the stream is closed.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Drain every remaining event.
    pub async fn collect_all(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }

    /// Stop accepting events. Already queued events can still be read.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl futures::Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Orchestrator {
    /// Streaming variant of [`Orchestrator::run`].
    ///
    /// Must be called from within a tokio runtime. Errors are delivered as
    /// a terminal `error` event rather than returned.
    pub fn run_stream(&self, prompt: &str, ctx: &InvocationContext) -> EventStream {
        let capacity = self.config.streaming.channel_capacity.max(1);
        let buffered = self.config.streaming.buffer_intermediate_content;
        let (tx, rx) = mpsc::channel(capacity);

        let this = self.clone();
        let prompt = prompt.to_string();
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let mut emitter = Emitter::new(tx, buffered);
            if emitter.send(StreamEvent::message_start()).await.is_err() {
                return;
            }

            let outcome = this.execute(&prompt, &ctx, &mut emitter).await;
            match outcome {
                Ok(output) => {
                    if let Err(e) = emitter.finish(&output).await {
                        debug!(agent = %this.name, "Stream consumer gone before message_stop: {e}");
                    }
                }
                Err(err) => emitter.fail(&err).await,
            }
        });

        EventStream::new(rx)
    }
}

/// Producer side of the pipeline, threaded through the loop.
///
/// A disabled emitter (blocking runs) drops everything. In buffered mode the
/// deltas of the current model call are held until the call's outcome is
/// known; tool-round text is then kept for replay before `message_stop`.
pub(crate) struct Emitter {
    tx: Option<mpsc::Sender<StreamEvent>>,
    buffered: bool,
    pending: Vec<String>,
    replay: Vec<String>,
    live_content: bool,
    closed: bool,
}

impl Emitter {
    pub(crate) fn disabled() -> Self {
        Self {
            tx: None,
            buffered: false,
            pending: Vec::new(),
            replay: Vec::new(),
            live_content: false,
            closed: true,
        }
    }

    pub(crate) fn new(tx: mpsc::Sender<StreamEvent>, buffered: bool) -> Self {
        Self {
            tx: Some(tx),
            buffered,
            pending: Vec::new(),
            replay: Vec::new(),
            live_content: false,
            closed: false,
        }
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.tx.is_some()
    }

    /// Sender for nested runs to relay their events into this stream.
    pub(crate) fn forwarder(&self) -> Option<EventForwarder> {
        if self.closed { None } else { self.tx.clone() }
    }

    async fn send(&mut self, event: StreamEvent) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        let terminal = event.is_terminal();
        if tx.send(event).await.is_err() {
            self.closed = true;
            return Err(Error::Cancelled("event stream closed by consumer".into()));
        }
        if terminal {
            self.closed = true;
        }
        Ok(())
    }

    pub(crate) async fn delta(&mut self, text: String) -> Result<()> {
        if !self.is_streaming() {
            return Ok(());
        }
        if self.buffered {
            self.pending.push(text);
            return Ok(());
        }
        self.live_content = true;
        self.send(StreamEvent::content_delta(text)).await
    }

    pub(crate) async fn tool_use(&mut self, call: ToolCallRequest) -> Result<()> {
        self.send(StreamEvent::tool_use(call)).await
    }

    pub(crate) async fn tool_result(
        &mut self,
        call: &ToolCallRequest,
        result: &ToolResult,
    ) -> Result<()> {
        let event = StreamEvent::tool_result(
            call.clone(),
            result.to_message_content(),
            result.is_error(),
        )
        .with_metadata("duration_ms", result.duration_ms.into());
        self.send(event).await
    }

    /// The model call requested tools.
    pub(crate) async fn end_tool_round(&mut self) -> Result<()> {
        if self.buffered {
            self.replay.append(&mut self.pending);
            return Ok(());
        }
        if std::mem::take(&mut self.live_content) {
            self.send(StreamEvent::content_complete()).await?;
        }
        Ok(())
    }

    /// The model call produced the final answer.
    pub(crate) async fn end_final_round(&mut self) -> Result<()> {
        for text in std::mem::take(&mut self.pending) {
            self.send(StreamEvent::content_delta(text)).await?;
        }
        self.live_content = false;
        self.send(StreamEvent::content_complete()).await
    }

    /// Replay held tool-round text, then `message_stop`.
    pub(crate) async fn finish(&mut self, output: &RunOutput) -> Result<()> {
        for text in std::mem::take(&mut self.replay) {
            let event = StreamEvent::content_delta(text)
                .with_metadata("replayed", serde_json::Value::Bool(true));
            self.send(event).await?;
        }

        let summary = serde_json::to_value(&output.summary)?;
        let stop = StreamEvent::message_stop()
            .with_metadata("answer", serde_json::Value::String(output.answer.clone()))
            .with_metadata("summary", summary)
            .with_metadata("forced_final", serde_json::Value::Bool(output.forced_final));
        self.send(stop).await
    }

    /// Terminal error event. A consumer that already left is not an error.
    pub(crate) async fn fail(&mut self, err: &Error) {
        let mut event = StreamEvent::error(err.to_string(), err.kind());
        if let Error::RecursionLimit { depth, max } = err {
            event = event
                .with_metadata("depth", (*depth).into())
                .with_metadata("max", (*max).into());
        }
        let _ = self.send(event).await;
    }
}

/// Read one provider stream to the end, emitting deltas and finished tool
/// calls as they arrive. Provider errors mid-stream are fatal.
pub(crate) async fn consume_chunks(
    mut chunks: ChunkReceiver,
    ctx: &InvocationContext,
    emitter: &mut Emitter,
    announce_tools: bool,
    id_prefix: &str,
) -> Result<StreamedTurn> {
    let mut turn = StreamedTurn::default();
    let mut assembler = ToolCallAssembler::new(id_prefix);

    loop {
        let next = tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            next = chunks.recv() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.map_err(Error::Provider)?;

        if let Some(text) = chunk.content
            && !text.is_empty()
        {
            turn.content.push_str(&text);
            emitter.delta(text).await?;
        }

        for delta in chunk.tool_calls {
            for call in assembler.push(delta) {
                if announce_tools {
                    emitter.tool_use(call).await?;
                }
            }
        }

        if chunk.usage.is_some() {
            turn.usage = chunk.usage;
        }
        if chunk.done {
            break;
        }
    }

    let (calls, unannounced) = assembler.finish();
    if announce_tools {
        for call in unannounced {
            emitter.tool_use(call).await?;
        }
    }
    turn.tool_calls = calls;
    Ok(turn)
}

#[derive(Debug, Default)]
pub(crate) struct StreamedTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl PartialCall {
    fn to_request(&self, id_prefix: &str, index: usize) -> ToolCallRequest {
        let id = if self.id.trim().is_empty() {
            fallback_call_id(id_prefix, index)
        } else {
            self.id.clone()
        };
        ToolCallRequest::new(id, &self.name, &self.arguments)
    }
}

/// Id for a tool call the provider left unnamed. `id_prefix` is unique per
/// model call within a run, so ids never repeat in one history.
pub(crate) fn fallback_call_id(id_prefix: &str, index: usize) -> String {
    format!("{id_prefix}_{index}")
}

/// Reassembles tool calls from index-keyed fragments.
///
/// A call is complete once a fragment for a higher index arrives, or when
/// the stream ends.
#[derive(Debug)]
pub(crate) struct ToolCallAssembler {
    id_prefix: String,
    partials: BTreeMap<usize, PartialCall>,
    announced: BTreeSet<usize>,
}

impl ToolCallAssembler {
    pub(crate) fn new(id_prefix: impl Into<String>) -> Self {
        Self {
            id_prefix: id_prefix.into(),
            partials: BTreeMap::new(),
            announced: BTreeSet::new(),
        }
    }

    /// Add a fragment; returns calls that just became complete.
    pub(crate) fn push(&mut self, delta: ToolCallDelta) -> Vec<ToolCallRequest> {
        let highest = self.partials.keys().next_back().copied();
        let index = delta.index;

        let entry = self.partials.entry(index).or_default();
        if let Some(id) = delta.id
            && !id.is_empty()
        {
            entry.id = id;
        }
        if let Some(name) = delta.name
            && !name.is_empty()
        {
            entry.name = name;
        }
        entry.arguments.push_str(&delta.arguments);

        match highest {
            Some(highest) if index > highest => self.take_ready(index),
            _ => Vec::new(),
        }
    }

    fn take_ready(&mut self, below: usize) -> Vec<ToolCallRequest> {
        let ready: Vec<usize> = self
            .partials
            .range(..below)
            .map(|(i, _)| *i)
            .filter(|i| !self.announced.contains(i))
            .collect();

        let mut calls = Vec::with_capacity(ready.len());
        for index in ready {
            self.announced.insert(index);
            if let Some(partial) = self.partials.get(&index) {
                calls.push(partial.to_request(&self.id_prefix, index));
            }
        }
        calls
    }

    /// All calls in index order, plus the ones never returned by `push`.
    pub(crate) fn finish(self) -> (Vec<ToolCallRequest>, Vec<ToolCallRequest>) {
        let all = self
            .partials
            .iter()
            .map(|(i, p)| p.to_request(&self.id_prefix, *i))
            .collect();
        let unannounced = self
            .partials
            .iter()
            .filter(|(i, _)| !self.announced.contains(i))
            .map(|(i, p)| p.to_request(&self.id_prefix, *i))
            .collect();
        (all, unannounced)
    }
}
