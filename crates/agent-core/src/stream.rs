//! Streaming Protocol
//!
//! Provider-agnostic state machine for server-sent-event responses.
//! Adapters decode each `data:` frame into [`FrameEvent`]s; [`StreamState`]
//! assembles them into text deltas and, at the end of the turn, either a
//! tool-call message or the final assistant message.
//!
//! ```text
//! Idle ─▶ Streaming ─┬─▶ ToolCallPending ─┬─▶ Done
//!                    └─▶ Completing ──────┘
//! ```

use futures::{Stream, StreamExt};

use crate::error::{AgentError, Result};
use crate::message::{Message, Usage};
use crate::provider::{FinishReason, ProviderStream, StreamEvent};
use crate::tool::ToolCall;

/// Decoded content of one frame
#[derive(Clone, Debug, PartialEq)]
pub enum FrameEvent {
    TextDelta(String),
    ToolCallFragment(ToolCallFragment),
    FinishSignal(FinishReason),
    UsageInfo(Usage),
}

/// Piece of a tool call as it arrives on the wire
///
/// The first fragment of a call carries its ID and name; later ones usually
/// carry only the position `index` and more argument text.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolCallFragment {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Streaming,
    ToolCallPending,
    Completing,
    Done,
}

#[derive(Debug)]
struct PendingToolCall {
    index: usize,
    id: String,
    name: String,
    arguments: String,
}

/// Per-request streaming state
#[derive(Debug)]
pub struct StreamState {
    phase: StreamPhase,
    accumulated_text: String,
    pending_tool_calls: Vec<PendingToolCall>,
    finalized_tool_calls: Vec<ToolCall>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            phase: StreamPhase::Idle,
            accumulated_text: String::new(),
            pending_tool_calls: Vec::new(),
            finalized_tool_calls: Vec::new(),
            finish_reason: None,
            usage: None,
        }
    }

    /// Mark the request as dispatched
    pub fn begin(&mut self) {
        if self.phase == StreamPhase::Idle {
            self.phase = StreamPhase::Streaming;
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Apply one decoded event; returns text to hand to the consumer
    pub fn apply(&mut self, event: FrameEvent) -> Result<Option<String>> {
        match event {
            FrameEvent::UsageInfo(usage) => {
                self.usage = Some(usage);
                Ok(None)
            }
            _ if self.phase != StreamPhase::Streaming => {
                tracing::debug!(phase = ?self.phase, "Ignoring frame content after finish reason");
                Ok(None)
            }
            FrameEvent::TextDelta(text) => {
                if text.is_empty() {
                    return Ok(None);
                }
                self.accumulated_text.push_str(&text);
                Ok(Some(text))
            }
            FrameEvent::ToolCallFragment(fragment) => {
                self.merge_fragment(fragment)?;
                Ok(None)
            }
            FrameEvent::FinishSignal(reason) => {
                self.on_finish(reason)?;
                Ok(None)
            }
        }
    }

    fn merge_fragment(&mut self, fragment: ToolCallFragment) -> Result<()> {
        let slot = match &fragment.id {
            Some(id) => self.pending_tool_calls.iter().position(|p| &p.id == id),
            None => self
                .pending_tool_calls
                .iter()
                .rposition(|p| p.index == fragment.index),
        };

        match slot {
            Some(i) => {
                let pending = &mut self.pending_tool_calls[i];
                if pending.name.is_empty() {
                    if let Some(name) = fragment.name {
                        pending.name = name;
                    }
                }
                if let Some(arguments) = fragment.arguments {
                    pending.arguments.push_str(&arguments);
                }
            }
            None => {
                let id = fragment.id.ok_or_else(|| {
                    AgentError::Protocol(format!(
                        "tool call fragment at index {} has no call id",
                        fragment.index
                    ))
                })?;
                self.pending_tool_calls.push(PendingToolCall {
                    index: fragment.index,
                    id,
                    name: fragment.name.unwrap_or_default(),
                    arguments: fragment.arguments.unwrap_or_default(),
                });
            }
        }

        Ok(())
    }

    fn on_finish(&mut self, reason: FinishReason) -> Result<()> {
        if reason == FinishReason::Error {
            self.phase = StreamPhase::Done;
            self.finish_reason = Some(FinishReason::Error);
            return Err(AgentError::Protocol(format!(
                "provider ended the stream with an error after {} chars",
                self.accumulated_text.len()
            )));
        }

        let wants_tools = reason == FinishReason::ToolCalls || !self.pending_tool_calls.is_empty();

        if !wants_tools {
            self.finish_reason = Some(reason);
            self.phase = StreamPhase::Completing;
            return Ok(());
        }

        if self.pending_tool_calls.is_empty() {
            self.phase = StreamPhase::Done;
            self.finish_reason = Some(FinishReason::Error);
            return Err(AgentError::Protocol(
                "finish reason 'tool_calls' without any tool call".into(),
            ));
        }

        self.finish_reason = Some(FinishReason::ToolCalls);
        self.phase = StreamPhase::ToolCallPending;

        let mut finalized = Vec::with_capacity(self.pending_tool_calls.len());
        for pending in self.pending_tool_calls.drain(..) {
            if pending.name.is_empty() {
                self.phase = StreamPhase::Done;
                return Err(AgentError::Protocol(format!(
                    "tool call '{}' has no tool name",
                    pending.id
                )));
            }
            match ToolCall::parse(pending.id, pending.name, pending.arguments) {
                Ok(call) => finalized.push(call),
                Err(e) => {
                    self.phase = StreamPhase::Done;
                    self.finish_reason = Some(FinishReason::Error);
                    return Err(e);
                }
            }
        }
        self.finalized_tool_calls = finalized;

        Ok(())
    }

    /// Close the exchange and build the turn's final event
    ///
    /// `terminated` tells whether the end-of-stream sentinel was seen.
    pub fn finish(&mut self, terminated: bool) -> Result<StreamEvent> {
        let phase = std::mem::replace(&mut self.phase, StreamPhase::Done);

        match phase {
            StreamPhase::ToolCallPending => {
                let calls = std::mem::take(&mut self.finalized_tool_calls);
                let message = Message::tool_call(std::mem::take(&mut self.accumulated_text), calls)
                    .with_usage(self.usage)
                    .add_metadata("finish_reason", FinishReason::ToolCalls.as_str().into());
                Ok(StreamEvent::ToolCalls(message))
            }
            StreamPhase::Completing => Ok(StreamEvent::Completed(self.completed_message())),
            StreamPhase::Streaming if terminated && self.pending_tool_calls.is_empty() => {
                self.finish_reason = Some(FinishReason::Stop);
                Ok(StreamEvent::Completed(self.completed_message()))
            }
            StreamPhase::Streaming => Err(AgentError::Protocol(
                "stream ended before a finish reason".into(),
            )),
            StreamPhase::Idle | StreamPhase::Done => Err(AgentError::Protocol(format!(
                "stream finished in {:?} phase",
                phase
            ))),
        }
    }

    fn completed_message(&mut self) -> Message {
        let reason = self.finish_reason.unwrap_or(FinishReason::Stop);
        Message::assistant(std::mem::take(&mut self.accumulated_text))
            .with_usage(self.usage)
            .add_metadata("finish_reason", reason.as_str().into())
    }
}

/// Classified SSE line
#[derive(Debug, PartialEq, Eq)]
pub enum SseLine<'a> {
    /// `data:` payload
    Data(&'a str),
    /// End-of-stream sentinel (`data: [DONE]`)
    Done,
    /// Blank line, comment, or non-data field
    Skip,
}

/// Classify one line of an SSE body
pub fn parse_sse_line(line: &str) -> SseLine<'_> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim_start();
    if data.is_empty() {
        SseLine::Skip
    } else if data == "[DONE]" {
        SseLine::Done
    } else {
        SseLine::Data(data)
    }
}

/// Splits a byte stream into lines
///
/// Bytes are buffered until a newline so multi-byte characters split
/// across network reads stay intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete line, without its terminator
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line[..pos]).trim_end_matches('\r').to_string())
    }

    /// Whatever is left once the body ends
    pub fn remainder(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).to_string())
    }
}

/// Run the state machine over an SSE byte stream
///
/// `decode` turns one `data:` payload into frame events and must return a
/// `Protocol` error for malformed frames. The returned stream yields text
/// deltas as they arrive and ends with one `ToolCalls` or `Completed` event.
/// Dropping it drops `body` and the state with it.
pub fn assemble<S, B, D>(body: S, decode: D) -> ProviderStream
where
    S: Stream<Item = Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    D: Fn(&str) -> Result<Vec<FrameEvent>> + Send + 'static,
{
    Box::pin(async_stream::try_stream! {
        let mut body = Box::pin(body);
        let mut lines = LineBuffer::default();
        let mut state = StreamState::new();
        let mut terminated = false;

        state.begin();

        'read: while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            lines.push(chunk.as_ref());

            while let Some(line) = lines.next_line() {
                match parse_sse_line(&line) {
                    SseLine::Skip => {}
                    SseLine::Done => {
                        terminated = true;
                        break 'read;
                    }
                    SseLine::Data(data) => {
                        for event in decode(data)? {
                            if let Some(text) = state.apply(event)? {
                                yield StreamEvent::TextDelta(text);
                            }
                        }
                    }
                }
            }
        }

        if !terminated {
            if let Some(line) = lines.remainder() {
                match parse_sse_line(&line) {
                    SseLine::Done => terminated = true,
                    SseLine::Data(data) => {
                        for event in decode(data)? {
                            if let Some(text) = state.apply(event)? {
                                yield StreamEvent::TextDelta(text);
                            }
                        }
                    }
                    SseLine::Skip => {}
                }
            }
        }

        let last = state.finish(terminated)?;
        yield last;
    })
}
