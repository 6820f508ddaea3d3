//! Built-in echo tools.
//!
//! `echo_joke` is the reference demo tool; `echo_stream` exercises the
//! full transport: it ships its payload over an Execution Stream with
//! progress datagrams on the side.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::datagram::DatagramChannel;
use crate::define_tool;
use crate::error::{McpFlowError, Result, ToolError};
use crate::protocol::{CallToolResult, Tool, ToolContent};
use crate::session::RequestContext;
use crate::tools::registry::ToolHandler;

const JOKES: &[&str] = &[
    "There are only 10 types of people: those who understand binary and those who don't.",
    "A SQL query walks into a bar, walks up to two tables and asks, 'Can I join you?'",
    "Why do programmers prefer dark mode? Because light attracts bugs.",
    "It works on my machine. ¯\\_(ツ)_/¯",
    "// TODO: fix this later — commit date: 3 years ago",
    "There's no place like 127.0.0.1",
    "I would tell you a UDP joke, but you might not get it.",
    "To understand recursion, you must first understand recursion.",
    "The best thing about a Boolean is that even if you're wrong, you're only off by a bit.",
    "Why do Java developers wear glasses? Because they can't C#.",
    "!false — It's funny because it's true.",
    "A programmer's wife says: 'Buy bread. If they have eggs, buy a dozen.' He returns with 12 loaves.",
    "There are only two hard things in CS: cache invalidation, naming things, and off-by-one errors.",
];

/// Returns a programming joke inline.
pub struct EchoJokeTool {
    next: AtomicUsize,
}

impl EchoJokeTool {
    pub fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
        }
    }
}

impl Default for EchoJokeTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolHandler for EchoJokeTool {
    fn definition(&self) -> Tool {
        define_tool! {
            name: "echo_joke",
            description: "Returns a programming joke. Guaranteed to pass a code review.",
            schema: {
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }
        }
    }

    async fn execute(&self, _ctx: &RequestContext, _arguments: Value) -> Result<CallToolResult> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % JOKES.len();
        let joke = JOKES[index];
        info!("serving joke: {}", joke);
        Ok(CallToolResult::text(joke))
    }
}

/// Echoes its argument back over an Execution Stream.
///
/// The response carries a `ref/stream` content element; the payload
/// travels out of band, with per-chunk progress datagrams.
pub struct EchoStreamTool;

#[async_trait]
impl ToolHandler for EchoStreamTool {
    fn definition(&self) -> Tool {
        define_tool! {
            name: "echo_stream",
            description: "Echoes the given text over an execution stream.",
            schema: {
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "repeat": { "type": "integer", "minimum": 1, "default": 1 }
                },
                "required": ["text"],
                "additionalProperties": false
            }
        }
    }

    async fn execute(&self, ctx: &RequestContext, arguments: Value) -> Result<CallToolResult> {
        let text = arguments
            .get("text")
            .and_then(Value::as_str)
            .ok_or(ToolError::MissingArgument("text".into()))?
            .to_string();
        let repeat = arguments
            .get("repeat")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .max(1) as usize;

        let mut stream = ctx.open_stream().await.map_err(McpFlowError::Protocol)?;
        let tag = stream.tag();

        for round in 0..repeat {
            if ctx.is_cancelled() {
                // Dropping the unfinished stream resets it; the dispatcher
                // turns the error into the Cancelled response.
                return Err(McpFlowError::Protocol(
                    crate::error::ProtocolError::Cancelled,
                ));
            }
            stream
                .write_all(text.as_bytes())
                .await
                .map_err(McpFlowError::Transport)?;

            let progress = format!("{}/{}", round + 1, repeat);
            let outcome = ctx
                .send_datagram(DatagramChannel::Progress, progress.as_bytes())
                .await;
            debug!(?outcome, "progress datagram");
        }

        stream.finish().await.map_err(McpFlowError::Transport)?;

        Ok(CallToolResult {
            content: vec![ToolContent::StreamRef {
                stream_tag: tag,
                mime_type: Some("text/plain".into()),
            }],
            is_error: None,
        })
    }
}
