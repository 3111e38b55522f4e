//! agent-stream - subprocess transports and stream primitives for AI agent CLIs
//!
//! This crate owns the low-level plumbing a gateway needs to supervise an
//! external coding agent: spawning the agent binary under a PTY (or pipes),
//! turning its byte streams into lines, parsing the line-delimited JSON wire
//! events, and buffering delivered events for replay to reconnecting
//! clients.

pub mod cli_event;
pub mod process;
pub mod pty;
pub mod replay;

pub use cli_event::{AssistantPayload, CliBlock, CliEvent, CliUsage, UserPayload};
pub use process::{AgentChild, AgentCommand, ExitInfo, OutputLine, StdinHandle};
pub use replay::ReplayBuffer;
