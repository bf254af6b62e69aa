//! Port definitions shared by adapters.

mod event_emitter;
mod mcp_error;

pub use event_emitter::{EventEmitter, NoopEmitter};
pub use mcp_error::{McpErrorCategory, McpErrorInfo, ToolCallError};
