//! Agent runtime: model client, the think/dispatch/inject loop, tools, and
//! the persistence wrapper around one invocation.

pub mod invocation;
pub mod loop_engine;
pub mod model;
pub mod tools;

pub use invocation::{InvocationHandle, InvocationResult, InvocationSpec, run_invocation};
pub use loop_engine::{LoopConfig, LoopOutcome, NoTools, ToolCallRecord, ToolHandler, run_agent_loop};
pub use model::{
    AnthropicClient, ContentBlock, FinishReason, Message, ModelClient, ModelRequest,
    ModelResponse, ToolCall, ToolDefinition,
};
