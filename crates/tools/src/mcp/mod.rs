//! MCP over JSON-RPC 2.0: wire types and the method dispatcher.

pub mod dispatcher;
pub mod protocol;
pub mod resources;

pub use dispatcher::McpDispatcher;
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
