//! Telephony core library: Vonage voice and SMS exposed as MCP tools, a webhook
//! receiver for provider callbacks, and the store that correlates the two.

pub mod callback;
pub mod config;
pub mod correlation;
pub mod init;
pub mod mcp;
pub mod server;
pub mod tools;
pub mod vonage;
