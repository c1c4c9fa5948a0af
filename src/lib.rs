// ABOUTME: Library root for the dynamic tool MCP server
// ABOUTME: Re-exports the pieces the binary entrypoint wires together

pub mod audit;
pub mod change_bus;
pub mod config;
pub mod ephemeral;
pub mod error;
pub mod guard;
pub mod http;
pub mod jsonrpc;
pub mod logging;
pub mod mcp_capability;
pub mod model;
pub mod registry;
pub mod sandbox;
pub mod service;
