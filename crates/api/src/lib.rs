//! Network surfaces: REST gateway, JSON-RPC endpoint and their run-loops.

pub mod app;
pub mod context;
pub mod middleware;
pub mod servers;
