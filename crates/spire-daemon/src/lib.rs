//! Library surface of the spire daemon: state wiring and the HTTP/WS
//! router, shared between the `spired` binary and integration tests.

pub mod app;
pub mod http;
