//! buxtond's internals, exposed as a library so the integration test
//! suite can drive a real daemon loop in-process against a temp socket.

pub mod client;
pub mod credentials;
pub mod dispatch;
pub mod server;
