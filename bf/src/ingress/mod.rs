//! Webhook ingress
//!
//! Accepts board events over HTTP, persists them before interpretation,
//! classifies them, and hands actionable work to the queue manager.

mod server;
mod service;

pub use server::{HttpState, build_router, serve};
pub use service::{IngressResult, IngressService};
