//! LLMGate transparent security proxy.
//!
//! Sits between client applications and upstream LLM provider APIs,
//! applying a fixed pipeline of security checks (rate limiting, time
//! gating, sensitive-data scanning, financial-content policy, response
//! caching) before forwarding requests with substituted credentials.
//! Every request outcome lands in the audit log and on the event channel.

pub mod api;
pub mod audit;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod policy;
pub mod rate_limit;
pub mod router;
pub mod sanitize;
pub mod shutdown;
pub mod upstream;
pub mod ws;

pub use pipeline::{proxy_handler, AppState};
pub use router::build_router;
pub use shutdown::ShutdownCoordinator;
