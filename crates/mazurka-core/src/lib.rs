//! mazurka-core: radix URI router and socket HTTP/1.1 engine.
//!
//! The crate provides the server-side half of the mazurka content
//! distribution plane: a per-method radix [`Router`] with typed
//! placeholders and rewrite rules, a blocking HTTP/1.1 [`HttpServer`]
//! with a bounded worker pool and keep-alive promotion, server-side
//! authentication flows, IP ban sets and the in-flight file registry
//! used for progressive responses.

pub mod auth;
pub mod ban;
pub mod compress;
pub mod conn;
pub mod context;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod partial;
pub mod pool;
pub mod router;
pub mod server;
pub mod uri_tree;

// Re-exports for users
pub use auth::{AuthEngine, AuthMode, AuthOutcome, CredentialStore, DigestStore, NegotiateBinding};
pub use ban::BanSet;
pub use context::{Capture, Context};
pub use error::{CoreError, CoreResult};
pub use http::{EXPECTED_SIZE_HEADER, Method, NO_RESPONSE, PARTIAL_ID_HEADER, STATIC_FILE};
pub use logging::{init_logging, init_logging_json};
pub use parser::{RangeSpec, RequestHead};
pub use partial::{PartialRegistry, PartialStatus};
pub use router::Router;
pub use server::{FnHooks, Hooks, HttpServer, RunningServer, ServerCore, ServerOptions, ServerState};
