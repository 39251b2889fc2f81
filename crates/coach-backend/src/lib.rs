//! Backend invocation contract for the coach streaming pipeline.
//!
//! A backend is anything that can take one user turn and hand back either a
//! terminal error or an ordered stream of fragments ending in a completion
//! signal. `HttpBackend` speaks the coach service's SSE protocol; tests and
//! embedders can plug in their own [`BackendAdapter`].

pub mod errors;
pub mod http;
pub mod provider;
pub mod stream;
pub mod types;
pub mod utils;

pub use errors::*;
pub use http::{HttpBackend, HttpBackendConfig};
pub use provider::*;
pub use stream::*;
pub use types::*;
pub use utils::accumulator::{Applied, StreamAccumulator};
