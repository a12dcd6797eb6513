//! Acceptance coefficient collection from the supplies API.
//!
//! ## Architecture
//!
//! - `source` - the [`CoefficientSource`] trait the engine polls through
//! - `rest` - Wildberries REST implementation with timeouts and bounded retries
//! - `limiter` - per-credential token buckets
//! - `cache` - single-flight snapshot cache keyed by credential

pub mod cache;
pub mod error;
pub mod limiter;
pub mod rest;
pub mod retry;
pub mod source;

pub use cache::*;
pub use error::*;
pub use limiter::*;
pub use rest::*;
pub use retry::*;
pub use source::*;
