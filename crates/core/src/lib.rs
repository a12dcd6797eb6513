//! Core data types for the acceptance coefficient watcher.

pub mod bounds;
pub mod coefficient;
pub mod credential;
pub mod ids;
pub mod watch;

pub use bounds::*;
pub use coefficient::*;
pub use credential::*;
pub use ids::*;
pub use watch::*;
