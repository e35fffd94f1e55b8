//! The user-facing session layer.

pub mod pager;
pub(crate) mod prepared_cache;
pub mod session;
pub mod session_builder;

pub use pager::QueryPager;
pub use session::Session;
pub use session_builder::{SessionBuilder, SessionConfig};
