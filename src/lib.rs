//! prq: a command-line client for code-review projects.
//!
//! The [`query`] module is a standalone query cache; [`review`] binds it to
//! the review API.

pub mod cache;
pub mod config;
pub mod logging;
pub mod query;
pub mod review;
