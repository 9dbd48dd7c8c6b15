//! Quiz client module.
//!
//! A headless participant connection: the transport half of a display
//! front-end.

#[allow(clippy::module_inception)]
mod client;

pub use client::{ClientError, TriviaClient};
