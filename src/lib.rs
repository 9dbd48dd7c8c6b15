//! # rust-trivia
//!
//! A real-time multiplayer trivia server. Participants connect over TCP,
//! register a name and race to answer each question first. Messages are
//! single-line JSON objects terminated by `\n`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rust_trivia::{ServerConfig, ServerError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ServerError> {
//!     rust_trivia::server::run(ServerConfig::default(), "questions.txt").await
//! }
//! ```

pub mod client;
pub mod data;
pub mod models;
pub mod protocol;
pub mod server;

pub use client::{ClientError, TriviaClient};
pub use data::{load_questions, LoadError};
pub use models::Question;
pub use protocol::{Framer, Message};
pub use server::{GameConfig, Server, ServerConfig, ServerError};
