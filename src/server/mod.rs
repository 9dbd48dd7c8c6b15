//! Quiz server module.
//!
//! Hosts a multiplayer trivia game over newline-delimited JSON on TCP.

mod broadcast;
mod config;
mod game;
mod scorer;
#[allow(clippy::module_inception)]
mod server;
mod session;

pub use broadcast::{broadcast, Delivery};
pub use config::{GameConfig, ServerConfig};
pub use game::{AnswerRejection, Event, Game, GameController, Phase, Round};
pub use scorer::{ScoreError, Scorer};
pub use server::{attach, run, Server, ServerContext, ServerError};
pub use session::{Received, Session, SessionError, SessionId, SessionReader};
