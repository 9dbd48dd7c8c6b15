//! Startup configuration. Nothing here changes once a game is running.

use std::time::Duration;

use crate::protocol::DEFAULT_PORT;

/// Settings for the listener and connection handling.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Connections beyond this are refused with `server_full`.
    pub max_connections: Option<usize>,
    /// Disconnect a session that sends nothing for this long.
    pub idle_timeout: Option<Duration>,
    pub game: GameConfig,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_connections: None,
            idle_timeout: None,
            game: GameConfig::default(),
        }
    }
}

/// Rules of a game.
#[derive(Debug, Clone)]
pub struct GameConfig {
    /// How long each answer window stays open.
    pub round_duration: Duration,
    /// Registered participants needed before the first question.
    pub min_participants: usize,
    /// Cap on rounds per game; the whole bank is used when unset.
    pub max_questions: Option<usize>,
    pub points_per_answer: u32,
    /// Pause between a leaderboard and the next question.
    pub intermission: Duration,
    /// Open a fresh lobby this long after a game ends. The server stops
    /// after the first game when unset.
    pub rematch_delay: Option<Duration>,
    /// Protocol violations tolerated before a session is closed.
    pub max_strikes: u32,
    pub shuffle: bool,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            round_duration: Duration::from_secs(30),
            min_participants: 1,
            max_questions: None,
            points_per_answer: 1,
            intermission: Duration::from_secs(3),
            rematch_delay: None,
            max_strikes: 3,
            shuffle: false,
        }
    }
}
