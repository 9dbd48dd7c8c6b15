//! Protocol messages for client-server communication.
//!
//! Every message is one compact JSON object tagged by its `kind` field.
//! Compact JSON escapes newlines inside strings, so an encoded message never
//! contains the line terminator used by the framer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single unit exchanged between participants and the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Participant asks to join under a display name.
    Register { name: String },

    /// Registration accepted.
    Welcome { name: String, players: usize },

    /// Names of the participants currently in the game.
    PlayerList { players: Vec<String> },

    /// A new game is starting.
    GameStart { total_questions: usize, round_secs: u64 },

    /// The question for the round that just opened.
    Question {
        index: usize,
        total: usize,
        text: String,
        choices: Vec<String>,
        time_limit_secs: u64,
    },

    /// Participant picks a choice for the question at `index`.
    Answer { index: usize, choice: usize },

    /// Result of an answer. Broadcast when a winner is recorded, sent
    /// privately for every other accepted answer.
    Feedback {
        index: usize,
        outcome: AnswerOutcome,
        #[serde(default)]
        winner: Option<String>,
        points: u32,
    },

    /// The answer window closed; reveals the correct choice.
    Timeout {
        index: usize,
        correct_choice: usize,
        correct_label: String,
        #[serde(default)]
        winner: Option<String>,
    },

    /// Standings after a round.
    Leaderboard {
        index: usize,
        entries: Vec<LeaderboardEntry>,
    },

    /// Final standings; no more rounds follow in this game.
    GameEnd { entries: Vec<LeaderboardEntry> },

    /// Request rejected or connection refused.
    Error { code: ErrorCode, reason: String },

    Ping,

    Pong,
}

impl Message {
    /// The wire name of this message's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Register { .. } => "register",
            Message::Welcome { .. } => "welcome",
            Message::PlayerList { .. } => "player_list",
            Message::GameStart { .. } => "game_start",
            Message::Question { .. } => "question",
            Message::Answer { .. } => "answer",
            Message::Feedback { .. } => "feedback",
            Message::Timeout { .. } => "timeout",
            Message::Leaderboard { .. } => "leaderboard",
            Message::GameEnd { .. } => "game_end",
            Message::Error { .. } => "error",
            Message::Ping => "ping",
            Message::Pong => "pong",
        }
    }

    /// Build an error reply.
    pub fn error(code: ErrorCode, reason: impl Into<String>) -> Self {
        Message::Error {
            code,
            reason: reason.into(),
        }
    }
}

/// How the server judged a submitted answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerOutcome {
    /// First correct answer of the round.
    Winner,
    /// Correct, but another participant already won the round.
    Late,
    Incorrect,
    /// The participant already answered this round.
    Duplicate,
}

/// Machine-readable reason carried by [`Message::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Malformed,
    Oversized,
    NotRegistered,
    AlreadyRegistered,
    InvalidName,
    NameTaken,
    GameInProgress,
    NoActiveRound,
    StaleQuestion,
    WindowClosed,
    InvalidChoice,
    UnexpectedMessage,
    ServerFull,
}

impl ErrorCode {
    /// Whether this rejection counts against the session's strike limit.
    pub fn is_violation(self) -> bool {
        matches!(
            self,
            ErrorCode::Malformed
                | ErrorCode::Oversized
                | ErrorCode::NotRegistered
                | ErrorCode::AlreadyRegistered
                | ErrorCode::InvalidChoice
                | ErrorCode::UnexpectedMessage
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Malformed => "malformed",
            ErrorCode::Oversized => "oversized",
            ErrorCode::NotRegistered => "not_registered",
            ErrorCode::AlreadyRegistered => "already_registered",
            ErrorCode::InvalidName => "invalid_name",
            ErrorCode::NameTaken => "name_taken",
            ErrorCode::GameInProgress => "game_in_progress",
            ErrorCode::NoActiveRound => "no_active_round",
            ErrorCode::StaleQuestion => "stale_question",
            ErrorCode::WindowClosed => "window_closed",
            ErrorCode::InvalidChoice => "invalid_choice",
            ErrorCode::UnexpectedMessage => "unexpected_message",
            ErrorCode::ServerFull => "server_full",
        };
        f.write_str(name)
    }
}

/// Entry in the leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub name: String,
    pub score: u32,
    /// False once the participant has disconnected.
    pub active: bool,
}

/// Username validation constants.
pub const USERNAME_MIN_LENGTH: usize = 3;
pub const USERNAME_MAX_LENGTH: usize = 16;

/// Default server port.
pub const DEFAULT_PORT: u16 = 8888;

/// Validates a username according to the rules.
///
/// Returns `Ok(())` if valid, or `Err` with an error message.
pub fn validate_username(username: &str) -> Result<(), &'static str> {
    let trimmed = username.trim();
    let length = trimmed.chars().count();

    if length < USERNAME_MIN_LENGTH {
        return Err("Username must be at least 3 characters");
    }

    if length > USERNAME_MAX_LENGTH {
        return Err("Username must be at most 16 characters");
    }

    if trimmed.chars().any(char::is_control) {
        return Err("Username must not contain control characters");
    }

    Ok(())
}
