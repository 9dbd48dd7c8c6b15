//! Wire protocol: message types and line framing.

mod framer;
mod messages;

pub use framer::{FrameError, FramedReader, Framer, Frames, MAX_FRAME_LEN, TERMINATOR};
pub use messages::{
    validate_username, AnswerOutcome, ErrorCode, LeaderboardEntry, Message, DEFAULT_PORT,
    USERNAME_MAX_LENGTH, USERNAME_MIN_LENGTH,
};
