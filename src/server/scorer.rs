//! Scoreboard shared between the game controller and the connection tasks.
//!
//! Every operation takes the board lock for its whole duration, so two
//! awards can never interleave and lose an increment.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;

use crate::protocol::LeaderboardEntry;

use super::session::SessionId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScoreError {
    #[error("name '{0}' is already taken")]
    DuplicateName(String),

    #[error("no participant named '{0}'")]
    UnknownParticipant(String),
}

#[derive(Debug)]
struct Entry {
    name: String,
    score: u32,
    active: bool,
    /// Session currently holding the name.
    owner: SessionId,
}

/// Entries in registration order plus a name index.
#[derive(Debug, Default)]
struct Board {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct Scorer {
    board: Mutex<Board>,
}

impl Scorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant with a zero score, owned by `owner`.
    ///
    /// A name held by an inactive entry is reactivated for the new owner,
    /// keeping its score and registration rank.
    pub fn register(&self, name: &str, owner: SessionId) -> Result<(), ScoreError> {
        let mut board = self.board.lock();

        if let Some(&i) = board.index.get(name) {
            let entry = &mut board.entries[i];
            if entry.active {
                return Err(ScoreError::DuplicateName(name.to_string()));
            }
            entry.active = true;
            entry.owner = owner;
            return Ok(());
        }

        let position = board.entries.len();
        board.entries.push(Entry {
            name: name.to_string(),
            score: 0,
            active: true,
            owner,
        });
        board.index.insert(name.to_string(), position);
        Ok(())
    }

    /// Add `points` to one participant. Returns the new score.
    pub fn award(&self, name: &str, points: u32) -> Result<u32, ScoreError> {
        let mut board = self.board.lock();
        let i = *board
            .index
            .get(name)
            .ok_or_else(|| ScoreError::UnknownParticipant(name.to_string()))?;
        let entry = &mut board.entries[i];
        entry.score = entry.score.saturating_add(points);
        Ok(entry.score)
    }

    /// Mark a participant as gone. The entry stays on the leaderboard.
    ///
    /// Only the session that holds the name can release it; a stale call
    /// from an earlier owner leaves a reactivated entry alone. Returns
    /// whether the entry was active.
    pub fn deactivate(&self, name: &str, owner: SessionId) -> bool {
        let mut board = self.board.lock();
        match board.index.get(name).copied() {
            Some(i) if board.entries[i].owner == owner => {
                std::mem::replace(&mut board.entries[i].active, false)
            }
            _ => false,
        }
    }

    /// Standings by descending score; ties go to whoever registered first.
    pub fn snapshot(&self) -> Vec<LeaderboardEntry> {
        let board = self.board.lock();
        let mut order: Vec<&Entry> = board.entries.iter().collect();
        // Stable sort keeps registration order among equal scores.
        order.sort_by(|a, b| b.score.cmp(&a.score));

        order
            .into_iter()
            .enumerate()
            .map(|(i, entry)| LeaderboardEntry {
                rank: i + 1,
                name: entry.name.clone(),
                score: entry.score,
                active: entry.active,
            })
            .collect()
    }

    pub fn score_of(&self, name: &str) -> Option<u32> {
        let board = self.board.lock();
        board.index.get(name).map(|&i| board.entries[i].score)
    }

    pub fn is_active(&self, name: &str) -> bool {
        let board = self.board.lock();
        board.index.get(name).is_some_and(|&i| board.entries[i].active)
    }

    pub fn active_count(&self) -> usize {
        self.board.lock().entries.iter().filter(|e| e.active).count()
    }

    /// Names of active participants in registration order.
    pub fn active_names(&self) -> Vec<String> {
        self.board
            .lock()
            .entries
            .iter()
            .filter(|e| e.active)
            .map(|e| e.name.clone())
            .collect()
    }

    /// Begin a new game: drop departed participants and reset everyone
    /// else to zero, keeping registration order.
    pub fn start_over(&self) {
        let mut board = self.board.lock();
        board.entries.retain(|e| e.active);
        for entry in &mut board.entries {
            entry.score = 0;
        }
        let index = board
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();
        board.index = index;
    }
}
