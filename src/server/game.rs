//! Game state machine.
//!
//! The [`GameController`] is the only task that touches game and round
//! state. Connection tasks hand it [`Event`]s over a channel; it processes
//! them one at a time, which fixes the order in which answers compete for a
//! round.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::models::Question;
use crate::protocol::{validate_username, AnswerOutcome, ErrorCode, LeaderboardEntry, Message};

use super::broadcast::broadcast;
use super::config::GameConfig;
use super::scorer::Scorer;
use super::session::{Session, SessionId};

/// Input to the controller from the connection tasks.
#[derive(Debug)]
pub enum Event {
    /// A transport was accepted.
    Connected(Arc<Session>),
    /// A decoded message from a session.
    Inbound {
        session: Arc<Session>,
        message: Message,
    },
    /// The session's transport closed.
    Disconnected(Arc<Session>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting registrations.
    Lobby,
    /// Question out, answer window open.
    RoundActive,
    /// Window closed, correct answer being revealed.
    Grading,
    LeaderboardBroadcast,
    GameEnd,
}

/// Why an answer was refused without being judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerRejection {
    InvalidChoice,
}

/// One question's lifecycle.
#[derive(Debug)]
pub struct Round {
    index: usize,
    question: Question,
    opened_at: Instant,
    window: Duration,
    answered: HashSet<SessionId>,
    winner: Option<String>,
}

impl Round {
    pub fn open(index: usize, question: Question, window: Duration) -> Self {
        Self {
            index,
            question,
            opened_at: Instant::now(),
            window,
            answered: HashSet::new(),
            winner: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn question(&self) -> &Question {
        &self.question
    }

    pub fn deadline(&self) -> Instant {
        self.opened_at + self.window
    }

    pub fn winner(&self) -> Option<&str> {
        self.winner.as_deref()
    }

    pub fn has_answered(&self, id: &SessionId) -> bool {
        self.answered.contains(id)
    }

    /// Judge one answer. The first correct answer claims the round; the
    /// winner never changes afterwards.
    pub fn submit(&mut self, id: SessionId, name: &str, choice: usize) -> Result<AnswerOutcome, AnswerRejection> {
        if choice >= self.question.choices.len() {
            return Err(AnswerRejection::InvalidChoice);
        }
        if !self.answered.insert(id) {
            return Ok(AnswerOutcome::Duplicate);
        }
        if !self.question.is_correct(choice) {
            return Ok(AnswerOutcome::Incorrect);
        }
        if self.winner.is_some() {
            return Ok(AnswerOutcome::Late);
        }
        self.winner = Some(name.to_string());
        Ok(AnswerOutcome::Winner)
    }
}

/// The ordered questions of one game and how far it has got.
#[derive(Debug)]
pub struct Game {
    questions: Vec<Question>,
    next_index: usize,
}

impl Game {
    pub fn new(mut questions: Vec<Question>, config: &GameConfig) -> Self {
        if config.shuffle {
            questions.shuffle(&mut rand::thread_rng());
        }
        if let Some(max) = config.max_questions {
            questions.truncate(max.max(1));
        }
        Self {
            questions,
            next_index: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.questions.len()
    }

    pub fn is_finished(&self) -> bool {
        self.next_index >= self.questions.len()
    }

    fn next_question(&mut self) -> Option<(usize, Question)> {
        let question = self.questions.get(self.next_index)?.clone();
        let index = self.next_index;
        self.next_index += 1;
        Some((index, question))
    }
}

pub struct GameController {
    config: GameConfig,
    bank: Vec<Question>,
    scorer: Arc<Scorer>,
    events: mpsc::UnboundedReceiver<Event>,
    phase: Phase,
    game: Game,
    round: Option<Round>,
    /// Every open connection, registered or not.
    connections: HashMap<SessionId, Arc<Session>>,
    /// Registered participants still connected.
    participants: HashMap<SessionId, Arc<Session>>,
}

impl GameController {
    pub fn new(
        config: GameConfig,
        bank: Vec<Question>,
        scorer: Arc<Scorer>,
        events: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        let game = Game::new(bank.clone(), &config);
        Self {
            config,
            bank,
            scorer,
            events,
            phase: Phase::Lobby,
            game,
            round: None,
            connections: HashMap::new(),
            participants: HashMap::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Drive games until one ends without a rematch or every event sender
    /// is gone. Returns the final standings of the last completed game.
    pub async fn run(mut self) -> Option<Vec<LeaderboardEntry>> {
        let mut last_standings = None;

        loop {
            let phase = self.phase;
            let keep_going = match phase {
                Phase::Lobby => self.wait_in_lobby().await,
                Phase::RoundActive => self.play_round().await,
                Phase::Grading => {
                    self.grade();
                    true
                }
                Phase::LeaderboardBroadcast => self.publish_leaderboard().await,
                Phase::GameEnd => {
                    last_standings = Some(self.finish_game());
                    match self.config.rematch_delay {
                        Some(delay) => {
                            let keep_going = self.idle_for(delay).await;
                            self.open_lobby();
                            keep_going
                        }
                        None => false,
                    }
                }
            };
            if !keep_going {
                break;
            }
        }

        self.close_all();
        last_standings
    }

    async fn wait_in_lobby(&mut self) -> bool {
        loop {
            if self.participants.len() >= self.config.min_participants.max(1) {
                self.start_game();
                return true;
            }
            match self.events.recv().await {
                Some(event) => self.handle_event(event),
                None => return false,
            }
        }
    }

    fn start_game(&mut self) {
        log::info!(
            "Starting game with {} participants and {} questions",
            self.participants.len(),
            self.game.total()
        );
        self.announce(Message::GameStart {
            total_questions: self.game.total(),
            round_secs: self.config.round_duration.as_secs(),
        });
        self.phase = Phase::RoundActive;
    }

    async fn play_round(&mut self) -> bool {
        let Some((index, question)) = self.game.next_question() else {
            self.phase = Phase::GameEnd;
            return true;
        };

        log::info!("Round {}/{}: {}", index + 1, self.game.total(), question.text);
        let round = Round::open(index, question, self.config.round_duration);
        let deadline = round.deadline();
        let message = Message::Question {
            index,
            total: self.game.total(),
            text: round.question().text.clone(),
            choices: round.question().choices.clone(),
            time_limit_secs: self.config.round_duration.as_secs(),
        };
        self.round = Some(round);
        self.announce(message);

        while !self.round_settled() {
            let event = tokio::select! {
                _ = sleep_until(deadline) => None,
                event = self.events.recv() => Some(event),
            };
            match event {
                None => break,
                Some(Some(event)) => self.handle_event(event),
                Some(None) => return false,
            }
        }

        self.phase = Phase::Grading;
        true
    }

    /// Nobody left to answer, or everyone already has.
    fn round_settled(&self) -> bool {
        let Some(round) = &self.round else {
            return true;
        };
        self.participants.is_empty() || self.participants.keys().all(|id| round.has_answered(id))
    }

    fn grade(&mut self) {
        if let Some(round) = self.round.take() {
            log::info!(
                "Round {} closed, winner: {}",
                round.index() + 1,
                round.winner().unwrap_or("none")
            );
            self.announce(Message::Timeout {
                index: round.index(),
                correct_choice: round.question().correct,
                correct_label: round.question().correct_label().to_string(),
                winner: round.winner.clone(),
            });
        }
        self.phase = Phase::LeaderboardBroadcast;
    }

    async fn publish_leaderboard(&mut self) -> bool {
        let index = self.game.next_index.saturating_sub(1);
        self.announce(Message::Leaderboard {
            index,
            entries: self.scorer.snapshot(),
        });

        if self.game.is_finished() {
            self.phase = Phase::GameEnd;
            return true;
        }
        // Still showing the leaderboard until the pause is over.
        let keep_going = self.idle_for(self.config.intermission).await;
        self.phase = Phase::RoundActive;
        keep_going
    }

    fn finish_game(&mut self) -> Vec<LeaderboardEntry> {
        let entries = self.scorer.snapshot();
        log::info!("Game over: {}", describe_standings(&entries));
        self.announce(Message::GameEnd {
            entries: entries.clone(),
        });
        entries
    }

    /// Start a fresh game in the lobby with whoever is still connected.
    fn open_lobby(&mut self) {
        self.scorer.start_over();
        self.game = Game::new(self.bank.clone(), &self.config);
        self.round = None;
        self.phase = Phase::Lobby;
        log::info!("Lobby open with {} participants", self.participants.len());
    }

    /// Keep handling events for `duration` without starting anything.
    async fn idle_for(&mut self, duration: Duration) -> bool {
        if duration.is_zero() {
            return true;
        }
        let until = Instant::now() + duration;
        loop {
            let event = tokio::select! {
                _ = sleep_until(until) => None,
                event = self.events.recv() => Some(event),
            };
            match event {
                None => return true,
                Some(Some(event)) => self.handle_event(event),
                Some(None) => return false,
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected(session) => {
                log::info!("New connection from {}", session.peer());
                self.connections.insert(session.id(), session);
            }
            Event::Inbound { session, message } => {
                log::debug!("{} from {}", message.kind(), session.label());
                self.handle_message(&session, message);
            }
            Event::Disconnected(session) => self.retire(&session),
        }
    }

    fn handle_message(&mut self, session: &Arc<Session>, message: Message) {
        match message {
            Message::Register { name } => self.admit(session, &name),
            Message::Answer { index, choice } => self.accept_answer(session, index, choice),
            other => self.reply_error(
                session,
                ErrorCode::UnexpectedMessage,
                format!("'{}' messages are not accepted from participants", other.kind()),
            ),
        }
    }

    fn admit(&mut self, session: &Arc<Session>, raw_name: &str) {
        if session.is_registered() {
            return self.reply_error(session, ErrorCode::AlreadyRegistered, "This connection is already registered");
        }
        if self.phase != Phase::Lobby {
            return self.reply_error(session, ErrorCode::GameInProgress, "A game is already in progress");
        }

        let name = raw_name.trim();
        if let Err(reason) = validate_username(name) {
            return self.reply_error(session, ErrorCode::InvalidName, reason);
        }
        if let Err(e) = self.scorer.register(name, session.id()) {
            return self.reply_error(session, ErrorCode::NameTaken, e.to_string());
        }
        if session.register(name).is_err() {
            // Closed while waiting in the queue.
            self.scorer.deactivate(name, session.id());
            return;
        }

        log::info!("{} joined as '{}'", session.peer(), name);
        self.participants.insert(session.id(), Arc::clone(session));
        let _ = session.send(Message::Welcome {
            name: name.to_string(),
            players: self.participants.len(),
        });
        self.announce_players();
    }

    fn accept_answer(&mut self, session: &Arc<Session>, index: usize, choice: usize) {
        let Some(name) = session.name() else {
            return self.reply_error(session, ErrorCode::NotRegistered, "Register before answering");
        };
        if !self.participants.contains_key(&session.id()) {
            return self.reply_error(session, ErrorCode::NotRegistered, "Not a participant in this game");
        }

        let Some(round) = self.round.as_mut().filter(|_| self.phase == Phase::RoundActive) else {
            return self.reply_error(session, ErrorCode::NoActiveRound, "No question is open");
        };
        if round.index() != index {
            return self.reply_error(
                session,
                ErrorCode::StaleQuestion,
                format!("Question {} is not the open question", index),
            );
        }
        if Instant::now() >= round.deadline() {
            return self.reply_error(session, ErrorCode::WindowClosed, "Time's up");
        }

        let outcome = match round.submit(session.id(), name, choice) {
            Ok(outcome) => outcome,
            Err(AnswerRejection::InvalidChoice) => {
                let reason = format!(
                    "Choice {} is out of range for {} choices",
                    choice,
                    round.question().choices.len()
                );
                return self.reply_error(session, ErrorCode::InvalidChoice, reason);
            }
        };
        let winner = round.winner.clone();
        log::info!("Answer from '{}' for question {}: {} ({:?})", name, index + 1, choice, outcome);

        if outcome == AnswerOutcome::Winner {
            let points = self.config.points_per_answer;
            if let Err(e) = self.scorer.award(name, points) {
                log::error!("Could not award points for question {}: {}", index + 1, e);
            }
            self.announce(Message::Feedback {
                index,
                outcome,
                winner,
                points,
            });
        } else {
            let _ = session.send(Message::Feedback {
                index,
                outcome,
                winner,
                points: 0,
            });
        }
    }

    /// Reply with an error. Violations count toward the strike limit.
    fn reply_error(&mut self, session: &Arc<Session>, code: ErrorCode, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("Rejected message from {}: {} ({})", session.label(), code, reason);
        let _ = session.send(Message::error(code, reason));

        if code.is_violation() {
            let strikes = session.strike();
            if strikes >= self.config.max_strikes {
                log::warn!("Disconnecting {} after {} violations", session.label(), strikes);
                session.close();
            }
        }
    }

    /// Drop a session from the game. Its score stays on the leaderboard.
    fn retire(&mut self, session: &Arc<Session>) {
        session.close();
        self.connections.remove(&session.id());

        if self.participants.remove(&session.id()).is_none() {
            log::info!("Connection from {} closed", session.peer());
            return;
        }
        if let Some(name) = session.name() {
            self.scorer.deactivate(name, session.id());
        }
        log::info!("{} left the game", session.label());
        self.announce_players();
    }

    fn announce_players(&mut self) {
        let players = self.scorer.active_names();
        self.announce(Message::PlayerList { players });
    }

    /// Broadcast to every participant and retire whoever can't receive.
    fn announce(&mut self, message: Message) {
        let delivery = broadcast(&message, self.participants.values());
        for session in delivery.failed {
            self.retire(&session);
        }
    }

    fn close_all(&mut self) {
        for session in self.connections.values().chain(self.participants.values()) {
            session.close();
        }
        self.connections.clear();
        self.participants.clear();
    }
}

fn describe_standings(entries: &[LeaderboardEntry]) -> String {
    if entries.is_empty() {
        return "no participants".to_string();
    }
    entries
        .iter()
        .map(|e| format!("{}. {} {}", e.rank, e.name, e.score))
        .collect::<Vec<_>>()
        .join(", ")
}
