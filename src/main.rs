use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use rust_trivia::protocol::DEFAULT_PORT;
use rust_trivia::{GameConfig, ServerConfig};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Question file: `.txt` pipe format or JSON
    #[arg(short, long, default_value = "questions.txt")]
    questions: PathBuf,

    /// Address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Seconds each question stays open
    #[arg(long, default_value_t = 30)]
    round_secs: u64,

    /// Registered players needed before the game starts
    #[arg(long, default_value_t = 1)]
    min_players: usize,

    /// Play at most this many questions
    #[arg(long)]
    max_questions: Option<usize>,

    /// Points for a winning answer
    #[arg(long, default_value_t = 1)]
    points: u32,

    /// Pause after each leaderboard
    #[arg(long, default_value_t = 3)]
    intermission_secs: u64,

    /// Open a new lobby this long after a game ends
    #[arg(long)]
    rematch_secs: Option<u64>,

    /// Refuse connections beyond this many
    #[arg(long)]
    max_connections: Option<usize>,

    /// Disconnect sessions silent for this long
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// Protocol violations tolerated before disconnecting
    #[arg(long, default_value_t = 3)]
    max_strikes: u32,

    /// Shuffle the question order
    #[arg(long)]
    shuffle: bool,
}

impl Args {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            max_connections: self.max_connections,
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            game: GameConfig {
                round_duration: Duration::from_secs(self.round_secs.max(1)),
                min_participants: self.min_players.max(1),
                max_questions: self.max_questions,
                points_per_answer: self.points,
                intermission: Duration::from_secs(self.intermission_secs),
                rematch_delay: self.rematch_secs.map(Duration::from_secs),
                max_strikes: self.max_strikes.max(1),
                shuffle: self.shuffle,
            },
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.config();

    tokio::select! {
        result = rust_trivia::server::run(config, &args.questions) => {
            if let Err(e) = result {
                log::error!("{}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down");
        }
    }
}
