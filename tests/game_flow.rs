use std::net::SocketAddr;
use std::time::Duration;

use rust_trivia::protocol::{AnswerOutcome, ErrorCode, LeaderboardEntry};
use rust_trivia::server::ServerError;
use rust_trivia::{GameConfig, Message, Question, Server, ServerConfig, TriviaClient};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;

type Client = TriviaClient<OwnedReadHalf, OwnedWriteHalf>;

const PATIENCE: Duration = Duration::from_secs(10);

fn questions() -> Vec<Question> {
    vec![
        Question::new(
            "Which planet is known as the Red Planet?",
            vec!["Venus".to_string(), "Mars".to_string(), "Jupiter".to_string()],
            1,
        ),
        Question::new(
            "What is the capital of France?",
            vec!["Paris".to_string(), "Rome".to_string()],
            0,
        ),
    ]
}

fn config(min_participants: usize) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        game: GameConfig {
            round_duration: Duration::from_secs(5),
            min_participants,
            intermission: Duration::ZERO,
            ..GameConfig::default()
        },
        ..ServerConfig::default()
    }
}

async fn start(config: ServerConfig) -> (SocketAddr, JoinHandle<Option<Vec<LeaderboardEntry>>>) {
    let server = Server::bind(config, questions()).await.unwrap();
    let address = server.local_addr().unwrap();
    (address, tokio::spawn(server.run()))
}

async fn wait_for<F>(client: &mut Client, predicate: F) -> Message
where
    F: FnMut(&Message) -> bool,
{
    timeout(PATIENCE, client.wait_for(predicate))
        .await
        .expect("timed out waiting for message")
        .unwrap()
}

async fn join(address: SocketAddr, name: &str) -> Client {
    let mut client = TriviaClient::connect(address).await.unwrap();
    client.register(name).await.unwrap();
    let welcome = wait_for(&mut client, |m| matches!(m, Message::Welcome { .. })).await;
    assert!(matches!(welcome, Message::Welcome { name: ref joined, .. } if joined == name));
    client
}

async fn question_index(client: &mut Client) -> usize {
    match wait_for(client, |m| matches!(m, Message::Question { .. })).await {
        Message::Question { index, .. } => index,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_full_game_over_tcp() {
    let (address, server) = start(config(2)).await;
    let mut alice = join(address, "alice").await;
    let mut bob = join(address, "bob").await;

    let start = wait_for(&mut alice, |m| matches!(m, Message::GameStart { .. })).await;
    assert_eq!(
        start,
        Message::GameStart {
            total_questions: 2,
            round_secs: 5
        }
    );

    // Round one: alice answers correctly first, bob answers wrong.
    assert_eq!(question_index(&mut alice).await, 0);
    assert_eq!(question_index(&mut bob).await, 0);
    alice.answer(0, 1).await.unwrap();
    let won = wait_for(&mut bob, |m| matches!(m, Message::Feedback { .. })).await;
    assert!(matches!(won, Message::Feedback { outcome: AnswerOutcome::Winner, points: 1, .. }));
    bob.answer(0, 0).await.unwrap();
    let own = wait_for(&mut bob, |m| matches!(m, Message::Feedback { .. })).await;
    assert!(matches!(own, Message::Feedback { outcome: AnswerOutcome::Incorrect, points: 0, .. }));

    // Round two: bob wins, alice only answers once that is announced.
    assert_eq!(question_index(&mut bob).await, 1);
    bob.answer(1, 0).await.unwrap();
    let won = wait_for(&mut alice, |m| {
        matches!(m, Message::Feedback { index: 1, outcome: AnswerOutcome::Winner, .. })
    })
    .await;
    assert!(matches!(won, Message::Feedback { winner: Some(ref w), .. } if w == "bob"));
    alice.answer(1, 0).await.unwrap();
    let own = wait_for(&mut alice, |m| matches!(m, Message::Feedback { .. })).await;
    assert!(matches!(own, Message::Feedback { outcome: AnswerOutcome::Late, .. }));

    let Message::GameEnd { entries } = wait_for(&mut alice, |m| matches!(m, Message::GameEnd { .. })).await else {
        unreachable!()
    };
    let standings: Vec<(&str, u32)> = entries.iter().map(|e| (e.name.as_str(), e.score)).collect();
    assert_eq!(standings, vec![("alice", 1), ("bob", 1)]);

    let final_board = timeout(PATIENCE, server).await.unwrap().unwrap().unwrap();
    assert_eq!(final_board, entries);
}

#[tokio::test]
async fn test_split_writes_form_one_message() {
    let (address, _server) = start(config(2)).await;
    let mut client = TriviaClient::connect(address).await.unwrap();

    client.send_raw(b"{\"kind\":\"register\",\"na").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.send_raw(b"me\":\"carol\"}\n").await.unwrap();

    let welcome = wait_for(&mut client, |m| matches!(m, Message::Welcome { .. })).await;
    assert_eq!(
        welcome,
        Message::Welcome {
            name: "carol".to_string(),
            players: 1
        }
    );
}

#[tokio::test]
async fn test_malformed_line_is_reported_and_connection_survives() {
    let (address, _server) = start(config(2)).await;
    let mut client = TriviaClient::connect(address).await.unwrap();

    client.send_raw(b"this is not json\n").await.unwrap();
    let error = wait_for(&mut client, |m| matches!(m, Message::Error { .. })).await;
    assert!(matches!(error, Message::Error { code: ErrorCode::Malformed, .. }));

    client.send(&Message::Ping).await.unwrap();
    assert_eq!(wait_for(&mut client, |m| matches!(m, Message::Pong)).await, Message::Pong);
}

#[tokio::test]
async fn test_connection_limit_refuses_extra_clients() {
    let config = ServerConfig {
        max_connections: Some(1),
        ..config(2)
    };
    let (address, _server) = start(config).await;
    let _first = join(address, "alice").await;

    let mut second = TriviaClient::connect(address).await.unwrap();
    let refusal = timeout(PATIENCE, second.next_message()).await.unwrap().unwrap();
    assert!(matches!(refusal, Some(Message::Error { code: ErrorCode::ServerFull, .. })));
    assert!(timeout(PATIENCE, second.next_message()).await.unwrap().unwrap().is_none());
}

#[tokio::test]
async fn test_empty_question_bank_is_refused() {
    let result = Server::bind(config(1), Vec::new()).await;
    assert!(matches!(result, Err(ServerError::NoQuestions)));
}

#[tokio::test]
async fn test_invalid_question_is_refused() {
    let broken = vec![Question::new("Only one choice?", vec!["yes".to_string()], 0)];
    let result = Server::bind(config(1), broken).await;
    assert!(matches!(result, Err(ServerError::Questions(_))));
}
