use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::models::Question;

/// Error raised while loading a question bank.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line}: {reason}")]
    Line { line: usize, reason: String },

    #[error("question {index}: {reason}")]
    Invalid { index: usize, reason: String },

    #[error("{} must contain at least one question", path.display())]
    Empty { path: PathBuf },
}

/// Load questions from a JSON array or, for `.txt` files, the line format
/// `id:Question text|a) First|b) Second|c) Third|d) Fourth|b`.
pub fn load_questions<P: AsRef<Path>>(path: P) -> Result<Vec<Question>, LoadError> {
    let path = path.as_ref();

    let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let is_text = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"));

    let questions = if is_text {
        parse_question_lines(&content)?
    } else {
        serde_json::from_str(&content).map_err(|source| LoadError::Json {
            path: path.to_path_buf(),
            source,
        })?
    };

    if questions.is_empty() {
        return Err(LoadError::Empty {
            path: path.to_path_buf(),
        });
    }
    validate_questions(&questions)?;

    log::info!("Loaded {} questions from {}", questions.len(), path.display());
    Ok(questions)
}

/// Check every question is playable.
pub fn validate_questions(questions: &[Question]) -> Result<(), LoadError> {
    for (index, question) in questions.iter().enumerate() {
        question
            .validate()
            .map_err(|reason| LoadError::Invalid { index, reason })?;
    }
    Ok(())
}

/// Parse the pipe-delimited text format. Blank lines and `#` comments are
/// skipped.
pub fn parse_question_lines(content: &str) -> Result<Vec<Question>, LoadError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(i, line)| {
            parse_question_line(line.trim()).map_err(|reason| LoadError::Line { line: i + 1, reason })
        })
        .collect()
}

fn parse_question_line(line: &str) -> Result<Question, String> {
    let parts: Vec<&str> = line.split('|').map(str::trim).collect();
    if parts.len() < 4 {
        return Err(format!("expected text, at least 2 choices and an answer, got {} fields", parts.len()));
    }

    let (head, rest) = parts.split_first().ok_or("empty line")?;
    let (answer, options) = rest.split_last().ok_or("missing answer")?;

    // A leading `id:` prefix is optional.
    let text = match head.split_once(':') {
        Some((id, text)) if !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric()) => text,
        _ => head,
    };

    let choices: Vec<String> = options.iter().map(|raw| strip_choice_label(raw).to_string()).collect();

    let letter = answer
        .chars()
        .next()
        .map(|c| c.to_ascii_lowercase())
        .ok_or("missing answer letter")?;
    if !letter.is_ascii_lowercase() {
        return Err(format!("answer '{}' is not a choice letter", answer));
    }
    let correct = (letter as u8 - b'a') as usize;

    Ok(Question::new(text.trim(), choices, correct))
}

/// Turn `b) Second` into `Second`; unlabeled choices are kept as-is.
fn strip_choice_label(raw: &str) -> &str {
    let mut chars = raw.char_indices();
    match (chars.next(), chars.next()) {
        (Some((_, letter)), Some((i, ')'))) if letter.is_ascii_alphabetic() => {
            raw[i + 1..].trim_start_matches([' ', '.', '-'])
        }
        _ => raw,
    }
}
