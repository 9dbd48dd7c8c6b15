mod loader;

pub use loader::{load_questions, parse_question_lines, validate_questions, LoadError};
