use serde::{Deserialize, Serialize};

/// Most choices a question may offer.
pub const MAX_CHOICES: usize = 26;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    #[serde(alias = "options")]
    pub choices: Vec<String>,
    #[serde(alias = "correct_answer")]
    pub correct: usize,
}

impl Question {
    pub fn new(text: impl Into<String>, choices: Vec<String>, correct: usize) -> Self {
        Self {
            text: text.into(),
            choices,
            correct,
        }
    }

    /// Label of the correct choice.
    pub fn correct_label(&self) -> &str {
        self.choices
            .get(self.correct)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn is_correct(&self, choice: usize) -> bool {
        choice == self.correct
    }

    /// Check the question is playable.
    pub fn validate(&self) -> Result<(), String> {
        if self.text.trim().is_empty() {
            return Err("question text is empty".to_string());
        }
        if self.choices.len() < 2 {
            return Err(format!("needs at least 2 choices, has {}", self.choices.len()));
        }
        if self.choices.len() > MAX_CHOICES {
            return Err(format!("has {} choices, at most {} allowed", self.choices.len(), MAX_CHOICES));
        }
        if let Some(i) = self.choices.iter().position(|c| c.trim().is_empty()) {
            return Err(format!("choice {} is empty", i));
        }
        if self.correct >= self.choices.len() {
            return Err(format!(
                "correct choice {} is out of range for {} choices",
                self.correct,
                self.choices.len()
            ));
        }
        Ok(())
    }
}
