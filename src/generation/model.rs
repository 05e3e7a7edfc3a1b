//! Quiz data model — questions, difficulty, and per-task generation settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;

/// Target difficulty for generated questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Easy => write!(f, "easy"),
            Self::Medium => write!(f, "medium"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

impl std::str::FromStr for Difficulty {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "easy" => Ok(Self::Easy),
            "medium" => Ok(Self::Medium),
            "hard" => Ok(Self::Hard),
            _ => Err(format!("Unknown difficulty: {}", s)),
        }
    }
}

/// A single multiple-choice question generated from one chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub task_id: String,
    /// Title of the chapter the question was generated from.
    pub chapter: String,
    /// Order within the chapter.
    pub position: i64,
    pub prompt: String,
    pub options: Vec<String>,
    /// Index into `options` of the correct answer.
    pub answer_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub difficulty: Difficulty,
    pub created_at: DateTime<Utc>,
}

impl Question {
    pub fn new(
        task_id: impl Into<String>,
        chapter: impl Into<String>,
        position: i64,
        prompt: impl Into<String>,
        options: Vec<String>,
        answer_index: usize,
        difficulty: Difficulty,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            chapter: chapter.into(),
            position,
            prompt: prompt.into(),
            options,
            answer_index,
            explanation: None,
            difficulty,
            created_at: Utc::now(),
        }
    }

    /// Builder: attach an explanation of the correct answer.
    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }
}

/// Input payload stored in a task's `settings` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    /// Markdown source of the textbook.
    pub document: String,
    #[serde(default = "default_questions_per_chapter")]
    pub questions_per_chapter: usize,
    #[serde(default)]
    pub difficulty: Difficulty,
    /// Chapters longer than this are split into parts.
    #[serde(default = "default_max_chapter_chars")]
    pub max_chapter_chars: usize,
}

pub const MAX_QUESTIONS_PER_CHAPTER: usize = 20;

fn default_questions_per_chapter() -> usize {
    5
}

fn default_max_chapter_chars() -> usize {
    12_000
}

impl GenerationSettings {
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
            questions_per_chapter: default_questions_per_chapter(),
            difficulty: Difficulty::default(),
            max_chapter_chars: default_max_chapter_chars(),
        }
    }

    /// Decode and validate settings from a task record.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, GenerationError> {
        let settings: Self = serde_json::from_value(value.clone())
            .map_err(|e| GenerationError::InvalidSettings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.document.trim().is_empty() {
            return Err(GenerationError::EmptyDocument);
        }
        if self.questions_per_chapter == 0 || self.questions_per_chapter > MAX_QUESTIONS_PER_CHAPTER {
            return Err(GenerationError::InvalidSettings(format!(
                "questions_per_chapter must be between 1 and {MAX_QUESTIONS_PER_CHAPTER}"
            )));
        }
        if self.max_chapter_chars < 500 {
            return Err(GenerationError::InvalidSettings(
                "max_chapter_chars must be at least 500".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
