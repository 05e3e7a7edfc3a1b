//! Quiz generation — chapter splitting, LLM question drafting, and the job
//! body that ties them to a task.

pub mod chunker;
pub mod job;
pub mod llm;
pub mod model;

pub use chunker::{Chapter, split_chapters};
pub use job::QuizGenerationJob;
pub use llm::{AnthropicGenerator, QuestionDraft, QuestionGenerator};
pub use model::{Difficulty, GenerationSettings, Question};
