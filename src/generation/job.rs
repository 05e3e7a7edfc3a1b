//! The quiz generation job body.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::GenerationError;
use crate::generation::chunker::split_chapters;
use crate::generation::llm::QuestionGenerator;
use crate::generation::model::{GenerationSettings, Question};
use crate::tasks::job::{JobBody, JobContext, JobOutcome};

/// Splits the task document into chapters and drafts questions for each.
///
/// Chapters that already have stored questions are skipped, so a task
/// relaunched after a restart picks up where it left off.
pub struct QuizGenerationJob {
    generator: Arc<dyn QuestionGenerator>,
}

impl QuizGenerationJob {
    pub fn new(generator: Arc<dyn QuestionGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl JobBody for QuizGenerationJob {
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome, GenerationError> {
        let settings = GenerationSettings::from_value(ctx.settings())?;
        let chapters = split_chapters(&settings.document, settings.max_chapter_chars);
        if chapters.is_empty() {
            return Err(GenerationError::EmptyDocument);
        }

        let titles: Vec<String> = chapters.iter().map(|c| c.title.clone()).collect();
        ctx.set_plan(&titles).await?;

        let done: HashSet<String> = ctx
            .store()
            .list_questions(ctx.task_id())
            .await?
            .into_iter()
            .map(|q| q.chapter)
            .collect();

        let total = chapters.len();
        let mut generated = 0usize;

        for (i, chapter) in chapters.iter().enumerate() {
            if !ctx.checkpoint().await {
                info!(task_id = %ctx.task_id(), chapter = %chapter.title, "Generation stopped");
                return Ok(JobOutcome::Cancelled);
            }

            let progress = (i + 1) as f64 / total as f64;
            if done.contains(&chapter.title) {
                debug!(task_id = %ctx.task_id(), chapter = %chapter.title, "Chapter already generated");
                ctx.report(
                    progress,
                    Some(&chapter.title),
                    format!("Skipped '{}' (already generated)", chapter.title),
                )
                .await?;
                continue;
            }

            let drafts = self
                .generator
                .generate(chapter, settings.questions_per_chapter, settings.difficulty)
                .await
                .map_err(|source| GenerationError::Chapter {
                    chapter: chapter.title.clone(),
                    source,
                })?;

            let questions: Vec<Question> = drafts
                .into_iter()
                .enumerate()
                .map(|(pos, draft)| {
                    draft.into_question(ctx.task_id(), &chapter.title, pos as i64, settings.difficulty)
                })
                .collect();
            ctx.store()
                .replace_questions(ctx.task_id(), &chapter.title, &questions)
                .await?;
            generated += questions.len();

            ctx.report(
                progress,
                Some(&chapter.title),
                format!(
                    "Generated {} questions for '{}' ({}/{})",
                    questions.len(),
                    chapter.title,
                    i + 1,
                    total
                ),
            )
            .await?;
        }

        Ok(JobOutcome::completed(format!(
            "Generated {generated} questions across {total} chapters"
        )))
    }
}
