//! System instruction for the writing assistant.

use chrono::{Local, NaiveDate};

/// Builds the system instruction sent with every prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    /// Extra context about the piece being written.
    writing_context: Option<String>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.writing_context = Some(context.into());
        self
    }

    /// System instruction dated today.
    pub fn build(&self) -> String {
        self.build_for(Local::now().date_naive())
    }

    pub fn build_for(&self, date: NaiveDate) -> String {
        let context = self
            .writing_context
            .as_deref()
            .unwrap_or("General writing assistance.");

        let mut parts = Vec::with_capacity(3);
        parts.push(format!(
            "You are an expert AI Writing Assistant. Your primary purpose is to be a collaborative writing partner. Today's date is {}.",
            date.format("%B %-d, %Y")
        ));
        parts.push(format!("**Writing Context**: {context}"));
        parts.push(
            "**Crucial Instructions**: Be direct and production-ready. Use clear formatting. \
             Never begin responses with phrases like \"Here's the edit:\", \"Here are the changes:\", \
             or similar introductory statements. Provide responses directly and professionally \
             without unnecessary preambles."
                .to_string(),
        );
        parts.join("\n")
    }
}
