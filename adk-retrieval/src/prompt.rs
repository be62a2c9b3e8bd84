//! Answer prompt templates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Placeholder replaced by the user question.
pub const QUESTION_PLACEHOLDER: &str = "{input_question}";

/// Placeholder replaced by the retrieved context.
pub const CONTEXT_PLACEHOLDER: &str = "{input_context}";

/// Reply a model gives when the context does not contain the answer.
pub const UPDATE_CONTEXT: &str = "UPDATE CONTEXT";

pub const PROMPT_DEFAULT: &str = "You're a retrieve augmented chatbot. You answer user's \
questions based on your own knowledge and the context provided by the user. You should \
follow the following steps to answer a question:
Step 1, you estimate the user's intent based on the question and context. The intent can \
be a code generation task or a question answering task.
Step 2, you reply based on the intent.
If you can't answer the question with or without the current context, you should reply \
exactly `UPDATE CONTEXT`.
If user's intent is code generation, you must obey the following rules:
Rule 1. You MUST NOT install any packages because all the packages needed are already installed.
Rule 2. You must follow the formats below to write your code:
```language
# your code
```

If user's intent is question answering, you must give as short an answer as possible.

User's question is: {input_question}

Context is: {input_context}
";

pub const PROMPT_CODE: &str = "You're a retrieve augmented coding assistant. You answer \
user's questions based on your own knowledge and the context provided by the user.
If you can't answer the question with or without the current context, you should reply \
exactly `UPDATE CONTEXT`.
For code generation, you must obey the following rules:
Rule 1. You MUST NOT install any packages because all the packages needed are already installed.
Rule 2. You must follow the formats below to write your code:
```language
# your code
```

User's question is: {input_question}

Context is: {input_context}
";

pub const PROMPT_QA: &str = "You're a retrieve augmented chatbot. You answer user's \
questions based on your own knowledge and the context provided by the user.
If you can't answer the question with or without the current context, you should reply \
exactly `UPDATE CONTEXT`.
You must give as short an answer as possible.

User's question is: {input_question}

Context is: {input_context}
";

/// Which built-in template to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum PromptTask {
    #[default]
    Default,
    Code,
    Qa,
}

impl PromptTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Code => "code",
            Self::Qa => "qa",
        }
    }

    pub fn template(&self) -> &'static str {
        match self {
            Self::Default => PROMPT_DEFAULT,
            Self::Code => PROMPT_CODE,
            Self::Qa => PROMPT_QA,
        }
    }
}

impl fmt::Display for PromptTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromptTask {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "code" => Ok(Self::Code),
            "qa" => Ok(Self::Qa),
            other => Err(RagError::Configuration(format!("unsupported prompt task: {other}"))),
        }
    }
}

impl TryFrom<String> for PromptTask {
    type Error = RagError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Renders answer prompts from a question and a context.
///
/// Built once by the caller and handed to whoever needs it; a customized
/// template takes precedence over the task's built-in one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptGenerator {
    template: String,
}

impl PromptGenerator {
    /// A generator for one of the built-in tasks.
    pub fn new(task: PromptTask) -> Self {
        Self { template: task.template().to_string() }
    }

    /// A generator for a customized template.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Configuration`] if the template lacks
    /// `{input_question}` or `{input_context}`.
    pub fn custom(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        for placeholder in [QUESTION_PLACEHOLDER, CONTEXT_PLACEHOLDER] {
            if !template.contains(placeholder) {
                return Err(RagError::Configuration(format!(
                    "customized prompt is missing placeholder {placeholder}"
                )));
            }
        }
        Ok(Self { template })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Render the prompt.
    pub fn generate(&self, question: &str, context: &str) -> String {
        // Context is substituted last so placeholders inside documents stay literal.
        self.template.replace(QUESTION_PLACEHOLDER, question).replace(CONTEXT_PLACEHOLDER, context)
    }
}

impl Default for PromptGenerator {
    fn default() -> Self {
        Self::new(PromptTask::Default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_templates_carry_both_placeholders() {
        for task in [PromptTask::Default, PromptTask::Code, PromptTask::Qa] {
            let prompt = PromptGenerator::new(task).generate("Q?", "CTX");
            assert!(prompt.contains("User's question is: Q?"), "{task}");
            assert!(prompt.contains("Context is: CTX"), "{task}");
            assert!(prompt.contains(UPDATE_CONTEXT), "{task}");
        }
    }

    #[test]
    fn custom_template_is_validated() {
        assert!(PromptGenerator::custom("only {input_question}").unwrap_err().is_configuration());
        let generator = PromptGenerator::custom("{input_context} => {input_question}").unwrap();
        assert_eq!(generator.generate("why", "because"), "because => why");
    }

    #[test]
    fn tasks_deserialize_by_name() {
        let task: PromptTask = serde_json::from_str("\"qa\"").unwrap();
        assert_eq!(task, PromptTask::Qa);
        assert!(serde_json::from_str::<PromptTask>("\"poem\"").is_err());
    }
}
