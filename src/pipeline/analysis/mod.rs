pub mod analyzer;
pub mod llm;
pub mod ollama;
pub mod openai;
pub mod parser;
pub mod prompt;
pub mod sanitize;
pub mod sections;

pub use analyzer::*;
pub use llm::*;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;
pub use parser::ParseOutcome;
pub use sections::*;

use thiserror::Error;

/// Which LLM pass failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisStage {
    Extraction,
    Synthesis,
}

impl AnalysisStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "stage-1",
            Self::Synthesis => "stage-2",
        }
    }
}

impl std::fmt::Display for AnalysisStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("{stage}: LLM call failed after {attempts} attempt(s): {source}")]
    Llm {
        stage: AnalysisStage,
        attempts: u32,
        #[source]
        source: LlmError,
    },

    #[error("{stage}: LLM output unusable after {attempts} attempt(s): {reason}")]
    Unparsable {
        stage: AnalysisStage,
        attempts: u32,
        reason: String,
    },
}

impl AnalysisError {
    pub fn stage(&self) -> AnalysisStage {
        match self {
            Self::Llm { stage, .. } | Self::Unparsable { stage, .. } => *stage,
        }
    }
}
