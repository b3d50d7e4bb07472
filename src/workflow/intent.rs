//! Instruction parsing (§4.D): keyword/intent classification and the
//! corresponding step plan templates.
//!
//! Grounded on the shape of `clawd::instructions::compiler::InstructionCompiler`
//! (a pure function from free text to a structured compiled output) and
//! `clawd::workflows::engine`'s step/trigger model, simplified from YAML
//! recipes to the spec's fixed keyword table since instruction parsing here
//! is explicitly keyword-only (§1 Non-goals).

use crate::registry::model::AgentClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    CompileNotebook,
    GenerateStudyMaterials,
    ExtractKnowledge,
    GenerateSummary,
    ProcessDocument,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CompileNotebook => "compile_notebook",
            Self::GenerateStudyMaterials => "generate_study_materials",
            Self::ExtractKnowledge => "extract_knowledge",
            Self::GenerateSummary => "generate_summary",
            Self::ProcessDocument => "process_document",
        }
    }
}

/// Classify free text by substring/keyword match, first match wins, in the
/// exact priority order of §4.D's table.
pub fn classify(text: &str) -> Intent {
    let t = text.to_lowercase();

    if t.contains("notebook") && t.contains("compile") {
        return Intent::CompileNotebook;
    }
    if t.contains("flashcard") || t.contains("quiz") || t.contains("question") || t.contains("study material") {
        return Intent::GenerateStudyMaterials;
    }
    if t.contains("extract")
        && (t.contains("concept") || t.contains("definition") || t.contains("entity") || t.contains("knowledge"))
    {
        return Intent::ExtractKnowledge;
    }
    if t.contains("summary") || t.contains("summarize") {
        return Intent::GenerateSummary;
    }
    Intent::ProcessDocument
}

/// A step in a plan template, before ids are minted for a concrete
/// workflow. `depends_on` refers to other templates' `key`.
pub struct StepTemplate {
    pub key: &'static str,
    pub agent_class: AgentClass,
    pub task_type: &'static str,
    pub depends_on: &'static [&'static str],
}

const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// Step plan for each intent (§4.D table).
pub fn plan_for(intent: Intent) -> &'static [StepTemplate] {
    match intent {
        Intent::CompileNotebook => &[StepTemplate {
            key: "synthesis",
            agent_class: AgentClass::Synthesis,
            task_type: "compile_notebook",
            depends_on: &[],
        }],
        Intent::GenerateStudyMaterials => &[
            StepTemplate {
                key: "ingestion",
                agent_class: AgentClass::Ingestion,
                task_type: "extract_text",
                depends_on: &[],
            },
            StepTemplate {
                key: "analysis",
                agent_class: AgentClass::Analysis,
                task_type: "generate_summary",
                depends_on: &["ingestion"],
            },
            StepTemplate {
                key: "extraction",
                agent_class: AgentClass::Extraction,
                task_type: "extract_concepts",
                depends_on: &["ingestion"],
            },
            StepTemplate {
                key: "pedagogy",
                agent_class: AgentClass::Pedagogy,
                task_type: "generate_study_materials",
                depends_on: &["analysis", "extraction"],
            },
        ],
        Intent::ExtractKnowledge => &[
            StepTemplate {
                key: "ingestion",
                agent_class: AgentClass::Ingestion,
                task_type: "extract_text",
                depends_on: &[],
            },
            StepTemplate {
                key: "extraction",
                agent_class: AgentClass::Extraction,
                task_type: "extract_concepts",
                depends_on: &["ingestion"],
            },
        ],
        Intent::GenerateSummary => &[
            StepTemplate {
                key: "ingestion",
                agent_class: AgentClass::Ingestion,
                task_type: "extract_text",
                depends_on: &[],
            },
            StepTemplate {
                key: "analysis",
                agent_class: AgentClass::Analysis,
                task_type: "generate_summary",
                depends_on: &["ingestion"],
            },
        ],
        Intent::ProcessDocument => &[StepTemplate {
            key: "ingestion",
            agent_class: AgentClass::Ingestion,
            task_type: "extract_text",
            depends_on: &[],
        }],
    }
}

pub fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_summary_workflow() {
        assert_eq!(classify("Generate a summary of this document"), Intent::GenerateSummary);
    }

    #[test]
    fn classifies_extraction_workflow() {
        assert_eq!(classify("Extract all concepts and definitions"), Intent::ExtractKnowledge);
    }

    #[test]
    fn classifies_study_materials_workflow() {
        assert_eq!(classify("Create flashcards and quiz questions"), Intent::GenerateStudyMaterials);
    }

    #[test]
    fn classifies_compile_notebook_before_other_keywords() {
        assert_eq!(classify("please compile this notebook"), Intent::CompileNotebook);
    }

    #[test]
    fn defaults_to_process_document() {
        assert_eq!(classify("do something with this file"), Intent::ProcessDocument);
    }

    #[test]
    fn study_materials_plan_has_pedagogy_depending_on_both() {
        let plan = plan_for(Intent::GenerateStudyMaterials);
        assert_eq!(plan.len(), 4);
        let pedagogy = plan.iter().find(|s| s.key == "pedagogy").unwrap();
        assert_eq!(pedagogy.depends_on, &["analysis", "extraction"]);
    }
}
