//! Built-in prompt library with workspace overrides.
//!
//! The four prompts the engine needs ship inside the binary. A workspace may
//! replace any of them (or add new ones) with `.kgqa/prompts/<id>.yml`.

use crate::builder::build_prompt;
use crate::loader::{list_prompts, load_prompt, parse_prompt};
use crate::types::{BuiltPrompt, PromptDefinition};
use kgqa_core::{AppError, AppResult};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;

pub const ANALYZER_EXTRACT: &str = "analyzer.extract";
pub const ANSWER_BASELINE: &str = "answer.baseline";
pub const ANSWER_GROUNDED: &str = "answer.grounded";
pub const ANSWER_JUDGE: &str = "answer.judge";

const BUILTIN: &[(&str, &str)] = &[
    (
        ANALYZER_EXTRACT,
        include_str!("../prompts/analyzer.extract.yml"),
    ),
    (ANSWER_BASELINE, include_str!("../prompts/answer.baseline.yml")),
    (ANSWER_GROUNDED, include_str!("../prompts/answer.grounded.yml")),
    (ANSWER_JUDGE, include_str!("../prompts/answer.judge.yml")),
];

/// Where a library entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptSource {
    Builtin,
    Workspace,
}

/// Prompt definitions keyed by id.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    prompts: BTreeMap<String, (PromptDefinition, PromptSource)>,
}

impl PromptLibrary {
    /// The compiled-in prompts only.
    pub fn builtin() -> AppResult<Self> {
        let mut prompts = BTreeMap::new();
        for (id, contents) in BUILTIN {
            let definition = parse_prompt(contents, &format!("builtin:{}", id))?;
            prompts.insert(definition.id.clone(), (definition, PromptSource::Builtin));
        }
        Ok(Self { prompts })
    }

    /// Built-in prompts overlaid with the workspace's `.kgqa/prompts/`.
    pub fn for_workspace(workspace: &Path) -> AppResult<Self> {
        let mut library = Self::builtin()?;

        for id in list_prompts(workspace)? {
            let definition = load_prompt(workspace, &id)?;
            if definition.id != id {
                tracing::warn!(
                    "Prompt file {}.yml declares id {}; using the declared id",
                    id,
                    definition.id
                );
            }
            tracing::debug!("Workspace prompt override: {}", definition.id);
            library
                .prompts
                .insert(definition.id.clone(), (definition, PromptSource::Workspace));
        }

        Ok(library)
    }

    pub fn get(&self, id: &str) -> AppResult<&PromptDefinition> {
        self.prompts
            .get(id)
            .map(|(definition, _)| definition)
            .ok_or_else(|| AppError::Prompt(format!("Unknown prompt: {}", id)))
    }

    /// Render prompt `id` with `variables`.
    pub fn build(&self, id: &str, variables: HashMap<String, String>) -> AppResult<BuiltPrompt> {
        build_prompt(self.get(id)?, variables)
    }

    /// Every prompt with its source, ordered by id.
    pub fn entries(&self) -> impl Iterator<Item = (&PromptDefinition, PromptSource)> {
        self.prompts.values().map(|(definition, source)| (definition, *source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_prompts_parse() {
        let library = PromptLibrary::builtin().unwrap();
        for id in [ANALYZER_EXTRACT, ANSWER_BASELINE, ANSWER_GROUNDED, ANSWER_JUDGE] {
            assert!(library.get(id).is_ok(), "missing builtin prompt {}", id);
        }
        assert_eq!(library.entries().count(), 4);
    }

    #[test]
    fn test_builtin_analyzer_renders() {
        let library = PromptLibrary::builtin().unwrap();
        let mut vars = HashMap::new();
        vars.insert("query".to_string(), "10 smoke detectors".to_string());
        vars.insert("schema".to_string(), "Node Types: Detector".to_string());

        let built = library.build(ANALYZER_EXTRACT, vars).unwrap();
        assert!(built.user.contains("10 smoke detectors"));
        assert!(built.user.contains("No previous context."));
        assert!(built.system.is_some());
        assert_eq!(built.metadata.output_format, "json");
    }

    #[test]
    fn test_workspace_override_wins() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".kgqa/prompts");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("answer.baseline.yml"),
            r#"
id: answer.baseline
title: Custom baseline
apiVersion: "1.1"
behavior:
  role: expert
  style: terse
input:
  required: [query]
template: "Q: {{query}}"
output:
  format: text
"#,
        )
        .unwrap();

        let library = PromptLibrary::for_workspace(temp.path()).unwrap();
        assert_eq!(library.get(ANSWER_BASELINE).unwrap().title, "Custom baseline");

        let sources: Vec<_> = library
            .entries()
            .filter(|(_, source)| *source == PromptSource::Workspace)
            .collect();
        assert_eq!(sources.len(), 1);
    }

    #[test]
    fn test_unknown_prompt() {
        let library = PromptLibrary::builtin().unwrap();
        assert!(library.get("nope").is_err());
    }
}
