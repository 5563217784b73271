//! Prompts command handler.

use clap::Args;
use kgqa_core::{config::AppConfig, AppResult};
use kgqa_prompt::{PromptLibrary, PromptSource};

/// Prompt library listing
#[derive(Args, Debug)]
pub struct PromptsCommand {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl PromptsCommand {
    pub fn execute(&self, config: &AppConfig) -> AppResult<()> {
        let library = PromptLibrary::for_workspace(&config.workspace)?;

        let rows: Vec<(String, &str, String, Vec<String>)> = library
            .entries()
            .map(|(definition, source)| {
                let source = match source {
                    PromptSource::Builtin => "builtin",
                    PromptSource::Workspace => "workspace",
                };
                (
                    definition.id.clone(),
                    source,
                    definition.title.clone(),
                    definition.input.required.clone(),
                )
            })
            .collect();

        if self.json {
            let output: Vec<serde_json::Value> = rows
                .iter()
                .map(|(id, source, title, required)| {
                    serde_json::json!({
                        "id": id,
                        "source": source,
                        "title": title,
                        "required": required,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            for (id, source, title, required) in &rows {
                println!("{:<18} {:<10} {} [{}]", id, source, title, required.join(", "));
            }
        }

        Ok(())
    }
}
