//! One-shot question command.

use crate::agent::TurnStatus;
use crate::cli::Output;
use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use anyhow::Result;

/// Ask a single question in a fresh session and print the answer.
pub async fn run_ask(question: &str, model: Option<String>, mut settings: Settings) -> Result<()> {
    if let Some(model) = model {
        settings.model.name = model;
    }

    let orchestrator = Orchestrator::new(settings).await?;
    let session = orchestrator.new_session().await;

    let spinner = Output::spinner("Thinking...");
    let outcome = session.ask(question).await;
    spinner.finish_and_clear();
    orchestrator.shutdown().await;

    match outcome {
        Some(outcome) if outcome.status == TurnStatus::Failed => {
            anyhow::bail!(outcome.answer)
        }
        Some(outcome) => {
            println!("{}", outcome.answer);
            Ok(())
        }
        None => anyhow::bail!("The turn ended without an answer"),
    }
}
