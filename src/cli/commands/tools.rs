//! Tools command: show the registry.

use crate::cli::Output;
use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use anyhow::Result;

/// Connect everything and list the registered tools.
pub async fn run_tools(settings: Settings) -> Result<()> {
    let orchestrator = Orchestrator::new(settings).await?;

    Output::header(&format!("Tools ({})", orchestrator.registry().len()));
    for tool in orchestrator.registry().list_all() {
        Output::tool(&tool.name, &tool.mode().to_string(), &tool.description);
    }

    let servers = orchestrator.remote_servers();
    if !servers.is_empty() {
        Output::header("Remote servers");
        for server in servers {
            Output::kv("connected", server);
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
