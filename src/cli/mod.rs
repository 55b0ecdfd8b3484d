//! CLI module for Referat.

pub mod commands;
mod output;

pub use output::Output;

use clap::{Parser, Subcommand};

/// Referat - a conversational assistant for your meetings
///
/// Turns meeting recordings into a searchable knowledge base and answers
/// questions about them, calling local and remote tools as needed.
#[derive(Parser, Debug)]
#[command(name = "referat")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "REFERAT_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start an interactive chat session
    Chat {
        /// Reasoning model to use
        #[arg(short, long)]
        model: Option<String>,

        /// Session id (a random one is used if omitted)
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Ask a single question and print the answer
    Ask {
        /// The question to ask
        question: String,

        /// Reasoning model to use
        #[arg(short, long)]
        model: Option<String>,
    },

    /// List the tools available to the assistant
    Tools,

    /// Start the HTTP API server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Check the configuration for errors
    Validate,

    /// Open configuration file in editor
    Edit,

    /// Show configuration file path
    Path,
}
