//! Interactive chat command.

use crate::agent::{ChatSession, TurnFragment, TurnStatus};
use crate::cli::Output;
use crate::config::Settings;
use crate::feedback::{FeedbackDelivery, FeedbackSignal, Rating};
use crate::orchestrator::Orchestrator;
use anyhow::Result;
use console::style;
use indicatif::ProgressBar;
use std::io::{self, BufRead, Write};

/// Run the interactive chat command.
pub async fn run_chat(model: Option<String>, session_id: Option<String>, mut settings: Settings) -> Result<()> {
    if let Some(model) = model {
        settings.model.name = model;
    }

    let orchestrator = Orchestrator::new(settings).await?;
    let session = match session_id {
        Some(id) => orchestrator.session(&id).await,
        None => orchestrator.new_session().await,
    };

    println!("\n{}", style("Referat Chat").bold().cyan());
    println!(
        "{}",
        style("Type your questions, or 'exit' to quit. Use 'clear' to reset the conversation.").dim()
    );
    println!(
        "{}\n",
        style("Rate the last answer with '/feedback up|down [comment]'.").dim()
    );

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("{} ", style("You:").green().bold());
        stdout.flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.is_empty() {
            continue;
        }

        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            Output::info("Goodbye!");
            break;
        }

        if input.eq_ignore_ascii_case("clear") {
            session.clear().await;
            Output::info("Conversation history cleared.");
            continue;
        }

        if let Some(rest) = input.strip_prefix("/feedback") {
            send_feedback(&session, rest).await;
            continue;
        }

        run_turn(&session, input).await;
    }

    orchestrator.shutdown().await;
    Ok(())
}

/// Stream one turn to the terminal.
async fn run_turn(session: &ChatSession, input: &str) {
    let mut stream = session.send(input);
    let mut spinner: Option<ProgressBar> = None;

    while let Some(fragment) = stream.next_fragment().await {
        match fragment {
            TurnFragment::Progress(message) => match &spinner {
                Some(pb) => pb.set_message(message),
                None => spinner = Some(Output::spinner(&message)),
            },
            TurnFragment::Answer(text) => {
                if let Some(pb) = spinner.take() {
                    pb.finish_and_clear();
                }
                Output::answer(&text);
            }
            TurnFragment::Error(message) => {
                if let Some(pb) = spinner.take() {
                    pb.finish_and_clear();
                }
                Output::error(&message);
            }
            TurnFragment::Completed(outcome) => {
                if let Some(pb) = spinner.take() {
                    pb.finish_and_clear();
                }
                if outcome.status == TurnStatus::Cancelled {
                    Output::warning("Turn cancelled.");
                }
                break;
            }
        }
    }
}

/// Parsed `/feedback` arguments: optional turn index, rating, optional comment.
#[derive(Debug, PartialEq)]
struct FeedbackCommand {
    turn: Option<usize>,
    signal: FeedbackSignal,
}

fn parse_feedback_command(args: &str) -> Option<FeedbackCommand> {
    let words: Vec<&str> = args.split_whitespace().collect();
    // A leading number is a turn index only when a rating follows it
    let (turn, rest) = match words.as_slice() {
        [first, second, ..] if Rating::parse(second).is_some() => match first.parse::<usize>() {
            Ok(n) => (Some(n), &words[1..]),
            Err(_) => (None, &words[..]),
        },
        _ => (None, &words[..]),
    };
    let (rating, comment) = rest.split_first()?;
    let rating = Rating::parse(rating)?;
    let comment = comment.join(" ");
    Some(FeedbackCommand {
        turn,
        signal: FeedbackSignal::new(rating, Some(comment)),
    })
}

async fn send_feedback(session: &ChatSession, args: &str) {
    let Some(command) = parse_feedback_command(args) else {
        Output::warning("Usage: /feedback [turn] up|down [comment]");
        return;
    };
    let Some(turn) = command.turn.or_else(|| session.last_turn_index()) else {
        Output::warning("There is no answer to rate yet.");
        return;
    };

    match session.feedback(turn, &command.signal).await {
        Ok(FeedbackDelivery::Direct { run_id }) | Ok(FeedbackDelivery::Correlated { run_id }) => {
            Output::success(&format!("Thanks! Feedback recorded for run {}.", run_id));
        }
        Ok(FeedbackDelivery::BestEffort { .. }) => {
            Output::success("Thanks! Feedback recorded.");
        }
        Err(e) => Output::error(&format!("Could not record feedback: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_feedback_command() {
        let parsed = parse_feedback_command(" up spot on").unwrap();
        assert_eq!(parsed.turn, None);
        assert_eq!(parsed.signal.rating, Rating::Positive);
        assert_eq!(parsed.signal.comment.as_deref(), Some("spot on"));

        let parsed = parse_feedback_command("3 down").unwrap();
        assert_eq!(parsed.turn, Some(3));
        assert_eq!(parsed.signal.rating, Rating::Negative);
        assert_eq!(parsed.signal.comment, None);

        assert!(parse_feedback_command("").is_none());
        assert!(parse_feedback_command("maybe").is_none());
    }
}
