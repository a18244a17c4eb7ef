//! Command implementations for the brulary CLI
//!
//! - **resolve**: which loader a reference selects
//! - **info**: compiled formula details
//! - **cask**: cask details, installed and outdated versions
//! - **update**: refresh the API indexes

mod cask;
mod info;
mod resolve;
mod update;

pub use cask::cask;
pub use info::info;
pub use resolve::resolve;
pub use update::update;

use brulary::Api;
use clap_complete::Shell;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::cmp::Ordering;
use std::io::IsTerminal;
use std::time::Duration;

/// Minimum Jaro-Winkler similarity for a "did you mean" hint.
const SUGGESTION_THRESHOLD: f64 = 0.85;

pub fn completions(shell: Shell, command: &mut clap::Command) {
    let name = command.get_name().to_string();
    clap_complete::generate(shell, command, name, &mut std::io::stdout());
}

/// Spinner on stderr, hidden when stderr is not a terminal.
pub(crate) fn spinner(message: String) -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Up to three known names close to `name`.
pub(crate) fn suggestions(name: &str, candidates: &[String]) -> Vec<String> {
    let mut scored: Vec<(f64, &String)> = candidates
        .iter()
        .map(|candidate| (strsim::jaro_winkler(name, candidate), candidate))
        .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
    scored
        .into_iter()
        .take(3)
        .map(|(_, candidate)| candidate.clone())
        .collect()
}

/// Print `error`, with spelling hints from the formula index when nothing matched.
pub(crate) async fn report(api: &Api, reference: &str, error: &brulary::BruError) {
    eprintln!("{} {}", "Error:".red().bold(), error);
    if !error.is_unavailable() || api.config().no_install_from_api {
        return;
    }

    if let Ok(index) = api.formula_index().await {
        let hints = suggestions(reference, &index.names());
        if !hints.is_empty() {
            eprintln!("Did you mean {}?", hints.join(", ").bold());
        }
    }
}
