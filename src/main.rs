use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use owo_colors::OwoColorize;

use crate::cli::{Cli, Command};
use crate::fetch::fetch_snapshot;
use crate::rewrite::{ChartOutcome, RewriteError, apply_to_file};
use crate::snapshot::CitationSnapshot;

mod cli;
mod fetch;
mod rewrite;
mod snapshot;

// Exit statuses: 0 success, 1 fetch exhausted, 2 rewrite refused.
const EXIT_FETCH_FAILED: u8 = 1;
const EXIT_REWRITE_FAILED: u8 = 2;

fn main() -> ExitCode {
    let args = Cli::parse();
    match args.command {
        Command::Fetch { profile } => {
            eprintln!("Fetching citation metrics...");
            match fetch_snapshot(&profile.to_options()) {
                Some(snapshot) => {
                    eprintln!("{} fetched from {}", "✓".green(), snapshot.source_url);
                    print_metrics(&snapshot);
                    ExitCode::SUCCESS
                }
                None => fetch_failed(),
            }
        }
        Command::Update {
            target,
            profile,
            safety_threshold,
        } => {
            // Fail before any network traffic when the target is missing.
            if !target.is_file() {
                eprintln!("{} target file {} not found", "✗".red(), target.display());
                return ExitCode::from(EXIT_REWRITE_FAILED);
            }
            eprintln!("Fetching citation metrics...");
            let Some(snapshot) = fetch_snapshot(&profile.to_options()) else {
                return fetch_failed();
            };
            eprintln!("{} fetched from {}", "✓".green(), snapshot.source_url);

            match apply_to_file(&target, &snapshot, safety_threshold) {
                Ok(applied) => {
                    eprintln!(
                        "{} backup written to {}",
                        "✓".green(),
                        applied.backup_path.display()
                    );
                    eprintln!(
                        "{} {} updated: {} summary occurrence(s), chart {}",
                        "✓".green(),
                        target.display(),
                        applied.rewrite.summaries_replaced,
                        chart_note(applied.rewrite.chart)
                    );
                    print_metrics(&snapshot);
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    report_update_error(&err, &target);
                    ExitCode::from(EXIT_REWRITE_FAILED)
                }
            }
        }
    }
}

fn print_metrics(snapshot: &CitationSnapshot) {
    println!("citations: {}", snapshot.citations);
    println!("h-index: {}", snapshot.h_index);
    println!("i10-index: {}", snapshot.i10_index);
    println!("chart: {} chars", snapshot.chart.chars().count());
}

fn chart_note(outcome: ChartOutcome) -> &'static str {
    match outcome {
        ChartOutcome::Spliced => "replaced",
        ChartOutcome::SplicedLoose => "replaced (loose boundary)",
        ChartOutcome::NoFragment => "left alone (no fragment fetched)",
        ChartOutcome::NotFound => "container not found, left alone",
    }
}

fn report_update_error(err: &anyhow::Error, target: &Path) {
    match err.downcast_ref::<RewriteError>() {
        Some(RewriteError::SafetyAbort {
            delta_pct,
            threshold_pct,
            ..
        }) => {
            eprintln!(
                "{} refusing to write {}: size change {delta_pct:.2}% is at or above the {threshold_pct:.2}% guard",
                "✗".red(),
                target.display()
            );
            eprintln!(
                "  the page shape likely changed; inspect the fetched data, or raise --safety-threshold if the change is intended"
            );
        }
        Some(RewriteError::MarkersNotFound) => {
            eprintln!(
                "{} {} has neither the citation summary nor the chart container; nothing to update",
                "✗".red(),
                target.display()
            );
        }
        None => eprintln!("{} {err:#}", "✗".red()),
    }
}

fn fetch_failed() -> ExitCode {
    eprintln!("{} no mirror returned a usable profile page", "✗".red());
    eprintln!("  try again in a few minutes (rate limits are common),");
    eprintln!("  check the connection, and make sure the profile is public");
    ExitCode::from(EXIT_FETCH_FAILED)
}
