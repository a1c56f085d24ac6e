use ankirag::models::{Deck, SyncRun};
use ankirag::services::sync::SyncOverview;
use clap::ValueEnum;
use serde::Serialize;

use crate::import::ImportSummary;
use crate::settings::AgentSettings;
use crate::sync::SyncSummary;

/// Output format for agent commands
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

/// Bundled output configuration passed to all print functions
#[derive(Debug, Clone, Copy)]
pub struct OutputConfig {
    pub format: OutputFormat,
    /// When true, print minimal output (just IDs or counts)
    pub quiet: bool,
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Could not encode output: {}", e),
    }
}

/// Prints a success message; JSON mode wraps it in `{"message": ...}`
pub fn print_success(message: &str, config: &OutputConfig) {
    match config.format {
        OutputFormat::Human => {
            if !config.quiet {
                println!("{}", message);
            }
        }
        OutputFormat::Json => print_json(&serde_json::json!({ "message": message })),
    }
}

pub fn print_sync_summary(summary: &SyncSummary, config: &OutputConfig) {
    match config.format {
        OutputFormat::Human => {
            if config.quiet {
                println!("{}", summary.cards_synced);
                return;
            }
            println!(
                "Sync complete: {} synced, {} failed, {} skipped",
                summary.cards_synced, summary.cards_failed, summary.cards_skipped
            );
            for error in &summary.errors {
                println!("  - {}", error);
            }
        }
        OutputFormat::Json => print_json(summary),
    }
}

pub fn print_import_summary(summary: &ImportSummary, config: &OutputConfig) {
    match config.format {
        OutputFormat::Human => {
            if config.quiet {
                println!("{}", summary.imported_cards);
                return;
            }
            println!(
                "Imported {} of {} notes into '{}' ({} skipped, {} failed)",
                summary.imported_cards,
                summary.notes_found,
                summary.deck_name,
                summary.skipped_cards,
                summary.failed_cards
            );
            for error in &summary.errors {
                println!("  - {}", error);
            }
        }
        OutputFormat::Json => print_json(summary),
    }
}

/// Connection state shown by `status`
#[derive(Debug, Serialize)]
pub struct AgentStatus {
    pub api_base_url: String,
    pub anki_connect_url: String,
    pub logged_in_as: Option<String>,
    pub anki_version: Option<u32>,
    /// Notes tagged by the agent in the local collection
    pub anki_cards: Option<usize>,
    pub server: Option<SyncOverview>,
}

pub fn print_status(status: &AgentStatus, config: &OutputConfig) {
    match config.format {
        OutputFormat::Human => {
            let user = status.logged_in_as.as_deref().unwrap_or("not logged in");
            if config.quiet {
                println!("{}", user);
                return;
            }
            println!("Backend:  {} ({})", status.api_base_url, user);
            match status.anki_version {
                Some(version) => println!("Anki:     {} (AnkiConnect v{})", status.anki_connect_url, version),
                None => println!("Anki:     {} (unreachable)", status.anki_connect_url),
            }
            if let Some(count) = status.anki_cards {
                println!("Local:    {} AnkiRAG cards", count);
            }
            if let Some(server) = &status.server {
                println!(
                    "Server:   {} total, {} synced, {} pending, {} failed",
                    server.total_cards, server.synced_cards, server.pending_cards, server.failed_cards
                );
                if let Some(last) = server.last_sync {
                    println!("Last sync: {}", last.format("%Y-%m-%d %H:%M"));
                }
            }
        }
        OutputFormat::Json => print_json(status),
    }
}

pub fn print_decks(decks: &[Deck], config: &OutputConfig) {
    match config.format {
        OutputFormat::Human => {
            if decks.is_empty() {
                if !config.quiet {
                    println!("No decks found.");
                }
                return;
            }
            if config.quiet {
                for deck in decks {
                    println!("{}", deck.get_id());
                }
                return;
            }
            let max_id = decks.iter().map(|d| d.get_id().len()).max().unwrap_or(2);
            println!("{:<width$}  NAME", "ID", width = max_id);
            for deck in decks {
                println!("{:<width$}  {}", deck.get_id(), deck.get_name(), width = max_id);
            }
        }
        OutputFormat::Json => print_json(decks),
    }
}

pub fn print_history(runs: &[SyncRun], config: &OutputConfig) {
    match config.format {
        OutputFormat::Human => {
            if runs.is_empty() {
                if !config.quiet {
                    println!("No sync runs yet.");
                }
                return;
            }
            if config.quiet {
                for run in runs {
                    println!("{}", run.id);
                }
                return;
            }
            println!("{:<16}  {:<6}  {:<11}  SYNCED/FAILED/SKIPPED", "STARTED", "SOURCE", "STATE");
            for run in runs {
                println!(
                    "{:<16}  {:<6}  {:<11}  {}/{}/{}",
                    run.created_at.format("%Y-%m-%d %H:%M"),
                    run.source.as_str(),
                    run.state.as_str(),
                    run.synced_cards,
                    run.failed_cards,
                    run.skipped_cards
                );
            }
        }
        OutputFormat::Json => print_json(runs),
    }
}

pub fn print_settings(settings: &AgentSettings, config: &OutputConfig) {
    match config.format {
        OutputFormat::Human => {
            println!("anki_connect_url  = {}", settings.anki_connect_url);
            println!("api_base_url      = {}", settings.api_base_url);
            println!("default_deck      = {}", settings.default_deck);
            println!("default_model     = {}", settings.default_model);
            println!("import_batch_size = {}", settings.import_batch_size);
            println!("api_batch_size    = {}", settings.api_batch_size);
        }
        OutputFormat::Json => print_json(settings),
    }
}
