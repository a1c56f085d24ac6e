mod client;
mod import;
mod output;
mod settings;
mod sync;

use std::path::Path;
use std::process;

use ankirag::anki::AnkiClient;
use clap::{Parser, Subcommand};
use client::{ApiClient, ClientError};
use output::{AgentStatus, OutputConfig, OutputFormat};
use settings::AgentSettings;
use tracing_subscriber::EnvFilter;

/// Local agent that moves cards between the AnkiRAG backend and Anki desktop
#[derive(Parser, Debug)]
#[clap(name = "ankirag-agent", about = "Sync AnkiRAG cards with the local Anki collection")]
struct Cli {
    /// Backend URL, overriding the saved setting
    #[clap(long, env = "ANKIRAG_API_BASE_URL", global = true)]
    api_url: Option<String>,

    /// AnkiConnect URL, overriding the saved setting
    #[clap(long, env = "ANKI_CONNECT_URL", global = true)]
    anki_url: Option<String>,

    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Human, global = true)]
    format: OutputFormat,

    /// Quiet mode: minimal output (just IDs or counts)
    #[clap(short, long, global = true)]
    quiet: bool,

    /// Log progress to stderr
    #[clap(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in and store the access token
    Login {
        #[clap(long)]
        email: String,
        #[clap(long, env = "ANKIRAG_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Forget the stored token and revoke it on the server
    Logout,
    /// Show backend and Anki connection state
    Status,
    /// Push approved cards into Anki
    Sync {
        /// Ask Anki to sync with AnkiWeb afterwards
        #[clap(long)]
        anki_web: bool,
    },
    /// Import the notes of an Anki deck into the backend
    Import {
        /// Name of the Anki deck to read
        deck: String,
        /// Backend deck to import into; defaults to the Anki deck's name
        #[clap(long)]
        into: Option<String>,
        /// Store imported cards as already synced
        #[clap(long)]
        mark_as_synced: bool,
    },
    /// List decks on the backend
    Decks,
    /// Show recent sync runs
    History {
        #[clap(long, default_value_t = 10)]
        limit: i64,
    },
    /// Show or change local settings
    #[command(subcommand)]
    Settings(SettingsCommands),
}

#[derive(Subcommand, Debug)]
enum SettingsCommands {
    /// Print the current settings
    Show,
    /// Change one setting
    Set { key: String, value: String },
}

/// Formats an error for human-readable stderr output
fn format_error(err: &anyhow::Error) -> String {
    let err_string = format!("{:#}", err);
    if let Some(ClientError::Request(_)) = err.downcast_ref::<ClientError>() {
        return format!("Could not connect to the backend. Is it running?\n  {}", err_string);
    }
    err_string
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli, dir: &Path) -> anyhow::Result<()> {
    let mut settings = AgentSettings::load(dir)?;
    if let Some(url) = cli.api_url {
        settings.api_base_url = url;
    }
    if let Some(url) = cli.anki_url {
        settings.anki_connect_url = url;
    }
    let out = OutputConfig {
        format: cli.format,
        quiet: cli.quiet,
    };

    let tokens = settings::load_tokens(dir)?;
    let api = ApiClient::new(&settings.api_base_url, tokens.as_ref().map(|t| t.access_token.clone()));
    let anki = AnkiClient::new(&settings.anki_connect_url)?;

    match cli.command {
        Commands::Login { email, password } => {
            let tokens = api.login(&email, &password).await?;
            settings::save_tokens(dir, &tokens)?;
            output::print_success(&format!("Logged in as {}", email), &out);
        }
        Commands::Logout => {
            if let Some(tokens) = &tokens {
                // The local token goes away even if the server is unreachable
                if let Err(e) = api.logout(&tokens.refresh_token).await {
                    tracing::warn!("Could not revoke token on the server: {}", e);
                }
            }
            let message = if settings::clear_tokens(dir)? { "Logged out" } else { "Not logged in" };
            output::print_success(message, &out);
        }
        Commands::Status => {
            let anki_version = anki.version().await.ok();
            let anki_cards = match anki_version {
                Some(_) => anki.find_cards(&format!("tag:{}", sync::ANKIRAG_TAG)).await.ok().map(|c| c.len()),
                None => None,
            };
            let logged_in_as = match tokens {
                Some(_) => api.me().await.ok().map(|user| user.get_email()),
                None => None,
            };
            let server = match logged_in_as {
                Some(_) => api.sync_status().await.ok(),
                None => None,
            };
            let status = AgentStatus {
                api_base_url: settings.api_base_url.clone(),
                anki_connect_url: settings.anki_connect_url.clone(),
                logged_in_as,
                anki_version,
                anki_cards,
                server,
            };
            output::print_status(&status, &out);
        }
        Commands::Sync { anki_web } => {
            let summary = sync::SyncEngine::new(&api, &anki, &settings).run().await?;
            if anki_web {
                if let Err(e) = anki.sync().await {
                    tracing::warn!("Could not trigger AnkiWeb sync: {}", e);
                }
            }
            output::print_sync_summary(&summary, &out);
        }
        Commands::Import { deck, into, mark_as_synced } => {
            let target = into.unwrap_or_else(|| deck.clone());
            let summary = import::import_deck(
                &api,
                &anki,
                &deck,
                &target,
                settings.import_batch_size,
                mark_as_synced,
            )
            .await?;
            output::print_import_summary(&summary, &out);
        }
        Commands::Decks => {
            let page = api.list_decks().await?;
            output::print_decks(&page.items, &out);
        }
        Commands::History { limit } => {
            let runs = api.sync_history(limit).await?;
            output::print_history(&runs, &out);
        }
        Commands::Settings(SettingsCommands::Show) => {
            output::print_settings(&settings, &out);
        }
        Commands::Settings(SettingsCommands::Set { key, value }) => {
            // Reload so command-line overrides are not persisted
            let mut stored = AgentSettings::load(dir)?;
            stored.set(&key, &value)?;
            stored.save(dir)?;
            output::print_success(&format!("Set {} = {}", key, value), &out);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match settings::agent_dir() {
        Ok(dir) => run(cli, &dir).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", format_error(&e));
        process::exit(1);
    }
}
