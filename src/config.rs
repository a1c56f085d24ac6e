use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use directories::ProjectDirs;
use clap::Parser;
use std::fs;
use tracing::{info, warn};

/// Configuration for the AnkiRAG server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// URL for the database connection
    pub database_url: String,
    /// Address the HTTP server binds to
    pub bind_addr: String,
    /// Secret used to sign access and refresh tokens
    pub jwt_secret: String,
    /// Lifetime of access tokens in minutes
    pub access_token_minutes: i64,
    /// Lifetime of refresh tokens in days
    pub refresh_token_days: i64,
    /// Base URL of the LLM service
    pub llm_base_url: String,
    /// Timeout for a single LLM task, including polling
    pub llm_timeout_seconds: u64,
    /// Model used when a request does not name one
    pub llm_default_model: String,
    /// Default sampling temperature
    pub llm_temperature: f64,
    /// Default completion budget
    pub llm_max_tokens: u32,
    /// Model used for fact checking
    pub fact_check_model: String,
    /// Embedding model name
    pub embedding_model: String,
    /// Embedding vector dimension
    pub embedding_dimension: usize,
    /// Number of texts sent per embedding request
    pub embedding_batch_size: usize,
    /// URL of the AnkiConnect endpoint reachable from the server
    pub anki_connect_url: String,
    /// Maximum number of background tasks running at once
    pub worker_max_concurrent: usize,
    /// Per-task timeout in seconds
    pub worker_task_timeout_seconds: u64,
    /// Number of retries after the first failed attempt
    pub worker_retry_attempts: usize,
    /// Base delay between retries in seconds
    pub worker_retry_delay_seconds: u64,
    /// Generation requests allowed per window
    pub generation_rate_limit: usize,
    /// Generation rate-limit window in seconds
    pub generation_rate_window_seconds: u64,
    /// Chat messages allowed per window
    pub chat_rate_limit: usize,
    /// Chat rate-limit window in seconds
    pub chat_rate_window_seconds: u64,
    /// Comma separated list of allowed CORS origins
    pub cors_origins: String,
    /// Directory for JSON log files; stdout only when unset
    pub log_dir: Option<String>,
}

/// Update structure for Config with all fields optional
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub bind_addr: Option<String>,
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default)]
    pub access_token_minutes: Option<i64>,
    #[serde(default)]
    pub refresh_token_days: Option<i64>,
    #[serde(default)]
    pub llm_base_url: Option<String>,
    #[serde(default)]
    pub llm_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub llm_default_model: Option<String>,
    #[serde(default)]
    pub llm_temperature: Option<f64>,
    #[serde(default)]
    pub llm_max_tokens: Option<u32>,
    #[serde(default)]
    pub fact_check_model: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub embedding_dimension: Option<usize>,
    #[serde(default)]
    pub embedding_batch_size: Option<usize>,
    #[serde(default)]
    pub anki_connect_url: Option<String>,
    #[serde(default)]
    pub worker_max_concurrent: Option<usize>,
    #[serde(default)]
    pub worker_task_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub worker_retry_attempts: Option<usize>,
    #[serde(default)]
    pub worker_retry_delay_seconds: Option<u64>,
    #[serde(default)]
    pub generation_rate_limit: Option<usize>,
    #[serde(default)]
    pub generation_rate_window_seconds: Option<u64>,
    #[serde(default)]
    pub chat_rate_limit: Option<usize>,
    #[serde(default)]
    pub chat_rate_window_seconds: Option<u64>,
    #[serde(default)]
    pub cors_origins: Option<String>,
    #[serde(default)]
    pub log_dir: Option<String>,
}

/// Command line arguments for the server
#[derive(Parser, Debug, Default)]
#[clap(name = "ankirag", about = "AnkiRAG flashcard generation server")]
pub struct CliArgs {
    /// Database URL
    #[clap(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Address to listen on, e.g. 127.0.0.1:8080
    #[clap(long, env = "ANKIRAG_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Token signing secret
    #[clap(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Access token lifetime in minutes
    #[clap(long, env = "JWT_ACCESS_TOKEN_EXPIRE_MINUTES")]
    pub access_token_minutes: Option<i64>,

    /// Refresh token lifetime in days
    #[clap(long, env = "JWT_REFRESH_TOKEN_EXPIRE_DAYS")]
    pub refresh_token_days: Option<i64>,

    /// LLM service base URL
    #[clap(long, env = "SOP_LLM_BASE_URL")]
    pub llm_base_url: Option<String>,

    /// LLM task timeout in seconds
    #[clap(long, env = "SOP_LLM_TIMEOUT")]
    pub llm_timeout_seconds: Option<u64>,

    /// Default LLM model
    #[clap(long, env = "SOP_LLM_DEFAULT_MODEL")]
    pub llm_default_model: Option<String>,

    /// Embedding model name
    #[clap(long, env = "EMBEDDING_MODEL")]
    pub embedding_model: Option<String>,

    /// AnkiConnect URL
    #[clap(long, env = "ANKI_CONNECT_URL")]
    pub anki_connect_url: Option<String>,

    /// Maximum concurrent background tasks
    #[clap(long, env = "WORKER_MAX_CONCURRENT_TASKS")]
    pub worker_max_concurrent: Option<usize>,

    /// Allowed CORS origins (comma separated)
    #[clap(long, env = "CORS_ORIGINS")]
    pub cors_origins: Option<String>,

    /// Directory for JSON log files
    #[clap(long, env = "ANKIRAG_LOG_DIR")]
    pub log_dir: Option<String>,

    /// Debug mode
    #[clap(long, env = "ANKIRAG_DEBUG", default_value_t = false)]
    pub debug: bool,
}

impl Config {
    /// Applies a config update to the current configuration
    pub fn apply_update(self, update: ConfigUpdate) -> Self {
        Self {
            database_url: update.database_url.unwrap_or(self.database_url),
            bind_addr: update.bind_addr.unwrap_or(self.bind_addr),
            jwt_secret: update.jwt_secret.unwrap_or(self.jwt_secret),
            access_token_minutes: update.access_token_minutes.unwrap_or(self.access_token_minutes),
            refresh_token_days: update.refresh_token_days.unwrap_or(self.refresh_token_days),
            llm_base_url: update.llm_base_url.unwrap_or(self.llm_base_url),
            llm_timeout_seconds: update.llm_timeout_seconds.unwrap_or(self.llm_timeout_seconds),
            llm_default_model: update.llm_default_model.unwrap_or(self.llm_default_model),
            llm_temperature: update.llm_temperature.unwrap_or(self.llm_temperature),
            llm_max_tokens: update.llm_max_tokens.unwrap_or(self.llm_max_tokens),
            fact_check_model: update.fact_check_model.unwrap_or(self.fact_check_model),
            embedding_model: update.embedding_model.unwrap_or(self.embedding_model),
            embedding_dimension: update.embedding_dimension.unwrap_or(self.embedding_dimension),
            embedding_batch_size: update.embedding_batch_size.unwrap_or(self.embedding_batch_size),
            anki_connect_url: update.anki_connect_url.unwrap_or(self.anki_connect_url),
            worker_max_concurrent: update.worker_max_concurrent.unwrap_or(self.worker_max_concurrent),
            worker_task_timeout_seconds: update
                .worker_task_timeout_seconds
                .unwrap_or(self.worker_task_timeout_seconds),
            worker_retry_attempts: update.worker_retry_attempts.unwrap_or(self.worker_retry_attempts),
            worker_retry_delay_seconds: update
                .worker_retry_delay_seconds
                .unwrap_or(self.worker_retry_delay_seconds),
            generation_rate_limit: update.generation_rate_limit.unwrap_or(self.generation_rate_limit),
            generation_rate_window_seconds: update
                .generation_rate_window_seconds
                .unwrap_or(self.generation_rate_window_seconds),
            chat_rate_limit: update.chat_rate_limit.unwrap_or(self.chat_rate_limit),
            chat_rate_window_seconds: update
                .chat_rate_window_seconds
                .unwrap_or(self.chat_rate_window_seconds),
            cors_origins: update.cors_origins.unwrap_or(self.cors_origins),
            log_dir: update.log_dir.or(self.log_dir),
        }
    }

    /// Returns the access token lifetime as a chrono Duration
    pub fn access_token_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.access_token_minutes)
    }

    /// Returns the refresh token lifetime as a chrono Duration
    pub fn refresh_token_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.refresh_token_days)
    }

    /// Returns the background task timeout as a Duration
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_task_timeout_seconds)
    }

    /// Returns the base retry delay for background tasks
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.worker_retry_delay_seconds)
    }

    /// Splits the configured CORS origins into trimmed, non-empty entries
    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect()
    }
}

/// Returns the base (default) configuration
pub fn base_config(config_path: Option<PathBuf>) -> Config {
    let database_url = config_path.map_or("ankirag.db".to_string(), |path| {
        path.join("ankirag.db").to_string_lossy().to_string()
    });

    Config {
        database_url,
        bind_addr: "127.0.0.1:8080".to_string(),
        jwt_secret: "change-me-in-production".to_string(),
        access_token_minutes: 30,
        refresh_token_days: 7,
        llm_base_url: "http://localhost:8001".to_string(),
        llm_timeout_seconds: 120,
        llm_default_model: "gpt-4o".to_string(),
        llm_temperature: 0.7,
        llm_max_tokens: 4096,
        fact_check_model: "llama-3.1-sonar-large-128k-online".to_string(),
        embedding_model: "multilingual-e5-large".to_string(),
        embedding_dimension: 1024,
        embedding_batch_size: 100,
        anki_connect_url: "http://localhost:8765".to_string(),
        worker_max_concurrent: 10,
        worker_task_timeout_seconds: 600,
        worker_retry_attempts: 3,
        worker_retry_delay_seconds: 60,
        generation_rate_limit: 10,
        generation_rate_window_seconds: 3600,
        chat_rate_limit: 60,
        chat_rate_window_seconds: 3600,
        cors_origins: "http://localhost:3000,http://localhost:5173".to_string(),
        log_dir: None,
    }
}

/// Loads configuration from a TOML file
pub fn config_from_file(config_path: Option<PathBuf>) -> Result<ConfigUpdate, String> {
    let Some(config_path) = config_path else {
        return Ok(ConfigUpdate::default());
    };

    if !config_path.exists() {
        info!("Config file not found at {:?}, using defaults", config_path);
        return Ok(ConfigUpdate::default());
    }

    match fs::read_to_string(&config_path) {
        Ok(content) => match toml::from_str::<ConfigUpdate>(&content) {
            Ok(config) => {
                info!("Loaded configuration from {:?}", config_path);
                Ok(config)
            },
            Err(e) => {
                warn!("Failed to parse config file: {}", e);
                Err(format!("Failed to parse config file: {}", e))
            }
        },
        Err(e) => {
            warn!("Failed to read config file: {}", e);
            Err(format!("Failed to read config file: {}", e))
        }
    }
}

/// Loads configuration from command line arguments
pub fn config_from_args(args: CliArgs) -> ConfigUpdate {
    ConfigUpdate {
        database_url: args.database_url,
        bind_addr: args.bind_addr,
        jwt_secret: args.jwt_secret,
        access_token_minutes: args.access_token_minutes,
        refresh_token_days: args.refresh_token_days,
        llm_base_url: args.llm_base_url,
        llm_timeout_seconds: args.llm_timeout_seconds,
        llm_default_model: args.llm_default_model,
        embedding_model: args.embedding_model,
        anki_connect_url: args.anki_connect_url,
        worker_max_concurrent: args.worker_max_concurrent,
        cors_origins: args.cors_origins,
        log_dir: args.log_dir,
        ..ConfigUpdate::default()
    }
}

/// Returns the platform configuration directory, if one can be determined
pub fn get_config_dir_path() -> Option<PathBuf> {
    match ProjectDirs::from("com", "ankirag", "ankirag") {
        Some(proj_dirs) => Some(proj_dirs.config_dir().to_path_buf()),
        None => {
            warn!("Could not determine XDG config directory, skipping config file");
            None
        }
    }
}

/// Gets the complete configuration by combining defaults with
/// values from config file, environment variables, and command line arguments
/// in order of increasing precedence
pub fn get_config(args: CliArgs) -> Config {
    let config_path = get_config_dir_path().and_then(|path| {
        if !path.exists() {
            info!("Config path not found at {:?}, using defaults", path);
            None
        } else {
            Some(path)
        }
    });

    let base = base_config(config_path.clone());
    let config_file = config_path.map(|path| path.join("config.toml"));

    let config = base
        .apply_update(config_from_file(config_file).unwrap_or_default())
        .apply_update(config_from_args(args));

    info!(
        "Final configuration: database_url={}, bind_addr={}, llm_base_url={}, workers={}",
        config.database_url, config.bind_addr, config.llm_base_url, config.worker_max_concurrent
    );

    if config.jwt_secret == "change-me-in-production" {
        warn!("JWT secret is the built-in default; set JWT_SECRET outside development");
    }

    config
}
