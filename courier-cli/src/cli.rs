use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use courier_client::Method;

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Call envelope-style JSON APIs with automatic token refresh")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// API base address, overrides the configuration file
    #[arg(long, global = true, env = "COURIER_BASE_URL")]
    pub base_url: Option<String>,

    /// Per-request timeout in milliseconds
    #[arg(long, global = true, env = "COURIER_TIMEOUT_MS")]
    pub timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Access token, overrides the stored session
    #[arg(long, global = true, env = "COURIER_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Refresh token used when the access token expires
    #[arg(long, global = true, env = "COURIER_REFRESH_TOKEN", hide_env_values = true)]
    pub refresh_token: Option<String>,

    /// Token type prefix of the Authorization header
    #[arg(long, global = true, env = "COURIER_TOKEN_TYPE", default_value = "bearer")]
    pub token_type: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a request and print the decoded `data`
    Request {
        #[arg(value_enum)]
        method: HttpMethod,

        /// Path relative to the base address, or an absolute URL
        path: String,

        /// Query parameter as key=value (repeatable)
        #[arg(long = "query", value_parser = parse_key_value)]
        query: Vec<(String, String)>,

        /// JSON request body
        #[arg(long, conflicts_with_all = ["form", "file"])]
        json: Option<String>,

        /// Multipart text field as key=value (repeatable)
        #[arg(long, value_parser = parse_key_value)]
        form: Vec<(String, String)>,

        /// Multipart file field as key=path (repeatable)
        #[arg(long, value_parser = parse_key_value)]
        file: Vec<(String, String)>,

        /// Save the raw response body to this file instead of decoding an envelope
        #[arg(long)]
        blob: Option<PathBuf>,
    },

    /// Open an event stream and print each event as it arrives
    Stream {
        path: String,

        #[arg(long, value_enum, default_value_t = HttpMethod::Get)]
        method: HttpMethod,

        /// JSON request body
        #[arg(long)]
        json: Option<String>,

        /// Parse event payloads as JSON
        #[arg(long)]
        parse: bool,
    },

    /// Sign in with a form and store the returned credential
    Login {
        #[arg(default_value = "/auth/login")]
        path: String,

        /// Form field as key=value (repeatable)
        #[arg(long, value_parser = parse_key_value)]
        form: Vec<(String, String)>,
    },

    /// Forget the stored credential
    Logout,

    /// Show or reset configuration
    Config {
        #[arg(long)]
        show: bool,

        #[arg(long)]
        reset: bool,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
            HttpMethod::Patch => Method::PATCH,
        }
    }
}

pub fn parse_key_value(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got `{input}`")),
    }
}
