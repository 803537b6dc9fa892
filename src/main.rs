//! Purpose: `clouddb` CLI entry point.
//! Role: Binary crate root; parses args, resolves configuration, runs one command.
//! Invariants: Events are emitted as one JSON object per line on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clouddb::api::{ClientConfig, Error, ErrorKind, Event, to_exit_code};
use clouddb::event_json::event_json;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

mod command_dispatch;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Configuration)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `clouddb --help`."));
            }
        },
    };

    init_tracing();
    let config = resolve_config(&cli.connection)?;
    let timeout = Duration::from_millis(cli.timeout_ms);
    command_dispatch::dispatch_command(cli.command, config, timeout)
}

#[derive(Parser)]
#[command(
    name = "clouddb",
    version,
    about = "Store, fetch, and watch tagged values in a shared cloud key/value store",
    long_about = None,
    before_help = r#"Values are JSON. Every client watching a project sees every change.

Mental model:
  - `store` writes a value under a tag (last writer wins)
  - `get` reads it back
  - `watch` streams changes made by anyone"#,
    after_help = r#"EXAMPLES
  $ clouddb --project demo --token-file token.txt watch
  $ clouddb --project demo --token-file token.txt store score '{"points": 3}'
  $ clouddb --project demo --token-file token.txt get score --default 0
  $ clouddb --url redis://localhost:6379 --project demo --token secret tags

Set RUST_LOG=debug to see connection lifecycle logs on stderr."#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[arg(
        long,
        global = true,
        default_value_t = 10_000,
        help = "How long one-shot commands wait for the server (milliseconds)"
    )]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Default)]
struct ConnectionArgs {
    #[arg(long, global = true, help = "Server host (DEFAULT selects the maintained deployment)")]
    server: Option<String>,
    #[arg(long, global = true, help = "Server port")]
    port: Option<u16>,
    #[arg(long, global = true, help = "Connect without TLS")]
    no_tls: bool,
    #[arg(
        long,
        global = true,
        help = "Server as redis://host:port or rediss://host:port",
        conflicts_with_all = ["server", "port"]
    )]
    url: Option<String>,
    #[arg(long, global = true, help = "JSON config file", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Project identifier (the change channel)")]
    project: Option<String>,
    #[arg(long, global = true, help = "Project access token", conflicts_with = "token_file")]
    token: Option<String>,
    #[arg(long, global = true, help = "Read the access token from a file", value_hint = ValueHint::FilePath)]
    token_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Store a JSON value under a tag")]
    Store {
        tag: String,
        #[arg(help = "JSON value, e.g. 42 or '\"text\"' or '{\"a\":1}'")]
        value: String,
    },
    #[command(about = "Fetch the value stored under a tag")]
    Get {
        tag: String,
        #[arg(long, default_value = "\"\"", help = "JSON value reported when the tag is absent")]
        default: String,
    },
    #[command(about = "Append a JSON value to the list stored under a tag")]
    Append { tag: String, value: String },
    #[command(about = "Remove and print the first element of the list under a tag")]
    Pop { tag: String },
    #[command(about = "Delete a tag")]
    Clear { tag: String },
    #[command(about = "List every tag in the project")]
    Tags,
    #[command(about = "Stream change notifications until Ctrl-C")]
    Watch {
        #[arg(long, help = "Exit after this many changes")]
        max: Option<u64>,
    },
}

fn resolve_config(args: &ConnectionArgs) -> Result<ClientConfig, Error> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(url) = &args.url {
        let parsed = ClientConfig::from_url(url)?;
        config.server = parsed.server;
        config.port = parsed.port;
        config.use_tls = parsed.use_tls;
        if !parsed.token.is_empty() {
            config.token = parsed.token;
        }
    }
    if let Some(server) = &args.server {
        config.server = server.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.no_tls {
        config.use_tls = false;
    }
    if let Some(project) = &args.project {
        config.project_id = project.clone();
    }
    if let Some(token) = &args.token {
        config.token = token.clone();
    }
    if let Some(path) = &args.token_file {
        config.token = read_token_file(path)?;
    }
    Ok(config)
}

fn read_token_file(path: &Path) -> Result<String, Error> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Configuration)
            .with_message(format!("failed to read token file {}", path.display()))
            .with_source(err)
    })?;
    Ok(text.trim().to_string())
}

fn parse_json_arg(name: &str, raw: &str) -> Result<Value, Error> {
    serde_json::from_str(raw).map_err(|err| {
        Error::new(ErrorKind::Configuration)
            .with_message(format!("{name} is not valid JSON: {err}"))
            .with_hint("Quote strings as JSON, e.g. '\"hello\"'.")
    })
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn time_now() -> String {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

fn emit_event(event: &Event) {
    let value = event_json(event, &time_now());
    let json = serde_json::to_string(&value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Configuration => "invalid configuration".to_string(),
        ErrorKind::Offline => "no network connectivity".to_string(),
        ErrorKind::Protocol => "server rejected the request".to_string(),
        ErrorKind::Decode => "value is not valid JSON".to_string(),
        ErrorKind::Auth => "authentication failed".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Shutdown => "client is shut down".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(tag) = err.tag() {
        inner.insert("tag".to_string(), json!(tag));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(tag) = err.tag() {
        lines.push(format!("tag: {tag}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
