//! Purpose: `portload` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit JSON on stdout (pretty on a TTY, compact otherwise).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All store mutations go through `api::PortStore` or `api::RemoteClient`.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{
    Args, CommandFactory, Parser, Subcommand, ValueEnum, ValueHint,
    error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};

mod command_dispatch;
mod serve;

use portload::api::{DEFAULT_BATCH_SIZE, DEFAULT_CHUNK_SIZE, Error, ErrorKind, to_exit_code};

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

/// Where port commands read and write.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StoreTarget {
    Local(PathBuf),
    Remote(String),
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse_from(std::env::args_os()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
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
                let message = clap_error_summary(&err);
                let hint = clap_error_hint(&err);
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(message)
                        .with_hint(hint),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    let target = match (cli.url, cli.store) {
        (Some(_), Some(_)) => {
            return Err((
                Error::new(ErrorKind::Usage)
                    .with_message("--url cannot be combined with --store")
                    .with_hint("Use --url for a running gateway or --store for a local file."),
                color_mode,
            ));
        }
        (Some(url), None) => StoreTarget::Remote(url),
        (None, store) => StoreTarget::Local(store.unwrap_or_else(default_store_path)),
    };

    let result = command_dispatch::dispatch_command(cli.command, target);

    result
        .map_err(add_pipeline_hint)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
        .map_err(|err| (err, color_mode))
}

fn default_store_path() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".portload").join("ports.json")
}

#[derive(Parser)]
#[command(
    name = "portload",
    version,
    about = "Stream large JSON port documents into bounded batches for bulk upsert",
    help_template = r#"{about-with-newline}
USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    after_help = r#"EXAMPLES
  $ portload upload ports.json                 # ingest into ~/.portload/ports.json
  $ portload get AEAJM
  $ portload serve --bind 127.0.0.1:9710       # Terminal 1
  $ portload --url http://127.0.0.1:9710 upload ports.json   # Terminal 2

  The input is one JSON object mapping port codes to port records:
  {"AEAJM": {"name": "Ajman", "coordinates": [55.51, 25.41], ...}, ...}"#,
    arg_required_else_help = true,
    disable_help_subcommand = false
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Port store snapshot file (default: ~/.portload/ports.json)",
        value_hint = ValueHint::FilePath
    )]
    store: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        help = "Base URL of a running gateway; commands go over HTTP instead of the local store",
        value_hint = ValueHint::Url
    )]
    url: Option<String>,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Run the HTTP gateway",
        long_about = r#"Serve port CRUD routes and the bulk upload route over HTTP.

Routes:
  GET    /healthz
  GET    /ports                 POST /ports
  GET    /ports/<id|slug>       PUT  /ports/<id|slug>     DELETE /ports/<id|slug>
  POST   /upload-ports          (multipart form field "file")

Logging follows RUST_LOG (default: info)."#
    )]
    Serve(ServeArgs),
    #[command(
        about = "Stream a ports document into the store",
        long_about = r#"Decode a ports document incrementally and upsert it batch by batch.

Batches committed before a failure stay committed; re-running the upload is
safe because upserts are keyed by slug."#
    )]
    Upload {
        #[arg(help = "Ports document path, or - for stdin", value_hint = ValueHint::FilePath)]
        file: PathBuf,
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, help = "Bytes read per chunk")]
        chunk_size: usize,
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, help = "Ports per bulk upsert")]
        batch_size: usize,
    },
    #[command(about = "List stored ports")]
    List,
    #[command(about = "Show one port by id or slug")]
    Get {
        #[arg(help = "Numeric id or slug (e.g. AEAJM)")]
        port: String,
    },
    #[command(about = "Delete one port by id or slug")]
    Delete {
        #[arg(help = "Numeric id or slug (e.g. AEAJM)")]
        port: String,
    },
    #[command(about = "Generate shell completion scripts")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:9710", help = "Address to listen on")]
    bind: String,
    #[arg(long, help = "Keep ports in memory instead of the --store file")]
    in_memory: bool,
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, help = "Bytes read per upload chunk")]
    chunk_size: usize,
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, help = "Ports per bulk upsert")]
    batch_size: usize,
    #[arg(
        long,
        default_value_t = serve::DEFAULT_MAX_UPLOAD_BYTES,
        help = "Largest accepted request body in bytes"
    )]
    max_upload_bytes: u64,
    #[arg(long, help = "Allow binding to non-loopback addresses")]
    allow_non_loopback: bool,
}

fn add_pipeline_hint(err: Error) -> Error {
    if !err.kind().is_pipeline() || err.hint().is_some() {
        return err;
    }
    let hint = match err.kind() {
        ErrorKind::ReadFailure => "Reading the input failed. Check the file or the upstream stream.",
        ErrorKind::MalformedTopLevel => {
            "The document must be one JSON object: {\"CODE\": {...}, ...}."
        }
        ErrorKind::NonStringKey => "Top-level keys must be JSON strings such as \"AEAJM\".",
        _ => "Each top-level value must be a JSON object describing one port.",
    };
    err.with_hint(hint)
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => err.with_hint(
            "Permission denied. Check file permissions or use --store to a writable location.",
        ),
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        _ => err,
    }
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_LOG=debug and share command/context if it persists.",
    )
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
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
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::AlreadyExists => "already exists".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Storage => "store snapshot unreadable".to_string(),
        ErrorKind::Invalid => "invalid port record".to_string(),
        ErrorKind::ReadFailure => "input read failed".to_string(),
        ErrorKind::MalformedTopLevel => "document is not a JSON object".to_string(),
        ErrorKind::NonStringKey => "object key is not a string".to_string(),
        ErrorKind::ValueDecodeFailure => "value could not be decoded".to_string(),
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
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(stage) = err.stage() {
        inner.insert("stage".to_string(), json!(stage.as_str()));
    }
    if let Some(key) = err.key() {
        inner.insert("key".to_string(), json!(key));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }
    if let Some(key) = err.key() {
        lines.push(format!(
            "{} {key}",
            colorize_label("key:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!(
            "{} {offset}",
            colorize_label("offset:", use_color, AnsiColor::Yellow)
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
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

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);

    let Some(usage) = usage else {
        return "Try `portload --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "portload") else {
        return "Try `portload --help`.".to_string();
    };

    let parts: Vec<&str> = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !(token.starts_with('-') || token.starts_with('<') || token.starts_with('['))
        })
        .copied()
        .collect();

    if parts.is_empty() {
        return "Try `portload --help`.".to_string();
    }
    format!("Try `portload {} --help`.", parts.join(" "))
}

fn completion_script(shell: Shell) -> Vec<u8> {
    let mut cmd = Cli::command();
    let mut out = Vec::new();
    clap_complete::aot::generate(shell, &mut cmd, "portload", &mut out);
    out
}
