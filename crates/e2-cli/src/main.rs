#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use e2_core::{Command, CommandOutput, FileSystem, HostFs, OpenOptions};
use e2_error::E2Error;
use std::env::VarError;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ── Logging ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "E2SH_LOG_FORMAT";

    fn parse(raw: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(raw.trim(), true).map_err(|_| {
            anyhow::anyhow!(
                "invalid {key}={raw:?}; expected one of: human, json",
                key = Self::ENV_KEY
            )
        })
    }

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => Ok(Some(Self::parse(&value)?)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => {
                bail!("{key} contains non-UTF-8 bytes", key = Self::ENV_KEY)
            }
        }
    }
}

/// `RUST_LOG`, else `warn` so log lines stay out of command output.
fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
}

fn init_logging(log_format_override: Option<LogFormat>) -> Result<LogFormat> {
    let format = log_format_override
        .or(LogFormat::from_env()?)
        .unwrap_or(LogFormat::Human);

    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter())
            .with_writer(io::stderr)
            .with_target(true)
            .with_level(true)
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_env_filter(default_env_filter())
            .with_writer(io::stderr)
            .with_target(true)
            .with_level(true)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize JSON logger: {err}"))?,
    }

    Ok(format)
}

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "e2sh", about = "Shell over an ext2 filesystem image")]
struct Cli {
    /// Path to the ext2 image.
    image: PathBuf,

    /// Run one command (e.g. `ls`, `cat hello.txt`) and exit. Without it,
    /// commands are read from stdin, one per line.
    command: Vec<String>,

    /// Print command results as JSON.
    #[arg(long)]
    json: bool,

    /// Open the image read-only; mutating commands fail.
    #[arg(long)]
    read_only: bool,

    /// Log output format (`human` or `json`).
    ///
    /// Precedence: `--log-format` > `E2SH_LOG_FORMAT` > `human`.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

// ── Shell ───────────────────────────────────────────────────────────────────

struct Shell {
    fs: FileSystem,
    json: bool,
}

impl Shell {
    /// Parse and run one command, rendering its result to `out`.
    fn run_words<S: AsRef<str>>(&mut self, words: &[S], out: &mut dyn Write) -> Result<()> {
        let command = Command::parse(words)?;
        let output = self
            .fs
            .execute(&command, out, &mut HostFs)
            .with_context(|| format!("{} failed", command.name()))?;
        self.render(&output, out)
    }

    fn render(&self, output: &CommandOutput, out: &mut dyn Write) -> Result<()> {
        if self.json {
            // `cat` bytes are already on the stream
            if !matches!(output, CommandOutput::Streamed { .. }) {
                writeln!(out, "{}", serde_json::to_string(output).context("serialize output")?)?;
            }
            return Ok(());
        }
        let text = output.to_string();
        if !text.is_empty() {
            writeln!(out, "{text}")?;
        }
        Ok(())
    }

    /// Read commands until end of input or `exit`/`quit`. A failing command
    /// is reported on `err` and the loop continues, unless the error says the
    /// image itself is unusable.
    fn repl(
        &mut self,
        input: impl BufRead,
        out: &mut dyn Write,
        err: &mut dyn Write,
        prompt: bool,
    ) -> Result<()> {
        let mut lines = input.lines();
        loop {
            if prompt {
                write!(out, "[{}]$> ", self.fs.pwd())?;
                out.flush()?;
            }
            let Some(line) = lines.next() else {
                break;
            };
            let line = line.context("read command line")?;
            let words: Vec<&str> = line.split_whitespace().collect();
            match words.as_slice() {
                [] => continue,
                ["exit" | "quit"] => break,
                _ => {}
            }
            if let Err(e) = self.run_words(&words, out) {
                let fs_error = e.downcast_ref::<E2Error>();
                let errno = fs_error.map(E2Error::to_errno);
                warn!(line = %line, errno, error = %e, "command failed");
                if fs_error.is_some_and(E2Error::is_fatal) {
                    return Err(e);
                }
                writeln!(err, "error: {e:#}")?;
            }
        }
        self.fs.sync().context("sync image")?;
        Ok(())
    }
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let format = init_logging(cli.log_format)?;

    let options = OpenOptions {
        read_only: cli.read_only,
        ..OpenOptions::default()
    };
    let fs = FileSystem::open_with_options(&cli.image, &options)
        .with_context(|| format!("failed to mount {}", cli.image.display()))?;
    info!(image = %cli.image.display(), log_format = ?format, "e2sh ready");

    let mut shell = Shell { fs, json: cli.json };
    let mut stdout = io::stdout().lock();
    if cli.command.is_empty() {
        let stdin = io::stdin();
        let prompt = stdin.is_terminal();
        shell.repl(stdin.lock(), &mut stdout, &mut io::stderr(), prompt)
    } else {
        shell.run_words(&cli.command, &mut stdout)?;
        shell.fs.sync().context("sync image")
    }
}
