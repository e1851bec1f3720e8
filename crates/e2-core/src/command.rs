//! Command parsing and dispatch.
//!
//! A command line is a verb plus a fixed number of words. Arity is checked
//! in [`Command::parse`], before the image is touched.

use crate::FileSystem;
use crate::output::{DirListing, FileAttr, FsInfo};
use e2_error::{E2Error, Result};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use tracing::debug;

/// One parsed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Info,
    Ls,
    Pwd,
    Cd { path: String },
    Cat { name: String },
    Attr { name: String },
    Touch { name: String },
    Mkdir { name: String },
    Rm { name: String },
    Rmdir { name: String },
    Rename { old: String, new: String },
    Cp { name: String, dest: String },
}

/// Number of arguments each verb takes.
fn arity(verb: &str) -> Option<usize> {
    Some(match verb {
        "info" | "ls" | "pwd" => 0,
        "cd" | "cat" | "attr" | "touch" | "mkdir" | "rm" | "rmdir" => 1,
        "rename" | "cp" => 2,
        _ => return None,
    })
}

impl Command {
    /// Parse `[verb, args...]`.
    pub fn parse<S: AsRef<str>>(words: &[S]) -> Result<Self> {
        let Some((verb, args)) = words.split_first() else {
            return Err(E2Error::UnknownCommand(String::new()));
        };
        let verb = verb.as_ref();
        let expected = arity(verb).ok_or_else(|| E2Error::UnknownCommand(verb.to_owned()))?;
        if args.len() != expected {
            return Err(E2Error::SyntaxError {
                command: verb.to_owned(),
                expected,
                got: args.len(),
            });
        }

        let arg = |i: usize| args[i].as_ref().to_owned();
        Ok(match verb {
            "info" => Self::Info,
            "ls" => Self::Ls,
            "pwd" => Self::Pwd,
            "cd" => Self::Cd { path: arg(0) },
            "cat" => Self::Cat { name: arg(0) },
            "attr" => Self::Attr { name: arg(0) },
            "touch" => Self::Touch { name: arg(0) },
            "mkdir" => Self::Mkdir { name: arg(0) },
            "rm" => Self::Rm { name: arg(0) },
            "rmdir" => Self::Rmdir { name: arg(0) },
            "rename" => Self::Rename {
                old: arg(0),
                new: arg(1),
            },
            "cp" => Self::Cp {
                name: arg(0),
                dest: arg(1),
            },
            _ => return Err(E2Error::UnknownCommand(verb.to_owned())),
        })
    }

    /// Parse a whitespace-separated line.
    pub fn parse_line(line: &str) -> Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        Self::parse(&words)
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Ls => "ls",
            Self::Pwd => "pwd",
            Self::Cd { .. } => "cd",
            Self::Cat { .. } => "cat",
            Self::Attr { .. } => "attr",
            Self::Touch { .. } => "touch",
            Self::Mkdir { .. } => "mkdir",
            Self::Rm { .. } => "rm",
            Self::Rmdir { .. } => "rmdir",
            Self::Rename { .. } => "rename",
            Self::Cp { .. } => "cp",
        }
    }

    /// Whether the command writes to the image.
    #[must_use]
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::Touch { .. }
                | Self::Mkdir { .. }
                | Self::Rm { .. }
                | Self::Rmdir { .. }
                | Self::Rename { .. }
        )
    }
}

// ── Output ──────────────────────────────────────────────────────────────────

/// Result of one executed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandOutput {
    Info(FsInfo),
    Listing(DirListing),
    Path { path: String },
    Attr(FileAttr),
    /// Bytes already written to the output stream by `cat`.
    Streamed { bytes: u64 },
    Copied { dest: String, bytes: u64 },
    Created { ino: u32 },
    Done,
}

impl fmt::Display for CommandOutput {
    /// Human form. `Streamed` and `Done` render as nothing.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info(info) => write!(f, "{info}"),
            Self::Listing(listing) => write!(f, "{listing}"),
            Self::Path { path } => f.write_str(path),
            Self::Attr(attr) => write!(f, "{attr}"),
            Self::Copied { dest, bytes } => write!(f, "{bytes} bytes copied to {dest}"),
            Self::Streamed { .. } | Self::Created { .. } | Self::Done => Ok(()),
        }
    }
}

// ── Host sinks ──────────────────────────────────────────────────────────────

/// Opens the host-side destination of `cp`.
pub trait SinkProvider {
    fn open_sink(&mut self, dest: &str) -> Result<Box<dyn Write + '_>>;
}

/// Creates or truncates a file on the host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostFs;

impl SinkProvider for HostFs {
    fn open_sink(&mut self, dest: &str) -> Result<Box<dyn Write + '_>> {
        let file = File::create(dest)?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

// ── Dispatch ────────────────────────────────────────────────────────────────

impl FileSystem {
    /// Run one command. `cat` writes file bytes to `out`; `cp` writes to a
    /// sink from `sinks`. Everything else is returned in the output value.
    pub fn execute(
        &mut self,
        command: &Command,
        out: &mut dyn Write,
        sinks: &mut dyn SinkProvider,
    ) -> Result<CommandOutput> {
        debug!(command = command.name(), "execute");
        if command.is_mutating() {
            self.ensure_writable()?;
        }
        Ok(match command {
            Command::Info => CommandOutput::Info(self.info()),
            Command::Ls => CommandOutput::Listing(self.ls()?),
            Command::Pwd => CommandOutput::Path { path: self.pwd() },
            Command::Cd { path } => {
                self.cd(path)?;
                CommandOutput::Done
            }
            Command::Cat { name } => CommandOutput::Streamed {
                bytes: self.cat(name, out)?,
            },
            Command::Attr { name } => CommandOutput::Attr(self.attr(name)?),
            Command::Touch { name } => CommandOutput::Created {
                ino: self.touch(name)?.0,
            },
            Command::Mkdir { name } => CommandOutput::Created {
                ino: self.mkdir(name)?.0,
            },
            Command::Rm { name } => {
                self.rm(name)?;
                CommandOutput::Done
            }
            Command::Rmdir { name } => {
                self.rmdir(name)?;
                CommandOutput::Done
            }
            Command::Rename { old, new } => {
                self.rename(old, new)?;
                CommandOutput::Done
            }
            Command::Cp { name, dest } => CommandOutput::Copied {
                dest: dest.clone(),
                bytes: self.cp(name, dest, sinks)?,
            },
        })
    }
}
