//! Configuration module.
//!
//! This module defines the command-line interface (CLI) for the linker using `clap`.
//! It handles parsing arguments like input files, the output file path and the
//! kind of output being produced (executable, shared object or relocatable).

use clap::Parser;
use std::path::PathBuf;

/// A minimal linker for x86_64 ELF binaries.
///
/// Combines multiple object files (and shared objects) into an executable or
/// shared object. Currently only x86_64 Linux is supported.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Input object files (and ignored flags)
    #[arg(required = true, allow_hyphen_values = true, num_args = 1..)]
    pub inputs: Vec<String>,

    /// Output file
    #[arg(short, long, default_value = "a.out", help = "Path to the output file")]
    pub output: PathBuf,

    /// Produce a shared object instead of an executable
    #[arg(long)]
    pub shared: bool,

    /// Produce a relocatable object (partial link)
    #[arg(short = 'r', long)]
    pub relocatable: bool,

    /// Generate position-independent output
    #[arg(long)]
    pub pic: bool,

    /// Entry point symbol name
    #[arg(long, default_value = "_start")]
    pub entry: String,

    /// Treat resolver warnings (e.g. mismatched common sizes) as fatal
    #[arg(long)]
    pub fatal_warnings: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}

/// The kind of file the link produces. Decides, among other things, whether
/// undefined symbols are fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Executable,
    SharedObject,
    Relocatable,
}

impl OutputKind {
    /// Shared objects and relocatable outputs may legitimately contain
    /// undefined symbols; final executables may not.
    pub fn allows_undefined(self) -> bool {
        !matches!(self, OutputKind::Executable)
    }
}

impl Config {
    pub fn output_kind(&self) -> OutputKind {
        if self.relocatable {
            OutputKind::Relocatable
        } else if self.shared {
            OutputKind::SharedObject
        } else {
            OutputKind::Executable
        }
    }

    /// Position independence is implied by shared output.
    pub fn is_pic(&self) -> bool {
        self.pic || self.shared
    }
}
