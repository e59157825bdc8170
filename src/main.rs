//! Entry point for the rld linker.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Initialize the linker with the `X86_64` backend (the only supported architecture).
//! 3. Verify input files match the target architecture.
//! 4. Execute the linking steps: load, resolve, scan, layout, relocate, write.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use memmap2::Mmap;
use object::{Architecture as ObjArch, Object, ObjectKind};
use std::fs::File;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use rld::arch::x86_64::X86_64;
use rld::config::Config;
use rld::linker::Linker;
use rld::resolver::WarningPolicy;

fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Manual parsing of arguments because clap's allow_hyphen_values captures everything
    let mut final_output = config.output.clone();
    let mut input_paths = Vec::new();

    let mut iter = config.inputs.iter();
    while let Some(arg) = iter.next() {
        if arg == "-o" {
            if let Some(path) = iter.next() {
                final_output = PathBuf::from(path);
            }
            continue;
        }

        if arg.starts_with('-') {
            continue; // Ignore other flags
        }

        let path = PathBuf::from(arg);
        if !path.exists() {
            // Ignore non-existent files (assumed flag args)
            continue;
        }

        input_paths.push(path);
    }

    if input_paths.is_empty() {
        anyhow::bail!("no input files");
    }

    // Map input files into memory
    let mut open_files = Vec::new();
    for path in &input_paths {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file)? };

        // Architecture check. Archives are checked member by member later.
        if !mmap.starts_with(b"!<arch>\n") {
            let obj = object::File::parse(&*mmap).context("failed to parse object file")?;
            if obj.architecture() != ObjArch::X86_64 {
                anyhow::bail!(
                    "Unsupported architecture in {}: {:?}. Only X86_64 is supported.",
                    path.display(),
                    obj.architecture()
                );
            }
            if obj.kind() == ObjectKind::Executable {
                anyhow::bail!("{} is already a linked executable", path.display());
            }
        }

        open_files.push((path.clone(), mmap));
    }

    let warning_policy = if config.fatal_warnings {
        WarningPolicy::Fatal
    } else {
        WarningPolicy::Continue
    };
    let mut linker = Linker::new(
        Box::new(X86_64),
        config.output_kind(),
        config.is_pic(),
        config.entry.clone(),
        warning_policy,
    );

    // 1. Add files (parses and resolves symbols)
    for (path, mmap) in &open_files {
        linker.add_file(path.clone(), mmap)?;
    }

    // 2. Map input sections into output sections
    linker.merge_sections()?;

    // 3. Scan relocations and reserve GOT/PLT/dynamic entries
    linker.scan_relocations()?;

    // 4. Layout sections and segments in memory
    linker.layout()?;

    // 5. Apply relocations and render the reserved tables
    linker.relocate()?;

    // 6. Write the final output
    linker.write(&final_output)?;

    println!("Linked successfully to {}", final_output.display());
    Ok(())
}
