//! Static linker library.
//!
//! This library provides the core components for the `rld` linker.
//! It is organized into several modules:
//! - `config`: CLI configuration.
//! - `arch`: Architecture-specific backend logic.
//! - `intern`: The symbol name intern table.
//! - `resolver`: Symbol resolution policy.
//! - `reloc`: Relocation records and their recycling arena.
//! - `scanner`: The relocation scan that reserves GOT/PLT/dynamic entries.
//! - `tables`: Builders for the reserved output tables.
//! - `linker`: The main linking orchestration.
//! - `layout`: Output memory layout management.
//! - `emit`: Output symbol-table and name-pool emission.

pub mod arch;
pub mod config;
pub mod diagnostics;
pub mod emit;
pub mod error;
pub mod intern;
pub mod layout;
pub mod linker;
pub mod reloc;
pub mod resolver;
pub mod scanner;
pub mod symbol;
pub mod tables;
pub mod utils;
pub mod writer;
