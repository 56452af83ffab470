//! A modular ELF linker core.
//!
//! `eld` consumes relocatable objects, archives, shared libraries and a
//! linker script, and emits an ELF executable, shared object or relocatable
//! object. The crate is a library: the embedder builds a [`config::LinkConfig`],
//! constructs a [`link::Linker`] and drives the link to completion.
//!
//! The pipeline runs in strict phase order: prepare (scripts and the input
//! tree), normalize (read inputs, resolve symbols into the name pool),
//! resolve (archive extraction, wrap, version scripts), layout (garbage
//! collection, rule matching, merging, relocation scan, address assignment,
//! expression commit, relaxation, relocation application) and emission.
//! All phases share one mutable [`module::Module`].

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod config;
pub mod diag;
pub mod elf;
pub mod emit;
pub mod fragment;
pub mod input;
pub mod layout;
pub mod link;
pub mod module;
pub mod object;
pub mod plugin;
pub mod reloc;
pub mod script;
pub mod section;
pub mod support;
pub mod symbol;
pub mod target;

pub use config::LinkConfig;
pub use diag::{DiagnosticEntry, DiagnosticKind, Result};
pub use link::Linker;
pub use module::Module;
