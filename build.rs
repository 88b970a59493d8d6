//! Generates the `ErrorKind` enum consumed by `crate::error`.
//!
//! Adding a new fallible subsystem to the crate means adding one line
//! to `ERROR_KINDS` below, not hand-writing a new enum variant plus
//! its `Debug`/`Copy`/`Clone` boilerplate.

use std::env;
use std::fs;
use std::path::Path;

use itertools::Itertools;

/// One entry per subsystem that produces its own `Error`s.
const ERROR_KINDS: &[&str] = &[
    "Error",
    "Configuration",
    "Communication",
    "CommunicationMessage",
    "CryptoHash",
    "CryptoSignature",
    "HashChain",
    "VersionVector",
    "ReplyCache",
    "Log",
    "Consensus",
    "ViewChange",
    "Checkpoint",
    "Client",
    "Executable",
];

fn main() {
    let out_dir = env::var("OUT_DIR").unwrap();
    let dest_path = Path::new(&out_dir).join("error_kind.rs");

    let variants = ERROR_KINDS.iter().map(|name| name.to_string()).join(",\n    ");

    let source = format!(
        "/// Identifies the subsystem an [`Error`](super::Error) originated from.\n\
         #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]\n\
         pub enum ErrorKind {{\n    {}\n}}\n",
        variants,
    );

    fs::write(&dest_path, source).unwrap();
    println!("cargo:rerun-if-changed=build.rs");
}
