//! Zip extraction into a sandbox directory, with junk and unsafe entries
//! filtered out.

pub mod extract;
pub mod junk;

pub use extract::{extract, ExtractError, ExtractReport};
