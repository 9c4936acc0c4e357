//! Publishing a working tree as the sole commit of a remote branch.

pub mod commands;
pub mod publish;

pub use commands::GitCli;
pub use publish::SyncBackend;
