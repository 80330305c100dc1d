//! External processes behind the indexer's collaborator traits.

pub mod common;
pub mod ctags;
pub mod git;

pub use ctags::CtagsParser;
pub use git::GitCli;
