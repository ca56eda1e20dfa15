//! Repository loader: GitHub REST walk, ignore policy and commit listing.

pub mod filter;
pub mod github;

pub use github::{parse_repo_url, CommitInfo, RepoRef, RepositoryLoader};
