//! Commit-history sync: summarize the newest commits of a project's default branch.

use uuid::Uuid;

use crate::error::Result;
use crate::gateway::ModelGateway;
use crate::models::Commit;
use crate::repo::{CommitInfo, RepositoryLoader};

/// How many of the newest commits a sync looks at.
pub const SYNC_LIMIT: usize = 10;

/// Diffs longer than this are cut before summarizing.
const MAX_DIFF_CHARS: usize = 20_000;

/// Fetch the newest commits, skip the ones in `known_shas`, and summarize the
/// rest. A diff that cannot be fetched or summarized yields an empty summary.
pub async fn sync_commits(
    loader: &RepositoryLoader,
    gateway: &ModelGateway,
    project_id: Uuid,
    repository_url: &str,
    token: Option<&str>,
    known_shas: &[String],
) -> Result<Vec<Commit>> {
    let recent = loader
        .recent_commits(repository_url, token, SYNC_LIMIT)
        .await?;
    let fresh: Vec<CommitInfo> = recent
        .into_iter()
        .filter(|c| !known_shas.contains(&c.sha))
        .collect();
    tracing::info!(%project_id, "Summarizing {} new commits", fresh.len());

    let mut commits = Vec::with_capacity(fresh.len());
    for info in fresh {
        let summary = match loader.commit_diff(repository_url, &info.sha, token).await {
            Ok(diff) => match gateway.generate(&diff_summary_prompt(&diff)).await {
                Ok(summary) => summary.trim().to_string(),
                Err(e) => {
                    tracing::warn!(sha = %info.sha, "Commit summary failed: {e}");
                    String::new()
                }
            },
            Err(e) => {
                tracing::warn!(sha = %info.sha, "Could not fetch diff: {e}");
                String::new()
            }
        };

        commits.push(Commit {
            id: Uuid::new_v4(),
            project_id,
            sha: info.sha,
            message: info.message,
            author_name: info.author_name,
            author_avatar: info.author_avatar,
            committed_at: info.committed_at,
            summary,
        });
    }
    Ok(commits)
}

pub fn diff_summary_prompt(diff: &str) -> String {
    let (diff, truncated) = crate::ingest::truncate_chars(diff, MAX_DIFF_CHARS);
    let marker = if truncated { "\n[... diff truncated]" } else { "" };
    format!(
        "You are an expert programmer, and you are trying to summarize a git diff.\n\
         Example summary comments:\n\
         ```\n\
         * Raised the amount of returned recordings from `10` to `100` [packages/server/recordings_api.ts], [packages/server/constants.ts]\n\
         * Fixed a typo in the github action name [.github/workflows/gpt-commit-summarizer.yml]\n\
         ```\n\
         Please summarize the following diff file:\n\n{diff}{marker}"
    )
}
