use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use crate::config::GithubConfig;
use crate::error::{Error, Result};
use crate::llm::check_status;
use crate::models::SourceFile;
use crate::repo::filter::should_fetch;

const RAW_MEDIA_TYPE: &str = "application/vnd.github.raw";
const DIFF_MEDIA_TYPE: &str = "application/vnd.github.diff";
const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";

/// `owner/name` of a GitHub repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Accepts `https://github.com/owner/name`, with or without `.git`, a
/// trailing slash or extra path segments (`/tree/main/...`).
pub fn parse_repo_url(url: &str) -> Result<RepoRef> {
    let parsed = Url::parse(url.trim()).map_err(|e| Error::repository(url, e.to_string()))?;
    if !matches!(parsed.scheme(), "https" | "http") {
        return Err(Error::repository(url, "only http(s) URLs are supported"));
    }
    if !matches!(parsed.host_str(), Some("github.com" | "www.github.com")) {
        return Err(Error::repository(url, "only github.com repositories are supported"));
    }

    let mut segments = parsed
        .path_segments()
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty());
    let owner = segments.next();
    let name = segments.next().map(|n| n.trim_end_matches(".git"));

    match (owner, name) {
        (Some(owner), Some(name)) if !name.is_empty() => Ok(RepoRef {
            owner: owner.to_string(),
            name: name.to_string(),
        }),
        _ => Err(Error::repository(url, "expected https://github.com/<owner>/<repo>")),
    }
}

/// A commit as listed by the commits API.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author_name: String,
    pub author_avatar: String,
    pub committed_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RepoResponse {
    default_branch: String,
}

#[derive(Deserialize)]
struct TreeResponse {
    #[serde(default)]
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: String,
    commit: CommitDetail,
    author: Option<GithubUser>,
}

#[derive(Deserialize)]
struct CommitDetail {
    message: String,
    author: Option<CommitAuthor>,
}

#[derive(Deserialize)]
struct CommitAuthor {
    name: String,
    date: DateTime<Utc>,
}

#[derive(Deserialize)]
struct GithubUser {
    avatar_url: String,
}

/// Walks a GitHub repository through the REST API.
#[derive(Clone)]
pub struct RepositoryLoader {
    client: reqwest::Client,
    api_url: String,
    fetch_concurrency: usize,
    default_token: Option<String>,
}

impl RepositoryLoader {
    pub fn new(client: reqwest::Client, config: &GithubConfig) -> Self {
        Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            fetch_concurrency: config.fetch_concurrency.max(1),
            default_token: config.token.clone(),
        }
    }

    /// Fetch every non-ignored text file of the default branch.
    ///
    /// Files that cannot be fetched or are not valid UTF-8 are skipped with a
    /// warning. Fails only if the repository itself cannot be resolved.
    pub async fn load(&self, url: &str, token: Option<&str>) -> Result<Vec<SourceFile>> {
        let repo = parse_repo_url(url)?;
        let token = self.resolve_token(token);
        let branch = self.default_branch(&repo, url, token).await?;

        let tree_url = format!(
            "{}/repos/{}/{}/git/trees/{}?recursive=1",
            self.api_url, repo.owner, repo.name, branch
        );
        let resp = self.request(&tree_url, JSON_MEDIA_TYPE, token).send().await?;
        if resp.status() == StatusCode::CONFLICT {
            // GitHub answers 409 "Git Repository is empty." for a repository without commits
            tracing::info!("{repo} has no commits; nothing to load");
            return Ok(Vec::new());
        }
        let tree: TreeResponse = check_status("github", resp)
            .await
            .map_err(|e| access_error(url, e))?
            .json()
            .await?;
        if tree.truncated {
            tracing::warn!("Tree listing for {repo} was truncated by GitHub; some files are missing");
        }

        let paths: Vec<String> = tree
            .tree
            .into_iter()
            .filter(|e| e.kind == "blob" && should_fetch(&e.path))
            .map(|e| e.path)
            .collect();
        tracing::info!("Fetching {} files from {repo}@{branch}", paths.len());

        let mut files: Vec<SourceFile> = stream::iter(paths)
            .map(|path| {
                let repo = &repo;
                let branch = branch.as_str();
                async move {
                    match self.fetch_file(repo, branch, &path, token).await {
                        Ok(Some(content)) => Some(SourceFile { path, content }),
                        Ok(None) => {
                            tracing::warn!("Skipping {path}: not a UTF-8 text file");
                            None
                        }
                        Err(e) => {
                            tracing::warn!("Skipping {path}: {e}");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.fetch_concurrency)
            .filter_map(|f| async move { f })
            .collect()
            .await;

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// The most recent commits of the default branch, newest first.
    pub async fn recent_commits(
        &self,
        url: &str,
        token: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CommitInfo>> {
        let repo = parse_repo_url(url)?;
        let token = self.resolve_token(token);
        let branch = self.default_branch(&repo, url, token).await?;

        let commits_url = format!(
            "{}/repos/{}/{}/commits?sha={}&per_page={}",
            self.api_url, repo.owner, repo.name, branch, limit
        );
        let resp = self.request(&commits_url, JSON_MEDIA_TYPE, token).send().await?;
        if resp.status() == StatusCode::CONFLICT {
            return Ok(Vec::new());
        }
        let commits: Vec<CommitResponse> = check_status("github", resp)
            .await
            .map_err(|e| access_error(url, e))?
            .json()
            .await?;

        Ok(commits
            .into_iter()
            .take(limit)
            .map(|c| {
                let (author_name, committed_at) = match c.commit.author {
                    Some(a) => (a.name, a.date),
                    None => (String::new(), Utc::now()),
                };
                CommitInfo {
                    sha: c.sha,
                    message: c.commit.message,
                    author_name,
                    author_avatar: c.author.map(|a| a.avatar_url).unwrap_or_default(),
                    committed_at,
                }
            })
            .collect())
    }

    /// Unified diff of a single commit.
    pub async fn commit_diff(&self, url: &str, sha: &str, token: Option<&str>) -> Result<String> {
        let repo = parse_repo_url(url)?;
        let token = self.resolve_token(token);
        let diff_url = format!(
            "{}/repos/{}/{}/commits/{}",
            self.api_url, repo.owner, repo.name, sha
        );
        let resp = self.request(&diff_url, DIFF_MEDIA_TYPE, token).send().await?;
        let resp = check_status("github", resp).await?;
        Ok(resp.text().await?)
    }

    async fn default_branch(&self, repo: &RepoRef, url: &str, token: Option<&str>) -> Result<String> {
        let repo_url = format!("{}/repos/{}/{}", self.api_url, repo.owner, repo.name);
        let resp = self.request(&repo_url, JSON_MEDIA_TYPE, token).send().await?;

        match resp.status() {
            StatusCode::NOT_FOUND => {
                let reason = if token.is_some() {
                    "repository not found or token lacks access"
                } else {
                    "repository not found (private repositories need a token)"
                };
                return Err(Error::repository(url, reason));
            }
            StatusCode::UNAUTHORIZED => {
                return Err(Error::repository(url, "GitHub rejected the access token"));
            }
            _ => {}
        }

        let resp = check_status("github", resp)
            .await
            .map_err(|e| access_error(url, e))?;
        let body: RepoResponse = resp.json().await?;
        Ok(body.default_branch)
    }

    /// `Ok(None)` for binary or undecodable content.
    async fn fetch_file(
        &self,
        repo: &RepoRef,
        branch: &str,
        path: &str,
        token: Option<&str>,
    ) -> Result<Option<String>> {
        let mut url = Url::parse(&format!(
            "{}/repos/{}/{}/contents",
            self.api_url, repo.owner, repo.name
        ))
        .map_err(|e| Error::Config(format!("Invalid GitHub API URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| Error::Config("GitHub API URL cannot be a base".into()))?
            .extend(path.split('/'));
        url.query_pairs_mut().append_pair("ref", branch);

        let resp = self.request(url.as_str(), RAW_MEDIA_TYPE, token).send().await?;
        let resp = check_status("github", resp).await?;
        let bytes = resp.bytes().await?;
        Ok(decode_text(&bytes))
    }

    fn request(&self, url: &str, accept: &str, token: Option<&str>) -> reqwest::RequestBuilder {
        let req = self
            .client
            .get(url)
            .header(USER_AGENT, "repo-qa")
            .header(ACCEPT, accept);
        match token {
            Some(token) => req.header(AUTHORIZATION, format!("Bearer {token}")),
            None => req,
        }
    }

    fn resolve_token<'a>(&'a self, token: Option<&'a str>) -> Option<&'a str> {
        token
            .or(self.default_token.as_deref())
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Auth failures while resolving a repository are repository-level errors.
fn access_error(url: &str, err: Error) -> Error {
    match err {
        Error::ProviderAuth { message, .. } => Error::repository(url, message),
        other => other,
    }
}

fn decode_text(bytes: &[u8]) -> Option<String> {
    if bytes.contains(&0) {
        return None;
    }
    String::from_utf8(bytes.to_vec()).ok()
}
