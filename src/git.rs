//! Latest-commit lookup over git's smart HTTP discovery endpoint.
//!
//! Only the ref advertisement is fetched (`info/refs?service=git-upload-pack`),
//! which is enough to learn the tip of a branch without cloning anything.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use regex::Regex;

use crate::error::ResolutionError;

pub const DEFAULT_BRANCH: &str = "master";

const USER_AGENT: &str = "docker-ci";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves the commit a remote branch currently points at.
#[async_trait]
pub trait CommitResolver: Send + Sync {
    /// `repo_url` may end with `#branch`; `master` is assumed otherwise.
    async fn resolve_latest_commit(&self, repo_url: &str) -> Result<String, ResolutionError>;
}

/// Splits `url[.git][#branch[:subdir]]` into the bare URL and the branch.
pub fn split_branch(repo: &str) -> (&str, &str) {
    let repo = repo.trim();
    let (url, fragment) = match repo.split_once('#') {
        Some((url, fragment)) => (url, Some(fragment)),
        None => (repo, None),
    };
    let branch = fragment
        .map(|f| f.split(':').next().unwrap_or(""))
        .filter(|b| !b.is_empty())
        .unwrap_or(DEFAULT_BRANCH);
    let url = url.trim_end_matches('/');
    (url.strip_suffix(".git").unwrap_or(url), branch)
}

/// Remote build context in the runtime's git URL syntax.
///
/// The runtime only treats http(s) remotes as git repositories when they
/// end in `.git`, so the suffix is always added back.
pub fn build_remote(repo_url: &str, branch: &str, context: &str) -> String {
    let context = context.trim_matches('/');
    if context.is_empty() || context == "." {
        format!("{}.git#{}", repo_url, branch)
    } else {
        format!("{}.git#{}:{}", repo_url, branch, context)
    }
}

pub fn discovery_url(repo_url: &str) -> String {
    format!("{}/info/refs?service=git-upload-pack", repo_url)
}

/// Finds the hash advertised for `refs/heads/<branch>` in a ref advertisement.
///
/// Each pkt-line starts with a four hex digit length that directly precedes
/// the hash, so the hash is matched at its exact width.
pub fn find_branch_commit(advertisement: &str, branch: &str) -> Option<String> {
    let pattern = format!(
        r"([0-9a-f]{{40}}(?:[0-9a-f]{{24}})?) refs/heads/{}(?:\x00|\n| |$)",
        regex::escape(branch)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(advertisement)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// [`CommitResolver`] speaking git's smart HTTP protocol.
pub struct GitHttpResolver {
    client: reqwest::Client,
}

impl GitHttpResolver {
    pub fn new() -> Result<Self, ResolutionError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CommitResolver for GitHttpResolver {
    async fn resolve_latest_commit(&self, repo_url: &str) -> Result<String, ResolutionError> {
        let (url, branch) = split_branch(repo_url);
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ResolutionError::InvalidUrl(url.to_string()));
        }

        let discovery = discovery_url(url);
        debug!("Fetching ref advertisement from {}", discovery);
        let resp = self.client.get(&discovery).send().await?;
        if !resp.status().is_success() {
            return Err(ResolutionError::Status(resp.status().as_u16()));
        }
        let body = resp.text().await?;

        find_branch_commit(&body, branch).ok_or_else(|| ResolutionError::BranchNotFound {
            branch: branch.to_string(),
        })
    }
}
