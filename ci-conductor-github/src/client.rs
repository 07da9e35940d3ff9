// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::GithubError;

/// The details of a pull request needed to build a change.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PullDetail {
    /// The pull request number.
    pub number: u64,
    /// The title.
    pub title: String,
    /// The message body.
    pub body: String,
    /// The URL of the pull request page.
    pub html_url: String,
    /// The head sha.
    pub head_sha: String,
    /// The target branch.
    pub branch: String,
    /// Whether the pull request is open.
    pub open: bool,
    /// Whether the pull request has been merged.
    pub merged: bool,
    /// Whether GitHub considers the pull request mergeable.
    pub mergeable: Option<bool>,
    /// When the pull request was last updated.
    pub updated_at: DateTime<Utc>,
}

/// One commit status as reported by the API.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct StatusDetail {
    /// The status state, e.g. `success`.
    pub state: String,
    /// The status context.
    pub context: String,
    /// The login of the creator, if known.
    pub creator: Option<String>,
    /// When the status was created.
    pub created_at: DateTime<Utc>,
}

/// One review as reported by the API.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ReviewDetail {
    /// The login of the reviewer.
    pub user: String,
    /// The review state, e.g. `APPROVED`.
    pub state: String,
    /// When the review was submitted.
    pub submitted_at: DateTime<Utc>,
}

/// The REST surface of GitHub the driver consumes.
#[async_trait]
pub trait GithubApi: Send + Sync {
    /// Fetch a pull request.
    async fn get_pull(&self, project: &str, number: u64) -> Result<PullDetail, GithubError>;

    /// The names of the files a pull request modifies.
    async fn list_pull_files(
        &self,
        project: &str,
        number: u64,
    ) -> Result<Vec<String>, GithubError>;

    /// The raw commit statuses on a sha, newest first.
    async fn list_statuses(
        &self,
        project: &str,
        sha: &str,
    ) -> Result<Vec<StatusDetail>, GithubError>;

    /// The reviews on a pull request.
    async fn list_reviews(
        &self,
        project: &str,
        number: u64,
    ) -> Result<Vec<ReviewDetail>, GithubError>;

    /// The permission of a user on a project: `admin`, `write`, `read`, or
    /// `none`.
    async fn get_permission(&self, project: &str, login: &str) -> Result<String, GithubError>;

    /// The branches of a project.
    async fn list_branches(&self, project: &str) -> Result<Vec<String>, GithubError>;

    /// Search open pull requests whose body mentions the given text,
    /// returning `(project, number)` pairs.
    async fn search_pulls_mentioning(
        &self,
        text: &str,
    ) -> Result<Vec<(String, u64)>, GithubError>;

    /// Leave a comment on a pull request.
    async fn comment(&self, project: &str, number: u64, body: &str) -> Result<(), GithubError>;

    /// Set a commit status on a sha.
    async fn set_status(
        &self,
        project: &str,
        sha: &str,
        state: &str,
        context: &str,
        description: &str,
    ) -> Result<(), GithubError>;

    /// Merge a pull request.
    async fn merge_pull(&self, project: &str, number: u64) -> Result<(), GithubError>;
}

/// A `GithubApi` implementation over the REST v3 API.
#[derive(Debug)]
pub struct RestGithubApi {
    client: reqwest::Client,
    api_root: String,
    token: Option<String>,
}

// Wire shapes for the handful of endpoints the driver consumes. Only the
// fields used are declared.

#[derive(Debug, Deserialize)]
struct WirePull {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    html_url: String,
    state: String,
    #[serde(default)]
    merged: bool,
    #[serde(default)]
    mergeable: Option<bool>,
    updated_at: DateTime<Utc>,
    head: WireRef,
    base: WireRef,
}

#[derive(Debug, Deserialize)]
struct WireRef {
    #[serde(default)]
    sha: String,
    #[serde(rename = "ref", default)]
    ref_name: String,
}

#[derive(Debug, Deserialize)]
struct WireFile {
    filename: String,
}

#[derive(Debug, Deserialize)]
struct WireStatus {
    state: String,
    context: String,
    #[serde(default)]
    creator: Option<WireUser>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct WireReview {
    user: WireUser,
    state: String,
    submitted_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct WirePermission {
    permission: String,
}

#[derive(Debug, Deserialize)]
struct WireBranch {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireSearchResults {
    items: Vec<WireSearchItem>,
}

#[derive(Debug, Deserialize)]
struct WireSearchItem {
    number: u64,
    repository_url: String,
}

impl RestGithubApi {
    /// Create a client for the given API root, e.g.
    /// `https://api.github.com`.
    pub fn new<R>(api_root: R, token: Option<String>) -> Self
    where
        R: Into<String>,
    {
        Self {
            client: reqwest::Client::new(),
            api_root: api_root.into(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.api_root, path);
        let mut req = self
            .client
            .request(method, url)
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", "ci-conductor");
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("token {}", token));
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, GithubError> {
        let rsp = req.send().await.map_err(|err| {
            GithubError::Http {
                details: format!("{}", err),
            }
        })?;
        let status = rsp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GithubError::NotFound {
                details: format!("{}", rsp.url()),
            });
        }
        if !status.is_success() {
            return Err(GithubError::Api {
                status: status.as_u16(),
                details: rsp.text().await.unwrap_or_default(),
            });
        }
        Ok(rsp)
    }

    async fn get_json<T>(&self, path: &str) -> Result<T, GithubError>
    where
        T: serde::de::DeserializeOwned,
    {
        let rsp = self.send(self.request(reqwest::Method::GET, path)).await?;
        rsp.json().await.map_err(|err| {
            GithubError::MalformedPayload {
                details: format!("{}", err),
            }
        })
    }
}

#[async_trait]
impl GithubApi for RestGithubApi {
    async fn get_pull(&self, project: &str, number: u64) -> Result<PullDetail, GithubError> {
        let wire: WirePull = self
            .get_json(&format!("repos/{}/pulls/{}", project, number))
            .await?;
        Ok(PullDetail {
            number: wire.number,
            title: wire.title,
            body: wire.body.unwrap_or_default(),
            html_url: wire.html_url,
            head_sha: wire.head.sha,
            branch: wire.base.ref_name,
            open: wire.state == "open",
            merged: wire.merged,
            mergeable: wire.mergeable,
            updated_at: wire.updated_at,
        })
    }

    async fn list_pull_files(
        &self,
        project: &str,
        number: u64,
    ) -> Result<Vec<String>, GithubError> {
        let wire: Vec<WireFile> = self
            .get_json(&format!("repos/{}/pulls/{}/files", project, number))
            .await?;
        Ok(wire.into_iter().map(|f| f.filename).collect())
    }

    async fn list_statuses(
        &self,
        project: &str,
        sha: &str,
    ) -> Result<Vec<StatusDetail>, GithubError> {
        let wire: Vec<WireStatus> = self
            .get_json(&format!("repos/{}/commits/{}/statuses", project, sha))
            .await?;
        Ok(wire
            .into_iter()
            .map(|s| {
                StatusDetail {
                    state: s.state,
                    context: s.context,
                    creator: s.creator.map(|u| u.login),
                    created_at: s.created_at,
                }
            })
            .collect())
    }

    async fn list_reviews(
        &self,
        project: &str,
        number: u64,
    ) -> Result<Vec<ReviewDetail>, GithubError> {
        let wire: Vec<WireReview> = self
            .get_json(&format!("repos/{}/pulls/{}/reviews", project, number))
            .await?;
        Ok(wire
            .into_iter()
            .map(|r| {
                ReviewDetail {
                    user: r.user.login,
                    state: r.state,
                    submitted_at: r.submitted_at,
                }
            })
            .collect())
    }

    async fn get_permission(&self, project: &str, login: &str) -> Result<String, GithubError> {
        let wire: WirePermission = self
            .get_json(&format!("repos/{}/collaborators/{}/permission", project, login))
            .await?;
        Ok(wire.permission)
    }

    async fn list_branches(&self, project: &str) -> Result<Vec<String>, GithubError> {
        let wire: Vec<WireBranch> = self
            .get_json(&format!("repos/{}/branches", project))
            .await?;
        Ok(wire.into_iter().map(|b| b.name).collect())
    }

    async fn search_pulls_mentioning(
        &self,
        text: &str,
    ) -> Result<Vec<(String, u64)>, GithubError> {
        let needle = text.replace(' ', "+");
        let query = format!("search/issues?q={}+type:pr+is:open", needle);
        let wire: WireSearchResults = self.get_json(&query).await?;
        Ok(wire
            .items
            .into_iter()
            .filter_map(|item| {
                // repository_url ends with "/repos/<org>/<project>".
                let mut parts = item.repository_url.rsplitn(3, '/');
                let project = parts.next()?;
                let org = parts.next()?;
                Some((format!("{}/{}", org, project), item.number))
            })
            .collect())
    }

    async fn comment(&self, project: &str, number: u64, body: &str) -> Result<(), GithubError> {
        let req = self
            .request(
                reqwest::Method::POST,
                &format!("repos/{}/issues/{}/comments", project, number),
            )
            .json(&json!({ "body": body }));
        self.send(req).await?;
        Ok(())
    }

    async fn set_status(
        &self,
        project: &str,
        sha: &str,
        state: &str,
        context: &str,
        description: &str,
    ) -> Result<(), GithubError> {
        let req = self
            .request(
                reqwest::Method::POST,
                &format!("repos/{}/statuses/{}", project, sha),
            )
            .json(&json!({
                "state": state,
                "context": context,
                "description": description,
            }));
        self.send(req).await?;
        Ok(())
    }

    async fn merge_pull(&self, project: &str, number: u64) -> Result<(), GithubError> {
        let req = self.request(
            reqwest::Method::PUT,
            &format!("repos/{}/pulls/{}/merge", project, number),
        );
        self.send(req).await?;
        Ok(())
    }
}
