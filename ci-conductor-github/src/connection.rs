// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ci_conductor_core::data::{Change, Project, PullRequest, RefUpdate, TriggerEvent};
use ci_conductor_source::{ReportPhase, SourceConnection, SourceError};

use crate::errors::source_error;
use crate::normalize::{depends_on, effective_statuses, latest_approvals};
use crate::{GithubApi, GithubError};

/// A source connection to a GitHub host.
pub struct GithubConnection {
    name: String,
    canonical_hostname: String,
    api: Arc<dyn GithubApi>,
    cache: Mutex<HashMap<(String, u64), Change>>,
}

impl GithubConnection {
    /// Create a connection.
    pub fn new<N, H>(name: N, canonical_hostname: H, api: Arc<dyn GithubApi>) -> Self
    where
        N: Into<String>,
        H: Into<String>,
    {
        Self {
            name: name.into(),
            canonical_hostname: canonical_hostname.into(),
            api,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn project(&self, name: &str) -> Result<Project, SourceError> {
        Project::builder()
            .canonical_hostname(self.canonical_hostname.clone())
            .name(name)
            .connection(self.name.clone())
            .build()
            .map_err(|err| {
                SourceError::Other {
                    details: format!("{}", err),
                }
            })
    }

    fn cached_by_sha(&self, sha: &str) -> Option<(String, u64)> {
        let cache = self.cache.lock().expect("cache lock poisoned");
        cache
            .iter()
            .find(|(_, change)| {
                change
                    .as_pull_request()
                    .map(|pr| pr.patchset == sha)
                    .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())
    }

    /// Fetch a pull request and assemble the change it represents.
    async fn get_pull_change(
        &self,
        project_name: &str,
        number: u64,
        source_event: Option<&TriggerEvent>,
    ) -> Result<Change, SourceError> {
        let pull = self
            .api
            .get_pull(project_name, number)
            .await
            .map_err(source_error)?;
        let files = self
            .api
            .list_pull_files(project_name, number)
            .await
            .map_err(source_error)?;
        let raw_statuses = self
            .api
            .list_statuses(project_name, &pull.head_sha)
            .await
            .map_err(source_error)?;
        let reviews = self
            .api
            .list_reviews(project_name, number)
            .await
            .map_err(source_error)?;

        let mut write_permission = HashMap::new();
        for review in &reviews {
            if write_permission.contains_key(&review.user) {
                continue;
            }
            let permission = self
                .api
                .get_permission(project_name, &review.user)
                .await
                .map_err(source_error)?;
            let writer = permission == "admin" || permission == "write";
            write_permission.insert(review.user.clone(), writer);
        }

        let project = self.project(project_name)?;
        let mut builder = PullRequest::builder()
            .project(project)
            .number(pull.number)
            .patchset(pull.head_sha)
            .branch(pull.branch)
            .refspec(format!("refs/pull/{}/head", pull.number))
            .url(pull.html_url)
            .title(pull.title)
            .message(pull.body)
            .updated_at(pull.updated_at)
            .files(files)
            .statuses(effective_statuses(raw_statuses))
            .approvals(latest_approvals(reviews, &write_permission))
            .open(pull.open)
            .merged(pull.merged);
        if let Some(event) = source_event {
            builder = builder.source_event(event.clone());
        }
        let change = Change::PullRequest(builder.build().map_err(|err| {
            SourceError::Other {
                details: format!("{}", err),
            }
        })?);

        let mut cache = self.cache.lock().expect("cache lock poisoned");
        cache.insert((project_name.into(), number), change.clone());
        Ok(change)
    }

    fn parse_change_url(&self, url: &str) -> Option<(String, u64)> {
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))?;
        let (host, path) = rest.split_once('/')?;
        if host != self.canonical_hostname {
            return None;
        }
        let mut segments = path.split('/');
        let org = segments.next()?;
        let project = segments.next()?;
        let marker = segments.next()?;
        let number = segments.next()?.parse().ok()?;
        if marker != "pull" {
            return None;
        }
        Some((format!("{}/{}", org, project), number))
    }
}

#[async_trait]
impl SourceConnection for GithubConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn canonical_hostname(&self) -> &str {
        &self.canonical_hostname
    }

    async fn get_change(&self, event: &TriggerEvent) -> Result<Change, SourceError> {
        if event.connection != self.name {
            return Err(SourceError::NotFound {
                change: format!("{} (foreign connection)", event.change_key()),
            });
        }
        if let Some(number) = event.change_number {
            return self
                .get_pull_change(&event.project_name, number, Some(event))
                .await;
        }
        if let Some(ref_name) = &event.ref_name {
            let project = self.project(&event.project_name)?;
            let update = RefUpdate::builder()
                .project(project)
                .ref_name(ref_name.clone())
                .oldrev(event.oldrev.clone().unwrap_or_default())
                .newrev(event.newrev.clone().unwrap_or_default())
                .build()
                .map_err(|err| {
                    SourceError::Other {
                        details: format!("{}", err),
                    }
                })?;
            return Ok(Change::Ref(update));
        }
        // Commit-status payloads only carry a sha; recognise the change if
        // it has been seen before.
        if let Some(sha) = &event.patchset {
            if let Some((project, number)) = self.cached_by_sha(sha) {
                return self.get_pull_change(&project, number, Some(event)).await;
            }
        }
        Err(SourceError::NotFound {
            change: event.change_key(),
        })
    }

    async fn get_project(&self, name: &str) -> Result<Project, SourceError> {
        self.project(name)
    }

    async fn get_project_branches(&self, project: &Project) -> Result<Vec<String>, SourceError> {
        self.api
            .list_branches(&project.name)
            .await
            .map_err(source_error)
    }

    async fn get_needed_changes(&self, change: &Change) -> Result<Vec<Change>, SourceError> {
        let Some(pr) = change.as_pull_request() else {
            return Ok(Vec::new());
        };
        let mut needed = Vec::new();
        for url in depends_on(&pr.message) {
            let Some((project, number)) = self.parse_change_url(&url) else {
                continue;
            };
            needed.push(self.get_pull_change(&project, number, None).await?);
        }
        Ok(needed)
    }

    async fn get_changes_depending_on(
        &self,
        change: &Change,
    ) -> Result<Vec<Change>, SourceError> {
        let Some(pr) = change.as_pull_request() else {
            return Ok(Vec::new());
        };
        let needle = format!("Depends-On: {}", pr.url);
        let hits = self
            .api
            .search_pulls_mentioning(&needle)
            .await
            .map_err(source_error)?;
        let mut dependents = Vec::new();
        for (project, number) in hits {
            dependents.push(self.get_pull_change(&project, number, None).await?);
        }
        Ok(dependents)
    }

    async fn can_merge(&self, change: &Change) -> Result<bool, SourceError> {
        let Some(pr) = change.as_pull_request() else {
            return Ok(false);
        };
        let pull = self
            .api
            .get_pull(&pr.project.name, pr.number)
            .await
            .map_err(source_error)?;
        // GitHub may report null while it computes mergeability; treat
        // that as mergeable rather than wedging the queue.
        Ok(pull.open && pull.mergeable.unwrap_or(true))
    }

    async fn report(
        &self,
        change: &Change,
        _phase: ReportPhase,
        message: &str,
    ) -> Result<(), SourceError> {
        let Some(pr) = change.as_pull_request() else {
            return Err(SourceError::Unsupported {
                operation: "report on a ref update".into(),
            });
        };
        self.api
            .comment(&pr.project.name, pr.number, message)
            .await
            .map_err(source_error)
    }

    async fn set_commit_status(
        &self,
        change: &Change,
        context: &str,
        state: &str,
        description: &str,
    ) -> Result<(), SourceError> {
        let Some(pr) = change.as_pull_request() else {
            return Err(SourceError::Unsupported {
                operation: "status on a ref update".into(),
            });
        };
        self.api
            .set_status(&pr.project.name, &pr.patchset, state, context, description)
            .await
            .map_err(source_error)
    }

    async fn merge_change(&self, change: &Change) -> Result<(), SourceError> {
        let Some(pr) = change.as_pull_request() else {
            return Err(SourceError::Unsupported {
                operation: "merge a ref update".into(),
            });
        };
        self.api
            .merge_pull(&pr.project.name, pr.number)
            .await
            .map_err(source_error)
    }

    async fn maintain_cache(&self, relevant: &[String]) {
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        cache.retain(|_, change| relevant.contains(&change.id()));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Utc;
    use ci_conductor_core::data::{TriggerEvent, TriggerEventKind};
    use ci_conductor_source::SourceConnection;

    use crate::{GithubApi, GithubConnection, GithubError, PullDetail, ReviewDetail, StatusDetail};

    #[derive(Default)]
    struct StubApi {
        pulls: HashMap<(String, u64), PullDetail>,
        statuses: Mutex<HashMap<String, Vec<StatusDetail>>>,
        reviews: Mutex<HashMap<(String, u64), Vec<ReviewDetail>>>,
        writers: HashMap<(String, String), String>,
        comments: Mutex<Vec<(String, u64, String)>>,
    }

    fn pull(number: u64, sha: &str) -> PullDetail {
        PullDetail {
            number,
            title: "A change".into(),
            body: String::new(),
            html_url: format!("https://github.example.com/org/project/pull/{}", number),
            head_sha: sha.into(),
            branch: "master".into(),
            open: true,
            merged: false,
            mergeable: Some(true),
            updated_at: Utc::now(),
        }
    }

    #[async_trait]
    impl GithubApi for StubApi {
        async fn get_pull(
            &self,
            project: &str,
            number: u64,
        ) -> Result<PullDetail, GithubError> {
            self.pulls
                .get(&(project.to_string(), number))
                .cloned()
                .ok_or_else(|| {
                    GithubError::NotFound {
                        details: format!("{}#{}", project, number),
                    }
                })
        }

        async fn list_pull_files(
            &self,
            _project: &str,
            _number: u64,
        ) -> Result<Vec<String>, GithubError> {
            Ok(vec!["src/lib.rs".into()])
        }

        async fn list_statuses(
            &self,
            _project: &str,
            sha: &str,
        ) -> Result<Vec<StatusDetail>, GithubError> {
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .get(sha)
                .cloned()
                .unwrap_or_default())
        }

        async fn list_reviews(
            &self,
            project: &str,
            number: u64,
        ) -> Result<Vec<ReviewDetail>, GithubError> {
            Ok(self
                .reviews
                .lock()
                .unwrap()
                .get(&(project.to_string(), number))
                .cloned()
                .unwrap_or_default())
        }

        async fn get_permission(
            &self,
            project: &str,
            login: &str,
        ) -> Result<String, GithubError> {
            Ok(self
                .writers
                .get(&(project.to_string(), login.to_string()))
                .cloned()
                .unwrap_or_else(|| "read".into()))
        }

        async fn list_branches(&self, _project: &str) -> Result<Vec<String>, GithubError> {
            Ok(vec!["master".into()])
        }

        async fn search_pulls_mentioning(
            &self,
            _text: &str,
        ) -> Result<Vec<(String, u64)>, GithubError> {
            Ok(Vec::new())
        }

        async fn comment(
            &self,
            project: &str,
            number: u64,
            body: &str,
        ) -> Result<(), GithubError> {
            self.comments
                .lock()
                .unwrap()
                .push((project.into(), number, body.into()));
            Ok(())
        }

        async fn set_status(
            &self,
            _project: &str,
            _sha: &str,
            _state: &str,
            _context: &str,
            _description: &str,
        ) -> Result<(), GithubError> {
            Ok(())
        }

        async fn merge_pull(&self, _project: &str, _number: u64) -> Result<(), GithubError> {
            Ok(())
        }
    }

    fn event(number: u64, sha: &str) -> TriggerEvent {
        TriggerEvent::builder()
            .kind(TriggerEventKind::PatchsetCreated)
            .action("opened")
            .connection("github")
            .project_hostname("github.example.com")
            .project_name("org/project")
            .change_number(number)
            .patchset(sha)
            .build()
            .unwrap()
    }

    fn connection(api: StubApi) -> GithubConnection {
        GithubConnection::new("github", "github.example.com", Arc::new(api))
    }

    #[tokio::test]
    async fn test_get_change_builds_pull_request() {
        let mut api = StubApi::default();
        api.pulls
            .insert(("org/project".into(), 12), pull(12, "deadbeef"));
        api.statuses.lock().unwrap().insert(
            "deadbeef".into(),
            vec![StatusDetail {
                state: "success".into(),
                context: "check".into(),
                creator: Some("conductor".into()),
                created_at: Utc::now(),
            }],
        );
        api.reviews.lock().unwrap().insert(
            ("org/project".into(), 12),
            vec![ReviewDetail {
                user: "derp".into(),
                state: "APPROVED".into(),
                submitted_at: Utc::now(),
            }],
        );
        api.writers
            .insert(("org/project".into(), "derp".into()), "write".into());

        let connection = connection(api);
        let change = connection.get_change(&event(12, "deadbeef")).await.unwrap();
        let pr = change.as_pull_request().unwrap();
        assert_eq!(pr.number, 12);
        assert_eq!(pr.patchset, "deadbeef");
        assert_eq!(pr.status_tuples(), ["conductor:check:success"]);
        assert_eq!(pr.approvals.len(), 1);
        assert_eq!(pr.approvals[0].value, 2);
    }

    #[tokio::test]
    async fn test_foreign_connection_is_not_found() {
        let connection = connection(StubApi::default());
        let mut foreign = event(12, "deadbeef");
        foreign.connection = "gerrit".into();
        let err = connection.get_change(&foreign).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_status_event_resolved_from_cache() {
        let mut api = StubApi::default();
        api.pulls
            .insert(("org/project".into(), 12), pull(12, "deadbeef"));
        let connection = connection(api);

        // Prime the cache through a regular event.
        connection.get_change(&event(12, "deadbeef")).await.unwrap();

        let status_event = TriggerEvent::builder()
            .kind(TriggerEventKind::CommitStatus)
            .connection("github")
            .project_name("org/project")
            .patchset("deadbeef")
            .status_context("check")
            .status_state("success")
            .build()
            .unwrap();
        let change = connection.get_change(&status_event).await.unwrap();
        assert_eq!(change.as_pull_request().unwrap().number, 12);
    }

    #[tokio::test]
    async fn test_status_event_for_unknown_sha_is_not_found() {
        let connection = connection(StubApi::default());
        let status_event = TriggerEvent::builder()
            .kind(TriggerEventKind::CommitStatus)
            .connection("github")
            .project_name("org/project")
            .patchset("deadbeef")
            .build()
            .unwrap();
        let err = connection.get_change(&status_event).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_needed_changes_follow_depends_on() {
        let mut api = StubApi::default();
        api.pulls
            .insert(("org/project".into(), 12), pull(12, "deadbeef"));
        let mut dep = pull(4, "cafe");
        dep.html_url = "https://github.example.com/org/lib/pull/4".into();
        api.pulls.insert(("org/lib".into(), 4), dep);
        let connection = connection(api);

        let mut change = connection.get_change(&event(12, "deadbeef")).await.unwrap();
        if let ci_conductor_core::data::Change::PullRequest(pr) = &mut change {
            pr.message = "Depends-On: https://github.example.com/org/lib/pull/4".into();
        }
        let needed = connection.get_needed_changes(&change).await.unwrap();
        assert_eq!(needed.len(), 1);
        assert_eq!(needed[0].as_pull_request().unwrap().number, 4);

        // References to other hosts are ignored.
        if let ci_conductor_core::data::Change::PullRequest(pr) = &mut change {
            pr.message = "Depends-On: https://elsewhere.example.com/org/lib/pull/4".into();
        }
        assert!(connection
            .get_needed_changes(&change)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_maintain_cache_prunes_stale_entries() {
        let mut api = StubApi::default();
        api.pulls
            .insert(("org/project".into(), 12), pull(12, "deadbeef"));
        let connection = connection(api);
        connection.get_change(&event(12, "deadbeef")).await.unwrap();
        assert!(connection.cached_by_sha("deadbeef").is_some());

        connection.maintain_cache(&[]).await;
        assert!(connection.cached_by_sha("deadbeef").is_none());
    }
}
