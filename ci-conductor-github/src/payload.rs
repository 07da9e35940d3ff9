// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use ci_conductor_core::data::{TriggerEvent, TriggerEventBuilder, TriggerEventKind};
use serde::Deserialize;

use crate::normalize::UNKNOWN_USER;
use crate::GithubError;

#[derive(Debug, Deserialize)]
struct PushBody {
    #[serde(rename = "ref")]
    ref_name: String,
    #[serde(default)]
    before: String,
    #[serde(default)]
    after: String,
    repository: RepositoryBody,
}

#[derive(Debug, Deserialize)]
struct RepositoryBody {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct SenderBody {
    login: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestBody {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    merged: bool,
    head: RefBody,
    base: RefBody,
}

#[derive(Debug, Deserialize)]
struct RefBody {
    #[serde(default)]
    sha: String,
    #[serde(rename = "ref", default)]
    ref_name: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestEventBody {
    action: String,
    pull_request: PullRequestBody,
    repository: RepositoryBody,
    #[serde(default)]
    label: Option<LabelBody>,
    #[serde(default)]
    sender: Option<SenderBody>,
}

#[derive(Debug, Deserialize)]
struct LabelBody {
    name: String,
}

#[derive(Debug, Deserialize)]
struct IssueCommentEventBody {
    action: String,
    issue: IssueBody,
    comment: CommentBody,
    repository: RepositoryBody,
    #[serde(default)]
    sender: Option<SenderBody>,
}

#[derive(Debug, Deserialize)]
struct IssueBody {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct CommentBody {
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct ReviewEventBody {
    action: String,
    review: ReviewBody,
    pull_request: PullRequestBody,
    repository: RepositoryBody,
    #[serde(default)]
    sender: Option<SenderBody>,
}

#[derive(Debug, Deserialize)]
struct ReviewBody {
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusEventBody {
    sha: String,
    context: String,
    state: String,
    repository: RepositoryBody,
    #[serde(default)]
    sender: Option<SenderBody>,
}

fn decode<'a, T>(body: &'a [u8]) -> Result<T, GithubError>
where
    T: Deserialize<'a>,
{
    serde_json::from_slice(body).map_err(|err| {
        GithubError::MalformedPayload {
            details: format!("{}", err),
        }
    })
}

fn sender_login(sender: Option<SenderBody>) -> String {
    sender
        .map(|s| s.login)
        .unwrap_or_else(|| UNKNOWN_USER.to_string())
}

fn pull_event(
    kind: TriggerEventKind,
    action: &str,
    connection: &str,
    hostname: &str,
    repository: &RepositoryBody,
    pull_request: &PullRequestBody,
) -> TriggerEventBuilder {
    TriggerEvent::builder()
        .kind(kind)
        .action(action)
        .connection(connection)
        .project_hostname(hostname)
        .project_name(repository.full_name.clone())
        .branch(pull_request.base.ref_name.clone())
        .change_number(pull_request.number)
        .patchset(pull_request.head.sha.clone())
        .refspec(format!("refs/pull/{}/head", pull_request.number))
        .change_url(pull_request.html_url.clone())
        .title(pull_request.title.clone())
}

/// Normalise one webhook request into a trigger event.
///
/// `event_type` is the value of the event-type header. Payloads which are
/// understood but describe no schedulable activity (e.g. a pull request
/// being assigned) yield `None`; unknown event types are an error so the
/// listener can reject them.
pub fn parse_event(
    connection: &str,
    hostname: &str,
    event_type: &str,
    body: &[u8],
) -> Result<Option<TriggerEvent>, GithubError> {
    match event_type {
        "push" => {
            let push: PushBody = decode(body)?;
            let mut builder = TriggerEvent::builder()
                .kind(TriggerEventKind::RefUpdated)
                .connection(connection)
                .project_hostname(hostname)
                .project_name(push.repository.full_name)
                .ref_name(push.ref_name.clone())
                .oldrev(push.before)
                .newrev(push.after);
            // Expose the branch so trigger filters can match against it.
            if let Some(branch) = push.ref_name.strip_prefix("refs/heads/") {
                builder = builder.branch(branch);
            }
            let event = builder.build().map_err(|err| {
                GithubError::MalformedPayload {
                    details: format!("{}", err),
                }
            })?;
            Ok(Some(event))
        },
        "pull_request" => {
            let pr: PullRequestEventBody = decode(body)?;
            let (kind, action) = match pr.action.as_str() {
                "opened" => (TriggerEventKind::PatchsetCreated, "opened"),
                "synchronize" => (TriggerEventKind::PatchsetCreated, "changed"),
                "reopened" => (TriggerEventKind::PatchsetCreated, "reopened"),
                "closed" => {
                    if pr.pull_request.merged {
                        (TriggerEventKind::ChangeMerged, "closed")
                    } else {
                        (TriggerEventKind::ChangeAbandoned, "closed")
                    }
                },
                "labeled" => (TriggerEventKind::CommentAdded, "labeled"),
                "unlabeled" => (TriggerEventKind::CommentAdded, "unlabeled"),
                _ => return Ok(None),
            };
            let mut builder = pull_event(
                kind,
                action,
                connection,
                hostname,
                &pr.repository,
                &pr.pull_request,
            )
            .account(sender_login(pr.sender));
            if let Some(label) = pr.label {
                builder = builder.label(label.name);
            }
            let event = builder.build().map_err(|err| {
                GithubError::MalformedPayload {
                    details: format!("{}", err),
                }
            })?;
            Ok(Some(event))
        },
        "issue_comment" => {
            let comment: IssueCommentEventBody = decode(body)?;
            if comment.action != "created" {
                return Ok(None);
            }
            let event = TriggerEvent::builder()
                .kind(TriggerEventKind::CommentAdded)
                .action("comment")
                .connection(connection)
                .project_hostname(hostname)
                .project_name(comment.repository.full_name)
                .change_number(comment.issue.number)
                .comment(comment.comment.body)
                .account(sender_login(comment.sender))
                .build()
                .map_err(|err| {
                    GithubError::MalformedPayload {
                        details: format!("{}", err),
                    }
                })?;
            Ok(Some(event))
        },
        "pull_request_review" => {
            let review: ReviewEventBody = decode(body)?;
            if review.action != "submitted" {
                return Ok(None);
            }
            let mut builder = pull_event(
                TriggerEventKind::CommentAdded,
                "submitted",
                connection,
                hostname,
                &review.repository,
                &review.pull_request,
            )
            .account(sender_login(review.sender));
            if let Some(body) = review.review.body {
                builder = builder.comment(body);
            }
            let event = builder.build().map_err(|err| {
                GithubError::MalformedPayload {
                    details: format!("{}", err),
                }
            })?;
            Ok(Some(event))
        },
        "status" => {
            let status: StatusEventBody = decode(body)?;
            let event = TriggerEvent::builder()
                .kind(TriggerEventKind::CommitStatus)
                .action("status")
                .connection(connection)
                .project_hostname(hostname)
                .project_name(status.repository.full_name)
                .patchset(status.sha)
                .status_context(status.context)
                .status_state(status.state)
                .account(sender_login(status.sender))
                .build()
                .map_err(|err| {
                    GithubError::MalformedPayload {
                        details: format!("{}", err),
                    }
                })?;
            Ok(Some(event))
        },
        _ => {
            Err(GithubError::UnhandledEvent {
                event: event_type.into(),
            })
        },
    }
}
