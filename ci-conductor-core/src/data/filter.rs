// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use chrono::{DateTime, Duration, Utc};
use derive_builder::Builder;
use regex::Regex;

use crate::data::{Approval, ApprovalKind, Change, TriggerEvent, TriggerEventKind};

/// A constraint on the review approvals of a change.
///
/// All configured fields must match the same approval.
#[derive(Debug, Clone, Default, Builder)]
#[builder(pattern = "owned", default)]
#[non_exhaustive]
pub struct ApprovalRequirement {
    /// The login the approval must come from.
    #[builder(setter(into, strip_option))]
    pub username: Option<String>,
    /// The kind the approval must have.
    #[builder(setter(strip_option))]
    pub kind: Option<ApprovalKind>,
    /// The minimum value the approval must carry.
    #[builder(setter(strip_option))]
    pub value: Option<i8>,
    /// The approval must have been granted within this window.
    #[builder(setter(strip_option))]
    pub newer_than: Option<Duration>,
    /// The approval must have been granted before this window.
    #[builder(setter(strip_option))]
    pub older_than: Option<Duration>,
}

impl ApprovalRequirement {
    /// Create a builder for the structure.
    pub fn builder() -> ApprovalRequirementBuilder {
        ApprovalRequirementBuilder::default()
    }

    /// Whether the given approval satisfies this requirement.
    pub fn matches(&self, approval: &Approval, now: DateTime<Utc>) -> bool {
        if let Some(username) = &self.username {
            if &approval.user != username {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if approval.kind != kind {
                return false;
            }
        }
        if let Some(value) = self.value {
            if approval.value < value {
                return false;
            }
        }
        if let Some(newer_than) = self.newer_than {
            if approval.granted_on < now - newer_than {
                return false;
            }
        }
        if let Some(older_than) = self.older_than {
            if approval.granted_on > now - older_than {
                return false;
            }
        }
        true
    }

    /// Whether any of the change's approvals satisfies this requirement.
    pub fn matches_change(&self, change: &Change, now: DateTime<Utc>) -> bool {
        change
            .as_pull_request()
            .map(|pr| pr.approvals.iter().any(|a| self.matches(a, now)))
            .unwrap_or(false)
    }
}

/// A trigger filter: decides whether an event-change pair enters a
/// pipeline.
#[derive(Debug, Clone, Default, Builder)]
#[builder(pattern = "owned", default)]
#[non_exhaustive]
pub struct EventFilter {
    /// Event kinds which match; empty matches any kind.
    pub kinds: Vec<TriggerEventKind>,
    /// Platform actions which match; empty matches any action.
    pub actions: Vec<String>,
    /// Branch patterns the change must target.
    pub branches: Vec<Regex>,
    /// Ref patterns the event must concern.
    pub refs: Vec<Regex>,
    /// Patterns the comment body must contain.
    pub comments: Vec<Regex>,
    /// Labels the event must carry.
    pub labels: Vec<String>,
    /// Approvals the change must carry.
    pub require_approvals: Vec<ApprovalRequirement>,
    /// Approvals the change must not carry.
    pub reject_approvals: Vec<ApprovalRequirement>,
    /// `user:context:state` tuples the change must carry.
    pub require_statuses: Vec<String>,
    /// `user:context:state` tuples the change must not carry.
    pub reject_statuses: Vec<String>,
    /// Patterns the event account must match.
    pub require_usernames: Vec<Regex>,
    /// Patterns the event account must not match.
    pub reject_usernames: Vec<Regex>,
}

impl EventFilter {
    /// Create a builder for the structure.
    pub fn builder() -> EventFilterBuilder {
        EventFilterBuilder::default()
    }

    /// Whether the event-change pair passes the filter.
    pub fn matches(&self, event: &TriggerEvent, change: &Change, now: DateTime<Utc>) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.actions.is_empty() {
            let matched = event
                .action
                .as_ref()
                .map(|a| self.actions.contains(a))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        if !self.branches.is_empty() {
            let branch = change.branch().or(event.branch.as_deref());
            let matched = branch
                .map(|b| self.branches.iter().any(|re| re.is_match(b)))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        if !self.refs.is_empty() {
            let matched = event
                .ref_name
                .as_deref()
                .map(|r| self.refs.iter().any(|re| re.is_match(r)))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        if !self.comments.is_empty() {
            let matched = event
                .comment
                .as_deref()
                .map(|c| self.comments.iter().any(|re| re.is_match(c)))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        if !self.labels.is_empty() {
            let matched = event
                .label
                .as_ref()
                .map(|l| self.labels.contains(l))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        if !self.require_usernames.is_empty() {
            let matched = event
                .account
                .as_deref()
                .map(|a| self.require_usernames.iter().any(|re| re.is_match(a)))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        if let Some(account) = event.account.as_deref() {
            if self.reject_usernames.iter().any(|re| re.is_match(account)) {
                return false;
            }
        }
        if !self
            .require_approvals
            .iter()
            .all(|req| req.matches_change(change, now))
        {
            return false;
        }
        if self
            .reject_approvals
            .iter()
            .any(|req| req.matches_change(change, now))
        {
            return false;
        }
        if !statuses_match(&self.require_statuses, &self.reject_statuses, change) {
            return false;
        }
        true
    }
}

/// A pipeline requirement: a constraint a change must satisfy regardless of
/// which event brought it in.
#[derive(Debug, Clone, Default, Builder)]
#[builder(pattern = "owned", default)]
#[non_exhaustive]
pub struct ChangeFilter {
    /// Whether the change must be open (or closed).
    #[builder(setter(strip_option))]
    pub open: Option<bool>,
    /// `user:context:state` tuples the change must carry.
    pub require_statuses: Vec<String>,
    /// Approvals the change must carry.
    pub require_approvals: Vec<ApprovalRequirement>,
    /// Approvals the change must not carry.
    pub reject_approvals: Vec<ApprovalRequirement>,
}

impl ChangeFilter {
    /// Create a builder for the structure.
    pub fn builder() -> ChangeFilterBuilder {
        ChangeFilterBuilder::default()
    }

    /// Whether the change satisfies the requirement.
    ///
    /// Ref changes carry no review metadata and satisfy only requirements
    /// with no review constraints.
    pub fn matches(&self, change: &Change, now: DateTime<Utc>) -> bool {
        if let Some(open) = self.open {
            let is_open = change
                .as_pull_request()
                .map(|pr| pr.open)
                .unwrap_or(false);
            if is_open != open {
                return false;
            }
        }
        if !statuses_match(&self.require_statuses, &[], change) {
            return false;
        }
        if !self
            .require_approvals
            .iter()
            .all(|req| req.matches_change(change, now))
        {
            return false;
        }
        if self
            .reject_approvals
            .iter()
            .any(|req| req.matches_change(change, now))
        {
            return false;
        }
        true
    }
}

fn statuses_match(required: &[String], rejected: &[String], change: &Change) -> bool {
    if required.is_empty() && rejected.is_empty() {
        return true;
    }
    let tuples = match change.as_pull_request() {
        Some(pr) => pr.status_tuples(),
        None => return required.is_empty(),
    };
    if !required.iter().all(|req| tuples.contains(req)) {
        return false;
    }
    if rejected.iter().any(|rej| tuples.contains(rej)) {
        return false;
    }
    true
}
