// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::HashMap;

use ci_conductor_core::data::{Approval, ApprovalKind, CommitStatus};
use regex::Regex;

use crate::{ReviewDetail, StatusDetail};

/// The login recorded for statuses whose creator is unknown.
pub const UNKNOWN_USER: &str = "Unknown";

/// Deduplicate the raw statuses of a head sha.
///
/// The effective status list keeps, per `(user, context)` pair, only the
/// newest status. Statuses without a creator are recorded under
/// `"Unknown"`.
pub fn effective_statuses(mut raw: Vec<StatusDetail>) -> Vec<CommitStatus> {
    raw.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let mut seen: Vec<(String, String)> = Vec::new();
    let mut statuses = Vec::new();
    for status in raw {
        let user = status
            .creator
            .unwrap_or_else(|| UNKNOWN_USER.to_string());
        let key = (user.clone(), status.context.clone());
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        statuses.push(CommitStatus::new(user, status.context, status.state));
    }
    statuses
}

/// Reduce the raw reviews of a pull request to the latest approval per
/// user.
///
/// `APPROVED` maps to `+2` when the reviewer has write permission on the
/// project and `+1` otherwise; `CHANGES_REQUESTED` to `-2` / `-1`
/// likewise; `COMMENTED` to a comment with value `0`. Review states the
/// platform may add later are ignored.
pub fn latest_approvals(
    reviews: Vec<ReviewDetail>,
    write_permission: &HashMap<String, bool>,
) -> Vec<Approval> {
    let mut latest: HashMap<String, ReviewDetail> = HashMap::new();
    for review in reviews {
        match latest.get(&review.user) {
            Some(existing) if existing.submitted_at >= review.submitted_at => {},
            _ => {
                latest.insert(review.user.clone(), review);
            },
        }
    }
    let mut approvals: Vec<_> = latest
        .into_values()
        .filter_map(|review| {
            let writer = write_permission
                .get(&review.user)
                .copied()
                .unwrap_or(false);
            let (kind, value) = match review.state.as_str() {
                "APPROVED" => (ApprovalKind::Approved, if writer { 2 } else { 1 }),
                "CHANGES_REQUESTED" => {
                    (ApprovalKind::ChangesRequested, if writer { -2 } else { -1 })
                },
                "COMMENTED" => (ApprovalKind::Comment, 0),
                _ => return None,
            };
            Some(Approval::new(review.user, kind, value, review.submitted_at))
        })
        .collect();
    approvals.sort_by(|a, b| a.user.cmp(&b.user));
    approvals
}

/// Extract the `Depends-On` references from a change message.
pub fn depends_on(message: &str) -> Vec<String> {
    let re = Regex::new(r"(?mi)^Depends-On:[ \t]*(\S+)[ \t]*$").expect("static pattern");
    re.captures_iter(message)
        .map(|caps| caps[1].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{Duration, Utc};
    use ci_conductor_core::data::ApprovalKind;

    use crate::normalize::{depends_on, effective_statuses, latest_approvals};
    use crate::{ReviewDetail, StatusDetail};

    fn status(creator: Option<&str>, context: &str, state: &str, age_mins: i64) -> StatusDetail {
        StatusDetail {
            state: state.into(),
            context: context.into(),
            creator: creator.map(Into::into),
            created_at: Utc::now() - Duration::minutes(age_mins),
        }
    }

    fn review(user: &str, state: &str, age_hours: i64) -> ReviewDetail {
        ReviewDetail {
            user: user.into(),
            state: state.into(),
            submitted_at: Utc::now() - Duration::hours(age_hours),
        }
    }

    #[test]
    fn test_statuses_deduplicate_keeping_newest() {
        let statuses = effective_statuses(vec![
            status(Some("conductor"), "check", "error", 60),
            status(Some("conductor"), "check", "success", 5),
            status(Some("conductor"), "gate", "pending", 10),
        ]);
        let tuples: Vec<_> = statuses.iter().map(|s| s.tuple()).collect();
        assert_eq!(
            tuples,
            ["conductor:check:success", "conductor:gate:pending"],
        );
    }

    #[test]
    fn test_status_without_creator_is_unknown() {
        let statuses = effective_statuses(vec![status(None, "check", "success", 0)]);
        assert_eq!(statuses[0].tuple(), "Unknown:check:success");
    }

    #[test]
    fn test_approved_value_depends_on_write_permission() {
        let mut writers = HashMap::new();
        writers.insert("derp".to_string(), true);
        writers.insert("herp".to_string(), false);
        let approvals = latest_approvals(
            vec![review("derp", "APPROVED", 1), review("herp", "APPROVED", 1)],
            &writers,
        );
        let derp = approvals.iter().find(|a| a.user == "derp").unwrap();
        let herp = approvals.iter().find(|a| a.user == "herp").unwrap();
        assert_eq!(derp.value, 2);
        assert_eq!(herp.value, 1);
    }

    #[test]
    fn test_changes_requested_is_negative() {
        let mut writers = HashMap::new();
        writers.insert("derp".to_string(), true);
        let approvals = latest_approvals(vec![review("derp", "CHANGES_REQUESTED", 1)], &writers);
        assert_eq!(approvals[0].kind, ApprovalKind::ChangesRequested);
        assert_eq!(approvals[0].value, -2);
    }

    #[test]
    fn test_latest_review_per_user_governs() {
        let mut writers = HashMap::new();
        writers.insert("derp".to_string(), true);
        let approvals = latest_approvals(
            vec![
                review("derp", "CHANGES_REQUESTED", 72),
                review("derp", "CHANGES_REQUESTED", 48),
                review("derp", "APPROVED", 0),
            ],
            &writers,
        );
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].kind, ApprovalKind::Approved);
        assert_eq!(approvals[0].value, 2);
    }

    #[test]
    fn test_commented_maps_to_comment() {
        let approvals = latest_approvals(vec![review("derp", "COMMENTED", 1)], &HashMap::new());
        assert_eq!(approvals[0].kind, ApprovalKind::Comment);
        assert_eq!(approvals[0].value, 0);
    }

    #[test]
    fn test_depends_on_extraction() {
        let message = "Add feature.\n\nDepends-On: https://github.example.com/org/lib/pull/4\ndepends-on: https://github.example.com/org/other/pull/9\n";
        assert_eq!(
            depends_on(message),
            [
                "https://github.example.com/org/lib/pull/4",
                "https://github.example.com/org/other/pull/9",
            ],
        );
        assert!(depends_on("no dependencies here").is_empty());
    }
}
