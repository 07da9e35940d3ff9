// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use chrono::Utc;

use crate::data::{Change, Project, PullRequest, RefUpdate};

macro_rules! assert_missing_field {
    ($err:expr, $type:tt, $field:expr $(,)?) => {
        let in_err = $err;
        let in_field = $field;
        if let $type::UninitializedField(field) = in_err {
            assert_eq!(field, in_field);
        } else {
            panic!(
                "unexpected error (expected to be missing `{}`): {:?}",
                in_field, in_err,
            );
        }
    };
}
pub(crate) use assert_missing_field;

pub(crate) fn project(name: &str) -> Project {
    Project::builder()
        .canonical_hostname("github.example.com")
        .name(name)
        .connection("github")
        .build()
        .unwrap()
}

pub(crate) fn pull_request(project_name: &str, number: u64, patchset: &str) -> Change {
    Change::PullRequest(
        PullRequest::builder()
            .project(project(project_name))
            .number(number)
            .patchset(patchset)
            .branch("master")
            .refspec(format!("refs/pull/{}/head", number))
            .updated_at(Utc::now())
            .build()
            .unwrap(),
    )
}

pub(crate) fn ref_update(project_name: &str, ref_name: &str) -> Change {
    Change::Ref(
        RefUpdate::builder()
            .project(project(project_name))
            .ref_name(ref_name)
            .oldrev("0000000000000000000000000000000000000000")
            .newrev("1111111111111111111111111111111111111111")
            .build()
            .unwrap(),
    )
}
