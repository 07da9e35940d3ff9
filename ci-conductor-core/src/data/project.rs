// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use derive_builder::Builder;

/// A project hosted on a code-review platform.
///
/// A project is identified by the canonical hostname of the platform it
/// lives on together with its name there; the connection field names the
/// source connection through which it is reached.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
#[builder(pattern = "owned")]
#[non_exhaustive]
pub struct Project {
    /// The canonical hostname of the platform hosting the project.
    #[builder(setter(into))]
    pub canonical_hostname: String,
    /// The name of the project, e.g. `org/project`.
    #[builder(setter(into))]
    pub name: String,
    /// The name of the source connection the project is reached through.
    #[builder(setter(into))]
    pub connection: String,
}

impl Project {
    /// Create a builder for the structure.
    pub fn builder() -> ProjectBuilder {
        ProjectBuilder::default()
    }

    /// The fully-qualified name of the project, unique across connections.
    pub fn canonical_name(&self) -> String {
        format!("{}/{}", self.canonical_hostname, self.name)
    }
}
