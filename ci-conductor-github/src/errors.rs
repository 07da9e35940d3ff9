// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use ci_conductor_source::SourceError;
use thiserror::Error;

/// An error that may occur when working with GitHub.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GithubError {
    /// The webhook carried an event type the driver does not handle.
    ///
    /// The listener maps this to a 400 response.
    #[error("unhandled webhook event: {}", event)]
    UnhandledEvent {
        /// The event type from the header.
        event: String,
    },
    /// The webhook payload could not be decoded.
    #[error("malformed webhook payload: {}", details)]
    MalformedPayload {
        /// Details of the error.
        details: String,
    },
    /// A webhook secret is configured but the request carried no
    /// signature.
    ///
    /// The listener maps this to a 401 response.
    #[error("webhook request carried no signature")]
    MissingSignature,
    /// The webhook signature did not match the payload.
    ///
    /// The listener maps this to a 401 response.
    #[error("webhook signature does not match the payload")]
    SignatureMismatch,
    /// The requested object does not exist on GitHub.
    #[error("not found: {}", details)]
    NotFound {
        /// Details of the error.
        details: String,
    },
    /// The API rejected the request.
    #[error("api error ({}): {}", status, details)]
    Api {
        /// The HTTP status returned.
        status: u16,
        /// Details of the error.
        details: String,
    },
    /// The API could not be reached.
    #[error("cannot contact github: {}", details)]
    Http {
        /// Details of the error.
        details: String,
    },
}

/// Translate a driver error into the source contract's error type.
pub(crate) fn source_error(err: GithubError) -> SourceError {
    let details = format!("{}", err);
    match err {
        GithubError::NotFound {
            ..
        } => {
            SourceError::NotFound {
                change: details,
            }
        },
        GithubError::Api {
            status, ..
        } => {
            if status == 401 || status == 403 {
                SourceError::Auth {
                    details,
                }
            } else {
                SourceError::Other {
                    details,
                }
            }
        },
        GithubError::Http {
            ..
        } => {
            SourceError::Connection {
                details,
            }
        },
        _ => {
            SourceError::Other {
                details,
            }
        },
    }
}
