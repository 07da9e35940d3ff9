// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::GithubError;

type HmacSha1 = Hmac<Sha1>;

/// Validate a webhook request signature.
///
/// The signature header carries `sha1=<hex>` where the digest is the
/// HMAC-SHA1 of the raw request body keyed with the shared webhook secret.
/// Validation is skipped when no secret is configured.
pub fn validate_signature(
    secret: Option<&str>,
    body: &[u8],
    signature: Option<&str>,
) -> Result<(), GithubError> {
    let Some(secret) = secret else {
        return Ok(());
    };
    let Some(signature) = signature else {
        return Err(GithubError::MissingSignature);
    };
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|_| GithubError::SignatureMismatch)?;
    mac.update(body);
    let expected = format!("sha1={}", hex::encode(mac.finalize().into_bytes()));
    if expected != signature {
        return Err(GithubError::SignatureMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use hmac::{Hmac, Mac};
    use sha1::Sha1;

    use crate::{validate_signature, GithubError};

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_no_secret_skips_validation() {
        assert!(validate_signature(None, b"{}", None).is_ok());
    }

    #[test]
    fn test_valid_signature() {
        let body = br#"{"action": "opened"}"#;
        let signature = sign("hunter2", body);
        assert!(validate_signature(Some("hunter2"), body, Some(&signature)).is_ok());
    }

    #[test]
    fn test_missing_signature() {
        let err = validate_signature(Some("hunter2"), b"{}", None).unwrap_err();
        if let GithubError::MissingSignature = err {
        } else {
            panic!("unexpected error: {:?}", err);
        }
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = br#"{"action": "opened"}"#;
        let signature = sign("wrong", body);
        let err = validate_signature(Some("hunter2"), body, Some(&signature)).unwrap_err();
        if let GithubError::SignatureMismatch = err {
        } else {
            panic!("unexpected error: {:?}", err);
        }
    }

    #[test]
    fn test_tampered_body_rejected() {
        let signature = sign("hunter2", b"{}");
        let err =
            validate_signature(Some("hunter2"), b"{\"a\":1}", Some(&signature)).unwrap_err();
        if let GithubError::SignatureMismatch = err {
        } else {
            panic!("unexpected error: {:?}", err);
        }
    }
}
