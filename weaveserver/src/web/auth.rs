//! Parsing and authentication of Hawk headers.
//!
//! The Hawk `id` property carries a signed JSON payload issued by the
//! tokenserver; the per-request MAC is keyed by a secret derived from that
//! id. Matches the python tokenlib scheme.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use actix_web::dev::ConnectionInfo;
use base64::{engine, Engine};
use hawk::{DigestAlgorithm, Header as HawkHeader, Key, RequestBuilder};
use hmac::{Hmac, Mac};
use http::Uri;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use weaveserver_common::hkdf_expand_32;
use weaveserver_settings::{Secret, Secrets};

use super::{
    error::{HawkErrorKind, ValidationErrorKind},
    extractors::RequestErrorLocation,
};
use crate::error::{ApiErrorKind, ApiResult};

/// A parsed and authenticated JSON payload extracted from the signed `id`
/// property of a Hawk `Authorization` header.
#[derive(Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct HawkPayload {
    /// Expiry time for the payload, in seconds.
    pub expires: f64,

    /// Base URI for the storage node.
    pub node: String,

    /// Salt used during HKDF-expansion of the token secret.
    pub salt: String,

    /// User identifier.
    #[serde(rename = "uid")]
    pub user_id: u64,

    #[serde(default)]
    pub fxa_uid: String,

    #[serde(default)]
    pub fxa_kid: String,

    #[serde(default)]
    pub hashed_fxa_uid: String,

    #[serde(default)]
    pub hashed_device_id: String,
}

impl HawkPayload {
    /// Parse and authenticate a payload using the supplied arguments.
    ///
    /// Assumes that the header string includes the `Hawk ` prefix.
    fn new(
        header: &str,
        method: &str,
        path: &str,
        host: &str,
        port: u16,
        secrets: &Secrets,
        expiry: u64,
    ) -> ApiResult<HawkPayload> {
        if header.len() < 5 || &header[0..5] != "Hawk " {
            Err(HawkErrorKind::MissingPrefix)?;
        }

        let header: HawkHeader = header[5..].parse()?;
        let id = header.id.as_ref().ok_or(HawkErrorKind::MissingId)?;

        // Secrets rotate: verification tries each known secret, newest
        // first. Signing (on the tokenserver side) always uses the newest.
        let mut result = Err(HawkErrorKind::InvalidHeader.into());
        for secret in secrets.iter() {
            match Self::validate_against_secret(&header, id, method, path, host, port, secret, expiry)
            {
                Ok(payload) => return Ok(payload),
                Err(e) => result = Err(e),
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn validate_against_secret(
        header: &HawkHeader,
        id: &str,
        method: &str,
        path: &str,
        host: &str,
        port: u16,
        secret: &Secret,
        expiry: u64,
    ) -> ApiResult<HawkPayload> {
        let payload = HawkPayload::extract_and_validate(id, secret, expiry)?;

        let token_secret = hkdf_expand_32(
            format!("services.mozilla.com/tokenlib/v1/derive/{}", id).as_bytes(),
            Some(payload.salt.as_bytes()),
            &secret.master_secret,
        )
        .map_err(ApiErrorKind::Internal)?;
        let token_secret = engine::general_purpose::URL_SAFE.encode(token_secret);

        let request = RequestBuilder::new(method, host, port, path).request();
        if request.validate_header(
            header,
            &Key::new(token_secret.as_bytes(), DigestAlgorithm::Sha256)
                .map_err(|e| ApiErrorKind::Internal(format!("HAWK key error: {}", e)))?,
            // Allow plenty of leeway for clock skew, because client
            // timestamps tend to be all over the shop
            Duration::from_secs(3600 * 24 * 365),
        ) {
            Ok(payload)
        } else {
            Err(HawkErrorKind::InvalidHeader)?
        }
    }

    /// Decode the `id` property of a Hawk header and verify the payload
    /// part against the signature part.
    fn extract_and_validate(id: &str, secret: &Secret, expiry: u64) -> ApiResult<HawkPayload> {
        let decoded_id = engine::general_purpose::URL_SAFE.decode(id)?;
        if decoded_id.len() <= 32 {
            Err(HawkErrorKind::TruncatedId)?;
        }

        let payload_length = decoded_id.len() - 32;
        let payload = &decoded_id[0..payload_length];
        let signature = &decoded_id[payload_length..];

        verify_hmac(payload, &secret.signing_secret, signature)?;

        let payload: HawkPayload = serde_json::from_slice(payload)?;

        if (payload.expires.round() as u64) > expiry {
            Ok(payload)
        } else {
            Err(HawkErrorKind::Expired)?
        }
    }

    pub fn extrude(
        header: &str,
        method: &str,
        secrets: &Secrets,
        ci: &ConnectionInfo,
        uri: &Uri,
    ) -> ApiResult<HawkPayload> {
        let host_port: Vec<_> = ci.host().splitn(2, ':').collect();
        let host = host_port[0];
        let port = if host_port.len() == 2 {
            host_port[1].parse().map_err(|_| {
                ValidationErrorKind::FromDetails(
                    "Invalid port (hostname:port) specified".to_owned(),
                    RequestErrorLocation::Header,
                    None,
                    None,
                )
            })?
        } else if ci.scheme() == "https" {
            443
        } else {
            80
        };

        let path = uri
            .path_and_query()
            .ok_or(HawkErrorKind::MissingPath)?
            .as_str();
        let expiry = if path.starts_with("/1.5") {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        } else {
            0
        };

        HawkPayload::new(header, method, path, host, port, secrets, expiry)
    }

    #[cfg(test)]
    pub fn test_default(user_id: u64) -> Self {
        HawkPayload {
            expires: (SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_secs() as f64)
                + 200_000.0,
            node: "friendly-node".to_string(),
            salt: "saltysalt".to_string(),
            user_id,
            fxa_uid: "xxx_test".to_owned(),
            fxa_kid: "xxx_test_kid".to_owned(),
            hashed_fxa_uid: "xxx_test_hashed".to_owned(),
            hashed_device_id: "xxx_test_device".to_owned(),
        }
    }
}

/// Helper function for [HMAC](https://tools.ietf.org/html/rfc2104) verification.
fn verify_hmac(info: &[u8], key: &[u8], expected: &[u8]) -> ApiResult<()> {
    let mut hmac: Hmac<Sha256> = Hmac::new_from_slice(key)?;
    hmac.update(info);
    hmac.verify_slice(expected).map_err(From::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::extractors::test_utils::{create_valid_hawk_header, SECRETS};

    const METHOD: &str = "GET";
    const HOST: &str = "localhost";
    const PORT: u16 = 5000;

    fn test_path(user_id: u64) -> String {
        format!("/1.5/{}/storage/col2", user_id)
    }

    fn expiry() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    #[test]
    fn valid_header() {
        let payload = HawkPayload::test_default(1);
        let path = test_path(1);
        let header = create_valid_hawk_header(&payload, &SECRETS, METHOD, &path, HOST, PORT);

        let result =
            HawkPayload::new(&header, METHOD, &path, HOST, PORT, &SECRETS, expiry()).unwrap();
        assert_eq!(result, payload);
    }

    #[test]
    fn valid_header_with_querystring() {
        let payload = HawkPayload::test_default(1);
        let mut path = test_path(1);
        path.push_str("?batch=MTUzNjE5ODk3NjkyMQ==&commit=true");
        let header = create_valid_hawk_header(&payload, &SECRETS, "POST", &path, HOST, PORT);

        let result =
            HawkPayload::new(&header, "POST", &path, HOST, PORT, &SECRETS, expiry()).unwrap();
        assert_eq!(result, payload);
    }

    #[test]
    fn missing_hawk_prefix() {
        let payload = HawkPayload::test_default(1);
        let path = test_path(1);
        let header = create_valid_hawk_header(&payload, &SECRETS, METHOD, &path, HOST, PORT);

        assert!(
            HawkPayload::new(&header[1..], METHOD, &path, HOST, PORT, &SECRETS, expiry()).is_err()
        );
    }

    #[test]
    fn bad_master_secret() {
        let payload = HawkPayload::test_default(1);
        let path = test_path(1);
        let header = create_valid_hawk_header(&payload, &SECRETS, METHOD, &path, HOST, PORT);

        let wrong = Secrets::new("wibble").unwrap();
        assert!(HawkPayload::new(&header, METHOD, &path, HOST, PORT, &wrong, expiry()).is_err());
    }

    #[test]
    fn rotated_secret_chain_still_validates() {
        let payload = HawkPayload::test_default(1);
        let path = test_path(1);
        // Sign with the older secret in the chain
        let old = Secrets::new("old secret").unwrap();
        let header = create_valid_hawk_header(&payload, &old, METHOD, &path, HOST, PORT);

        let chain = Secrets::new("new secret,old secret").unwrap();
        let result =
            HawkPayload::new(&header, METHOD, &path, HOST, PORT, &chain, expiry()).unwrap();
        assert_eq!(result, payload);
    }

    #[test]
    fn expired_payload() {
        let mut payload = HawkPayload::test_default(1);
        payload.expires = expiry() as f64 - 1.0;
        let path = test_path(1);
        let header = create_valid_hawk_header(&payload, &SECRETS, METHOD, &path, HOST, PORT);

        assert!(HawkPayload::new(&header, METHOD, &path, HOST, PORT, &SECRETS, expiry()).is_err());
    }

    #[test]
    fn bad_method() {
        let payload = HawkPayload::test_default(1);
        let path = test_path(1);
        let header = create_valid_hawk_header(&payload, &SECRETS, METHOD, &path, HOST, PORT);

        assert!(HawkPayload::new(&header, "POST", &path, HOST, PORT, &SECRETS, expiry()).is_err());
    }

    #[test]
    fn bad_path() {
        let payload = HawkPayload::test_default(1);
        let path = test_path(1);
        let header = create_valid_hawk_header(&payload, &SECRETS, METHOD, &path, HOST, PORT);

        let other_path = format!("{}?batch=true", path);
        assert!(HawkPayload::new(
            &header,
            METHOD,
            &other_path,
            HOST,
            PORT,
            &SECRETS,
            expiry()
        )
        .is_err());
    }

    #[test]
    fn bad_host() {
        let payload = HawkPayload::test_default(1);
        let path = test_path(1);
        let header = create_valid_hawk_header(&payload, &SECRETS, METHOD, &path, HOST, PORT);

        assert!(HawkPayload::new(
            &header,
            METHOD,
            &path,
            "localhost.com",
            PORT,
            &SECRETS,
            expiry()
        )
        .is_err());
    }

    #[test]
    fn bad_port() {
        let payload = HawkPayload::test_default(1);
        let path = test_path(1);
        let header = create_valid_hawk_header(&payload, &SECRETS, METHOD, &path, HOST, PORT);

        assert!(
            HawkPayload::new(&header, METHOD, &path, HOST, PORT + 1, &SECRETS, expiry()).is_err()
        );
    }

    #[test]
    fn tampered_signature() {
        let payload = HawkPayload::test_default(1);
        let path = test_path(1);
        let header = create_valid_hawk_header(&payload, &SECRETS, METHOD, &path, HOST, PORT);
        // Flip a character inside the id property
        let tampered = header.replacen("id=\"", "id=\"A", 1);

        assert!(HawkPayload::new(&tampered, METHOD, &path, HOST, PORT, &SECRETS, expiry()).is_err());
    }
}
