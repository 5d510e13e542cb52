use base64::Engine;
use serde::{Deserialize, Serialize};
use tokenserver_common::TokenserverError;

use crate::{
    crypto::{Crypto, CryptoImpl},
    MakeTokenPlaintext,
};

// These info strings are part of the wire protocol: the storage side derives
// the same per-token secret from them when it validates Hawk signatures, so
// changing either would invalidate every outstanding token.
const HKDF_SIGNING_INFO: &[u8] = b"services.mozilla.com/tokenlib/v1/signing";
const HKDF_INFO_DERIVE: &[u8] = b"services.mozilla.com/tokenlib/v1/derive/";

pub struct Tokenlib {}

#[derive(Debug, Serialize, Deserialize)]
struct Token<'a> {
    #[serde(flatten)]
    plaintext: MakeTokenPlaintext,
    salt: &'a str,
}

impl Tokenlib {
    /// Build the signed token handed to the client as its Hawk id, plus the
    /// per-token secret the client uses as its Hawk key.
    pub fn get_token_and_derived_secret(
        plaintext: MakeTokenPlaintext,
        shared_secret: &str,
    ) -> Result<(String, String), TokenserverError> {
        let crypto_lib = CryptoImpl {};
        let mut salt_bytes = [0u8; 3];
        crypto_lib.rand_bytes(&mut salt_bytes)?;
        let salt = hex::encode(salt_bytes);
        let token_str = serde_json::to_string(&Token {
            plaintext,
            salt: &salt,
        })
        .map_err(|_| TokenserverError::internal_error())?;
        let hmac_key = crypto_lib.hkdf(shared_secret, None, HKDF_SIGNING_INFO)?;
        let signature = crypto_lib.hmac_sign(&hmac_key, token_str.as_bytes())?;
        let mut token_bytes = Vec::with_capacity(token_str.len() + signature.len());
        token_bytes.extend_from_slice(token_str.as_bytes());
        token_bytes.extend_from_slice(&signature);
        let token = base64::engine::general_purpose::URL_SAFE.encode(token_bytes);

        // The token is final; derive the per-token secret from it
        let mut info = Vec::with_capacity(HKDF_INFO_DERIVE.len() + token.len());
        info.extend_from_slice(HKDF_INFO_DERIVE);
        info.extend_from_slice(token.as_bytes());

        let per_token_secret = crypto_lib.hkdf(shared_secret, Some(salt.as_bytes()), &info)?;
        let per_token_secret = base64::engine::general_purpose::URL_SAFE.encode(per_token_secret);
        Ok((token, per_token_secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SHA256_OUTPUT_LEN;

    #[test]
    fn generates_valid_token_and_per_token_secret() -> Result<(), TokenserverError> {
        // The generated token must carry a correct HMAC signature over the
        // JSON payload
        let plaintext = MakeTokenPlaintext {
            node: "https://www.example.com".to_string(),
            fxa_kid: "kid".to_string(),
            fxa_uid: "user uid".to_string(),
            hashed_fxa_uid: "hashed uid".to_string(),
            hashed_device_id: "hashed device id".to_string(),
            expires: 1031,
            uid: 13,
        };
        let secret = "foobar";
        let crypto_impl = CryptoImpl {};
        let hmac_key = crypto_impl.hkdf(secret, None, HKDF_SIGNING_INFO).unwrap();
        let (b64_token, per_token_secret) =
            Tokenlib::get_token_and_derived_secret(plaintext.clone(), secret).unwrap();
        let token = base64::engine::general_purpose::URL_SAFE
            .decode(&b64_token)
            .unwrap();
        let token_size = token.len();
        let signature = &token[token_size - SHA256_OUTPUT_LEN..];
        let payload = &token[..token_size - SHA256_OUTPUT_LEN];
        crypto_impl
            .hmac_verify(&hmac_key, payload, signature)
            .unwrap();

        // The signed payload must round-trip to the same plaintext
        let token_data = serde_json::from_slice::<Token<'_>>(payload).unwrap();
        assert_eq!(token_data.plaintext, plaintext);

        // And the same per-token secret must be derivable from the payload
        // plus the shared secret
        let mut info = Vec::with_capacity(HKDF_INFO_DERIVE.len() + b64_token.len());
        info.extend_from_slice(HKDF_INFO_DERIVE);
        info.extend_from_slice(b64_token.as_bytes());

        let expected_per_token_secret =
            crypto_impl.hkdf(secret, Some(token_data.salt.as_bytes()), &info)?;
        let expected_per_token_secret =
            base64::engine::general_purpose::URL_SAFE.encode(expected_per_token_secret);

        assert_eq!(expected_per_token_secret, per_token_secret);

        Ok(())
    }
}
