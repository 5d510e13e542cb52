use std::{borrow::Cow, time::Duration};

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokenserver_common::TokenserverError;
use tokenserver_settings::Settings;
use weaveserver_common::Metrics;

use crate::crypto::{JWTVerifier, OAuthVerifyError};
use crate::VerifyToken;

const SYNC_SCOPE: &str = "https://identity.mozilla.com/apps/oldsync";

/// The data extracted from a valid OAuth token.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VerifyOutput {
    pub fxa_uid: String,
    pub generation: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug)]
struct TokenClaims {
    #[serde(rename = "sub")]
    user: String,
    scope: String,
    #[serde(rename = "fxa-generation")]
    generation: Option<i64>,
}

impl TokenClaims {
    fn validate(self) -> Result<VerifyOutput, TokenserverError> {
        if !self.scope.split(',').any(|scope| scope == SYNC_SCOPE) {
            return Err(TokenserverError::invalid_credentials(
                "Unauthorized".to_owned(),
            ));
        }
        Ok(self.into())
    }
}

impl From<TokenClaims> for VerifyOutput {
    fn from(value: TokenClaims) -> Self {
        Self {
            fxa_uid: value.user,
            generation: value.generation,
        }
    }
}

/// The verifier used to verify OAuth tokens.
#[derive(Clone)]
pub struct Verifier<J> {
    verify_url: Url,
    jwks_url: Url,
    jwk_verifiers: Vec<J>,
    http_client: reqwest::Client,
}

impl<J> Verifier<J>
where
    J: JWTVerifier,
{
    pub fn new(settings: &Settings, jwk_verifiers: Vec<J>) -> Result<Self, TokenserverError> {
        let base_url = Url::parse(&settings.fxa_oauth_server_url)
            .map_err(|_| TokenserverError::internal_error())?;
        let verify_url = base_url
            .join("v1/verify")
            .map_err(|_| TokenserverError::internal_error())?;
        let jwks_url = base_url
            .join("v1/jwks")
            .map_err(|_| TokenserverError::internal_error())?;
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.fxa_oauth_request_timeout))
            .use_rustls_tls()
            .build()
            .map_err(|_| TokenserverError::internal_error())?;

        Ok(Self {
            verify_url,
            jwks_url,
            jwk_verifiers,
            http_client,
        })
    }

    async fn remote_verify_token(&self, token: &str) -> Result<TokenClaims, TokenserverError> {
        #[derive(Serialize)]
        struct VerifyRequest<'a> {
            token: &'a str,
        }

        #[derive(Serialize, Deserialize)]
        struct VerifyResponse {
            user: String,
            scope: Vec<String>,
            generation: Option<i64>,
        }

        impl From<VerifyResponse> for TokenClaims {
            fn from(value: VerifyResponse) -> Self {
                Self {
                    user: value.user,
                    scope: value.scope.join(","),
                    generation: value.generation,
                }
            }
        }

        let response = self
            .http_client
            .post(self.verify_url.clone())
            .json(&VerifyRequest { token })
            .send()
            .await
            // A verifier that's down or timing out is not the client's
            // fault: report a retryable 503
            .map_err(unavailable_err_with_ctx)?;

        if response.status().is_server_error() {
            return Err(unavailable_err_with_ctx(format!(
                "Got verify status code: {}",
                response.status()
            )));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // Preserve the verifier's hints about clock problems
            if body.contains("expired") || body.contains("issued later than") {
                return Err(TokenserverError {
                    context: format!("Verify rejection ({}): {}", status, body),
                    ..TokenserverError::invalid_timestamp("Unauthorized".to_owned())
                });
            }
            return Err(unauthorized_err_with_ctx(format!(
                "Got verify status code: {}",
                status
            )));
        }

        Ok(response
            .json::<VerifyResponse>()
            .await
            .map_err(unauthorized_err_with_ctx)?
            .into())
    }

    async fn get_remote_jwks(&self) -> Result<Vec<J>, TokenserverError> {
        #[derive(Deserialize)]
        struct KeysResponse<K> {
            keys: Vec<K>,
        }
        self.http_client
            .get(self.jwks_url.clone())
            .send()
            .await
            .map_err(internal_err_with_ctx)?
            .json::<KeysResponse<J::Key>>()
            .await
            .map_err(internal_err_with_ctx)?
            .keys
            .into_iter()
            .map(|key| key.try_into().map_err(internal_err_with_ctx))
            .collect()
    }

    fn verify_jwt_locally(
        &self,
        verifiers: &[Cow<'_, J>],
        token: &str,
    ) -> Result<TokenClaims, OAuthVerifyError> {
        if verifiers.is_empty() {
            return Err(OAuthVerifyError::InvalidKey);
        }

        verifiers
            .iter()
            .find_map(|verifier| {
                match verifier.verify::<TokenClaims>(token) {
                    // An invalid signature means the key was well formatted
                    // but didn't match; try the next key if there is one
                    Err(OAuthVerifyError::InvalidSignature) => None,
                    res => Some(res),
                }
            })
            // Every key was well formatted but none verified the signature
            .ok_or(OAuthVerifyError::TrustError)?
    }
}

#[async_trait]
impl<J> VerifyToken for Verifier<J>
where
    J: JWTVerifier,
{
    type Output = VerifyOutput;

    /// Verifies an OAuth token. Returns `VerifyOutput` for valid tokens and
    /// a `TokenserverError` for invalid tokens.
    ///
    /// Tokens are first verified locally against the configured JWKs; when
    /// none are configured the latest keys are fetched from the upstream
    /// /v1/jwks endpoint. If local verification can't proceed (unusable
    /// keys, or a token shape the keys can't decode) the verifier falls
    /// back to the upstream /v1/verify endpoint. All other failures are
    /// invalid credentials and surface as a generic "Unauthorized".
    async fn verify(
        &self,
        token: String,
        metrics: &Metrics,
    ) -> Result<VerifyOutput, TokenserverError> {
        let mut verifiers = self
            .jwk_verifiers
            .iter()
            .map(Cow::Borrowed)
            .collect::<Vec<_>>();
        if self.jwk_verifiers.is_empty() {
            verifiers = self
                .get_remote_jwks()
                .await
                .unwrap_or_else(|e| {
                    slog_scope::warn!("Error requesting remote jwks: {}", e);
                    vec![]
                })
                .into_iter()
                .map(Cow::Owned)
                .collect();
        }

        let claims = match self.verify_jwt_locally(&verifiers, &token) {
            Ok(res) => res,
            Err(e) => {
                if e.is_reportable_err() {
                    metrics.incr(e.metric_label())
                }
                match e {
                    OAuthVerifyError::DecodingError | OAuthVerifyError::InvalidKey => {
                        self.remote_verify_token(&token).await?
                    }
                    e => return Err(unauthorized_err_with_ctx(e)),
                }
            }
        };
        claims.validate()
    }
}

fn unauthorized_err_with_ctx<E: std::fmt::Display>(err: E) -> TokenserverError {
    TokenserverError {
        context: err.to_string(),
        ..TokenserverError::invalid_credentials("Unauthorized".to_owned())
    }
}

fn unavailable_err_with_ctx<E: std::fmt::Display>(err: E) -> TokenserverError {
    TokenserverError {
        context: err.to_string(),
        ..TokenserverError::resource_unavailable()
    }
}

fn internal_err_with_ctx<E: std::fmt::Display>(err: E) -> TokenserverError {
    TokenserverError {
        context: err.to_string(),
        ..TokenserverError::internal_error()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::crypto::{JWTVerifierImpl, OAuthVerifyError};

    #[derive(Deserialize)]
    struct MockJwk {}

    macro_rules! mock_jwk_verifier {
        ($im:expr) => {
            mock_jwk_verifier!(_token, $im);
        };
        ($token:ident, $im:expr) => {
            #[derive(Clone, Debug)]
            struct MockJwtVerifier {}

            impl TryFrom<MockJwk> for MockJwtVerifier {
                type Error = OAuthVerifyError;
                fn try_from(_value: MockJwk) -> Result<Self, Self::Error> {
                    Ok(Self {})
                }
            }

            impl JWTVerifier for MockJwtVerifier {
                type Key = MockJwk;
                fn verify<T: ::serde::de::DeserializeOwned>(
                    &self,
                    $token: &str,
                ) -> Result<T, OAuthVerifyError> {
                    $im
                }
            }
        };
    }

    #[tokio::test]
    async fn no_keys_in_verifier_falls_back_to_remote() -> Result<(), TokenserverError> {
        let mut server = mockito::Server::new_async().await;
        let mock_jwks = server.mock("GET", "/v1/jwks").with_status(500).create();

        let body = json!({
            "user": "fxa_id",
            "scope": [SYNC_SCOPE],
            "generation": 123
        });
        let mock_verify = server
            .mock("POST", "/v1/verify")
            .with_header("content-type", "application/json")
            .with_status(200)
            .with_body(body.to_string())
            .create();

        let settings = Settings {
            fxa_oauth_server_url: server.url(),
            ..Default::default()
        };
        let verifier: Verifier<JWTVerifierImpl> = Verifier::new(&settings, vec![])?;
        let res = verifier
            .verify("a token the server will validate".to_string(), &Metrics::noop())
            .await?;
        mock_jwks.expect(1);
        mock_verify.expect(1);
        assert_eq!(res.generation.unwrap(), 123);
        assert_eq!(res.fxa_uid, "fxa_id");
        Ok(())
    }

    #[tokio::test]
    async fn expired_signature_fails_without_fallback() -> Result<(), TokenserverError> {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/v1/verify").create();
        mock_jwk_verifier!(Err(OAuthVerifyError::ExpiredSignature));

        let settings = Settings {
            fxa_oauth_server_url: server.url(),
            ..Settings::default()
        };
        let verifier: Verifier<MockJwtVerifier> =
            Verifier::new(&settings, vec![MockJwtVerifier {}])?;

        let err = verifier
            .verify("An expired token".to_string(), &Metrics::noop())
            .await
            .unwrap_err();
        // We also make sure we didn't try to hit the server
        mock.expect(0);
        assert_eq!(err.status, "invalid-credentials");
        assert_eq!(err.http_status, 401);
        assert_eq!(err.description, "Unauthorized");

        Ok(())
    }

    #[tokio::test]
    async fn verifier_attempts_all_keys_on_invalid_signature() -> Result<(), TokenserverError> {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/v1/verify").create();

        #[derive(Debug, Clone)]
        struct MockJwtVerifier {
            id: u8,
        }

        impl TryFrom<MockJwk> for MockJwtVerifier {
            type Error = OAuthVerifyError;
            fn try_from(_value: MockJwk) -> Result<Self, Self::Error> {
                Ok(Self { id: 0 })
            }
        }

        impl JWTVerifier for MockJwtVerifier {
            type Key = MockJwk;
            fn verify<T: serde::de::DeserializeOwned>(
                &self,
                token: &str,
            ) -> Result<T, OAuthVerifyError> {
                if self.id == 0 {
                    Err(OAuthVerifyError::InvalidSignature)
                } else {
                    Ok(serde_json::from_str(token).unwrap())
                }
            }
        }

        let jwk_verifiers = vec![MockJwtVerifier { id: 0 }, MockJwtVerifier { id: 1 }];
        let settings = Settings {
            fxa_oauth_server_url: server.url(),
            ..Settings::default()
        };
        let verifier: Verifier<MockJwtVerifier> = Verifier::new(&settings, jwk_verifiers).unwrap();

        let token_claims = TokenClaims {
            user: "fxa_id".to_string(),
            scope: SYNC_SCOPE.to_string(),
            generation: Some(124),
        };

        let res = verifier
            .verify(
                serde_json::to_string(&token_claims).unwrap(),
                &Metrics::noop(),
            )
            .await?;
        assert_eq!(res.fxa_uid, "fxa_id");
        assert_eq!(res.generation.unwrap(), 124);
        mock.expect(0); // We shouldn't have hit the server
        Ok(())
    }

    #[tokio::test]
    async fn all_signature_failures_fail() -> Result<(), TokenserverError> {
        let mut server = mockito::Server::new_async().await;
        let mock_verify = server.mock("POST", "/v1/verify").create();
        mock_jwk_verifier!(Err(OAuthVerifyError::InvalidSignature));

        let jwk_verifiers = vec![MockJwtVerifier {}, MockJwtVerifier {}];
        let settings = Settings {
            fxa_oauth_server_url: server.url(),
            ..Settings::default()
        };
        let verifier: Verifier<MockJwtVerifier> = Verifier::new(&settings, jwk_verifiers).unwrap();
        let err = verifier
            .verify(
                "a token with an invalid signature".to_string(),
                &Metrics::noop(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status, "invalid-credentials");
        assert_eq!(err.http_status, 401);
        assert_eq!(err.description, "Unauthorized");

        mock_verify.expect(0);
        Ok(())
    }

    #[tokio::test]
    async fn falls_back_to_remote_on_decode_error() -> Result<(), TokenserverError> {
        let mut server = mockito::Server::new_async().await;
        let body = json!({
            "user": "fxa_id",
            "scope": [SYNC_SCOPE],
            "generation": 123
        });
        let mock_verify = server
            .mock("POST", "/v1/verify")
            .with_header("content-type", "application/json")
            .with_status(200)
            .with_body(body.to_string())
            .create();

        mock_jwk_verifier!(Err(OAuthVerifyError::DecodingError));

        let settings = Settings {
            fxa_oauth_server_url: server.url(),
            ..Settings::default()
        };
        let verifier: Verifier<MockJwtVerifier> =
            Verifier::new(&settings, vec![MockJwtVerifier {}]).unwrap();

        let res = verifier
            .verify(
                "invalid token that can't be decoded".to_string(),
                &Metrics::noop(),
            )
            .await?;
        assert_eq!(res.fxa_uid, "fxa_id");
        assert_eq!(res.generation.unwrap(), 123);
        mock_verify.expect(1);
        Ok(())
    }

    #[tokio::test]
    async fn remote_5xx_is_service_unavailable() -> Result<(), TokenserverError> {
        let mut server = mockito::Server::new_async().await;
        let mock_verify = server.mock("POST", "/v1/verify").with_status(503).create();

        mock_jwk_verifier!(Err(OAuthVerifyError::DecodingError));

        let settings = Settings {
            fxa_oauth_server_url: server.url(),
            ..Settings::default()
        };
        let verifier: Verifier<MockJwtVerifier> =
            Verifier::new(&settings, vec![MockJwtVerifier {}]).unwrap();

        let err = verifier
            .verify("any token".to_string(), &Metrics::noop())
            .await
            .unwrap_err();
        assert_eq!(err.http_status, 503);
        mock_verify.expect(1);
        Ok(())
    }

    #[tokio::test]
    async fn expiry_hints_map_to_invalid_timestamp() -> Result<(), TokenserverError> {
        let mut server = mockito::Server::new_async().await;
        let mock_verify = server
            .mock("POST", "/v1/verify")
            .with_status(400)
            .with_body("token expired, try again")
            .create();

        mock_jwk_verifier!(Err(OAuthVerifyError::DecodingError));

        let settings = Settings {
            fxa_oauth_server_url: server.url(),
            ..Settings::default()
        };
        let verifier: Verifier<MockJwtVerifier> =
            Verifier::new(&settings, vec![MockJwtVerifier {}]).unwrap();

        let err = verifier
            .verify("an expired token".to_string(), &Metrics::noop())
            .await
            .unwrap_err();
        assert_eq!(err.status, "invalid-timestamp");
        assert_eq!(err.http_status, 401);
        mock_verify.expect(1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_sync_scope_fails() -> Result<(), TokenserverError> {
        let server = mockito::Server::new_async().await;
        let token_claims = TokenClaims {
            user: "fxa_id".to_string(),
            scope: "some other scope".to_string(),
            generation: Some(124),
        };
        mock_jwk_verifier!(token, Ok(serde_json::from_str(token).unwrap()));

        let settings = Settings {
            fxa_oauth_server_url: server.url(),
            ..Settings::default()
        };
        let verifier: Verifier<MockJwtVerifier> =
            Verifier::new(&settings, vec![MockJwtVerifier {}]).unwrap();
        let err = verifier
            .verify(
                serde_json::to_string(&token_claims).unwrap(),
                &Metrics::noop(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status, "invalid-credentials");
        assert_eq!(err.http_status, 401);
        assert_eq!(err.description, "Unauthorized");

        Ok(())
    }

    #[tokio::test]
    async fn remote_rejection_wins_no_matter_the_body() -> Result<(), TokenserverError> {
        let mut server = mockito::Server::new_async().await;
        let body = json!({
            "user": "fxa_id",
            "scope": [SYNC_SCOPE],
            "generation": 123
        });
        let mock_verify = server
            .mock("POST", "/v1/verify")
            .with_header("content-type", "application/json")
            .with_status(401)
            // Even with a plausible body, a non-2xx means invalid credentials
            .with_body(body.to_string())
            .create();
        let settings = Settings {
            fxa_oauth_server_url: server.url(),
            ..Settings::default()
        };

        mock_jwk_verifier!(Err(OAuthVerifyError::DecodingError));

        let verifier: Verifier<MockJwtVerifier> = Verifier::new(&settings, vec![]).unwrap();

        let err = verifier
            .verify(
                "A token we will ask the upstream about".to_string(),
                &Metrics::noop(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status, "invalid-credentials");
        assert_eq!(err.http_status, 401);
        assert_eq!(err.description, "Unauthorized");
        mock_verify.expect(1);

        Ok(())
    }
}
