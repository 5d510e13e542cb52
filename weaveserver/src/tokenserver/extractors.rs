//! Request header/body/query extractors for the tokenserver
//!
//! Parses the bearer token and key-id headers, resolves the user's ledger
//! record, and runs the credential consistency checks before any token is
//! issued.

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{
    dev::Payload,
    web::{Data, Query},
    FromRequest, HttpRequest,
};
use base64::{engine, Engine};
use futures::future::LocalBoxFuture;
use hmac::{Hmac, Mac};
use http::StatusCode;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use sha2::Sha256;
use tokenserver_common::{ErrorLocation, NodeType, TokenserverError};
use tokenserver_db::{params, results, Db, DbPool};
use weaveserver_settings::Secrets;

use super::{LogItemsMutator, ServerState, TokenserverMetrics};
use crate::server::MetricsWrapper;

lazy_static! {
    static ref CLIENT_STATE_REGEX: Regex = Regex::new("^[a-zA-Z0-9._-]{1,32}$").unwrap();
}

const SYNC_SERVICE_NAME: &str = "sync-1.5";

/// Information from the request needed to process a tokenserver request.
#[derive(Debug, Default)]
pub struct TokenserverRequest {
    pub user: results::GetOrCreateUser,
    pub auth_data: AuthData,
    pub shared_secret: String,
    pub hashed_fxa_uid: String,
    pub hashed_device_id: String,
    pub service_id: i32,
    pub duration: u64,
    pub node_type: NodeType,
}

impl TokenserverRequest {
    /// Performs an elaborate set of consistency checks on the provided
    /// claims, which we expect to behave as follows:
    ///
    ///   * `generation` is a monotonic timestamp, and increases every time
    ///     there is an authentication-related change on the user's account.
    ///
    ///   * `keys_changed_at` is a monotonic timestamp, and increases every
    ///     time the user's keys change. This is a type of auth-related
    ///     change, so `keys_changed_at` <= `generation` at all times.
    ///
    ///   * `client_state` is a key fingerprint and should never change back
    ///     to a previously-seen value.
    ///
    /// Callers who provide identity claims that violate any of these rules
    /// either have stale credentials (in which case they should
    /// re-authenticate) or are buggy (in which case we deny them access to
    /// the user's data).
    ///
    /// The logic here is slightly complicated by the fact that older
    /// versions of the identity server may not have been sending all the
    /// expected fields, and that some clients do not report the
    /// `generation` timestamp.
    fn validate(&self) -> Result<(), TokenserverError> {
        let auth_keys_changed_at = self.auth_data.keys_changed_at;
        let auth_generation = self.auth_data.generation;
        let user_keys_changed_at = self.user.keys_changed_at;
        let user_generation = Some(self.user.generation);

        /// `$left` and `$right` must both be `Option`s, and `$op` must be a
        /// binary infix operator. If `$left` and `$right` are both `Some`,
        /// this macro returns `$left $op $right`; otherwise, it returns
        /// `false`.
        macro_rules! opt_cmp {
            ($left:ident $op:tt $right:ident) => {
                $left.zip($right).map(|(l, r)| l $op r).unwrap_or(false)
            }
        }

        // If the caller reports a generation number, then a change in keys
        // should correspond to a change in generation number. Unfortunately
        // a previous version of the identity server that didn't have
        // `keys_changed_at` support may have already seen and written the
        // new value of `generation`. The best we can do here is enforce
        // that `keys_changed_at` <= `generation`.
        if opt_cmp!(auth_keys_changed_at > user_keys_changed_at)
            && opt_cmp!(auth_generation < auth_keys_changed_at)
        {
            return Err(TokenserverError {
                context: "keys_changed_at greater than generation".to_owned(),
                ..TokenserverError::invalid_keys_changed_at()
            });
        }

        // If the caller reports new client state, but the auth doesn't,
        // flag it as an error.
        if !self.user.client_state.is_empty() && self.auth_data.client_state.is_empty() {
            let error_message = "Unacceptable client-state value empty string".to_owned();
            return Err(TokenserverError::invalid_client_state(error_message, None));
        }
        // The client state on the request must not have been used in the past.
        if self
            .user
            .old_client_states
            .contains(&self.auth_data.client_state)
        {
            let error_message = "Unacceptable client-state value stale value".to_owned();
            warn!("Client attempted stale value"; "uid" => self.user.uid, "client_state" => self.user.client_state.clone());
            return Err(TokenserverError::invalid_client_state(
                error_message,
                Some(vec![("is_stale", "true".to_owned())]),
            ));
        }

        // If the client state on the request differs from the most
        // recently-used client state, it must be accompanied by a valid
        // change in generation (if the client reports a generation).
        if self.auth_data.client_state != self.user.client_state
            && opt_cmp!(auth_generation <= user_generation)
        {
            let error_message =
                "Unacceptable client-state value new value with no generation change".to_owned();
            return Err(TokenserverError::invalid_client_state(error_message, None));
        }

        // If the client state on the request differs from the most
        // recently-used client state, it must be accompanied by a valid
        // change in keys_changed_at
        if self.auth_data.client_state != self.user.client_state
            && opt_cmp!(auth_keys_changed_at <= user_keys_changed_at)
        {
            let error_message =
                "Unacceptable client-state value new value with no keys_changed_at change"
                    .to_owned();
            return Err(TokenserverError::invalid_client_state(error_message, None));
        }

        // The generation on the request cannot be earlier than the
        // generation stored on the user record.
        if opt_cmp!(user_generation > auth_generation) {
            return Err(TokenserverError {
                context: "New generation less than previously-seen generation".to_owned(),
                ..TokenserverError::invalid_generation()
            });
        }

        // The keys_changed_at on the request cannot be earlier than the
        // keys_changed_at stored on the user record.
        if opt_cmp!(user_keys_changed_at > auth_keys_changed_at) {
            return Err(TokenserverError {
                context: "New keys_changed_at less than previously-seen keys_changed_at".to_owned(),
                ..TokenserverError::invalid_keys_changed_at()
            });
        }

        // Requests must always include a `keys_changed_at` header once one
        // has been seen. The legacy server converted a NULL
        // `keys_changed_at` to 0 in memory, treating the two equivalently;
        // that would let users with a 0 `keys_changed_at` on their record
        // hold off on sending the header even though the stored value is
        // non-NULL, so handle that case here.
        if auth_keys_changed_at.is_none()
            && matches!(user_keys_changed_at, Some(inner) if inner != 0)
        {
            let context =
                "No keys_changed_at sent for a user for whom we've already seen a keys_changed_at"
                    .to_owned();
            return Err(TokenserverError {
                context,
                ..TokenserverError::invalid_keys_changed_at()
            });
        }
        Ok(())
    }
}

impl FromRequest for TokenserverRequest {
    type Error = TokenserverError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();

        Box::pin(async move {
            let mut log_items_mutator = LogItemsMutator::from(&req);
            let auth_data = AuthData::extract(&req).await?;

            let state = get_server_state(&req)?.as_ref();
            let shared_secret = get_secret(&req)?;
            let fxa_metrics_hash_secret = &state.fxa_metrics_hash_secret.as_bytes();

            // To preserve anonymity, compute a hash of the uid to be used
            // for reporting metrics
            let hashed_fxa_uid = {
                let hashed_fxa_uid_full =
                    fxa_metrics_hash(&auth_data.fxa_uid, fxa_metrics_hash_secret);
                log_items_mutator.insert("uid".to_owned(), hashed_fxa_uid_full.clone());
                hashed_fxa_uid_full[0..32].to_owned()
            };
            log_items_mutator.insert("metrics_uid".to_owned(), hashed_fxa_uid.clone());

            // To preserve anonymity, compute a hash of the device ID to be
            // used for reporting metrics. Use "none" as a placeholder for
            // OAuth requests, which carry no device id.
            let hashed_device_id = hash_device_id(&hashed_fxa_uid, fxa_metrics_hash_secret);

            let DbWrapper(mut db) = DbWrapper::extract(&req).await?;
            let service_id = {
                let path = req.match_info();

                // If we've reached this extractor, we know that the
                // tokenserver path was matched, meaning "application" and
                // "version" are both present in the URL, so we can use
                // `unwrap()` here.
                let application = path.get("application").unwrap();
                let version = path.get("version").unwrap();

                if application == "sync" {
                    if version == "1.5" {
                        db.get_service_id(params::GetServiceId {
                            service: SYNC_SERVICE_NAME.to_owned(),
                        })
                        .await?
                        .id
                    } else {
                        return Err(TokenserverError::unsupported(
                            "Unsupported application version".to_owned(),
                            version.to_owned(),
                        ));
                    }
                } else {
                    // NOTE: The legacy tokenserver only includes
                    // "application" in this error message, not the name of
                    // the unsupported application, so stay consistent.
                    return Err(TokenserverError::unsupported(
                        "Unsupported application".to_owned(),
                        "application".to_owned(),
                    ));
                }
            };
            let user = db
                .get_or_create_user(params::GetOrCreateUser {
                    service_id,
                    email: auth_data.email.clone(),
                    generation: auth_data.generation.unwrap_or(0),
                    client_state: auth_data.client_state.clone(),
                    keys_changed_at: auth_data.keys_changed_at,
                    capacity_release_rate: state.node_capacity_release_rate,
                })
                .await?;
            log_items_mutator.insert("first_seen_at".to_owned(), user.first_seen_at.to_string());

            let duration = {
                let params =
                    Query::<QueryParams>::extract(&req)
                        .await
                        .map_err(|_| TokenserverError {
                            description: "invalid query params".to_owned(),
                            context: "invalid query params".to_owned(),
                            http_status: StatusCode::BAD_REQUEST,
                            location: ErrorLocation::Url,
                            ..Default::default()
                        })?;

                // An error in the "duration" query parameter should never
                // cause a request to fail. Instead, simply resort to the
                // default token duration.
                params.duration.as_ref().and_then(|duration_string| {
                    match duration_string.parse::<u64>() {
                        // The specified token duration can only lower the
                        // default duration set on the server.
                        Ok(duration) if duration > 0 && duration <= state.token_duration => {
                            Some(duration)
                        }
                        _ => None,
                    }
                })
            };

            let tokenserver_request = TokenserverRequest {
                user,
                auth_data,
                shared_secret,
                hashed_fxa_uid,
                hashed_device_id,
                service_id,
                duration: duration.unwrap_or(state.token_duration),
                node_type: state.node_type,
            };

            tokenserver_request.validate()?;

            Ok(tokenserver_request)
        })
    }
}

#[derive(Deserialize)]
struct QueryParams {
    pub duration: Option<String>,
}

/// A local "newtype" that wraps `Box<dyn Db>` so we can implement
/// `FromRequest`.
pub struct DbWrapper(pub Box<dyn Db>);

impl FromRequest for DbWrapper {
    type Error = TokenserverError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();

        Box::pin(async move {
            DbPoolWrapper::extract(&req)
                .await?
                .0
                .get()
                .await
                .map(Self)
                .map_err(|e| TokenserverError {
                    context: format!("Couldn't acquire a database connection: {}", e),
                    ..TokenserverError::internal_error()
                })
        })
    }
}

struct DbPoolWrapper(Box<dyn DbPool>);

impl FromRequest for DbPoolWrapper {
    type Error = TokenserverError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();

        Box::pin(async move {
            let state = get_server_state(&req)?.as_ref();

            Ok(Self(state.db_pool.clone()))
        })
    }
}

/// An authentication token as parsed from the `Authorization` header.
/// OAuth tokens are opaque to the tokenserver and must be verified
/// upstream.
pub enum Token {
    OAuthToken(String),
}

impl FromRequest for Token {
    type Error = TokenserverError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();

        Box::pin(async move {
            // The request must have a valid Authorization header
            let authorization_header = req
                .headers()
                .get("Authorization")
                .ok_or_else(|| TokenserverError {
                    description: "Unauthorized".to_owned(),
                    location: ErrorLocation::Body,
                    context: "No Authorization header".to_owned(),
                    ..Default::default()
                })?
                .to_str()
                .map_err(|e| TokenserverError {
                    description: "Unauthorized".to_owned(),
                    location: ErrorLocation::Body,
                    context: format!(
                        "Authorization header contains invalid ASCII characters: {}",
                        e
                    ),
                    ..Default::default()
                })?;

            if let Some((auth_type, token)) = authorization_header.split_once(' ') {
                let auth_type = auth_type.to_ascii_lowercase();

                if auth_type == "bearer" {
                    Ok(Token::OAuthToken(token.to_owned()))
                } else {
                    // The request must use a Bearer token
                    Err(TokenserverError {
                        description: "Unsupported".to_owned(),
                        location: ErrorLocation::Body,
                        context: "Invalid authorization scheme".to_owned(),
                        ..Default::default()
                    })
                }
            } else {
                // Headers that are not of the format "[AUTH TYPE] [TOKEN]"
                // are invalid
                Err(TokenserverError {
                    description: "Unauthorized".to_owned(),
                    location: ErrorLocation::Body,
                    context: "Invalid Authorization header format".to_owned(),
                    ..Default::default()
                })
            }
        })
    }
}

/// The data extracted from the authentication token.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct AuthData {
    pub client_state: String,
    pub email: String,
    pub fxa_uid: String,
    pub generation: Option<i64>,
    pub keys_changed_at: Option<i64>,
}

impl FromRequest for AuthData {
    type Error = TokenserverError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();

        Box::pin(async move {
            let state = get_server_state(&req)?.as_ref();
            let token = Token::extract(&req).await?;

            let TokenserverMetrics(mut metrics) = TokenserverMetrics::extract(&req).await?;
            let mut log_items_mutator = LogItemsMutator::from(&req);

            // The legacy tokenserver treats zero values and null values
            // both as being null, so for consistency, convert a `Some(0)`
            // value to `None`
            fn convert_zero_to_none(generation_or_keys_changed_at: Option<i64>) -> Option<i64> {
                match generation_or_keys_changed_at {
                    Some(0) => None,
                    _ => generation_or_keys_changed_at,
                }
            }

            match token {
                Token::OAuthToken(token) => {
                    log_items_mutator.insert("token_type".to_owned(), "OAuth".to_owned());

                    let mut tags = HashMap::default();
                    tags.insert("token_type".to_owned(), "OAuth".to_owned());
                    metrics.start_timer("token_verification", Some(tags));
                    let verify_output = state.oauth_verifier.verify(token, &metrics).await?;

                    // For requests using OAuth, the keys_changed_at and
                    // client state are embedded in the X-KeyID header.
                    let key_id = KeyId::extract(&req).await?;
                    let fxa_uid = verify_output.fxa_uid;
                    let email = format!("{}@{}", fxa_uid, state.fxa_email_domain);

                    Ok(AuthData {
                        client_state: key_id.client_state,
                        email,
                        fxa_uid,
                        generation: convert_zero_to_none(verify_output.generation),
                        keys_changed_at: convert_zero_to_none(Some(key_id.keys_changed_at)),
                    })
                }
            }
        })
    }
}

/// The value of the X-Client-State header if it was present: the raw client
/// state bytes encoded as a hexadecimal string.
struct XClientStateHeader(Option<String>);

impl FromRequest for XClientStateHeader {
    type Error = TokenserverError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();

        Box::pin(async move {
            let headers = req.headers();
            let maybe_x_client_state = headers
                .get("X-Client-State")
                .and_then(|header| header.to_str().ok());

            // If there's a client state value in the X-Client-State header,
            // make sure it is valid
            if let Some(x_client_state) = maybe_x_client_state {
                if !CLIENT_STATE_REGEX.is_match(x_client_state) {
                    return Err(TokenserverError {
                        status: "error",
                        location: ErrorLocation::Header,
                        description: "Invalid client state value".to_owned(),
                        name: "X-Client-State".to_owned(),
                        http_status: StatusCode::BAD_REQUEST,
                        context: "Invalid client state value".to_owned(),
                        ..Default::default()
                    });
                }
            }

            Ok(Self(maybe_x_client_state.map(ToOwned::to_owned)))
        })
    }
}

// The key ID, as extracted from the X-KeyID header. The X-KeyID header is
// of the format `[keys_changed_at]-[base64-encoded client state]`
// (e.g. `0000000001234-qqo`)
#[derive(Clone, Debug, PartialEq)]
struct KeyId {
    client_state: String,
    keys_changed_at: i64,
}

impl FromRequest for KeyId {
    type Error = TokenserverError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();

        Box::pin(async move {
            let headers = req.headers();

            // The X-KeyID header must be present for requests using OAuth
            let x_key_id = headers
                .get("X-KeyID")
                .ok_or_else(|| {
                    TokenserverError::invalid_key_id("Missing X-KeyID header".to_owned())
                })?
                .to_str()
                .map_err(|_| {
                    TokenserverError::invalid_key_id("Invalid X-KeyID header".to_owned())
                })?;

            let (keys_changed_at_string, encoded_client_state) =
                x_key_id.split_once('-').ok_or_else(|| TokenserverError {
                    context: "X-KeyID header has invalid format".to_owned(),
                    ..TokenserverError::invalid_credentials("Unauthorized".to_owned())
                })?;

            let client_state = {
                // The client state in the X-KeyID header consists of the
                // raw client state bytes encoded as URL-safe base64 with
                // the padding removed. We convert it to hex because we
                // store the client state as hex in the database.
                let client_state_hex = {
                    let bytes = engine::general_purpose::URL_SAFE_NO_PAD
                        .decode(encoded_client_state)
                        .map_err(|e| TokenserverError {
                            context: format!(
                                "Failed to decode client state base64 in X-KeyID: {}",
                                e
                            ),
                            ..TokenserverError::invalid_credentials("Unauthorized".to_owned())
                        })?;

                    hex::encode(bytes)
                };
                // The client state from the X-Client-State header is
                // already properly encoded as hex
                let XClientStateHeader(x_client_state) = XClientStateHeader::extract(&req).await?;

                // If there's a client state value in the X-Client-State
                // header, verify that it matches the value in X-KeyID.
                if let Some(x_client_state) = x_client_state {
                    if x_client_state != client_state_hex {
                        return Err(TokenserverError {
                            status: "invalid-client-state",
                            location: ErrorLocation::Body,
                            context: "Client state mismatch in X-Client-State header".to_owned(),
                            ..TokenserverError::default()
                        });
                    }
                }

                client_state_hex
            };

            let keys_changed_at =
                keys_changed_at_string
                    .parse::<i64>()
                    .map_err(|e| TokenserverError {
                        context: format!("Non-integral keys_changed_at in X-KeyID: {}", e),
                        ..TokenserverError::invalid_credentials("Unauthorized".to_owned())
                    })?;
            if keys_changed_at < 0 {
                return Err(TokenserverError {
                    context: "Negative keys_changed_at in X-KeyID".to_owned(),
                    ..TokenserverError::invalid_credentials("Unauthorized".to_owned())
                });
            }

            Ok(KeyId {
                client_state,
                keys_changed_at,
            })
        })
    }
}

impl FromRequest for TokenserverMetrics {
    type Error = TokenserverError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();

        // `Result::unwrap` is safe to use here, since
        // MetricsWrapper::extract can never fail
        Box::pin(async move {
            Ok(TokenserverMetrics(
                MetricsWrapper::extract(&req).await.unwrap().0,
            ))
        })
    }
}

fn get_server_state(req: &HttpRequest) -> Result<&Data<ServerState>, TokenserverError> {
    req.app_data::<Data<ServerState>>()
        .ok_or_else(|| TokenserverError {
            context: "Failed to load the application state".to_owned(),
            ..TokenserverError::internal_error()
        })
}

fn get_secret(req: &HttpRequest) -> Result<String, TokenserverError> {
    let secrets = req
        .app_data::<Data<Arc<Secrets>>>()
        .ok_or_else(|| TokenserverError {
            context: "Failed to load the application secrets".to_owned(),
            ..TokenserverError::internal_error()
        })?;

    String::from_utf8(secrets.current().master_secret.clone()).map_err(|e| TokenserverError {
        context: format!("Failed to read the master secret: {}", e),
        ..TokenserverError::internal_error()
    })
}

fn fxa_metrics_hash(fxa_uid: &str, hmac_key: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(hmac_key).expect("HMAC has no key size limit");
    mac.update(fxa_uid.as_bytes());

    let result = mac.finalize().into_bytes();
    hex::encode(result)
}

fn hash_device_id(fxa_uid: &str, hmac_key: &[u8]) -> String {
    let mut to_hash = String::from(fxa_uid);
    // The device string defaulted to "none" when device ids stopped being
    // reported by the identity layer; keep the hard coded value for
    // compatibility.
    to_hash.push_str("none");
    let fxa_metrics_hash = fxa_metrics_hash(&to_hash, hmac_key);

    String::from(&fxa_metrics_hash[0..32])
}

#[cfg(test)]
mod tests {
    use super::*;

    use actix_web::{
        dev::ServiceResponse,
        http::{Method, StatusCode},
        test::{self, TestRequest},
        HttpResponse,
    };
    use futures::executor::block_on;
    use lazy_static::lazy_static;
    use tokenserver_auth::{oauth, MockVerifier};
    use tokenserver_db::mock::MockDbPool as MockTokenserverPool;
    use tokenserver_settings::Settings as TokenserverSettings;
    use weaveserver_common::metrics_from_opts;
    use weaveserver_settings::Secrets;

    use crate::tokenserver::ServerState;

    use std::sync::Arc;

    lazy_static! {
        static ref SECRETS: Arc<Secrets> =
            Arc::new(Secrets::new("Ted Koppel is a robot").unwrap());
    }

    const TOKEN_DURATION: u64 = 3600;

    fn make_state(oauth_verifier: MockVerifier<oauth::VerifyOutput>) -> ServerState {
        let tokenserver_settings = TokenserverSettings::default();

        ServerState {
            fxa_email_domain: "test.com".to_owned(),
            fxa_metrics_hash_secret: "".to_owned(),
            oauth_verifier: Box::new(oauth_verifier),
            db_pool: Box::new(MockTokenserverPool::new()),
            node_capacity_release_rate: None,
            node_type: Default::default(),
            metrics: metrics_from_opts(&tokenserver_settings.statsd_label, None, 0).unwrap(),
            token_duration: TOKEN_DURATION,
        }
    }

    fn extract_body_as_str(sresponse: ServiceResponse) -> String {
        String::from_utf8(block_on(test::read_body(sresponse)).to_vec()).unwrap()
    }

    fn user(
        client_state: &str,
        generation: i64,
        keys_changed_at: Option<i64>,
        old_client_states: Vec<&str>,
    ) -> results::GetOrCreateUser {
        results::GetOrCreateUser {
            uid: 1,
            email: "test@test.com".to_owned(),
            client_state: client_state.to_owned(),
            generation,
            node: "node".to_owned(),
            keys_changed_at,
            created_at: 1234,
            first_seen_at: 1234,
            replaced_at: None,
            old_client_states: old_client_states.into_iter().map(String::from).collect(),
        }
    }

    fn auth_data(
        client_state: &str,
        generation: Option<i64>,
        keys_changed_at: Option<i64>,
    ) -> AuthData {
        AuthData {
            fxa_uid: "test".to_owned(),
            email: "test@test.com".to_owned(),
            generation,
            keys_changed_at,
            client_state: client_state.to_owned(),
        }
    }

    fn request_with(user: results::GetOrCreateUser, auth_data: AuthData) -> TokenserverRequest {
        TokenserverRequest {
            user,
            auth_data,
            shared_secret: "secret".to_owned(),
            hashed_fxa_uid: "abcdef".to_owned(),
            hashed_device_id: "abcdef".to_owned(),
            service_id: 1,
            duration: TOKEN_DURATION,
            node_type: Default::default(),
        }
    }

    #[actix_rt::test]
    async fn test_valid_tokenserver_request() {
        let fxa_uid = "test123";
        let oauth_verifier = MockVerifier {
            valid: true,
            verify_output: oauth::VerifyOutput {
                fxa_uid: fxa_uid.to_owned(),
                generation: Some(1234),
            },
        };
        let state = make_state(oauth_verifier);

        let req = TestRequest::default()
            .app_data(Data::new(state))
            .app_data(Data::new(Arc::clone(&SECRETS)))
            .insert_header(("authorization", "Bearer fake_token"))
            .insert_header(("accept", "application/json,text/plain:q=0.5"))
            .insert_header(("x-keyid", "0000000001234-qqo"))
            .param("application", "sync")
            .param("version", "1.5")
            .uri("/1.0/sync/1.5?duration=100")
            .method(Method::GET)
            .to_http_request();

        let mut payload = Payload::None;
        let result = TokenserverRequest::from_request(&req, &mut payload)
            .await
            .unwrap();

        assert_eq!(result.auth_data.fxa_uid, fxa_uid);
        assert_eq!(result.auth_data.email, "test123@test.com");
        assert_eq!(result.auth_data.generation, Some(1234));
        assert_eq!(result.auth_data.keys_changed_at, Some(1234));
        assert_eq!(result.auth_data.client_state, "aaaa");
        assert_eq!(result.shared_secret, "Ted Koppel is a robot");
        assert_eq!(result.duration, 100);
    }

    #[actix_rt::test]
    async fn test_invalid_auth_token() {
        let fxa_uid = "test123";
        let oauth_verifier = MockVerifier {
            valid: false,
            verify_output: oauth::VerifyOutput {
                fxa_uid: fxa_uid.to_owned(),
                generation: Some(1234),
            },
        };
        let state = make_state(oauth_verifier);

        let request = TestRequest::default()
            .app_data(Data::new(state))
            .app_data(Data::new(Arc::clone(&SECRETS)))
            .insert_header(("authorization", "Bearer fake_token"))
            .insert_header(("accept", "application/json,text/plain:q=0.5"))
            .insert_header(("x-keyid", "0000000001234-qqo"))
            .param("application", "sync")
            .param("version", "1.5")
            .method(Method::GET)
            .to_http_request();

        let response: HttpResponse = TokenserverRequest::extract(&request)
            .await
            .unwrap_err()
            .into();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let expected_error = TokenserverError::invalid_credentials("Unauthorized".to_owned());
        let body = extract_body_as_str(ServiceResponse::new(request, response));
        assert_eq!(body, serde_json::to_string(&expected_error).unwrap());
    }

    #[actix_rt::test]
    async fn test_application_and_version() {
        fn build_request() -> TestRequest {
            let fxa_uid = "test123";
            let oauth_verifier = MockVerifier {
                valid: true,
                verify_output: oauth::VerifyOutput {
                    fxa_uid: fxa_uid.to_owned(),
                    generation: Some(1234),
                },
            };

            TestRequest::default()
                .app_data(Data::new(make_state(oauth_verifier)))
                .app_data(Data::new(Arc::clone(&SECRETS)))
                .insert_header(("authorization", "Bearer fake_token"))
                .insert_header(("accept", "application/json,text/plain:q=0.5"))
                .insert_header(("x-keyid", "0000000001234-qqo"))
                .method(Method::GET)
        }

        // Valid application and invalid version
        {
            let request = build_request()
                .param("application", "sync")
                .param("version", "1.0")
                .to_http_request();

            let response: HttpResponse = TokenserverRequest::extract(&request)
                .await
                .unwrap_err()
                .into();

            assert_eq!(response.status(), StatusCode::NOT_FOUND);

            let expected_error = TokenserverError::unsupported(
                "Unsupported application version".to_owned(),
                "1.0".to_owned(),
            );
            let body = extract_body_as_str(ServiceResponse::new(request, response));
            assert_eq!(body, serde_json::to_string(&expected_error).unwrap());
        }

        // Invalid application and valid version
        {
            let request = build_request()
                .param("application", "push")
                .param("version", "1.5")
                .to_http_request();

            let response: HttpResponse = TokenserverRequest::extract(&request)
                .await
                .unwrap_err()
                .into();

            assert_eq!(response.status(), StatusCode::NOT_FOUND);

            let expected_error = TokenserverError::unsupported(
                "Unsupported application".to_owned(),
                "application".to_owned(),
            );
            let body = extract_body_as_str(ServiceResponse::new(request, response));
            assert_eq!(body, serde_json::to_string(&expected_error).unwrap());
        }

        // Valid application and valid version
        {
            let request = build_request()
                .param("application", "sync")
                .param("version", "1.5")
                .to_http_request();

            assert!(TokenserverRequest::extract(&request).await.is_ok());
        }
    }

    #[actix_rt::test]
    async fn test_key_id() {
        fn build_request() -> TestRequest {
            let fxa_uid = "test123";
            let oauth_verifier = MockVerifier {
                valid: true,
                verify_output: oauth::VerifyOutput {
                    fxa_uid: fxa_uid.to_owned(),
                    generation: Some(1234),
                },
            };

            TestRequest::default()
                .app_data(Data::new(make_state(oauth_verifier)))
                .insert_header(("authorization", "Bearer fake_token"))
                .insert_header(("accept", "application/json,text/plain:q=0.5"))
                .param("application", "sync")
                .param("version", "1.5")
                .method(Method::GET)
        }

        // Request with no X-KeyID header
        {
            let request = build_request().to_http_request();
            let response: HttpResponse = KeyId::extract(&request).await.unwrap_err().into();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

            let expected_error =
                TokenserverError::invalid_key_id("Missing X-KeyID header".to_owned());
            let body = extract_body_as_str(ServiceResponse::new(request, response));
            assert_eq!(body, serde_json::to_string(&expected_error).unwrap());
        }

        // Improperly-formatted X-KeyID header
        {
            let request = build_request()
                .insert_header(("x-keyid", "00000000"))
                .to_http_request();
            let response: HttpResponse = KeyId::extract(&request).await.unwrap_err().into();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

            let expected_error = TokenserverError::invalid_credentials("Unauthorized".to_owned());
            let body = extract_body_as_str(ServiceResponse::new(request, response));
            assert_eq!(body, serde_json::to_string(&expected_error).unwrap());
        }

        // X-KeyID header with improperly-base64-encoded client state bytes
        {
            let request = build_request()
                .insert_header(("x-keyid", "0000000001234-notbase64"))
                .to_http_request();
            let response: HttpResponse = KeyId::extract(&request).await.unwrap_err().into();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

            let expected_error = TokenserverError::invalid_credentials("Unauthorized".to_owned());
            let body = extract_body_as_str(ServiceResponse::new(request, response));
            assert_eq!(body, serde_json::to_string(&expected_error).unwrap());
        }

        // X-KeyID header with non-UTF-8 bytes
        {
            let request = build_request()
                .insert_header(("x-keyid", &[0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8][..]))
                .to_http_request();
            let response: HttpResponse = KeyId::extract(&request).await.unwrap_err().into();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

            let expected_error =
                TokenserverError::invalid_key_id("Invalid X-KeyID header".to_owned());
            let body = extract_body_as_str(ServiceResponse::new(request, response));
            assert_eq!(body, serde_json::to_string(&expected_error).unwrap());
        }

        // X-KeyID header with non-integral keys_changed_at
        {
            let request = build_request()
                .insert_header(("x-keyid", "notanumber-qqo"))
                .to_http_request();
            let response: HttpResponse = KeyId::extract(&request).await.unwrap_err().into();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

            let expected_error = TokenserverError::invalid_credentials("Unauthorized".to_owned());
            let body = extract_body_as_str(ServiceResponse::new(request, response));
            assert_eq!(body, serde_json::to_string(&expected_error).unwrap());
        }

        // X-KeyID header with a negative keys_changed_at
        {
            let request = build_request()
                .insert_header(("x-keyid", "-1234-qqo"))
                .to_http_request();
            let response: HttpResponse = KeyId::extract(&request).await.unwrap_err().into();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        // X-KeyID header with client state that does not match the
        // X-Client-State header
        {
            let request = build_request()
                .insert_header(("x-keyid", "0000000001234-qqo"))
                .insert_header(("x-client-state", "bbbb"))
                .to_http_request();
            let response: HttpResponse = KeyId::extract(&request).await.unwrap_err().into();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

            let expected_error = TokenserverError {
                status: "invalid-client-state",
                location: ErrorLocation::Body,
                ..TokenserverError::default()
            };
            let body = extract_body_as_str(ServiceResponse::new(request, response));
            assert_eq!(body, serde_json::to_string(&expected_error).unwrap());
        }

        // Valid X-KeyID header with matching X-Client-State header
        {
            let request = build_request()
                .insert_header(("x-keyid", "0000000001234-qqo"))
                .insert_header(("x-client-state", "aaaa"))
                .to_http_request();
            let key_id = KeyId::extract(&request).await.unwrap();
            let expected_key_id = KeyId {
                client_state: "aaaa".to_owned(),
                keys_changed_at: 1234,
            };

            assert_eq!(key_id, expected_key_id);
        }

        // Valid X-KeyID header with no X-Client-State header
        {
            let request = build_request()
                .insert_header(("x-keyid", "0000000001234-qqo"))
                .to_http_request();
            let key_id = KeyId::extract(&request).await.unwrap();
            let expected_key_id = KeyId {
                client_state: "aaaa".to_owned(),
                keys_changed_at: 1234,
            };

            assert_eq!(key_id, expected_key_id);
        }
    }

    #[actix_rt::test]
    async fn test_old_generation() {
        // The request includes a generation that is less than the
        // generation currently stored on the user record
        let tokenserver_request = request_with(
            user("aaaa", 1234, Some(1234), vec![]),
            auth_data("aaaa", Some(1233), Some(1234)),
        );

        let error = tokenserver_request.validate().unwrap_err();
        assert_eq!(
            error,
            TokenserverError {
                context: "New generation less than previously-seen generation".to_owned(),
                ..TokenserverError::invalid_generation()
            }
        );
    }

    #[actix_rt::test]
    async fn test_old_keys_changed_at() {
        // The request includes a keys_changed_at that is less than the
        // keys_changed_at currently stored on the user record
        let tokenserver_request = request_with(
            user("aaaa", 1234, Some(1234), vec![]),
            auth_data("aaaa", Some(1234), Some(1233)),
        );

        let error = tokenserver_request.validate().unwrap_err();
        assert_eq!(
            error,
            TokenserverError {
                context: "New keys_changed_at less than previously-seen keys_changed_at".to_owned(),
                ..TokenserverError::invalid_keys_changed_at()
            }
        );
    }

    #[actix_rt::test]
    async fn test_keys_changed_without_generation_change() {
        // The request includes a new value for keys_changed_at without a
        // new value for generation
        let tokenserver_request = request_with(
            user("aaaa", 1234, Some(1234), vec![]),
            auth_data("aaaa", Some(1234), Some(1235)),
        );

        let error = tokenserver_request.validate().unwrap_err();
        assert_eq!(
            error,
            TokenserverError {
                context: "keys_changed_at greater than generation".to_owned(),
                ..TokenserverError::invalid_keys_changed_at()
            }
        );
    }

    #[actix_rt::test]
    async fn test_old_client_state() {
        // The request includes a previously-used client state that is not
        // the user's current client state
        let tokenserver_request = request_with(
            user("aaaa", 1234, Some(1234), vec!["bbbb"]),
            auth_data("bbbb", Some(1234), Some(1234)),
        );

        let error = tokenserver_request.validate().unwrap_err();
        let error_message = "Unacceptable client-state value stale value".to_owned();
        assert_eq!(
            error,
            TokenserverError::invalid_client_state(
                error_message,
                Some(vec![("is_stale", "true".to_owned())])
            )
        );
    }

    #[actix_rt::test]
    async fn test_new_client_state_without_generation_change() {
        // The request includes a new client state without a new generation
        // value
        let tokenserver_request = request_with(
            user("aaaa", 1234, Some(1234), vec![]),
            auth_data("bbbb", Some(1234), Some(1234)),
        );

        let error = tokenserver_request.validate().unwrap_err();
        let error_message =
            "Unacceptable client-state value new value with no generation change".to_owned();
        assert_eq!(
            error,
            TokenserverError::invalid_client_state(error_message, None),
        );
    }

    #[actix_rt::test]
    async fn test_new_client_state_without_key_change() {
        // The request includes a new client state without a new
        // keys_changed_at value
        let tokenserver_request = request_with(
            user("aaaa", 1234, Some(1234), vec![]),
            auth_data("bbbb", Some(1235), Some(1234)),
        );

        let error = tokenserver_request.validate().unwrap_err();
        let error_message =
            "Unacceptable client-state value new value with no keys_changed_at change".to_owned();
        assert_eq!(
            error,
            TokenserverError::invalid_client_state(error_message, None)
        );
    }

    #[actix_rt::test]
    async fn test_keys_changed_at_must_not_revert_to_null() {
        // Once a non-zero keys_changed_at has been seen, requests without
        // one are rejected
        let tokenserver_request = request_with(
            user("aaaa", 1234, Some(1234), vec![]),
            auth_data("aaaa", Some(1234), None),
        );

        let error = tokenserver_request.validate().unwrap_err();
        assert_eq!(error.status, "invalid-keysChangedAt");

        // but a stored value of zero tolerates a missing header
        let tokenserver_request = request_with(
            user("aaaa", 1234, Some(0), vec![]),
            auth_data("aaaa", Some(1234), None),
        );
        assert!(tokenserver_request.validate().is_ok());
    }
}
