//! Request header/body/query extractors
//!
//! Ensures the headers, body, and query parameters are correct, extracts
//! them to relevant types, and fails correctly with the appropriate errors
//! if issues arise.

use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
    sync::Arc,
};

use actix_web::{
    dev::{ConnectionInfo, Extensions, Payload, RequestHead},
    http::header::{Accept, ContentType, Header, HeaderMap, QualityItem},
    http::Uri,
    web::{Data, Json, Query},
    Error, FromRequest, HttpMessage, HttpRequest,
};
use futures::future::{self, FutureExt, LocalBoxFuture, Ready, TryFutureExt};
use lazy_static::lazy_static;
use mime::STAR_STAR;
use regex::Regex;
use serde::{
    de::{Deserializer, Error as SerdeError, IgnoredAny},
    Deserialize, Serialize,
};
use serde_json::Value;
use validator::{Validate, ValidationError};

use weaveserver_common::{Metrics, X_WEAVE_BYTES, X_WEAVE_RECORDS, X_WEAVE_TOTAL_BYTES, X_WEAVE_TOTAL_RECORDS};
use weaveserver_settings::Secrets;
use weavestorage_db::{params, DbError, DbPool, Sorting, SyncTimestamp, UserIdentifier};

use super::{
    auth::HawkPayload,
    error::{HawkErrorKind, ValidationErrorKind},
    transaction::DbTransactionPool,
    DOCKER_FLOW_ENDPOINTS,
};
use crate::error::{ApiError, ApiErrorKind};
use crate::server::{MetricsWrapper, ServerState, BSO_ID_REGEX, COLLECTION_ID_REGEX};

pub const BATCH_MAX_IDS: usize = 100;

// BSO body constraints
pub const BSO_MAX_TTL: u32 = 999_999_999;
pub const BSO_MAX_SORTINDEX_VALUE: i32 = 999_999_999;
pub const BSO_MIN_SORTINDEX_VALUE: i32 = -999_999_999;

pub const ACCEPTED_CONTENT_TYPES: [&str; 3] =
    ["application/json", "text/plain", "application/newlines"];

lazy_static! {
    static ref KNOWN_BAD_PAYLOAD_REGEX: Regex =
        Regex::new(r#"IV":\s*"AAAAAAAAAAAAAAAAAAAAAA=="#).unwrap();
    static ref VALID_ID_REGEX: Regex = Regex::new(&format!("^{}$", BSO_ID_REGEX)).unwrap();
    static ref VALID_COLLECTION_ID_REGEX: Regex =
        Regex::new(&format!("^{}$", COLLECTION_ID_REGEX)).unwrap();
    static ref TRUE_REGEX: Regex = Regex::new("^(?i)true$").unwrap();
}

/// Validation Error Location in the request
#[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestErrorLocation {
    Body,
    QueryString,
    Url,
    Header,
    Path,
    Cookies,
    Method,
    Unknown,
}

/// Convenience function to create a `ValidationError` with additional context
fn request_error(message: &'static str, location: RequestErrorLocation) -> ValidationError {
    let mut err = ValidationError::new(message);
    err.add_param("location".into(), &location);
    err
}

pub fn urldecode(s: &str) -> Result<String, ApiError> {
    let decoded: String = urlencoding::decode(s)
        .map_err(|e| {
            trace!("Extract: unclean urldecode entry: {:?} {:?}", s, e);
            ApiErrorKind::Internal(e.to_string())
        })?
        .into_owned();
    Ok(decoded)
}

/// Pull the most-preferred Accept entry we support, or the default for
/// `*/*`. Anything else resolves to "invalid" so callers can 406.
pub fn get_accepted(req: &HttpRequest, accepted: &[&str], default: &'static str) -> String {
    let mut candidates = Accept::parse(req).unwrap_or_else(|_| {
        Accept(vec![QualityItem::max(
            mime::Mime::from_str(default).expect("Could not parse default mime type"),
        )])
    });
    if candidates.is_empty() {
        return default.to_owned();
    }
    candidates.sort_by(|a, b| {
        b.quality
            .partial_cmp(&a.quality)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for qitem in candidates.iter().cloned() {
        if qitem.item == STAR_STAR {
            return default.to_owned();
        }
        let lc = qitem.item.to_string().to_lowercase();
        if accepted.contains(&lc.as_str()) {
            return lc;
        }
    }
    "invalid".to_string()
}

/// Verifies the BSO sortindex is in the valid range
fn validate_body_bso_sortindex(sort: i32) -> Result<(), ValidationError> {
    if (BSO_MIN_SORTINDEX_VALUE..=BSO_MAX_SORTINDEX_VALUE).contains(&sort) {
        Ok(())
    } else {
        Err(request_error("invalid value", RequestErrorLocation::Body))
    }
}

/// Verifies the BSO id string is valid
fn validate_body_bso_id(id: &str) -> Result<(), ValidationError> {
    if !VALID_ID_REGEX.is_match(id) {
        return Err(request_error("Invalid id", RequestErrorLocation::Body));
    }
    Ok(())
}

/// Verifies the BSO ttl is valid
fn validate_body_bso_ttl(ttl: u32) -> Result<(), ValidationError> {
    if ttl > BSO_MAX_TTL {
        return Err(request_error("Invalid TTL", RequestErrorLocation::Body));
    }
    Ok(())
}

/// Verifies that the list of id's is not too long and that the ids are valid
fn validate_qs_ids(ids: &[String]) -> Result<(), ValidationError> {
    if ids.len() > BATCH_MAX_IDS {
        return Err(request_error(
            "Too many ids provided",
            RequestErrorLocation::QueryString,
        ));
    }
    for id in ids {
        if !VALID_ID_REGEX.is_match(id) {
            return Err(request_error(
                "Invalid id in ids",
                RequestErrorLocation::QueryString,
            ));
        }
    }
    Ok(())
}

/// Verifies the batch commit field is valid
fn validate_qs_commit(commit: &str) -> Result<(), ValidationError> {
    if !TRUE_REGEX.is_match(commit) {
        return Err(request_error(
            r#"commit parameter must be "true" to apply batches"#,
            RequestErrorLocation::QueryString,
        ));
    }
    Ok(())
}

/// Deserialize a header string value (epoch seconds with 2 decimal places)
/// as a SyncTimestamp
fn deserialize_sync_timestamp<'de, D>(deserializer: D) -> Result<Option<SyncTimestamp>, D::Error>
where
    D: Deserializer<'de>,
{
    let maybe_str: Option<String> = Deserialize::deserialize(deserializer)?;
    if let Some(val) = maybe_str {
        let result = SyncTimestamp::from_header(&val).map_err(SerdeError::custom);
        Ok(Some(result?))
    } else {
        Ok(None)
    }
}

fn deserialize_offset<'de, D>(deserializer: D) -> Result<Option<params::Offset>, D::Error>
where
    D: Deserializer<'de>,
{
    let maybe_str: Option<String> = Deserialize::deserialize(deserializer)?;
    if let Some(val) = maybe_str {
        return Ok(Some(
            params::Offset::from_str(&val).map_err(SerdeError::custom)?,
        ));
    }
    Ok(None)
}

/// Deserialize a comma separated string
fn deserialize_comma_sep_string<'de, D, E>(deserializer: D) -> Result<Vec<E>, D::Error>
where
    D: Deserializer<'de>,
    E: FromStr,
{
    let str: String = Deserialize::deserialize(deserializer)?;
    let lst: Vec<String> = str
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let mut parsed_lst: Vec<E> = Vec::new();
    for item in lst {
        parsed_lst.push(
            item.parse::<E>()
                .map_err(|_| SerdeError::custom("Invalid value in list"))?,
        );
    }
    Ok(parsed_lst)
}

/// Deserialize a value as True if it exists, False otherwise
#[allow(clippy::unnecessary_wraps)] // serde::Deserialize requires Result<bool>
fn deserialize_present_value<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let maybe_str: Option<String> = Option::deserialize(deserializer).unwrap_or(None);
    Ok(maybe_str.is_some())
}

/// UID parameter from the URL path
#[allow(dead_code)] // Not really dead, but Rust can't see the deserialized use.
#[derive(Deserialize)]
pub struct UidParam {
    pub uid: u64,
}

/// BSO search parameters from the query string.
///
/// Used by several handlers; not every param applies to each one.
#[derive(Debug, Default, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct BsoQueryParams {
    /// lower-bound on last-modified time
    #[serde(deserialize_with = "deserialize_sync_timestamp")]
    pub newer: Option<SyncTimestamp>,

    /// upper-bound on last-modified time
    #[serde(deserialize_with = "deserialize_sync_timestamp")]
    pub older: Option<SyncTimestamp>,

    /// order in which to return results
    #[serde(default)]
    pub sort: Sorting,

    /// maximum number of items to return
    pub limit: Option<u32>,

    /// position at which to restart search (an opaque cursor issued by a
    /// previous truncated response)
    #[serde(deserialize_with = "deserialize_offset")]
    pub offset: Option<params::Offset>,

    /// a comma-separated list of BSO ids
    #[serde(deserialize_with = "deserialize_comma_sep_string", default)]
    #[validate(custom(function = "validate_qs_ids"))]
    pub ids: Vec<String>,

    // flag, whether to include full bodies
    #[serde(deserialize_with = "deserialize_present_value")]
    pub full: bool,
}

impl FromRequest for BsoQueryParams {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        let mut payload = Payload::None;
        Box::pin(async move {
            let params = Query::<BsoQueryParams>::from_request(&req, &mut payload)
                .map_err(|e| {
                    ValidationErrorKind::FromDetails(
                        e.to_string(),
                        RequestErrorLocation::QueryString,
                        None,
                        None,
                    )
                })
                .await?
                .into_inner();
            params.validate().map_err(|e| {
                ValidationErrorKind::FromValidationErrors(
                    e,
                    RequestErrorLocation::QueryString,
                    None,
                )
            })?;
            Ok(params)
        })
    }
}

#[derive(Debug, Default, Clone, Deserialize, Validate)]
#[serde(default)]
struct BatchParams {
    pub batch: Option<String>,
    #[validate(custom(function = "validate_qs_commit"))]
    pub commit: Option<String>,
}

/// The batch intent derived from the `batch`/`commit` query params: a new
/// batch, an append to an existing one, and/or a commit.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct BatchRequest {
    pub id: Option<String>,
    pub commit: bool,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct BatchRequestOpt {
    pub opt: Option<BatchRequest>,
}

impl FromRequest for BatchRequestOpt {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<BatchRequestOpt, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        let mut payload = Payload::None;
        Box::pin(async move {
            let params = Query::<BatchParams>::from_request(&req, &mut payload)
                .map_err(|e| {
                    ValidationErrorKind::FromDetails(
                        e.to_string(),
                        RequestErrorLocation::QueryString,
                        None,
                        None,
                    )
                })
                .await?
                .into_inner();
            let state = match req.app_data::<Data<ServerState>>() {
                Some(s) => s,
                None => {
                    error!("⚠️ Could not load the app state");
                    return Err(ValidationErrorKind::FromDetails(
                        "Internal error".to_owned(),
                        RequestErrorLocation::Unknown,
                        Some("state".to_owned()),
                        None,
                    )
                    .into());
                }
            };

            let limits = &state.limits;

            // Client-advertised size headers are rejected before the body
            // is parsed when they exceed the server limits.
            let checks = [
                (X_WEAVE_RECORDS, limits.max_post_records),
                (X_WEAVE_BYTES, limits.max_post_bytes),
                (X_WEAVE_TOTAL_RECORDS, limits.max_total_records),
                (X_WEAVE_TOTAL_BYTES, limits.max_total_bytes),
            ];
            for (header, limit) in &checks {
                let value = match req.headers().get(*header) {
                    Some(value) => value.to_str().map_err(|e| {
                        let err: ApiError = ValidationErrorKind::FromDetails(
                            e.to_string(),
                            RequestErrorLocation::Header,
                            Some((*header).to_owned()),
                            None,
                        )
                        .into();
                        err
                    })?,
                    None => continue,
                };
                let count = value.parse::<u32>().map_err(|_| {
                    let err: ApiError = ValidationErrorKind::FromDetails(
                        format!("Invalid integer value: {}", value),
                        RequestErrorLocation::Header,
                        Some((*header).to_owned()),
                        Some("request.validate.batch.invalid_x_weave"),
                    )
                    .into();
                    err
                })?;
                if count > *limit {
                    return Err(ValidationErrorKind::FromDetails(
                        "size-limit-exceeded".to_owned(),
                        RequestErrorLocation::Header,
                        None,
                        Some("request.validate.batch.size_exceeded"),
                    )
                    .into());
                }
            }

            if params.batch.is_none() && params.commit.is_none() {
                // No batch options requested
                return Ok(Self { opt: None });
            } else if params.batch.is_none() {
                // commit w/ no batch ID is an error
                return Err(ValidationErrorKind::FromDetails(
                    "Commit with no batch specified".to_string(),
                    RequestErrorLocation::Path,
                    None,
                    Some("request.validate.batch.missing_id"),
                )
                .into());
            }

            params.validate().map_err(|e| {
                let err: ApiError = ValidationErrorKind::FromValidationErrors(
                    e,
                    RequestErrorLocation::QueryString,
                    None,
                )
                .into();
                err
            })?;

            let id = match params.batch {
                None => None,
                Some(ref batch) if batch.is_empty() || TRUE_REGEX.is_match(batch) => None,
                Some(batch) => {
                    let transaction_pool = DbTransactionPool::extract(&req).await?;
                    let pool = transaction_pool.get_pool()?;

                    if pool.validate_batch_id(batch.clone()).is_err() {
                        return Err(ValidationErrorKind::FromDetails(
                            format!(r#"Invalid batch ID: "{}""#, batch),
                            RequestErrorLocation::QueryString,
                            Some("batch".to_owned()),
                            Some("request.validate.batch.invalid_id"),
                        )
                        .into());
                    }
                    Some(batch)
                }
            };

            Ok(Self {
                opt: Some(BatchRequest {
                    id,
                    commit: params.commit.is_some(),
                }),
            })
        })
    }
}

/// A BSO body as it arrives in a single PUT request.
#[derive(Default, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct BsoBody {
    #[validate(custom(function = "validate_body_bso_id"))]
    pub id: Option<String>,
    #[validate(custom(function = "validate_body_bso_sortindex"))]
    pub sortindex: Option<i32>,
    pub payload: Option<String>,
    #[validate(custom(function = "validate_body_bso_ttl"))]
    pub ttl: Option<u32>,
    /// Any client-supplied value for these fields are ignored
    #[serde(rename(deserialize = "modified"), skip_serializing)]
    pub _ignored_modified: Option<IgnoredAny>,
    #[serde(rename(deserialize = "collection"), skip_serializing)]
    pub _ignored_collection: Option<IgnoredAny>,
}

impl FromRequest for BsoBody {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<BsoBody, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        // req.clone() allows the move into the async block; payload.take()
        // grabs the request body payload so it's strictly read once
        let req = req.clone();
        let mut payload = payload.take();

        Box::pin(async move {
            // Only try and parse the body if it's a valid content-type
            let ctype = match ContentType::parse(&req) {
                Ok(v) => v,
                Err(e) => {
                    return Err(ValidationErrorKind::FromDetails(
                        format!("Unreadable Content-Type: {:?}", e),
                        RequestErrorLocation::Header,
                        Some("Content-Type".to_owned()),
                        Some("request.error.invalid_content_type"),
                    )
                    .into())
                }
            };

            let content_type = format!("{}/{}", ctype.type_(), ctype.subtype());
            if !ACCEPTED_CONTENT_TYPES.contains(&content_type.as_ref()) {
                return Err(ValidationErrorKind::FromDetails(
                    "Invalid Content-Type".to_owned(),
                    RequestErrorLocation::Header,
                    Some("Content-Type".to_owned()),
                    Some("request.error.invalid_content_type"),
                )
                .into());
            }
            let state = match req.app_data::<Data<ServerState>>() {
                Some(s) => s,
                None => {
                    error!("⚠️ Could not load the app state");
                    return Err(ValidationErrorKind::FromDetails(
                        "Internal error".to_owned(),
                        RequestErrorLocation::Unknown,
                        Some("app_data".to_owned()),
                        None,
                    )
                    .into());
                }
            };

            let max_payload_size = state.limits.max_record_payload_bytes as usize;

            let bso = <Json<BsoBody>>::from_request(&req, &mut payload)
                .await
                .map_err(|e| {
                    warn!("⚠️ Could not parse BSO Body: {:?}", e);
                    ValidationErrorKind::FromDetails(
                        e.to_string(),
                        RequestErrorLocation::Body,
                        Some("bso".to_owned()),
                        Some("request.validate.bad_bso_body"),
                    )
                })?;

            // Check the max payload size manually with our desired limit
            if bso
                .payload
                .as_ref()
                .map(std::string::String::len)
                .unwrap_or_default()
                > max_payload_size
            {
                return Err(ValidationErrorKind::FromDetails(
                    "payload too large".to_owned(),
                    RequestErrorLocation::Body,
                    Some("bso".to_owned()),
                    Some("request.validate.payload_too_large"),
                )
                .into());
            }
            if let Err(e) = bso.validate() {
                return Err(ValidationErrorKind::FromValidationErrors(
                    e,
                    RequestErrorLocation::Body,
                    None,
                )
                .into());
            }
            Ok(bso.into_inner())
        })
    }
}

/// A BSO body as it arrives as an item in a POST list.
#[derive(Debug, Deserialize, Validate)]
pub struct BatchBsoBody {
    #[validate(custom(function = "validate_body_bso_id"))]
    pub id: String,
    #[validate(custom(function = "validate_body_bso_sortindex"))]
    pub sortindex: Option<i32>,
    pub payload: Option<String>,
    #[validate(custom(function = "validate_body_bso_ttl"))]
    pub ttl: Option<u32>,
}

impl BatchBsoBody {
    /// Convert a valid raw JSON BSO body to a BatchBsoBody
    pub fn from_raw_bso(val: Value) -> Result<BatchBsoBody, String> {
        let map = val.as_object().ok_or("invalid json")?;
        // Verify all the keys are valid. modified/collection are allowed
        // but ignored
        let valid_keys = [
            "id",
            "sortindex",
            "payload",
            "ttl",
            "modified",
            "collection",
        ];
        for key_name in map.keys() {
            if !valid_keys.contains(&key_name.as_str()) {
                return Err(format!("unknown field {}", key_name));
            }
        }
        serde_json::from_value(val)
            .map_err(|_| "invalid json".to_string())
            .and_then(|v: BatchBsoBody| match v.validate() {
                Ok(()) => Ok(v),
                Err(e) => Err(format!("invalid bso: {}", e)),
            })
    }
}

impl From<BatchBsoBody> for params::PostCollectionBso {
    fn from(b: BatchBsoBody) -> params::PostCollectionBso {
        params::PostCollectionBso {
            id: b.id,
            sortindex: b.sortindex,
            payload: b.payload,
            ttl: b.ttl,
        }
    }
}

/// The list of BSO bodies in a POST request, split into the valid ones and
/// the per-id failures.
#[derive(Default, Deserialize)]
pub struct BsoBodies {
    pub valid: Vec<BatchBsoBody>,
    pub invalid: HashMap<String, String>,
}

impl FromRequest for BsoBodies {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    /// Extract the BSO Bodies from the request
    ///
    /// This extraction ensures the following conditions:
    ///   - Total payload size does not exceed `max_post_bytes`
    ///   - All BSO's deserialize from the request correctly
    ///   - Request content-type is a valid value
    ///   - Valid BSO's include a BSO id
    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        // Only try and parse the body if it's a valid content-type
        let ctype = match ContentType::parse(req) {
            Ok(v) => v,
            Err(e) => {
                return Box::pin(future::err(
                    ValidationErrorKind::FromDetails(
                        format!("Unreadable Content-Type: {:?}", e),
                        RequestErrorLocation::Header,
                        Some("Content-Type".to_owned()),
                        Some("request.error.invalid_content_type"),
                    )
                    .into(),
                ))
            }
        };
        let content_type = format!("{}/{}", ctype.type_(), ctype.subtype());
        trace!("BSO Body content_type: {:?}", &content_type);

        if !ACCEPTED_CONTENT_TYPES.contains(&content_type.as_ref()) {
            return Box::pin(future::err(
                ValidationErrorKind::FromDetails(
                    format!("Invalid Content-Type {:?}", content_type),
                    RequestErrorLocation::Header,
                    Some("Content-Type".to_owned()),
                    Some("request.error.invalid_content_type"),
                )
                .into(),
            ));
        }

        // Load the entire request into a String
        let fut = <String>::from_request(req, payload).map_err(|e| {
            warn!("⚠️ Payload read error: {:?}", e);
            let err: Error = ValidationErrorKind::FromDetails(
                "Mimetype/encoding/content-length error".to_owned(),
                RequestErrorLocation::Header,
                None,
                None,
            )
            .into();
            err
        });

        // Avoid duplicating by defining our error func now
        fn make_error() -> Error {
            ValidationErrorKind::FromDetails(
                "Invalid JSON in request body".to_owned(),
                RequestErrorLocation::Body,
                Some("bsos".to_owned()),
                Some("request.validate.invalid_body_json"),
            )
            .into()
        }

        // Capture the newline flag before the content_type is dropped
        let newlines: bool = content_type == "application/newlines";

        // Grab the max sizes
        let state = match req.app_data::<Data<ServerState>>() {
            Some(s) => s,
            None => {
                error!("⚠️ Could not load the app state");
                return Box::pin(future::err(
                    ValidationErrorKind::FromDetails(
                        "Internal error".to_owned(),
                        RequestErrorLocation::Unknown,
                        Some("app_data".to_owned()),
                        None,
                    )
                    .into(),
                ));
            }
        };

        let max_payload_size = state.limits.max_record_payload_bytes as usize;
        let max_post_bytes = state.limits.max_post_bytes as usize;

        let fut = fut.and_then(move |body| {
            // Get all the raw JSON values
            let bsos: Vec<Value> = if newlines {
                let mut bsos = Vec::new();
                for item in body.lines() {
                    // Check that its a valid JSON map like we expect
                    if let Ok(raw_json) = serde_json::from_str::<Value>(item) {
                        bsos.push(raw_json);
                    } else {
                        // Per the python version, BSO's must json deserialize
                        return future::err(make_error());
                    }
                }
                bsos
            } else if let Ok(json_vals) = serde_json::from_str::<Vec<Value>>(&body) {
                json_vals
            } else {
                // Per the python version, BSO's must json deserialize
                return future::err(make_error());
            };

            // Validate all the BSO's, move invalid to our other list. Assume
            // they'll all make it with our pre-allocation
            let mut valid: Vec<BatchBsoBody> = Vec::with_capacity(bsos.len());

            // Invalid BSO's are any BSO that can deserialize despite how
            // wrong the contents are, per the way the python version works
            let mut invalid: HashMap<String, String> = HashMap::new();

            // Keep track of our total payload size
            let mut total_payload_size = 0;

            // Temporarily track the bso id's for dupe detection
            let mut bso_ids: HashSet<String> = HashSet::with_capacity(bsos.len());

            for bso in bsos {
                // Error out if its not a JSON mapping type
                if !bso.is_object() {
                    return future::err(make_error());
                }
                // Save all id's we get, check for missing id, or duplicate.
                let bso_id = if let Some(id) = bso.get("id").and_then(serde_json::Value::as_str) {
                    let id = id.to_string();
                    if bso_ids.contains(&id) {
                        return future::err(
                            ValidationErrorKind::FromDetails(
                                "Input BSO has duplicate ID".to_owned(),
                                RequestErrorLocation::Body,
                                Some("bsos".to_owned()),
                                Some("request.store.duplicate_bso_id"),
                            )
                            .into(),
                        );
                    } else {
                        bso_ids.insert(id.clone());
                        id
                    }
                } else {
                    return future::err(
                        ValidationErrorKind::FromDetails(
                            "Input BSO has no ID".to_owned(),
                            RequestErrorLocation::Body,
                            Some("bsos".to_owned()),
                            Some("request.store.missing_bso_id"),
                        )
                        .into(),
                    );
                };
                match BatchBsoBody::from_raw_bso(bso) {
                    Ok(b) => {
                        // Is this record too large? Deny if it is.
                        let payload_size = b
                            .payload
                            .as_ref()
                            .map(std::string::String::len)
                            .unwrap_or_default();
                        total_payload_size += payload_size;
                        if payload_size <= max_payload_size && total_payload_size <= max_post_bytes
                        {
                            valid.push(b);
                        } else {
                            invalid.insert(b.id, "retry bytes".to_string());
                        }
                    }
                    Err(e) => {
                        invalid.insert(bso_id, e);
                    }
                }
            }
            future::ok(BsoBodies { valid, invalid })
        });

        Box::pin(fut)
    }
}

/// A user-identifier extracted from the authentication token and validated
/// against the URL.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct HawkIdentifier {
    /// The tokenserver-assigned uid, the storage tables' primary key.
    pub legacy_id: u64,
    pub fxa_uid: String,
    pub fxa_kid: String,
    pub hashed_fxa_uid: String,
    pub hashed_device_id: String,
}

impl HawkIdentifier {
    pub fn cmd_dummy() -> Self {
        // Create a "dummy" identifier for the DockerFlow commands
        Self {
            legacy_id: 0,
            fxa_uid: "cmd".to_owned(),
            fxa_kid: "cmd".to_owned(),
            hashed_fxa_uid: "cmd".to_owned(),
            hashed_device_id: "cmd".to_owned(),
        }
    }

    fn uid_from_path(uri: &Uri) -> Result<u64, Error> {
        // path: "/1.5/{uid}"
        let elements: Vec<&str> = uri.path().split('/').collect();
        if let Some(v) = elements.get(2) {
            let clean = match urldecode(v) {
                Err(e) => {
                    warn!("⚠️ HawkIdentifier Error invalid UID {:?} {:?}", v, e);
                    return Err(ValidationErrorKind::FromDetails(
                        "Invalid UID".to_owned(),
                        RequestErrorLocation::Path,
                        Some("uid".to_owned()),
                        Some("request.validate.hawk.invalid_uid"),
                    )
                    .into());
                }
                Ok(v) => v,
            };
            u64::from_str(&clean).map_err(|e| {
                warn!("⚠️ HawkIdentifier Error invalid UID {:?} {:?}", v, e);
                ValidationErrorKind::FromDetails(
                    "Invalid UID".to_owned(),
                    RequestErrorLocation::Path,
                    Some("uid".to_owned()),
                    Some("request.validate.hawk.invalid_uid"),
                )
                .into()
            })
        } else {
            warn!("⚠️ HawkIdentifier Error missing UID {:?}", uri);
            Err(ValidationErrorKind::FromDetails(
                "Missing UID".to_owned(),
                RequestErrorLocation::Path,
                Some("uid".to_owned()),
                Some("request.validate.hawk.missing_uid"),
            ))?
        }
    }

    pub fn extrude<T>(
        msg: &T,
        method: &str,
        uri: &Uri,
        ci: &ConnectionInfo,
        secrets: &Secrets,
    ) -> Result<Self, Error>
    where
        T: HttpMessage,
    {
        if let Some(user_id) = msg.extensions().get::<HawkIdentifier>() {
            return Ok(user_id.clone());
        }

        let auth_header = msg
            .headers()
            .get("authorization")
            .ok_or_else(|| -> ApiError { HawkErrorKind::MissingHeader.into() })?
            .to_str()
            .map_err(|e| -> ApiError { HawkErrorKind::Header(e).into() })?;
        let identifier = Self::generate(secrets, method, auth_header, ci, uri)?;
        msg.extensions_mut().insert(identifier.clone());
        Ok(identifier)
    }

    pub fn generate(
        secrets: &Secrets,
        method: &str,
        header: &str,
        connection_info: &ConnectionInfo,
        uri: &Uri,
    ) -> Result<Self, Error> {
        let payload = HawkPayload::extrude(header, method, secrets, connection_info, uri)?;
        let puid = Self::uid_from_path(uri)?;
        if payload.user_id != puid {
            warn!("⚠️ Hawk UID not in URI: {:?} {:?}", payload.user_id, uri);
            Err(ValidationErrorKind::FromDetails(
                "conflicts with payload".to_owned(),
                RequestErrorLocation::Path,
                Some("uid".to_owned()),
                Some("request.validate.hawk.uri_missing_uid"),
            ))?;
        }

        let user_id = HawkIdentifier {
            legacy_id: payload.user_id,
            fxa_uid: payload.fxa_uid,
            fxa_kid: payload.fxa_kid,
            hashed_fxa_uid: payload.hashed_fxa_uid,
            hashed_device_id: payload.hashed_device_id,
        };
        Ok(user_id)
    }
}

impl From<HawkIdentifier> for UserIdentifier {
    fn from(hawk_id: HawkIdentifier) -> Self {
        Self {
            legacy_id: hawk_id.legacy_id,
            fxa_uid: hawk_id.fxa_uid,
            fxa_kid: hawk_id.fxa_kid,
            hashed_fxa_uid: hawk_id.hashed_fxa_uid,
            hashed_device_id: hawk_id.hashed_device_id,
        }
    }
}

impl FromRequest for HawkIdentifier {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    /// Use HawkPayload extraction and format as HawkIdentifier.
    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        // Dummy token if a Docker Flow request is detected.
        if DOCKER_FLOW_ENDPOINTS.contains(&req.uri().path().to_lowercase().as_str()) {
            return future::ready(Ok(HawkIdentifier::cmd_dummy()));
        }
        let req = req.clone();
        let uri = req.uri();
        // NOTE: `connection_info()` takes a mutable reference lock on
        // `extensions()`
        let connection_info = req.connection_info().clone();
        let method = req.method().clone();
        let secrets = match req.app_data::<Data<Arc<Secrets>>>() {
            Some(v) => v,
            None => {
                let err: ApiError = ApiErrorKind::Internal("No app_data Secrets".to_owned()).into();
                return future::ready(Err(err.into()));
            }
        };

        future::ready(Self::extrude(
            &req,
            method.as_str(),
            uri,
            &connection_info,
            secrets,
        ))
    }
}

/// PreCondition header
///
/// It's valid to include a X-If-Modified-Since or X-If-Unmodified-Since
/// header but not both.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PreConditionHeader {
    IfModifiedSince(SyncTimestamp),
    IfUnmodifiedSince(SyncTimestamp),
    #[allow(dead_code)]
    NoHeader,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PreConditionHeaderOpt {
    pub opt: Option<PreConditionHeader>,
}

impl PreConditionHeaderOpt {
    pub fn extrude(headers: &HeaderMap) -> Result<Self, Error> {
        let modified = headers.get("X-If-Modified-Since");
        let unmodified = headers.get("X-If-Unmodified-Since");
        if modified.is_some() && unmodified.is_some() {
            return Err(ValidationErrorKind::FromDetails(
                "conflicts with X-If-Modified-Since".to_owned(),
                RequestErrorLocation::Header,
                Some("X-If-Unmodified-Since".to_owned()),
                Some("request.validate.mod_header.conflict"),
            )
            .into());
        };
        let (value, field_name) = if let Some(modified_value) = modified {
            (modified_value, "X-If-Modified-Since")
        } else if let Some(unmodified_value) = unmodified {
            (unmodified_value, "X-If-Unmodified-Since")
        } else {
            return Ok(Self { opt: None });
        };
        if value
            .to_str()
            .unwrap_or("0.0")
            .parse::<f64>()
            .unwrap_or(0.0)
            < 0.0
        {
            return Err(ValidationErrorKind::FromDetails(
                "value is negative".to_owned(),
                RequestErrorLocation::Header,
                Some(field_name.to_owned()),
                Some("request.validate.mod_header.negative"),
            )
            .into());
        }
        value
            .to_str()
            .map_err(|e| {
                ValidationErrorKind::FromDetails(
                    e.to_string(),
                    RequestErrorLocation::Header,
                    Some(field_name.to_owned()),
                    None,
                )
                .into()
            })
            .and_then(|v| {
                SyncTimestamp::from_header(v).map_err(|e| {
                    ValidationErrorKind::FromDetails(
                        e.to_string(),
                        RequestErrorLocation::Header,
                        Some(field_name.to_owned()),
                        None,
                    )
                    .into()
                })
            })
            .map(|v| {
                let header = if field_name == "X-If-Modified-Since" {
                    PreConditionHeader::IfModifiedSince(v)
                } else {
                    PreConditionHeader::IfUnmodifiedSince(v)
                };
                Self { opt: Some(header) }
            })
    }
}

impl FromRequest for PreConditionHeaderOpt {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        Box::pin(async move { Self::extrude(req.headers()) })
    }
}

/// Bso id parameter extractor
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct BsoParam {
    #[validate(regex(path = *VALID_ID_REGEX))]
    pub bso: String,
}

impl BsoParam {
    fn bsoparam_from_path(uri: &Uri) -> Result<Self, Error> {
        // path: "/1.5/{uid}/storage/{collection}/{bso}"
        let elements: Vec<&str> = uri.path().split('/').collect();
        let elem = elements.get(3);
        if elem.is_none() || elem != Some(&"storage") || elements.len() != 6 {
            return Err(ValidationErrorKind::FromDetails(
                "Invalid BSO".to_owned(),
                RequestErrorLocation::Path,
                Some("bso".to_owned()),
                Some("request.process.invalid_bso"),
            ))?;
        }
        if let Some(v) = elements.get(5) {
            let sv = urldecode(v).map_err(|e| {
                warn!("⚠️ Invalid BsoParam Error: {:?} {:?}", v, e);
                ValidationErrorKind::FromDetails(
                    "Invalid BSO".to_owned(),
                    RequestErrorLocation::Path,
                    Some("bso".to_owned()),
                    Some("request.process.invalid_bso"),
                )
            })?;
            Ok(Self { bso: sv })
        } else {
            warn!("⚠️ Missing BSO: {:?}", uri.path());
            Err(ValidationErrorKind::FromDetails(
                "Missing BSO".to_owned(),
                RequestErrorLocation::Path,
                Some("bso".to_owned()),
                Some("request.process.missing_bso"),
            ))?
        }
    }

    pub fn extrude(head: &RequestHead, extensions: &mut Extensions) -> Result<Self, Error> {
        let uri = head.uri.clone();
        if let Some(bso) = extensions.get::<BsoParam>() {
            return Ok(bso.clone());
        }
        let bso = Self::bsoparam_from_path(&uri)?;
        bso.validate().map_err(|e| {
            ValidationErrorKind::FromValidationErrors(e, RequestErrorLocation::Path, None)
        })?;
        extensions.insert(bso.clone());
        Ok(bso)
    }
}

impl FromRequest for BsoParam {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        future::ready(Self::extrude(req.head(), &mut req.extensions_mut()))
    }
}

/// Collection parameter extractor
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct CollectionParam {
    #[validate(regex(path = *VALID_COLLECTION_ID_REGEX))]
    pub collection: String,
}

impl CollectionParam {
    fn col_from_path(uri: &Uri) -> Result<Option<CollectionParam>, Error> {
        // path: "/1.5/{uid}/storage/{collection}"
        let elements: Vec<&str> = uri.path().split('/').collect();
        let elem = elements.get(3);
        if elem.is_none() || elem != Some(&"storage") || !(5..=6).contains(&elements.len()) {
            return Ok(None);
        }
        if let Some(v) = elements.get(4) {
            let sv = urldecode(v).map_err(|_e| {
                ValidationErrorKind::FromDetails(
                    "Invalid Collection".to_owned(),
                    RequestErrorLocation::Path,
                    Some("collection".to_owned()),
                    Some("request.process.invalid_collection"),
                )
            })?;
            Ok(Some(Self { collection: sv }))
        } else {
            Err(ValidationErrorKind::FromDetails(
                "Missing Collection".to_owned(),
                RequestErrorLocation::Path,
                Some("collection".to_owned()),
                Some("request.process.missing_collection"),
            ))?
        }
    }

    pub fn extrude(uri: &Uri, extensions: &mut Extensions) -> Result<Option<Self>, Error> {
        if let Some(collection) = extensions.get::<Option<Self>>() {
            return Ok(collection.clone());
        }

        let collection = Self::col_from_path(uri)?;
        let result = if let Some(collection) = collection {
            collection.validate().map_err(|e| {
                ValidationErrorKind::FromValidationErrors(e, RequestErrorLocation::Path, None)
            })?;
            Some(collection)
        } else {
            None
        };
        extensions.insert(result.clone());
        Ok(result)
    }
}

impl FromRequest for CollectionParam {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        Box::pin(async move {
            if let Some(collection) = Self::extrude(req.uri(), &mut req.extensions_mut())? {
                Ok(collection)
            } else {
                Err(ValidationErrorKind::FromDetails(
                    "Missing Collection".to_owned(),
                    RequestErrorLocation::Path,
                    Some("collection".to_owned()),
                    Some("request.process.missing_collection"),
                ))?
            }
        })
    }
}

/// Emit a per-operation counter tagged for the request.
pub trait EmitApiMetric {
    fn metrics(&self) -> &Metrics;

    fn emit_api_metric(&self, label: &str) {
        self.metrics().incr(label);
    }
}

macro_rules! impl_emit_api_metric {
    ($type:ty) => {
        impl EmitApiMetric for $type {
            fn metrics(&self) -> &Metrics {
                &self.metrics
            }
        }
    };
}

/// Information Requests extractor
///
/// Only the database and user identifier are required for information
/// requests.
pub struct MetaRequest {
    pub user_id: UserIdentifier,
    pub metrics: Metrics,
}

impl_emit_api_metric!(MetaRequest);

impl FromRequest for MetaRequest {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        let mut payload = Payload::None;
        async move {
            let user_id = HawkIdentifier::from_request(&req, &mut payload).await?;

            Ok(MetaRequest {
                user_id: user_id.into(),
                metrics: MetricsWrapper::extract(&req).await?.0,
            })
        }
        .boxed_local()
    }
}

/// Desired reply format for a collection GET request
#[derive(Copy, Clone, Debug)]
pub enum ReplyFormat {
    Json,
    Newlines,
}

/// Collection Request Delete/Get extractor
///
/// Extracts/validates information needed for collection delete/get requests.
pub struct CollectionRequest {
    pub collection: String,
    pub user_id: UserIdentifier,
    pub query: BsoQueryParams,
    pub reply: ReplyFormat,
    pub metrics: Metrics,
}

impl_emit_api_metric!(CollectionRequest);

impl FromRequest for CollectionRequest {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        let mut payload = Payload::None;
        async move {
            let (user_id, query, collection) =
                <(HawkIdentifier, BsoQueryParams, CollectionParam)>::from_request(
                    &req,
                    &mut payload,
                )
                .await?;
            let collection = collection.collection;

            let accept = get_accepted(&req, &ACCEPTED_CONTENT_TYPES, "application/json");
            let reply = match accept.as_str() {
                "application/newlines" => ReplyFormat::Newlines,
                "application/json" | "" => ReplyFormat::Json,
                _ => {
                    return Err(ValidationErrorKind::FromDetails(
                        format!("Invalid Accept header specified: {:?}", accept),
                        RequestErrorLocation::Header,
                        Some("accept".to_string()),
                        Some("request.validate.invalid_accept_header"),
                    )
                    .into());
                }
            };

            Ok(CollectionRequest {
                collection,
                user_id: user_id.into(),
                query,
                reply,
                metrics: MetricsWrapper::extract(&req).await?.0,
            })
        }
        .boxed_local()
    }
}

/// Collection Request Post extractor
///
/// Iterates over a list of BSOs in the request body and PUTs them into the
/// database with the same timestamp.
pub struct CollectionPostRequest {
    pub collection: String,
    pub user_id: UserIdentifier,
    pub query: BsoQueryParams,
    pub bsos: BsoBodies,
    pub batch: Option<BatchRequest>,
    pub metrics: Metrics,
    pub quota_enabled: bool,
}

impl_emit_api_metric!(CollectionPostRequest);

impl FromRequest for CollectionPostRequest {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    /// Extractor for collection posts (batch BSO upload)
    ///
    /// Utilizes the `BsoBodies` for parsing, and adds two validation steps
    /// not done previously:
    ///   - If the collection is 'crypto', known bad payloads are checked for
    ///   - Any valid BSO's beyond `max_post_records` are moved to invalid
    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        let mut payload = payload.take();
        Box::pin(async move {
            let state = match req.app_data::<Data<ServerState>>() {
                Some(s) => s,
                None => {
                    error!("⚠️ Could not load the app state");
                    return Err(ValidationErrorKind::FromDetails(
                        "Internal error".to_owned(),
                        RequestErrorLocation::Unknown,
                        Some("app_data".to_owned()),
                        None,
                    )
                    .into());
                }
            };

            let max_post_records = i64::from(state.limits.max_post_records);

            let (user_id, collection, query, mut bsos) =
                <(HawkIdentifier, CollectionParam, BsoQueryParams, BsoBodies)>::from_request(
                    &req,
                    &mut payload,
                )
                .await?;

            let collection = collection.collection;
            if collection == "crypto" {
                // Verify the client didn't mess up the crypto if we have a
                // payload
                for bso in &bsos.valid {
                    if let Some(ref data) = bso.payload {
                        if KNOWN_BAD_PAYLOAD_REGEX.is_match(data) {
                            return Err(ValidationErrorKind::FromDetails(
                                "Known-bad BSO payload".to_owned(),
                                RequestErrorLocation::Body,
                                Some("bsos".to_owned()),
                                Some("request.process.known_bad_bso"),
                            )
                            .into());
                        }
                    }
                }
            }

            // Trim the excess BSO's to be under the batch size
            let overage: i64 = (bsos.valid.len() as i64) - max_post_records;
            if overage > 0 {
                for _ in 1..=overage {
                    if let Some(last) = bsos.valid.pop() {
                        bsos.invalid.insert(last.id, "retry bso".to_string());
                    }
                }
            }

            let batch = BatchRequestOpt::extract(&req).await?;
            Ok(CollectionPostRequest {
                collection,
                user_id: user_id.into(),
                query,
                bsos,
                batch: batch.opt,
                metrics: MetricsWrapper::extract(&req).await?.0,
                quota_enabled: state.quota_enabled,
            })
        })
    }
}

/// BSO Request Delete/Get extractor
///
/// Extracts/validates information needed for BSO delete/get requests.
#[derive(Debug)]
pub struct BsoRequest {
    pub collection: String,
    pub user_id: UserIdentifier,
    pub query: BsoQueryParams,
    pub bso: String,
    pub metrics: Metrics,
}

impl_emit_api_metric!(BsoRequest);

impl FromRequest for BsoRequest {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        let mut payload = payload.take();
        Box::pin(async move {
            let (user_id, query, collection, bso) =
                <(HawkIdentifier, BsoQueryParams, CollectionParam, BsoParam)>::from_request(
                    &req,
                    &mut payload,
                )
                .await?;
            let collection = collection.collection;

            Ok(BsoRequest {
                collection,
                user_id: user_id.into(),
                query,
                bso: bso.bso,
                metrics: MetricsWrapper::extract(&req).await?.0,
            })
        })
    }
}

/// BSO Request Put extractor
///
/// Extracts/validates information needed for BSO put requests.
pub struct BsoPutRequest {
    pub collection: String,
    pub user_id: UserIdentifier,
    pub query: BsoQueryParams,
    pub bso: String,
    pub body: BsoBody,
    pub metrics: Metrics,
}

impl_emit_api_metric!(BsoPutRequest);

impl FromRequest for BsoPutRequest {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        let mut payload = payload.take();

        async move {
            let metrics = MetricsWrapper::extract(&req).await?.0;
            let (user_id, collection, query, bso, body) = <(
                HawkIdentifier,
                CollectionParam,
                BsoQueryParams,
                BsoParam,
                BsoBody,
            )>::from_request(&req, &mut payload)
            .await?;

            let collection = collection.collection;
            if collection == "crypto" {
                // Verify the client didn't mess up the crypto if we have a
                // payload
                if let Some(ref data) = body.payload {
                    if KNOWN_BAD_PAYLOAD_REGEX.is_match(data) {
                        return Err(ValidationErrorKind::FromDetails(
                            "Known-bad BSO payload".to_owned(),
                            RequestErrorLocation::Body,
                            Some("bsos".to_owned()),
                            Some("request.process.known_bad_bso"),
                        )
                        .into());
                    }
                }
            }
            Ok(BsoPutRequest {
                collection,
                user_id: user_id.into(),
                query,
                bso: bso.bso,
                body,
                metrics,
            })
        }
        .boxed_local()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct QuotaInfo {
    pub enabled: bool,
    pub size: usize,
}

/// Heartbeat extractor: everything `/__heartbeat__` needs from the state.
pub struct HeartbeatRequest {
    pub headers: HeaderMap,
    pub db_pool: Box<dyn DbPool<Error = DbError>>,
    pub quota: QuotaInfo,
}

impl FromRequest for HeartbeatRequest {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        async move {
            let headers = req.headers().clone();
            let state = match req.app_data::<Data<ServerState>>() {
                Some(s) => s,
                None => {
                    error!("⚠️ Could not load the app state");
                    return Err(ValidationErrorKind::FromDetails(
                        "Internal error".to_owned(),
                        RequestErrorLocation::Unknown,
                        Some("state".to_owned()),
                        None,
                    )
                    .into());
                }
            };
            let quota = QuotaInfo {
                enabled: state.quota_enabled,
                size: state.limits.max_quota_limit as usize,
            };

            Ok(HeartbeatRequest {
                headers,
                db_pool: state.db_pool.clone(),
                quota,
            })
        }
        .boxed_local()
    }
}

/// Extractor for the `/__error__` Sentry check endpoint.
pub struct TestErrorRequest {
    pub headers: HeaderMap,
}

impl FromRequest for TestErrorRequest {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        future::ready(Ok(TestErrorRequest {
            headers: req.headers().clone(),
        }))
    }
}

#[cfg(test)]
pub mod test_utils {
    use std::sync::Arc;

    use actix_web::{
        dev::ServiceResponse,
        http::Method,
        test::{self, TestRequest},
        FromRequest, HttpResponse,
    };
    use base64::{engine, Engine};
    use futures::executor::block_on;
    use hawk::{Credentials, DigestAlgorithm, Key, RequestBuilder};
    use hmac::{Hmac, Mac};
    use lazy_static::lazy_static;
    use serde_json::Value;
    use sha2::Sha256;
    use tokio::sync::RwLock;

    use weaveserver_common::{hkdf_expand_32, metrics_from_opts, BlockingThreadpool};
    use weaveserver_settings::{Secrets, Settings};
    use weavestorage_db::mock::MockDbPool;
    use weavestorage_settings::Deadman;

    use super::CollectionPostRequest;
    use crate::server::ServerState;
    use crate::web::auth::HawkPayload;

    lazy_static! {
        pub static ref SECRETS: Secrets = Secrets::new("Ted Koppel is a robot").unwrap();
        pub static ref USER_ID: u64 = 42;
        pub static ref USER_ID_STR: String = USER_ID.to_string();
    }

    pub const TEST_HOST: &str = "localhost";
    pub const TEST_PORT: u16 = 8080;
    pub const INVALID_COLLECTION_NAME: &str = "invalid?name";
    pub const INVALID_BSO_NAME: &str =
        "abcdefghijklmnopqrstuvwxyz0123456789abcdefghijklmnopqrstuvwxyz0123456789";

    pub fn make_state() -> ServerState {
        let settings = Settings::default();
        ServerState {
            db_pool: Box::new(MockDbPool::new()),
            limits: Arc::new(settings.storage.limits.clone()),
            limits_json: serde_json::to_string(&settings.storage.limits).unwrap(),
            port: 8000,
            metrics: metrics_from_opts("weavestorage_test", None, 0).unwrap(),
            quota_enabled: settings.storage.enable_quota,
            deadman: Arc::new(RwLock::new(Deadman::default())),
            blocking_threadpool: Arc::new(BlockingThreadpool::default()),
        }
    }

    pub fn extract_body_as_str(sresponse: ServiceResponse) -> String {
        String::from_utf8(block_on(test::read_body(sresponse)).to_vec()).unwrap()
    }

    /// Build a valid Hawk Authorization header for the given payload, the
    /// same way the tokenserver and a real client together would.
    pub fn create_valid_hawk_header(
        payload: &HawkPayload,
        secrets: &Secrets,
        method: &str,
        path: &str,
        host: &str,
        port: u16,
    ) -> String {
        let payload_json = serde_json::to_string(payload).unwrap();
        let mut signature: Hmac<Sha256> =
            Hmac::new_from_slice(&secrets.current().signing_secret).unwrap();
        signature.update(payload_json.as_bytes());
        let signature = signature.finalize().into_bytes();

        let mut id: Vec<u8> = vec![];
        id.extend(payload_json.as_bytes());
        id.extend_from_slice(&signature);
        let id = engine::general_purpose::URL_SAFE.encode(&id);

        let token_secret = hkdf_expand_32(
            format!("services.mozilla.com/tokenlib/v1/derive/{}", id).as_bytes(),
            Some(payload.salt.as_bytes()),
            &secrets.current().master_secret,
        )
        .unwrap();
        let token_secret = engine::general_purpose::URL_SAFE.encode(token_secret);

        let request = RequestBuilder::new(method, host, port, path).request();
        let credentials = Credentials {
            id,
            key: Key::new(token_secret.as_bytes(), DigestAlgorithm::Sha256).unwrap(),
        };
        let header = request.make_header(&credentials).unwrap();
        format!("Hawk {}", header)
    }

    pub async fn post_collection(
        qs: &str,
        body: &Value,
    ) -> Result<CollectionPostRequest, actix_web::Error> {
        let payload = HawkPayload::test_default(*USER_ID);
        let uri = format!(
            "/1.5/{}/storage/tabs{}{}",
            *USER_ID,
            if qs.is_empty() { "" } else { "?" },
            qs
        );
        let header = create_valid_hawk_header(&payload, &SECRETS, "POST", &uri, TEST_HOST, TEST_PORT);
        let (req, mut payload) = TestRequest::with_uri(&uri)
            .method(Method::POST)
            .insert_header(("authorization", header))
            .insert_header(("content-type", "application/json; charset=UTF-8"))
            .insert_header(("accept", "application/json;q=0.9,/;q=0.2"))
            .set_payload(body.to_string())
            .app_data(actix_web::web::Data::new(make_state()))
            .app_data(actix_web::web::Data::new(Arc::new(Secrets::new(
                "Ted Koppel is a robot",
            )
            .unwrap())))
            .param("uid", USER_ID_STR.as_str())
            .param("collection", "tabs")
            .to_http_parts();

        CollectionPostRequest::from_request(&req, &mut payload).await
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;

    use actix_web::{
        dev::ServiceResponse,
        http::Method,
        test::TestRequest,
        web::Data,
        FromRequest, HttpResponse,
    };
    use futures::executor::block_on;
    use serde_json::json;

    use weaveserver_settings::Secrets;
    use weavestorage_db::{params, Sorting, SyncTimestamp};

    use super::test_utils::*;
    use super::*;
    use crate::web::auth::HawkPayload;

    #[test]
    fn test_invalid_query_args() {
        let req = TestRequest::with_uri("/?newer=-1.23&sort=whatever")
            .app_data(Data::new(make_state()))
            .to_http_request();
        let result = block_on(BsoQueryParams::extract(&req));
        assert!(result.is_err());
        let response: HttpResponse = result.err().unwrap().into();
        assert_eq!(response.status(), 400);
        let body = extract_body_as_str(ServiceResponse::new(req, response));
        assert_eq!(body, "0");
    }

    #[test]
    fn test_valid_query_args() {
        let req = TestRequest::with_uri("/?ids=1,2&full=&sort=index&older=2.43")
            .app_data(Data::new(make_state()))
            .to_http_request();
        let result = block_on(BsoQueryParams::extract(&req)).unwrap();
        assert_eq!(result.ids, vec!["1", "2"]);
        assert_eq!(result.sort, Sorting::Index);
        assert_eq!(result.older.unwrap(), SyncTimestamp::from_seconds(2.43));
        assert!(result.full);
    }

    #[test]
    fn test_cursor_offsets_parse() {
        let req = TestRequest::with_uri("/?sort=oldest&offset=100000:3")
            .app_data(Data::new(make_state()))
            .to_http_request();
        let result = block_on(BsoQueryParams::extract(&req)).unwrap();
        let offset = result.offset.unwrap();
        assert_eq!(offset.timestamp, Some(SyncTimestamp::from_seconds(100.0)));
        assert_eq!(offset.offset, 3);

        // and plain numeric offsets keep working
        assert_eq!(params::Offset::from_str("12").unwrap().offset, 12);
    }

    #[actix_rt::test]
    async fn test_valid_bso_request() {
        let payload = HawkPayload::test_default(*USER_ID);
        let uri = format!("/1.5/{}/storage/tabs/asdf", *USER_ID);
        let header =
            create_valid_hawk_header(&payload, &SECRETS, "GET", &uri, TEST_HOST, TEST_PORT);
        let req = TestRequest::with_uri(&uri)
            .insert_header(("authorization", header))
            .method(Method::GET)
            .app_data(Data::new(make_state()))
            .app_data(Data::new(Arc::new(
                Secrets::new("Ted Koppel is a robot").unwrap(),
            )))
            .param("uid", USER_ID_STR.as_str())
            .param("collection", "tabs")
            .param("bso", "asdf")
            .to_http_request();
        let result = BsoRequest::extract(&req)
            .await
            .expect("Could not get result in test_valid_bso_request");
        assert_eq!(result.user_id.legacy_id, *USER_ID);
        assert_eq!(&result.collection, "tabs");
        assert_eq!(&result.bso, "asdf");
    }

    #[actix_rt::test]
    async fn test_invalid_bso_request() {
        let payload = HawkPayload::test_default(*USER_ID);
        let uri = format!("/1.5/{}/storage/tabs/{}", *USER_ID, INVALID_BSO_NAME);
        let header =
            create_valid_hawk_header(&payload, &SECRETS, "GET", &uri, TEST_HOST, TEST_PORT);
        let req = TestRequest::with_uri(&uri)
            .insert_header(("authorization", header))
            .method(Method::GET)
            .app_data(Data::new(make_state()))
            .app_data(Data::new(Arc::new(
                Secrets::new("Ted Koppel is a robot").unwrap(),
            )))
            .param("uid", USER_ID_STR.as_str())
            .param("collection", "tabs")
            .param("bso", INVALID_BSO_NAME)
            .to_http_request();
        let result = BsoRequest::extract(&req).await;
        assert!(result.is_err());
        let response: HttpResponse = result.err().unwrap().into();
        assert_eq!(response.status(), 400);
        let body = extract_body_as_str(ServiceResponse::new(req, response));
        assert_eq!(body, "0");
    }

    #[actix_rt::test]
    async fn test_valid_hawk_header_with_valid_path() {
        let hawk_payload = HawkPayload::test_default(*USER_ID);
        let uri = format!("/1.5/{}/storage/col2", *USER_ID);
        let header =
            create_valid_hawk_header(&hawk_payload, &SECRETS, "GET", &uri, TEST_HOST, TEST_PORT);
        let req = TestRequest::with_uri(&uri)
            .insert_header(("authorization", header))
            .method(Method::GET)
            .app_data(Data::new(make_state()))
            .app_data(Data::new(Arc::new(
                Secrets::new("Ted Koppel is a robot").unwrap(),
            )))
            .param("uid", USER_ID_STR.as_str())
            .to_http_request();
        let mut payload = Payload::None;
        let result = HawkIdentifier::from_request(&req, &mut payload)
            .await
            .expect("Could not get result in test_valid_hawk_header_with_valid_path");
        assert_eq!(result.legacy_id, *USER_ID);
    }

    #[actix_rt::test]
    async fn test_hawk_uid_must_match_path() {
        let hawk_payload = HawkPayload::test_default(*USER_ID);
        let mismatch_uid = "5";
        let uri = format!("/1.5/{}/storage/col2", mismatch_uid);
        let header =
            create_valid_hawk_header(&hawk_payload, &SECRETS, "GET", &uri, TEST_HOST, TEST_PORT);
        let req = TestRequest::with_uri(&uri)
            .insert_header(("authorization", header))
            .method(Method::GET)
            .app_data(Data::new(make_state()))
            .app_data(Data::new(Arc::new(
                Secrets::new("Ted Koppel is a robot").unwrap(),
            )))
            .param("uid", mismatch_uid)
            .to_http_request();
        let result = HawkIdentifier::extract(&req).await;
        assert!(result.is_err());
        let response: HttpResponse = result.err().unwrap().into();
        assert_eq!(response.status(), 400);
    }

    #[test]
    fn test_invalid_precondition_headers() {
        fn assert_invalid_header(req: actix_web::HttpRequest) {
            let result = PreConditionHeaderOpt::extrude(req.headers());
            assert!(result.is_err());
            let response: HttpResponse = result.err().unwrap().into();
            assert_eq!(response.status(), 400);
            let body = extract_body_as_str(ServiceResponse::new(req, response));
            assert_eq!(body, "0");
        }
        let req = TestRequest::with_uri("/")
            .app_data(Data::new(make_state()))
            .insert_header(("X-If-Modified-Since", "32124.32"))
            .insert_header(("X-If-Unmodified-Since", "4212.12"))
            .to_http_request();
        assert_invalid_header(req);
        let req = TestRequest::with_uri("/")
            .app_data(Data::new(make_state()))
            .insert_header(("X-If-Modified-Since", "-32.1"))
            .to_http_request();
        assert_invalid_header(req);
    }

    #[test]
    fn test_valid_precondition_headers() {
        let req = TestRequest::with_uri("/")
            .app_data(Data::new(make_state()))
            .insert_header(("X-If-Modified-Since", "32.1"))
            .to_http_request();
        let result = PreConditionHeaderOpt::extrude(req.headers())
            .unwrap()
            .opt
            .unwrap();
        assert_eq!(
            result,
            PreConditionHeader::IfModifiedSince(SyncTimestamp::from_seconds(32.1))
        );
        let req = TestRequest::with_uri("/")
            .app_data(Data::new(make_state()))
            .insert_header(("X-If-Unmodified-Since", "32.14"))
            .to_http_request();
        let result = PreConditionHeaderOpt::extrude(req.headers())
            .unwrap()
            .opt
            .unwrap();
        assert_eq!(
            result,
            PreConditionHeader::IfUnmodifiedSince(SyncTimestamp::from_seconds(32.14))
        );
    }

    #[actix_rt::test]
    async fn test_valid_collection_post_request() {
        // Batch requests require id's on each BSO
        let bso_body = json!([
            {"id": "123", "payload": "xxx", "sortindex": 23},
            {"id": "456", "payload": "xxxasdf", "sortindex": 23}
        ]);
        let result = post_collection("", &bso_body)
            .await
            .expect("Could not get result in test_valid_collection_post_request");
        assert_eq!(result.user_id.legacy_id, *USER_ID);
        assert_eq!(&result.collection, "tabs");
        assert_eq!(result.bsos.valid.len(), 2);
        assert!(result.batch.is_none());
    }

    #[actix_rt::test]
    async fn test_invalid_collection_post_request() {
        // Unknown fields on an item move it to the invalid map
        let bso_body = json!([
            {"id": "1", "sortindex": 23, "jump": 1},
            {"id": "2", "sortindex": -99, "hop": "low"}
        ]);
        let result = post_collection("", &bso_body)
            .await
            .expect("Could not get result in test_invalid_collection_post_request");
        assert_eq!(result.user_id.legacy_id, *USER_ID);
        assert_eq!(&result.collection, "tabs");
        assert_eq!(result.bsos.invalid.len(), 2);
    }

    #[actix_rt::test]
    async fn test_max_ttl_moves_item_to_invalid() {
        let bso_body = json!([
            {"id": "123", "payload": "xxx", "sortindex": 23, "ttl": 94_608_000},
            {"id": "456", "payload": "xxxasdf", "sortindex": 23, "ttl": 999_999_999},
            {"id": "789", "payload": "xxxfoo", "sortindex": 23, "ttl": 1_000_000_000}
        ]);
        let result = post_collection("", &bso_body)
            .await
            .expect("Could not get result in test_max_ttl_moves_item_to_invalid");
        assert_eq!(result.bsos.valid.len(), 2);
        assert_eq!(result.bsos.invalid.len(), 1);
        assert!(result.bsos.invalid.contains_key("789"));
    }

    #[actix_rt::test]
    async fn test_valid_collection_batch_post_request() {
        // With no value or a value of "true", a new batch is created
        let bso_body = json!([
            {"id": "123", "payload": "xxx", "sortindex": 23},
            {"id": "456", "payload": "xxxasdf", "sortindex": 23}
        ]);
        let result = post_collection("batch=True", &bso_body)
            .await
            .expect("Could not get result in test_valid_collection_batch_post_request");
        assert_eq!(result.user_id.legacy_id, *USER_ID);
        let batch = result
            .batch
            .expect("Could not get batch in test_valid_collection_batch_post_request");
        assert!(batch.id.is_none());
        assert!(!batch.commit);

        let result2 = post_collection("batch", &bso_body)
            .await
            .expect("Could not get result2 in test_valid_collection_batch_post_request");
        let batch2 = result2
            .batch
            .expect("Could not get batch2 in test_valid_collection_batch_post_request");
        assert!(batch2.id.is_none());
        assert!(!batch2.commit);

        let result3 = post_collection("batch=MTI%3D&commit=true", &bso_body)
            .await
            .expect("Could not get result3 in test_valid_collection_batch_post_request");
        let batch3 = result3
            .batch
            .expect("Could not get batch3 in test_valid_collection_batch_post_request");
        assert!(batch3.id.is_some());
        assert!(batch3.commit);
    }

    #[actix_rt::test]
    async fn test_invalid_collection_batch_post_request() {
        // commit=true without a batch id is an error
        let bso_body = json!([
            {"id": "123", "payload": "xxx", "sortindex": 23},
            {"id": "456", "payload": "xxxasdf", "sortindex": 23}
        ]);
        let result = post_collection("commit=true", &bso_body).await;
        assert!(result.is_err());
        let response: HttpResponse = result.err().unwrap().into();
        assert_eq!(response.status(), 400);
    }

    #[actix_rt::test]
    async fn test_weave_size_headers_are_pre_checked() {
        let bso_body = json!([{"id": "123", "payload": "xxx"}]);
        let payload = HawkPayload::test_default(*USER_ID);
        let uri = format!("/1.5/{}/storage/tabs?batch=true", *USER_ID);
        let header =
            create_valid_hawk_header(&payload, &SECRETS, "POST", &uri, TEST_HOST, TEST_PORT);
        let (req, mut payload) = TestRequest::with_uri(&uri)
            .method(Method::POST)
            .insert_header(("authorization", header))
            .insert_header(("content-type", "application/json"))
            // way past max_total_records
            .insert_header(("X-Weave-Total-Records", "1000000"))
            .set_payload(bso_body.to_string())
            .app_data(Data::new(make_state()))
            .app_data(Data::new(Arc::new(
                Secrets::new("Ted Koppel is a robot").unwrap(),
            )))
            .param("uid", USER_ID_STR.as_str())
            .param("collection", "tabs")
            .to_http_parts();

        let result = CollectionPostRequest::from_request(&req, &mut payload).await;
        assert!(result.is_err());
        let response: HttpResponse = result.err().unwrap().into();
        // size-limit-exceeded renders as the legacy "17" body
        assert_eq!(response.status(), 400);
        let body = extract_body_as_str(ServiceResponse::new(req, response));
        assert_eq!(body, "17");
    }

    #[actix_rt::test]
    async fn test_crypto_collection_rejects_known_bad_payloads() {
        let payload = HawkPayload::test_default(*USER_ID);
        let uri = format!("/1.5/{}/storage/crypto/keys", *USER_ID);
        let header =
            create_valid_hawk_header(&payload, &SECRETS, "PUT", &uri, TEST_HOST, TEST_PORT);
        let bso_body = json!({
            "id": "keys",
            "payload": "{\"IV\": \"AAAAAAAAAAAAAAAAAAAAAA==\"}"
        });
        let (req, mut payload) = TestRequest::with_uri(&uri)
            .method(Method::PUT)
            .insert_header(("authorization", header))
            .insert_header(("content-type", "application/json"))
            .set_payload(bso_body.to_string())
            .app_data(Data::new(make_state()))
            .app_data(Data::new(Arc::new(
                Secrets::new("Ted Koppel is a robot").unwrap(),
            )))
            .param("uid", USER_ID_STR.as_str())
            .param("collection", "crypto")
            .param("bso", "keys")
            .to_http_parts();

        let result = BsoPutRequest::from_request(&req, &mut payload).await;
        assert!(result.is_err());
        let response: HttpResponse = result.err().unwrap().into();
        assert_eq!(response.status(), 400);
        let body = extract_body_as_str(ServiceResponse::new(req, response));
        assert_eq!(body, "8");
    }
}
