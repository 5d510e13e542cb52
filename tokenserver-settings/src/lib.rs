use jsonwebtoken::jwk::Jwk;
use serde::Deserialize;
use tokenserver_common::NodeType;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Path (or `file:` URI) of the tokenserver SQLite database.
    pub database_url: String,
    /// The max size of the database connection pool.
    pub database_pool_max_size: u32,
    /// Pool timeout when waiting for a slot to become available, in seconds
    pub database_pool_connection_timeout: Option<u32>,
    /// Database request timeout, in seconds
    pub database_request_timeout: Option<u32>,
    /// Whether or not to enable the tokenserver endpoints.
    pub enabled: bool,
    /// The secret used when computing the hash for a user's metrics UID.
    pub fxa_metrics_hash_secret: String,
    /// The email domain for users' upstream accounts.
    pub fxa_email_domain: String,
    /// The URL of the upstream server used for verifying OAuth tokens.
    pub fxa_oauth_server_url: String,
    /// The timeout for requests to the OAuth verification server, in seconds.
    pub fxa_oauth_request_timeout: u64,
    /// The JWK used to verify OAuth tokens locally. Caching this avoids an
    /// external API call per verification.
    pub fxa_oauth_primary_jwk: Option<Jwk>,
    /// A secondary JWK for verifying OAuth tokens, enabling seamless key
    /// rotations upstream.
    pub fxa_oauth_secondary_jwk: Option<Jwk>,
    /// The rate at which capacity should be released from nodes that are at
    /// capacity.
    pub node_capacity_release_rate: Option<f32>,
    /// The type of the storage nodes used by this instance.
    pub node_type: NodeType,
    /// The label to be used when reporting Metrics.
    pub statsd_label: String,
    /// Whether or not to run the tokenserver migrations upon startup.
    pub run_migrations: bool,
    /// The database ID of a single dedicated storage node. When set, the
    /// allocator always returns this node and skips load accounting.
    pub dedicated_node_id: Option<i32>,
    /// The number of seconds before a token provided by this server expires.
    pub token_duration: u64,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            database_url: "tokenserver.db".to_owned(),
            database_pool_max_size: 10,
            database_pool_connection_timeout: Some(30),
            database_request_timeout: None,
            enabled: false,
            fxa_metrics_hash_secret: "secret".to_owned(),
            fxa_email_domain: "api.accounts.example.com".to_owned(),
            fxa_oauth_server_url: "https://oauth.accounts.example.com".to_owned(),
            fxa_oauth_request_timeout: 10,
            fxa_oauth_primary_jwk: None,
            fxa_oauth_secondary_jwk: None,
            node_capacity_release_rate: None,
            node_type: NodeType::Sqlite,
            statsd_label: "weavestorage.tokenserver".to_owned(),
            run_migrations: cfg!(test),
            dedicated_node_id: None,
            token_duration: 300,
        }
    }
}
