//! Top-level application settings and the master secret chain.
#[macro_use]
extern crate slog_scope;

use std::env::{self, VarError};

use config::{Config, ConfigError, Environment, File};
use serde::{de::Error as SerdeError, Deserialize, Deserializer};
use weaveserver_common::hkdf_expand_32;
use weavestorage_settings::Settings as StorageSettings;
use tokenserver_settings::Settings as TokenserverSettings;

static PREFIX: &str = "weave";
const SIGNING_INFO: &[u8] = b"services.mozilla.com/tokenlib/v1/signing";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port: u16,
    pub host: String,
    pub actix_keep_alive: Option<u32>,
    /// The master secret chain. Hawk verification tries every entry, newest
    /// first; token issuance always signs with the newest.
    pub master_secret: Secrets,

    pub human_logs: bool,

    pub statsd_host: Option<String>,
    pub statsd_port: u16,

    /// Cors Settings
    pub cors_allowed_origin: Option<String>,
    pub cors_max_age: Option<usize>,
    pub cors_allowed_methods: Option<Vec<String>>,
    pub cors_allowed_headers: Option<Vec<String>>,

    pub storage: StorageSettings,
    pub tokenserver: TokenserverSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            port: 8000,
            host: "127.0.0.1".to_string(),
            actix_keep_alive: None,
            master_secret: Secrets::default(),
            human_logs: false,
            statsd_host: None,
            statsd_port: 8125,
            cors_allowed_origin: Some("*".to_string()),
            cors_max_age: Some(1728000),
            cors_allowed_methods: Some(
                ["DELETE", "GET", "POST", "PUT"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            ),
            cors_allowed_headers: Some(
                [
                    "Authorization",
                    "Content-Type",
                    "UserAgent",
                    "X-If-Modified-Since",
                    "X-If-Unmodified-Since",
                    "X-KeyID",
                    "X-Client-State",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
            ),
            storage: StorageSettings::default(),
            tokenserver: TokenserverSettings::default(),
        }
    }
}

impl Settings {
    /// Load the settings from the config file if supplied, then the environment.
    ///
    /// Environment variables are specified as `WEAVE_FOO__BAR_VALUE=gorp`
    /// for `foo.bar_value = "gorp"`.
    pub fn with_env_and_config_file(filename: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(config_filename) = filename {
            builder = builder.add_source(File::with_name(config_filename));
        }
        builder = builder
            .add_source(Environment::with_prefix(&PREFIX.to_uppercase()).separator("__"));

        let mut settings: Self = builder.build()?.try_deserialize()?;
        settings.storage.normalize();

        if matches!(env::var("ACTIX_THREADPOOL"), Err(VarError::NotPresent)) {
            // Db backends block via the actix threadpool: grow its size to
            // accommodate the full number of connections
            let total_db_pool_size = {
                let storage_pool_max_size = if settings.storage.enabled {
                    settings.storage.database_pool_max_size
                } else {
                    0
                };

                let tokenserver_pool_max_size = if settings.tokenserver.enabled {
                    settings.tokenserver.database_pool_max_size
                } else {
                    0
                };

                storage_pool_max_size + tokenserver_pool_max_size
            };

            let fxa_threads = if settings.tokenserver.enabled
                && settings.tokenserver.fxa_oauth_primary_jwk.is_none()
            {
                // OAuth verifications hit the network when no JWK is cached;
                // give them a little extra headroom
                1
            } else {
                0
            };

            env::set_var(
                "ACTIX_THREADPOOL",
                ((total_db_pool_size + fxa_threads).max(1)).to_string(),
            );
        }

        Ok(settings)
    }

    pub fn banner(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// A testing-only variant of the settings, loaded from the environment
    /// so CI can point the SQLite files somewhere writable.
    pub fn test_settings() -> Self {
        let mut settings =
            Self::with_env_and_config_file(None).expect("Could not get Settings in test_settings");
        settings.port = 8000;
        settings.storage.database_pool_max_size = 1;
        #[cfg(debug_assertions)]
        {
            settings.storage.database_use_test_transactions = true;
        }
        settings
    }
}

/// One master secret and the Hawk signing secret derived from it.
#[derive(Clone, Debug)]
pub struct Secret {
    pub master_secret: Vec<u8>,
    pub signing_secret: [u8; 32],
}

impl Secret {
    pub fn new(secret: &str) -> Result<Self, String> {
        Ok(Self {
            master_secret: secret.as_bytes().to_vec(),
            signing_secret: hkdf_expand_32(SIGNING_INFO, None, secret.as_bytes())?,
        })
    }
}

/// An ordered chain of secrets, newest first. Configured as a single
/// comma-separated string so rotation is one settings change.
#[derive(Clone, Debug)]
pub struct Secrets(Vec<Secret>);

impl Secrets {
    pub fn new(secrets: &str) -> Result<Self, String> {
        let parsed = secrets
            .split(',')
            .map(|secret| Secret::new(secret.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        if parsed.is_empty() {
            return Err("Empty master_secret".to_owned());
        }
        Ok(Self(parsed))
    }

    /// The newest secret, used for signing.
    pub fn current(&self) -> &Secret {
        // The chain is guaranteed non-empty by the constructor.
        &self.0[0]
    }

    /// All known secrets, newest first, for verification.
    pub fn iter(&self) -> std::slice::Iter<'_, Secret> {
        self.0.iter()
    }
}

impl Default for Secrets {
    /// A debugging default; logs a warning so it can't sneak into prod.
    fn default() -> Self {
        warn!("!!! Using default master_secret !!!");
        Self::new("secret0").expect("Could not get Secrets in Secrets::default")
    }
}

impl<'d> Deserialize<'d> for Secrets {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let secrets: String = Deserialize::deserialize(deserializer)?;
        Secrets::new(&secrets).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::Secrets;

    #[test]
    fn secret_chain_order() {
        let secrets = Secrets::new("newest, older,oldest").unwrap();
        assert_eq!(secrets.iter().count(), 3);
        assert_eq!(secrets.current().master_secret, b"newest".to_vec());
    }

    #[test]
    fn signing_secret_is_derived() {
        let secrets = Secrets::new("Ted Koppel is a robot").unwrap();
        let secret = secrets.current();
        assert_ne!(&secret.signing_secret[..], &secret.master_secret[..]);
        // Same input must derive the same signing secret
        let again = Secrets::new("Ted Koppel is a robot").unwrap();
        assert_eq!(secret.signing_secret, again.current().signing_secret);
    }
}
