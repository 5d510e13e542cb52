mod error;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use error::{ErrorLocation, TokenserverError};

/// The type of the storage nodes fronted by this tokenserver, reported in
/// token issuance responses as `node_type`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    MySql,
    Spanner,
    #[default]
    Sqlite,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::MySql => write!(f, "mysql"),
            NodeType::Spanner => write!(f, "spanner"),
            NodeType::Sqlite => write!(f, "sqlite"),
        }
    }
}
