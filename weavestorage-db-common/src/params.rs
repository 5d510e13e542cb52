//! Parameter types for database methods.
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{results, util::SyncTimestamp, Sorting, UserIdentifier};

macro_rules! data {
    ($name:ident {$($property:ident: $type:ty,)*}) => {
        #[derive(Clone, Debug)]
        pub struct $name {
            $(pub $property: $type,)*
        }
    }
}

macro_rules! uid_data {
    ($($name:ident,)+) => ($(
        pub type $name = UserIdentifier;
    )+)
}

macro_rules! collection_data {
    ($($name:ident {$($property:ident: $type:ty,)*},)+) => ($(
        data! {
            $name {
                user_id: UserIdentifier,
                collection: String,
                $($property: $type,)*
            }
        }
    )+)
}

macro_rules! bso_data {
    ($($name:ident {$($property:ident: $type:ty,)*},)+) => ($(
        data! {
            $name {
                user_id: UserIdentifier,
                collection: String,
                id: String,
                $($property: $type,)*
            }
        }
    )+)
}

uid_data! {
    GetCollectionTimestamps,
    GetCollectionCounts,
    GetCollectionUsage,
    GetStorageTimestamp,
    GetStorageUsage,
    DeleteStorage,
}

/// A pagination cursor.
///
/// For time-ordered sorts the cursor carries the boundary `modified`
/// timestamp of the last row already returned plus the number of rows seen
/// at exactly that timestamp, so subsequent pages can never repeat or skip
/// rows that existed when the first page was cut. For `sort=index` (and
/// unsorted reads) only the numeric part is used.
#[derive(Debug, Default, Clone)]
pub struct Offset {
    pub timestamp: Option<SyncTimestamp>,
    pub offset: u64,
}

impl ToString for Offset {
    fn to_string(&self) -> String {
        match self.timestamp {
            None => self.offset.to_string(),
            Some(ts) => format!("{}:{}", ts.as_i64(), self.offset),
        }
    }
}

impl FromStr for Offset {
    type Err = &'static str;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s.split_once(':') {
            None => Offset {
                timestamp: None,
                offset: s.parse::<u64>().map_err(|_| "Invalid offset")?,
            },
            Some((timestamp, offset)) => {
                let timestamp = timestamp.parse::<u64>().map_err(|_| "Invalid offset")?;
                Offset {
                    timestamp: Some(SyncTimestamp::from_milliseconds(timestamp)),
                    offset: offset.parse::<u64>().map_err(|_| "Invalid offset")?,
                }
            }
        };
        Ok(result)
    }
}

collection_data! {
    LockCollection {},
    DeleteCollection {},
    GetCollectionTimestamp {},
    DeleteBsos {
        ids: Vec<String>,
    },
    GetBsos {
        newer: Option<SyncTimestamp>,
        older: Option<SyncTimestamp>,
        sort: Sorting,
        limit: Option<u32>,
        offset: Option<Offset>,
        ids: Vec<String>,
        full: bool,
    },
    PostBsos {
        bsos: Vec<PostCollectionBso>,
    },

    CreateBatch {
        bsos: Vec<PostCollectionBso>,
    },
    ValidateBatch {
        id: String,
    },
    AppendToBatch {
        batch: results::CreateBatch,
        bsos: Vec<PostCollectionBso>,
    },
    CommitBatch {
        batch: Batch,
    },
    GetBatch {
        id: String,
    },
    DeleteBatch {
        id: String,
    },
    GetQuotaUsage {
        collection_id: i32,
    },
}

impl From<ValidateBatch> for GetBatch {
    fn from(v: ValidateBatch) -> Self {
        Self {
            id: v.id,
            user_id: v.user_id,
            collection: v.collection,
        }
    }
}

pub type ValidateBatchId = String;
pub type GetBsoIds = GetBsos;

bso_data! {
    DeleteBso {},
    GetBso {},
    GetBsoTimestamp {},
}

#[derive(Clone, Debug, Default)]
pub struct Batch {
    pub id: String,
}

pub struct PutBso {
    pub user_id: UserIdentifier,
    pub collection: String,
    pub id: String,
    pub sortindex: Option<i32>,
    pub payload: Option<String>,
    // ttl in seconds
    pub ttl: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PostCollectionBso {
    pub id: String,
    pub sortindex: Option<i32>,
    pub payload: Option<String>,
    // ttl in seconds
    pub ttl: Option<u32>,
}

pub type GetCollectionId = String;

pub type CreateCollection = String;

data! {
    UpdateCollection {
        user_id: UserIdentifier,
        collection_id: i32,
        collection: String,
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::Offset;

    #[test]
    fn offset_round_trips() {
        let numeric = Offset::from_str("100").unwrap();
        assert!(numeric.timestamp.is_none());
        assert_eq!(numeric.offset, 100);
        assert_eq!(numeric.to_string(), "100");

        let cursor = Offset::from_str("1234567890120:3").unwrap();
        assert_eq!(cursor.timestamp.unwrap().as_i64(), 1_234_567_890_120);
        assert_eq!(cursor.offset, 3);
        assert_eq!(cursor.to_string(), "1234567890120:3");
    }

    #[test]
    fn offset_rejects_garbage() {
        assert!(Offset::from_str("").is_err());
        assert!(Offset::from_str("a:1").is_err());
        assert!(Offset::from_str("1:a").is_err());
        assert!(Offset::from_str("-1").is_err());
    }
}
