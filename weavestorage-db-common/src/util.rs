use chrono::offset::Utc;
use diesel::{
    backend::Backend,
    deserialize::{self, FromSql},
    sql_types::BigInt,
    FromSqlRow,
};
use serde::{ser, Deserialize, Deserializer, Serialize, Serializer};

use super::error::DbError;

/// Get the time since the UNIX epoch in milliseconds
fn ms_since_epoch() -> i64 {
    Utc::now().timestamp_millis()
}

/// Sync Timestamp
///
/// Internally a u64 of milliseconds since the epoch, truncated to
/// centisecond (0.01s) precision: every `modified` value on the wire renders
/// as seconds with exactly two decimal places.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Deserialize, Serialize, FromSqlRow)]
pub struct SyncTimestamp(
    #[serde(deserialize_with = "deserialize_ts", serialize_with = "serialize_ts")] u64,
);

impl SyncTimestamp {
    /// Create a string value compatible with existing Sync Timestamp headers
    ///
    /// Represents the timestamp as seconds since epoch with two decimal
    /// places of precision.
    pub fn as_header(self) -> String {
        format_ts(self.0)
    }

    /// Create a `SyncTimestamp` from a string header
    ///
    /// Assumes the string represents seconds since epoch with two decimal
    /// places of precision.
    pub fn from_header(val: &str) -> Result<Self, &'static str> {
        val.parse::<f64>()
            .map_err(|_| "Invalid value")
            .and_then(|v| {
                if v < 0f64 || v > ((u64::MAX / 1_000u64) as f64) || v.is_nan() {
                    Err("Invalid value")
                } else {
                    Ok(v)
                }
            })
            .map(|v: f64| (v * 1_000f64) as u64)
            .map(SyncTimestamp::from_milliseconds)
    }

    /// Create a `SyncTimestamp` from an i64 of milliseconds since epoch
    pub fn from_i64(val: i64) -> Result<Self, DbError> {
        if val < 0 {
            return Err(DbError::internal("Invalid modified i64 (< 0)".to_owned()));
        }
        Ok(SyncTimestamp::from_milliseconds(val as u64))
    }

    /// Create a `SyncTimestamp` from the milliseconds since epoch
    pub fn from_milliseconds(val: u64) -> Self {
        SyncTimestamp(val - (val % 10))
    }

    /// Create a `SyncTimestamp` from seconds since epoch
    pub fn from_seconds(val: f64) -> Self {
        let val = (val * 1000f64) as u64;
        SyncTimestamp(val - (val % 10))
    }

    /// Create a `SyncTimestamp` at epoch
    pub fn zero() -> Self {
        SyncTimestamp(0)
    }

    /// Return the timestamp as an i64 milliseconds since epoch
    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }

    /// Return the timestamp as an f64 seconds since epoch
    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

impl Default for SyncTimestamp {
    fn default() -> Self {
        SyncTimestamp::from_milliseconds(ms_since_epoch() as u64)
    }
}

impl From<SyncTimestamp> for i64 {
    fn from(val: SyncTimestamp) -> i64 {
        val.0 as i64
    }
}

impl From<SyncTimestamp> for u64 {
    fn from(val: SyncTimestamp) -> u64 {
        val.0
    }
}

impl<DB> FromSql<BigInt, DB> for SyncTimestamp
where
    i64: FromSql<BigInt, DB>,
    DB: Backend,
{
    fn from_sql(value: <DB as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
        let i64_value = <i64 as FromSql<BigInt, DB>>::from_sql(value)?;
        SyncTimestamp::from_i64(i64_value)
            .map_err(|e| format!("Invalid SyncTimestamp i64 {}", e).into())
    }
}

/// Format a timestamp as seconds since epoch with two decimal places of precision.
fn format_ts(val: u64) -> String {
    format!("{:.*}", 2, val as f64 / 1000.0)
}

fn deserialize_ts<'de, D>(d: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Deserialize::deserialize(d).map(|result: f64| (result * 1_000f64) as u64)
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_ts<S>(x: &u64, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    // Using serde_json::Number w/ the arbitrary_precision feature enabled to
    // persist the two decimal places of precision (vs serialize_f64 which
    // renders e.g. 0.00 as 0.0)
    let precise: serde_json::Number =
        serde_json::from_str(&format_ts(*x)).map_err(ser::Error::custom)?;
    precise.serialize(s)
}

#[cfg(test)]
mod tests {
    use super::SyncTimestamp;

    #[test]
    fn centisecond_truncation() {
        let ts = SyncTimestamp::from_milliseconds(1_591_142_320_347);
        assert_eq!(ts.as_i64(), 1_591_142_320_340);
        assert_eq!(ts.as_header(), "1591142320.34");
        assert_eq!(ts.as_seconds(), 1_591_142_320.34);
    }

    #[test]
    fn header_round_trip() {
        let ts = SyncTimestamp::from_header("1591142320.34").unwrap();
        assert_eq!(ts, SyncTimestamp::from_seconds(1_591_142_320.34));
        assert_eq!(ts.as_header(), "1591142320.34");
    }

    #[test]
    fn rejects_bad_headers() {
        assert!(SyncTimestamp::from_header("-1.0").is_err());
        assert!(SyncTimestamp::from_header("nope").is_err());
        assert!(SyncTimestamp::from_header("NaN").is_err());
    }

    #[test]
    fn zero() {
        let zero = SyncTimestamp::zero();
        assert_eq!(zero, SyncTimestamp::from_i64(0).unwrap());
        assert_eq!(zero, SyncTimestamp::from_seconds(0.00));
        assert_eq!(zero.as_header(), "0.00");
    }

    #[test]
    fn json_serialization_keeps_two_decimals() {
        let ts = SyncTimestamp::from_seconds(0.0);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "0.00");
    }
}
