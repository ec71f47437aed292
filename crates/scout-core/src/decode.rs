//! Field-level and snapshot-level decoding of feed payloads.
//!
//! Record fields are captured as raw JSON tokens first and decoded one by one,
//! so a malformed token can be reported with its field name and the exact text
//! that failed.

use std::collections::BTreeMap;
use std::io::Read;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serializer};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::{check_schema_version, HazardRecord, Scalar, Snapshot, VersionMismatch};

pub const NULL_TOKEN: &str = "null";

/// Layout of feed timestamps, always UTC.
pub const FEED_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed snapshot json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("field {field}: cannot decode token {token}")]
    Field { field: &'static str, token: String },
    #[error("field {field}: required value is missing")]
    Missing { field: &'static str },
    #[error("record {index}{}: {source}", object_label(.object))]
    Record {
        index: usize,
        /// `objectName` of the failing record, empty when it has none.
        object: String,
        #[source]
        source: Box<DecodeError>,
    },
}

fn object_label(object: &str) -> String {
    if object.is_empty() {
        String::new()
    } else {
        format!(" ({object})")
    }
}

/// Strips one pair of matching `'` or `"` quotes, if present.
pub fn unquote(raw: &str) -> &str {
    let bytes = raw.as_bytes();
    if bytes.len() > 1
        && bytes[0] == bytes[bytes.len() - 1]
        && (bytes[0] == b'\'' || bytes[0] == b'"')
    {
        &raw[1..raw.len() - 1]
    } else {
        raw
    }
}

/// A scalar type that can be parsed from an unquoted feed token.
pub trait FeedScalar: Sized {
    fn parse_token(text: &str) -> Option<Self>;
}

impl FeedScalar for i32 {
    fn parse_token(text: &str) -> Option<Self> {
        text.parse().ok()
    }
}

impl FeedScalar for f64 {
    fn parse_token(text: &str) -> Option<Self> {
        text.parse().ok()
    }
}

impl FeedScalar for DateTime<Utc> {
    fn parse_token(text: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(text, FEED_TIME_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

/// Decodes a raw token that may be `null`, a quoted value or a bare value.
pub fn decode_scalar<T: FeedScalar>(
    field: &'static str,
    raw: &str,
) -> Result<Scalar<T>, DecodeError> {
    let raw = raw.trim();
    if raw == NULL_TOKEN {
        return Ok(Scalar::Absent);
    }
    T::parse_token(unquote(raw))
        .map(Scalar::Present)
        .ok_or_else(|| DecodeError::Field {
            field,
            token: raw.to_string(),
        })
}

/// Free-text fields are never optional: `null` decodes to the empty string.
pub fn decode_text(field: &'static str, raw: &str) -> Result<String, DecodeError> {
    let raw = raw.trim();
    if raw == NULL_TOKEN {
        return Ok(String::new());
    }
    serde_json::from_str::<String>(raw).map_err(|_| DecodeError::Field {
        field,
        token: raw.to_string(),
    })
}

pub(crate) fn serialize_feed_time<S: Serializer>(
    value: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&value.format(FEED_TIME_FORMAT))
}

pub(crate) fn serialize_feed_time_scalar<S: Serializer>(
    value: &Scalar<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Scalar::Absent => serializer.serialize_none(),
        Scalar::Present(value) => serialize_feed_time(value, serializer),
    }
}

pub type RawRecord = BTreeMap<String, Box<RawValue>>;

#[derive(Debug, Default, Deserialize)]
pub struct Signature {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub version: String,
}

/// A payload whose envelope is parsed but whose records are still raw tokens.
#[derive(Debug, Deserialize)]
pub struct SnapshotEnvelope {
    #[serde(default)]
    pub count: String,
    #[serde(default)]
    pub signature: Signature,
    #[serde(default)]
    pub data: Option<Vec<RawRecord>>,
}

impl SnapshotEnvelope {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, DecodeError> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn version(&self) -> &str {
        &self.signature.version
    }

    pub fn check_version(&self) -> Result<(), VersionMismatch> {
        check_schema_version(self.version())
    }

    pub fn record_count(&self) -> usize {
        self.data.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Decodes every record. Does not check the schema version.
    pub fn decode(self) -> Result<Snapshot, DecodeError> {
        let records = self
            .data
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                decode_record(raw).map_err(|source| DecodeError::Record {
                    index,
                    object: decode_text("objectName", token(raw, "objectName"))
                        .unwrap_or_default(),
                    source: Box::new(source),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Snapshot {
            count: self.count,
            source: self.signature.source,
            schema_version: self.signature.version,
            records,
        })
    }
}

fn token<'a>(record: &'a RawRecord, field: &str) -> &'a str {
    record.get(field).map(|raw| raw.get()).unwrap_or(NULL_TOKEN)
}

fn required<T>(field: &'static str, value: Scalar<T>) -> Result<T, DecodeError> {
    match value {
        Scalar::Present(value) => Ok(value),
        Scalar::Absent => Err(DecodeError::Missing { field }),
    }
}

pub fn decode_record(record: &RawRecord) -> Result<HazardRecord, DecodeError> {
    let object_name = decode_text("objectName", token(record, "objectName"))?;
    if object_name.is_empty() {
        return Err(DecodeError::Missing {
            field: "objectName",
        });
    }
    let last_run = required("lastRun", decode_scalar("lastRun", token(record, "lastRun"))?)?;

    Ok(HazardRecord {
        object_name,
        last_run,
        h: decode_scalar("H", token(record, "H"))?,
        rating: decode_scalar("rating", token(record, "rating"))?,
        ca_dist: decode_scalar("caDist", token(record, "caDist"))?,
        moid: decode_scalar("moid", token(record, "moid"))?,
        neo_score: decode_scalar("neoScore", token(record, "neoScore"))?,
        neo1km_score: decode_scalar("neo1kmScore", token(record, "neo1kmScore"))?,
        pha_score: decode_scalar("phaScore", token(record, "phaScore"))?,
        ieo_score: decode_scalar("ieoScore", token(record, "ieoScore"))?,
        geocentric_score: decode_scalar("geocentricScore", token(record, "geocentricScore"))?,
        tisserand_score: decode_scalar("tisserandScore", token(record, "tisserandScore"))?,
        unc: decode_scalar("unc", token(record, "unc"))?,
        unc_p1: decode_scalar("uncP1", token(record, "uncP1"))?,
        ra: decode_text("ra", token(record, "ra"))?,
        dec: decode_text("dec", token(record, "dec"))?,
        elong: decode_text("elong", token(record, "elong"))?,
        t_ephem: decode_scalar("tEphem", token(record, "tEphem"))?,
        rate: decode_scalar("rate", token(record, "rate"))?,
        n_obs: decode_scalar("nObs", token(record, "nObs"))?,
        arc: decode_scalar("arc", token(record, "arc"))?,
        v_inf: decode_scalar("vInf", token(record, "vInf"))?,
        rms_n: decode_scalar("rmsN", token(record, "rmsN"))?,
        vmag: decode_scalar("Vmag", token(record, "Vmag"))?,
    })
}

/// Parses a whole payload, rejecting foreign schema versions before any
/// record is decoded.
pub fn decode_snapshot_checked(bytes: &[u8]) -> Result<Snapshot, SnapshotError> {
    let envelope = SnapshotEnvelope::from_slice(bytes)?;
    envelope.check_version()?;
    Ok(envelope.decode()?)
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Version(#[from] VersionMismatch),
}
