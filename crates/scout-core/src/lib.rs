//! Core domain model for Scout hazard assessment snapshots.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;

pub mod decode;

pub use decode::{DecodeError, SnapshotEnvelope};

/// The only feed schema version this crate knows how to decode.
pub const EXPECTED_SCHEMA_VERSION: &str = "1.2";

/// An optional scalar from the feed: either a decoded value or explicitly absent.
///
/// `Absent` is the default so that a field missing from the payload decodes the
/// same way as an explicit `null`. It is never the same thing as zero.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Scalar<T> {
    #[default]
    Absent,
    Present(T),
}

impl<T> Scalar<T> {
    /// Value to bind at a storage boundary; `None` becomes SQL NULL.
    pub fn into_option(self) -> Option<T> {
        match self {
            Scalar::Absent => None,
            Scalar::Present(value) => Some(value),
        }
    }
}

impl<T> From<Option<T>> for Scalar<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Scalar::Present(value),
            None => Scalar::Absent,
        }
    }
}

impl<T: Serialize> Serialize for Scalar<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scalar::Absent => serializer.serialize_none(),
            Scalar::Present(value) => serializer.serialize_some(value),
        }
    }
}

/// Composite natural key of a [`HazardRecord`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NaturalKey {
    pub object_name: String,
    pub last_run: DateTime<Utc>,
}

/// One object's hazard assessment as of one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HazardRecord {
    /// NEOCP temporary designation.
    pub object_name: String,
    /// Time of the analysis run (UTC, minute precision).
    #[serde(serialize_with = "decode::serialize_feed_time")]
    pub last_run: DateTime<Utc>,
    /// Absolute magnitude.
    #[serde(rename = "H")]
    pub h: Scalar<f64>,
    /// Impact rating, 0 (negligible) to 4 (elevated).
    pub rating: Scalar<i32>,
    /// Close-approach distance in lunar distances.
    pub ca_dist: Scalar<f64>,
    /// Minimum orbit intersection distance (au).
    pub moid: Scalar<f64>,
    pub neo_score: Scalar<i32>,
    pub neo1km_score: Scalar<i32>,
    pub pha_score: Scalar<i32>,
    pub ieo_score: Scalar<i32>,
    pub geocentric_score: Scalar<i32>,
    pub tisserand_score: Scalar<i32>,
    /// 1-sigma plane-of-sky uncertainty now and one day out (arc-minutes).
    pub unc: Scalar<f64>,
    pub unc_p1: Scalar<f64>,
    pub ra: String,
    pub dec: String,
    pub elong: String,
    #[serde(serialize_with = "decode::serialize_feed_time_scalar")]
    pub t_ephem: Scalar<DateTime<Utc>>,
    /// Plane-of-sky rate of motion (arc-seconds per minute).
    pub rate: Scalar<f64>,
    pub n_obs: Scalar<i32>,
    /// Observation arc length in hours.
    pub arc: Scalar<f64>,
    pub v_inf: Scalar<f64>,
    pub rms_n: Scalar<f64>,
    #[serde(rename = "Vmag")]
    pub vmag: Scalar<f64>,
}

impl HazardRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            object_name: self.object_name.clone(),
            last_run: self.last_run,
        }
    }
}

/// One payload retrieved from the feed, fully decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub count: String,
    pub source: String,
    pub schema_version: String,
    pub records: Vec<HazardRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown snapshot version {found:?} (expected {EXPECTED_SCHEMA_VERSION:?})")]
pub struct VersionMismatch {
    pub found: String,
}

/// Rejects any declared version other than [`EXPECTED_SCHEMA_VERSION`].
pub fn check_schema_version(declared: &str) -> Result<(), VersionMismatch> {
    if declared == EXPECTED_SCHEMA_VERSION {
        Ok(())
    } else {
        Err(VersionMismatch {
            found: declared.to_string(),
        })
    }
}
