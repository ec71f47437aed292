//! TimescaleDB-backed [`HazardStore`].

use async_trait::async_trait;
use scout_core::HazardRecord;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use crate::writer::{HazardStore, HazardTransaction, InsertOutcome, PersistenceError};

pub const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS scout (
    object_name       TEXT NOT NULL,
    last_run          TIMESTAMPTZ NOT NULL,
    h                 REAL,
    rating            SMALLINT,
    ca_dist           REAL,
    moid              REAL,
    neo_score         SMALLINT,
    neo_1km_score     SMALLINT,
    pha_score         SMALLINT,
    ieo_score         SMALLINT,
    geocentric_score  SMALLINT,
    tisserand_score   SMALLINT,
    unc               REAL,
    uncp1             REAL,
    ra                TEXT,
    dec               TEXT,
    elong             TEXT,
    tephem            TIMESTAMPTZ,
    rate              REAL,
    nobs              SMALLINT,
    arc               REAL,
    vinf              REAL,
    rmsn              REAL,
    vmag              REAL,
    PRIMARY KEY(object_name, last_run)
)
"#;

pub const CREATE_HYPERTABLE_SQL: &str =
    "SELECT create_hypertable('scout', 'last_run', if_not_exists => true)";

const INSERT_SQL: &str = r#"
INSERT INTO scout (
    object_name, last_run, h, rating, ca_dist, moid, neo_score, neo_1km_score, pha_score, ieo_score,
    geocentric_score, tisserand_score, unc, uncp1, ra, dec, elong, tephem, rate, nobs,
    arc, vinf, rmsn, vmag
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20,
    $21, $22, $23, $24
)
ON CONFLICT (object_name, last_run) DO NOTHING
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Builds a single-connection pool that does not connect until first use,
    /// so a run with nothing to ingest never touches the database.
    pub fn connect_lazy(options: PgConnectOptions) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy_with(options);
        Self { pool }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HazardStore for PgStore {
    async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| PersistenceError::Connect(err.into()))?;

        for statement in [CREATE_TABLE_SQL, CREATE_HYPERTABLE_SQL] {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .map_err(|err| PersistenceError::Schema(err.into()))?;
        }
        debug!("scout table provisioned");
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn HazardTransaction>, PersistenceError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|err| PersistenceError::Begin(err.into()))?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl HazardTransaction for PgTransaction {
    async fn insert_or_ignore(
        &mut self,
        record: &HazardRecord,
    ) -> Result<InsertOutcome, PersistenceError> {
        let result = sqlx::query(INSERT_SQL)
            .bind(&record.object_name)
            .bind(record.last_run)
            .bind(record.h.into_option())
            .bind(record.rating.into_option())
            .bind(record.ca_dist.into_option())
            .bind(record.moid.into_option())
            .bind(record.neo_score.into_option())
            .bind(record.neo1km_score.into_option())
            .bind(record.pha_score.into_option())
            .bind(record.ieo_score.into_option())
            .bind(record.geocentric_score.into_option())
            .bind(record.tisserand_score.into_option())
            .bind(record.unc.into_option())
            .bind(record.unc_p1.into_option())
            .bind(&record.ra)
            .bind(&record.dec)
            .bind(&record.elong)
            .bind(record.t_ephem.into_option())
            .bind(record.rate.into_option())
            .bind(record.n_obs.into_option())
            .bind(record.arc.into_option())
            .bind(record.v_inf.into_option())
            .bind(record.rms_n.into_option())
            .bind(record.vmag.into_option())
            .execute(&mut *self.tx)
            .await
            .map_err(|err| PersistenceError::Insert {
                key: record.natural_key(),
                source: err.into(),
            })?;

        Ok(if result.rows_affected() == 0 {
            InsertOutcome::ConflictIgnored
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        self.tx
            .commit()
            .await
            .map_err(|err| PersistenceError::Commit(err.into()))
    }

    async fn rollback(self: Box<Self>) -> Result<(), PersistenceError> {
        self.tx
            .rollback()
            .await
            .map_err(|err| PersistenceError::Rollback(err.into()))
    }
}
