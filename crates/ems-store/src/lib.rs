//! Store seam for EMS: the [`MorbidityStore`] trait, its Postgres
//! implementation, and an in-memory implementation for pipeline tests and
//! offline runs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ems_core::Fingerprint;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ems-store";

// Postgres allows 65535 binds per statement; 11 binds per attention row.
const INSERT_CHUNK: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionRow {
    pub name: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceRow {
    pub name: String,
    pub region: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosisRow {
    pub code: String,
    pub name: String,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthPlanRow {
    pub name: String,
    pub kind: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageEntityRow {
    pub name: String,
    pub kind: String,
}

/// Natural-key to surrogate-key lookups for the four dimensions a fact row
/// references.
#[derive(Debug, Clone, Default)]
pub struct DimensionMaps {
    pub places: HashMap<String, i64>,
    pub diagnoses: HashMap<String, i64>,
    pub health_plans: HashMap<String, i64>,
    pub coverage_entities: HashMap<String, i64>,
}

/// Fact row ready for insertion, dimension keys already resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttention {
    pub period: String,
    pub year: i32,
    pub sex: String,
    pub age: i16,
    pub age_group: String,
    pub place_id: i64,
    pub diagnosis_id: i64,
    pub health_plan_id: i64,
    pub coverage_entity_id: i64,
    pub attended_at: NaiveDate,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_attentions: i64,
    pub new_attentions: i64,
}

/// Storage operations one synchronization pass needs. The handle is acquired
/// at pass start and passed explicitly into each stage.
///
/// Dimension upserts are insert-if-absent by natural key and never mutate
/// existing rows. `insert_attentions` commits facts and their fingerprints in
/// a single transaction.
#[async_trait]
pub trait MorbidityStore: Send + Sync {
    async fn seen_fingerprints(&self) -> Result<HashSet<Fingerprint>, StoreError>;

    async fn upsert_regions(&self, rows: &[RegionRow]) -> Result<(), StoreError>;

    /// A place is only inserted when its parent region already exists.
    async fn upsert_places(&self, rows: &[PlaceRow]) -> Result<(), StoreError>;

    async fn upsert_diagnoses(&self, rows: &[DiagnosisRow]) -> Result<(), StoreError>;

    async fn upsert_health_plans(&self, rows: &[HealthPlanRow]) -> Result<(), StoreError>;

    async fn upsert_coverage_entities(&self, rows: &[CoverageEntityRow])
        -> Result<(), StoreError>;

    async fn dimension_maps(&self) -> Result<DimensionMaps, StoreError>;

    /// Returns the number of rows actually inserted; rows whose fingerprint
    /// already exists are silently suppressed.
    async fn insert_attentions(&self, rows: &[NewAttention]) -> Result<u64, StoreError>;

    async fn total_attentions(&self) -> Result<i64, StoreError>;

    async fn record_run(&self, stats: &RunStats) -> Result<(), StoreError>;
}

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StoreError::Unavailable)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MorbidityStore for PgStore {
    async fn seen_fingerprints(&self) -> Result<HashSet<Fingerprint>, StoreError> {
        let rows = sqlx::query("SELECT fingerprint FROM seen_fingerprints")
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            let digest: String = row.try_get("fingerprint")?;
            out.insert(Fingerprint::from(digest));
        }
        Ok(out)
    }

    async fn upsert_regions(&self, rows: &[RegionRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO regions (name, country) VALUES ($1, $2) \
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(&row.name)
            .bind(&row.country)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_places(&self, rows: &[PlaceRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            // Zero rows affected when the parent region is absent; the
            // affected facts are skipped later by the loader.
            sqlx::query(
                "INSERT INTO places (name, region_id, kind) \
                 SELECT $1, r.id, $3 FROM regions r WHERE r.name = $2 \
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(&row.name)
            .bind(&row.region)
            .bind(&row.kind)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_diagnoses(&self, rows: &[DiagnosisRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO diagnoses (code, name, category) VALUES ($1, $2, $3) \
                 ON CONFLICT (code) DO NOTHING",
            )
            .bind(&row.code)
            .bind(&row.name)
            .bind(&row.category)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_health_plans(&self, rows: &[HealthPlanRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO health_plans (name, kind, description) VALUES ($1, $2, $3) \
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(&row.name)
            .bind(&row.kind)
            .bind(&row.description)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_coverage_entities(
        &self,
        rows: &[CoverageEntityRow],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO coverage_entities (name, kind) VALUES ($1, $2) \
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(&row.name)
            .bind(&row.kind)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn dimension_maps(&self) -> Result<DimensionMaps, StoreError> {
        let mut maps = DimensionMaps::default();
        for row in sqlx::query("SELECT id, name FROM places")
            .fetch_all(&self.pool)
            .await?
        {
            maps.places.insert(row.try_get("name")?, row.try_get("id")?);
        }
        for row in sqlx::query("SELECT id, code FROM diagnoses")
            .fetch_all(&self.pool)
            .await?
        {
            maps.diagnoses
                .insert(row.try_get("code")?, row.try_get("id")?);
        }
        for row in sqlx::query("SELECT id, name FROM health_plans")
            .fetch_all(&self.pool)
            .await?
        {
            maps.health_plans
                .insert(row.try_get("name")?, row.try_get("id")?);
        }
        for row in sqlx::query("SELECT id, name FROM coverage_entities")
            .fetch_all(&self.pool)
            .await?
        {
            maps.coverage_entities
                .insert(row.try_get("name")?, row.try_get("id")?);
        }
        Ok(maps)
    }

    async fn insert_attentions(&self, rows: &[NewAttention]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0u64;
        let mut tx = self.pool.begin().await?;

        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut facts: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
                "INSERT INTO attentions (period, year, sex, age, age_group, place_id, \
                 diagnosis_id, health_plan_id, coverage_entity_id, attended_at, fingerprint) ",
            );
            facts.push_values(chunk, |mut b, row| {
                b.push_bind(&row.period)
                    .push_bind(row.year)
                    .push_bind(&row.sex)
                    .push_bind(row.age)
                    .push_bind(&row.age_group)
                    .push_bind(row.place_id)
                    .push_bind(row.diagnosis_id)
                    .push_bind(row.health_plan_id)
                    .push_bind(row.coverage_entity_id)
                    .push_bind(row.attended_at)
                    .push_bind(row.fingerprint.as_str());
            });
            facts.push(" ON CONFLICT (fingerprint) DO NOTHING");
            inserted += facts.build().execute(&mut *tx).await?.rows_affected();

            let mut prints: QueryBuilder<sqlx::Postgres> =
                QueryBuilder::new("INSERT INTO seen_fingerprints (fingerprint) ");
            prints.push_values(chunk, |mut b, row| {
                b.push_bind(row.fingerprint.as_str());
            });
            prints.push(" ON CONFLICT (fingerprint) DO NOTHING");
            prints.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn total_attentions(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM attentions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    async fn record_run(&self, stats: &RunStats) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_runs (run_id, started_at, finished_at, total_attentions, \
             new_attentions) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(stats.run_id)
        .bind(stats.started_at)
        .bind(stats.finished_at)
        .bind(stats.total_attentions)
        .bind(stats.new_attentions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory store with the same observable semantics as [`PgStore`],
/// including the place-requires-region rule and fingerprint conflict
/// suppression.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: i64,
    regions: HashMap<String, i64>,
    places: HashMap<String, i64>,
    diagnoses: HashMap<String, i64>,
    health_plans: HashMap<String, i64>,
    coverage_entities: HashMap<String, i64>,
    fingerprints: HashSet<Fingerprint>,
    attentions: Vec<NewAttention>,
    runs: Vec<RunStats>,
}

impl MemoryInner {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn recorded_runs(&self) -> Vec<RunStats> {
        self.inner.lock().await.runs.clone()
    }

    pub async fn stored_attentions(&self) -> Vec<NewAttention> {
        self.inner.lock().await.attentions.clone()
    }
}

#[async_trait]
impl MorbidityStore for MemoryStore {
    async fn seen_fingerprints(&self) -> Result<HashSet<Fingerprint>, StoreError> {
        Ok(self.inner.lock().await.fingerprints.clone())
    }

    async fn upsert_regions(&self, rows: &[RegionRow]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            if !inner.regions.contains_key(&row.name) {
                let id = inner.allocate_id();
                inner.regions.insert(row.name.clone(), id);
            }
        }
        Ok(())
    }

    async fn upsert_places(&self, rows: &[PlaceRow]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            if inner.regions.contains_key(&row.region) && !inner.places.contains_key(&row.name)
            {
                let id = inner.allocate_id();
                inner.places.insert(row.name.clone(), id);
            }
        }
        Ok(())
    }

    async fn upsert_diagnoses(&self, rows: &[DiagnosisRow]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            if !inner.diagnoses.contains_key(&row.code) {
                let id = inner.allocate_id();
                inner.diagnoses.insert(row.code.clone(), id);
            }
        }
        Ok(())
    }

    async fn upsert_health_plans(&self, rows: &[HealthPlanRow]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            if !inner.health_plans.contains_key(&row.name) {
                let id = inner.allocate_id();
                inner.health_plans.insert(row.name.clone(), id);
            }
        }
        Ok(())
    }

    async fn upsert_coverage_entities(
        &self,
        rows: &[CoverageEntityRow],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            if !inner.coverage_entities.contains_key(&row.name) {
                let id = inner.allocate_id();
                inner.coverage_entities.insert(row.name.clone(), id);
            }
        }
        Ok(())
    }

    async fn dimension_maps(&self) -> Result<DimensionMaps, StoreError> {
        let inner = self.inner.lock().await;
        Ok(DimensionMaps {
            places: inner.places.clone(),
            diagnoses: inner.diagnoses.clone(),
            health_plans: inner.health_plans.clone(),
            coverage_entities: inner.coverage_entities.clone(),
        })
    }

    async fn insert_attentions(&self, rows: &[NewAttention]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut inserted = 0u64;
        for row in rows {
            if inner.fingerprints.insert(row.fingerprint.clone()) {
                inner.attentions.push(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn total_attentions(&self) -> Result<i64, StoreError> {
        Ok(self.inner.lock().await.attentions.len() as i64)
    }

    async fn record_run(&self, stats: &RunStats) -> Result<(), StoreError> {
        self.inner.lock().await.runs.push(stats.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(name: &str) -> RegionRow {
        RegionRow {
            name: name.to_string(),
            country: "Colombia".to_string(),
        }
    }

    fn place(name: &str, region: &str) -> PlaceRow {
        PlaceRow {
            name: name.to_string(),
            region: region.to_string(),
            kind: "municipality".to_string(),
        }
    }

    fn attention(fingerprint: &str) -> NewAttention {
        NewAttention {
            period: "2024-03".to_string(),
            year: 2024,
            sex: "F".to_string(),
            age: 30,
            age_group: "25-44".to_string(),
            place_id: 1,
            diagnosis_id: 2,
            health_plan_id: 3,
            coverage_entity_id: 4,
            attended_at: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            fingerprint: Fingerprint::from(fingerprint.to_string()),
        }
    }

    #[tokio::test]
    async fn dimension_upserts_are_idempotent() {
        let store = MemoryStore::new();
        store
            .upsert_regions(&[region("ANTIOQUIA"), region("ANTIOQUIA")])
            .await
            .unwrap();
        store.upsert_regions(&[region("ANTIOQUIA")]).await.unwrap();
        store
            .upsert_places(&[place("MEDELLIN", "ANTIOQUIA")])
            .await
            .unwrap();
        store
            .upsert_places(&[place("MEDELLIN", "ANTIOQUIA")])
            .await
            .unwrap();

        let maps = store.dimension_maps().await.unwrap();
        assert_eq!(maps.places.len(), 1);
    }

    #[tokio::test]
    async fn place_without_region_is_not_inserted() {
        let store = MemoryStore::new();
        store
            .upsert_places(&[place("MEDELLIN", "ANTIOQUIA")])
            .await
            .unwrap();
        assert!(store.dimension_maps().await.unwrap().places.is_empty());

        store.upsert_regions(&[region("ANTIOQUIA")]).await.unwrap();
        store
            .upsert_places(&[place("MEDELLIN", "ANTIOQUIA")])
            .await
            .unwrap();
        assert_eq!(store.dimension_maps().await.unwrap().places.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_fingerprints_are_suppressed() {
        let store = MemoryStore::new();
        let inserted = store
            .insert_attentions(&[attention("aa"), attention("aa"), attention("bb")])
            .await
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(store.total_attentions().await.unwrap(), 2);

        let inserted = store.insert_attentions(&[attention("aa")]).await.unwrap();
        assert_eq!(inserted, 0);
        assert_eq!(store.total_attentions().await.unwrap(), 2);

        let seen = store.seen_fingerprints().await.unwrap();
        assert!(seen.contains(&Fingerprint::from("aa".to_string())));
        assert!(seen.contains(&Fingerprint::from("bb".to_string())));
    }
}
