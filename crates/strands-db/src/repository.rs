//! The character store: a `CharacterStore` trait over Life Strand
//! operations, the Postgres repository behind it, and an in-memory double
//! for tests.
//!
//! Queryable columns are extracted from the JSONB document on every write;
//! the document itself is authoritative. Vector search runs over the
//! pgvector column with cosine distance and never sees archived records.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use strands_types::{LifeStrand, LifeStrandUpdate, Memory, RecordStatus, StrandError};

fn storage_err(e: sqlx::Error) -> StrandError {
    StrandError::StorageError(e.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct NpcQuery {
    pub location: Option<String>,
    pub faction: Option<String>,
    pub status: Option<String>,
    pub name_search: Option<String>,
    pub age_min: Option<i32>,
    pub age_max: Option<i32>,
    pub limit: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NpcSummary {
    pub id: Uuid,
    pub name: Option<String>,
    pub location: Option<String>,
    pub faction: Option<String>,
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorHit {
    pub id: Uuid,
    pub name: Option<String>,
    pub similarity: f64,
}

/// Operations the NPC service exposes over its records. The Postgres
/// repository implements this in production; tests substitute
/// [`MemoryCharacterStore`].
#[async_trait]
pub trait CharacterStore: Send + Sync {
    async fn create(&self, strand: LifeStrand) -> Result<Uuid, StrandError>;
    async fn get(&self, id: Uuid) -> Result<Option<LifeStrand>, StrandError>;
    async fn get_for_prompt(&self, id: Uuid) -> Result<Option<LifeStrand>, StrandError>;
    async fn update(&self, id: Uuid, update: &LifeStrandUpdate) -> Result<bool, StrandError>;
    async fn add_memory(&self, id: Uuid, memory: Memory) -> Result<bool, StrandError>;
    async fn archive(&self, id: Uuid) -> Result<bool, StrandError>;
    async fn restore(&self, id: Uuid) -> Result<(), StrandError>;
    async fn record_status(&self, id: Uuid) -> Result<Option<RecordStatus>, StrandError>;
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<NpcSummary>, StrandError>;
    async fn query(&self, filters: &NpcQuery) -> Result<Vec<NpcSummary>, StrandError>;
    async fn search_by_trait(
        &self,
        trait_name: &str,
        limit: i64,
    ) -> Result<Vec<NpcSummary>, StrandError>;
    async fn search_by_embedding(
        &self,
        query_vector: &[f32],
        limit: i64,
    ) -> Result<Vec<VectorHit>, StrandError>;
    async fn upsert_embedding(&self, id: Uuid, vector: &[f32]) -> Result<(), StrandError>;
    async fn clear_embedding(&self, id: Uuid) -> Result<(), StrandError>;
    async fn stats(&self) -> Result<serde_json::Value, StrandError>;
}

#[derive(Debug, Clone)]
pub struct NpcRepository {
    pool: PgPool,
    embedding_dimensions: usize,
}

impl NpcRepository {
    /// Connect and make sure schema, extension, and indexes exist.
    pub async fn connect(database_url: &str, embedding_dimensions: usize) -> Result<Self, StrandError> {
        let pool = PgPoolOptions::new()
            .min_connections(2)
            .max_connections(20)
            .connect(database_url)
            .await
            .map_err(storage_err)?;
        let repo = Self {
            pool,
            embedding_dimensions,
        };
        repo.initialize_schema().await?;
        Ok(repo)
    }

    async fn initialize_schema(&self) -> Result<(), StrandError> {
        let dims = self.embedding_dimensions;
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS npcs (
                id UUID PRIMARY KEY,
                name TEXT,
                location TEXT,
                faction TEXT,
                status TEXT DEFAULT 'active',
                background_occupation TEXT,
                background_age INT,
                personality_traits JSONB,
                life_strand_data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                embedding vector({dims})
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_npcs_status ON npcs(status)".to_string(),
            "CREATE INDEX IF NOT EXISTS idx_npcs_location ON npcs(location) WHERE status <> 'archived'".to_string(),
            "CREATE INDEX IF NOT EXISTS idx_npcs_faction ON npcs(faction) WHERE status <> 'archived'".to_string(),
            "CREATE INDEX IF NOT EXISTS idx_npcs_updated_at ON npcs(updated_at)".to_string(),
            "CREATE INDEX IF NOT EXISTS idx_npcs_traits_gin ON npcs USING GIN (personality_traits jsonb_path_ops)".to_string(),
            "CREATE INDEX IF NOT EXISTS idx_npcs_embedding ON npcs USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100)".to_string(),
        ] {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        tracing::info!(dims, "npc repository schema ready");
        Ok(())
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), StrandError> {
        if vector.len() != self.embedding_dimensions {
            return Err(StrandError::ValidationFailed(format!(
                "embedding dimension {} does not match configured {}",
                vector.len(),
                self.embedding_dimensions
            )));
        }
        Ok(())
    }

    /// Create a record. The document is validated and sanitized, identity
    /// fields are assigned here.
    pub async fn create(&self, mut strand: LifeStrand) -> Result<Uuid, StrandError> {
        strand.sanitize();
        strand.validate()?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        strand.id = Some(id);
        strand.created_at = Some(now);
        strand.updated_at = Some(now);

        let document = serde_json::to_value(&strand)?;
        let traits = serde_json::to_value(&strand.personality.traits)?;
        sqlx::query(
            "INSERT INTO npcs (
                id, name, location, faction, status, background_occupation,
                background_age, personality_traits, life_strand_data, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(id)
        .bind(&strand.name)
        .bind(strand.effective_location())
        .bind(&strand.faction)
        .bind(strand.status.as_str())
        .bind(&strand.background.occupation)
        .bind(strand.background.age.map(|a| a as i32))
        .bind(traits)
        .bind(document)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        tracing::info!(npc_id = %id, name = %strand.name, "created npc");
        Ok(id)
    }

    /// Full record by id; archived records are invisible here.
    pub async fn get(&self, id: Uuid) -> Result<Option<LifeStrand>, StrandError> {
        let row = sqlx::query(
            "SELECT life_strand_data FROM npcs WHERE id = $1 AND status != 'archived'",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        match row {
            Some(row) => {
                let document: serde_json::Value =
                    row.try_get("life_strand_data").map_err(storage_err)?;
                Ok(Some(serde_json::from_value(document)?))
            }
            None => Ok(None),
        }
    }

    /// Merge an update document into the stored record under the merge
    /// rules, refresh `updated_at`, and re-extract queryable columns.
    pub async fn update(&self, id: Uuid, update: &LifeStrandUpdate) -> Result<bool, StrandError> {
        let Some(mut strand) = self.get(id).await? else {
            return Ok(false);
        };
        let now = Utc::now();
        strand.merge(update, now);
        strand.sanitize();
        strand.validate()?;
        strand.updated_at = Some(now);
        self.persist(&strand, id, now).await?;
        tracing::info!(npc_id = %id, "updated npc");
        Ok(true)
    }

    async fn persist(
        &self,
        strand: &LifeStrand,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StrandError> {
        let document = serde_json::to_value(strand)?;
        let traits = serde_json::to_value(&strand.personality.traits)?;
        sqlx::query(
            "UPDATE npcs SET
                name = $2, location = $3, faction = $4, status = $5,
                background_occupation = $6, background_age = $7,
                personality_traits = $8, life_strand_data = $9, updated_at = $10
            WHERE id = $1",
        )
        .bind(id)
        .bind(&strand.name)
        .bind(strand.effective_location())
        .bind(&strand.faction)
        .bind(strand.status.as_str())
        .bind(&strand.background.occupation)
        .bind(strand.background.age.map(|a| a as i32))
        .bind(traits)
        .bind(document)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    /// Append one memory, going through the merge rules.
    pub async fn add_memory(&self, id: Uuid, memory: Memory) -> Result<bool, StrandError> {
        let update = LifeStrandUpdate {
            memories: vec![memory],
            ..LifeStrandUpdate::default()
        };
        self.update(id, &update).await
    }

    /// Soft delete: `status = archived`.
    pub async fn archive(&self, id: Uuid) -> Result<bool, StrandError> {
        // The document keeps its own copy of status in sync.
        let result = sqlx::query(
            "UPDATE npcs SET status = 'archived', updated_at = $2,
                life_strand_data = jsonb_set(life_strand_data, '{status}', '\"archived\"')
             WHERE id = $1 AND status != 'archived'",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    /// Flip an archived record back to active.
    pub async fn restore(&self, id: Uuid) -> Result<(), StrandError> {
        let result = sqlx::query(
            "UPDATE npcs SET status = 'active', updated_at = $2,
                life_strand_data = jsonb_set(life_strand_data, '{status}', '\"active\"')
             WHERE id = $1 AND status = 'archived'",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(StrandError::NotFound);
        }
        Ok(())
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<NpcSummary>, StrandError> {
        let rows = sqlx::query(
            "SELECT id, name, location, faction, status, created_at, updated_at
             FROM npcs WHERE status != 'archived'
             ORDER BY updated_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter().map(|row| summary_from_row(&row)).collect()
    }

    /// Filter query over the extracted columns.
    pub async fn query(&self, filters: &NpcQuery) -> Result<Vec<NpcSummary>, StrandError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT id, name, location, faction, status, created_at, updated_at
             FROM npcs WHERE status != 'archived'",
        );
        if let Some(location) = &filters.location {
            builder.push(" AND location = ").push_bind(location);
        }
        if let Some(faction) = &filters.faction {
            builder.push(" AND faction = ").push_bind(faction);
        }
        if let Some(status) = &filters.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(name_search) = &filters.name_search {
            builder
                .push(" AND name ILIKE ")
                .push_bind(format!("%{name_search}%"));
        }
        if let Some(age_min) = filters.age_min {
            builder.push(" AND background_age >= ").push_bind(age_min);
        }
        if let Some(age_max) = filters.age_max {
            builder.push(" AND background_age <= ").push_bind(age_max);
        }
        let limit = if filters.limit > 0 { filters.limit } else { 50 };
        builder.push(" ORDER BY updated_at DESC LIMIT ").push_bind(limit);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.into_iter().map(|row| summary_from_row(&row)).collect()
    }

    /// Substring search over the traits column.
    pub async fn search_by_trait(
        &self,
        trait_name: &str,
        limit: i64,
    ) -> Result<Vec<NpcSummary>, StrandError> {
        let rows = sqlx::query(
            "SELECT id, name, location, faction, status, created_at, updated_at
             FROM npcs
             WHERE status != 'archived' AND personality_traits::text ILIKE $1
             ORDER BY updated_at DESC LIMIT $2",
        )
        .bind(format!("%{trait_name}%"))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter().map(|row| summary_from_row(&row)).collect()
    }

    /// Top-K active records by cosine similarity to `query_vector`.
    pub async fn search_by_embedding(
        &self,
        query_vector: &[f32],
        limit: i64,
    ) -> Result<Vec<VectorHit>, StrandError> {
        self.check_dimensions(query_vector)?;
        let vector = Vector::from(query_vector.to_vec());
        let rows = sqlx::query(
            "SELECT id, name, (1 - (embedding <=> $1)) AS similarity
             FROM npcs
             WHERE embedding IS NOT NULL AND status != 'archived'
             ORDER BY embedding <=> $1
             LIMIT $2",
        )
        .bind(vector)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter()
            .map(|row| {
                Ok(VectorHit {
                    id: row.try_get("id").map_err(storage_err)?,
                    name: row.try_get("name").map_err(storage_err)?,
                    similarity: row.try_get("similarity").map_err(storage_err)?,
                })
            })
            .collect()
    }

    /// Store or overwrite the record's embedding. A vector of the wrong
    /// dimension is rejected, never coerced.
    pub async fn upsert_embedding(&self, id: Uuid, vector: &[f32]) -> Result<(), StrandError> {
        self.check_dimensions(vector)?;
        let result = sqlx::query("UPDATE npcs SET embedding = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(Vector::from(vector.to_vec()))
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(StrandError::NotFound);
        }
        Ok(())
    }

    pub async fn clear_embedding(&self, id: Uuid) -> Result<(), StrandError> {
        sqlx::query("UPDATE npcs SET embedding = NULL, updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Trimmed projection for prompt building.
    pub async fn get_for_prompt(&self, id: Uuid) -> Result<Option<LifeStrand>, StrandError> {
        Ok(self.get(id).await?.map(|strand| strand.prompt_view()))
    }

    pub async fn stats(&self) -> Result<serde_json::Value, StrandError> {
        let active: i64 = sqlx::query("SELECT COUNT(*) AS n FROM npcs WHERE status != 'archived'")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?
            .try_get("n")
            .map_err(storage_err)?;
        let archived: i64 = sqlx::query("SELECT COUNT(*) AS n FROM npcs WHERE status = 'archived'")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?
            .try_get("n")
            .map_err(storage_err)?;
        let total_memories: i64 = sqlx::query(
            "SELECT COALESCE(SUM(jsonb_array_length(life_strand_data->'memories')), 0)::bigint AS n
             FROM npcs WHERE status != 'archived'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?
        .try_get("n")
        .map_err(storage_err)?;

        let by_location = self.group_counts("location").await?;
        let by_faction = self.group_counts("faction").await?;

        Ok(serde_json::json!({
            "active_npcs": active,
            "archived_npcs": archived,
            "total_memories": total_memories,
            "locations": by_location,
            "factions": by_faction,
        }))
    }

    async fn group_counts(&self, column: &str) -> Result<Vec<serde_json::Value>, StrandError> {
        // `column` is one of two literals; never user input.
        let rows = sqlx::query(&format!(
            "SELECT {column} AS label, COUNT(*) AS n
             FROM npcs WHERE status != 'archived' AND {column} IS NOT NULL
             GROUP BY {column} ORDER BY n DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter()
            .map(|row| {
                let label: Option<String> = row.try_get("label").map_err(storage_err)?;
                let count: i64 = row.try_get("n").map_err(storage_err)?;
                Ok(serde_json::json!({"label": label, "count": count}))
            })
            .collect()
    }

    /// Delete archived records not touched in `days_old` days.
    pub async fn cleanup_old_archived(&self, days_old: i64) -> Result<u64, StrandError> {
        let cutoff = Utc::now() - chrono::Duration::days(days_old);
        let result =
            sqlx::query("DELETE FROM npcs WHERE status = 'archived' AND updated_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::info!(deleted, "cleaned up old archived npcs");
        }
        Ok(deleted)
    }

    /// Verify the record's status regardless of archival, for restore.
    pub async fn record_status(&self, id: Uuid) -> Result<Option<RecordStatus>, StrandError> {
        let row = sqlx::query("SELECT status FROM npcs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(match row {
            Some(row) => {
                let status: String = row.try_get("status").map_err(storage_err)?;
                Some(match status.as_str() {
                    "archived" => RecordStatus::Archived,
                    "inactive" => RecordStatus::Inactive,
                    _ => RecordStatus::Active,
                })
            }
            None => None,
        })
    }
}

fn summary_from_row(row: &sqlx::postgres::PgRow) -> Result<NpcSummary, StrandError> {
    Ok(NpcSummary {
        id: row.try_get("id").map_err(storage_err)?,
        name: row.try_get("name").map_err(storage_err)?,
        location: row.try_get("location").map_err(storage_err)?,
        faction: row.try_get("faction").map_err(storage_err)?,
        status: row.try_get("status").map_err(storage_err)?,
        created_at: row.try_get("created_at").map_err(storage_err)?,
        updated_at: row.try_get("updated_at").map_err(storage_err)?,
    })
}

#[async_trait]
impl CharacterStore for NpcRepository {
    async fn create(&self, strand: LifeStrand) -> Result<Uuid, StrandError> {
        NpcRepository::create(self, strand).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<LifeStrand>, StrandError> {
        NpcRepository::get(self, id).await
    }

    async fn get_for_prompt(&self, id: Uuid) -> Result<Option<LifeStrand>, StrandError> {
        NpcRepository::get_for_prompt(self, id).await
    }

    async fn update(&self, id: Uuid, update: &LifeStrandUpdate) -> Result<bool, StrandError> {
        NpcRepository::update(self, id, update).await
    }

    async fn add_memory(&self, id: Uuid, memory: Memory) -> Result<bool, StrandError> {
        NpcRepository::add_memory(self, id, memory).await
    }

    async fn archive(&self, id: Uuid) -> Result<bool, StrandError> {
        NpcRepository::archive(self, id).await
    }

    async fn restore(&self, id: Uuid) -> Result<(), StrandError> {
        NpcRepository::restore(self, id).await
    }

    async fn record_status(&self, id: Uuid) -> Result<Option<RecordStatus>, StrandError> {
        NpcRepository::record_status(self, id).await
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<NpcSummary>, StrandError> {
        NpcRepository::list(self, limit, offset).await
    }

    async fn query(&self, filters: &NpcQuery) -> Result<Vec<NpcSummary>, StrandError> {
        NpcRepository::query(self, filters).await
    }

    async fn search_by_trait(
        &self,
        trait_name: &str,
        limit: i64,
    ) -> Result<Vec<NpcSummary>, StrandError> {
        NpcRepository::search_by_trait(self, trait_name, limit).await
    }

    async fn search_by_embedding(
        &self,
        query_vector: &[f32],
        limit: i64,
    ) -> Result<Vec<VectorHit>, StrandError> {
        NpcRepository::search_by_embedding(self, query_vector, limit).await
    }

    async fn upsert_embedding(&self, id: Uuid, vector: &[f32]) -> Result<(), StrandError> {
        NpcRepository::upsert_embedding(self, id, vector).await
    }

    async fn clear_embedding(&self, id: Uuid) -> Result<(), StrandError> {
        NpcRepository::clear_embedding(self, id).await
    }

    async fn stats(&self) -> Result<serde_json::Value, StrandError> {
        NpcRepository::stats(self).await
    }
}

// ---------------------------------------------------------------------------
// In-memory store for tests
// ---------------------------------------------------------------------------

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct StoredRecord {
    strand: LifeStrand,
    embedding: Option<Vec<f32>>,
}

/// In-memory `CharacterStore` with the repository's semantics: same
/// validation, merge rules, archived-record visibility, dimension checks,
/// and nearest-first search ordering.
#[derive(Debug)]
pub struct MemoryCharacterStore {
    dimensions: usize,
    records: Mutex<HashMap<Uuid, StoredRecord>>,
}

impl MemoryCharacterStore {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), StrandError> {
        if vector.len() != self.dimensions {
            return Err(StrandError::ValidationFailed(format!(
                "embedding dimension {} does not match configured {}",
                vector.len(),
                self.dimensions
            )));
        }
        Ok(())
    }

    fn summaries<F>(&self, keep: F) -> Vec<NpcSummary>
    where
        F: Fn(&LifeStrand) -> bool,
    {
        let records = lock(&self.records);
        let mut out: Vec<NpcSummary> = records
            .iter()
            .filter(|(_, r)| r.strand.status != RecordStatus::Archived && keep(&r.strand))
            .map(|(id, r)| NpcSummary {
                id: *id,
                name: Some(r.strand.name.clone()),
                location: r.strand.effective_location().map(ToString::to_string),
                faction: r.strand.faction.clone(),
                status: Some(r.strand.status.as_str().to_string()),
                created_at: r.strand.created_at.unwrap_or_else(Utc::now),
                updated_at: r.strand.updated_at.unwrap_or_else(Utc::now),
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        0.0
    } else {
        f64::from(dot / (norm_a * norm_b))
    }
}

#[async_trait]
impl CharacterStore for MemoryCharacterStore {
    async fn create(&self, mut strand: LifeStrand) -> Result<Uuid, StrandError> {
        strand.sanitize();
        strand.validate()?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        strand.id = Some(id);
        strand.created_at = Some(now);
        strand.updated_at = Some(now);
        lock(&self.records).insert(
            id,
            StoredRecord {
                strand,
                embedding: None,
            },
        );
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<LifeStrand>, StrandError> {
        Ok(lock(&self.records)
            .get(&id)
            .filter(|r| r.strand.status != RecordStatus::Archived)
            .map(|r| r.strand.clone()))
    }

    async fn get_for_prompt(&self, id: Uuid) -> Result<Option<LifeStrand>, StrandError> {
        Ok(self.get(id).await?.map(|strand| strand.prompt_view()))
    }

    async fn update(&self, id: Uuid, update: &LifeStrandUpdate) -> Result<bool, StrandError> {
        let mut records = lock(&self.records);
        let Some(record) = records
            .get_mut(&id)
            .filter(|r| r.strand.status != RecordStatus::Archived)
        else {
            return Ok(false);
        };
        let now = Utc::now();
        let mut merged = record.strand.clone();
        merged.merge(update, now);
        merged.sanitize();
        merged.validate()?;
        merged.updated_at = Some(now);
        record.strand = merged;
        Ok(true)
    }

    async fn add_memory(&self, id: Uuid, memory: Memory) -> Result<bool, StrandError> {
        let update = LifeStrandUpdate {
            memories: vec![memory],
            ..LifeStrandUpdate::default()
        };
        self.update(id, &update).await
    }

    async fn archive(&self, id: Uuid) -> Result<bool, StrandError> {
        let mut records = lock(&self.records);
        let Some(record) = records.get_mut(&id) else {
            return Ok(false);
        };
        if record.strand.status == RecordStatus::Archived {
            return Ok(false);
        }
        record.strand.status = RecordStatus::Archived;
        record.strand.updated_at = Some(Utc::now());
        Ok(true)
    }

    async fn restore(&self, id: Uuid) -> Result<(), StrandError> {
        let mut records = lock(&self.records);
        let Some(record) = records.get_mut(&id) else {
            return Err(StrandError::NotFound);
        };
        if record.strand.status != RecordStatus::Archived {
            return Err(StrandError::NotFound);
        }
        record.strand.status = RecordStatus::Active;
        record.strand.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn record_status(&self, id: Uuid) -> Result<Option<RecordStatus>, StrandError> {
        Ok(lock(&self.records).get(&id).map(|r| r.strand.status))
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<NpcSummary>, StrandError> {
        let all = self.summaries(|_| true);
        Ok(all
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn query(&self, filters: &NpcQuery) -> Result<Vec<NpcSummary>, StrandError> {
        let limit = if filters.limit > 0 { filters.limit } else { 50 };
        let matches = self.summaries(|strand| {
            filters
                .location
                .as_deref()
                .map_or(true, |l| strand.effective_location() == Some(l))
                && filters
                    .faction
                    .as_deref()
                    .map_or(true, |f| strand.faction.as_deref() == Some(f))
                && filters
                    .status
                    .as_deref()
                    .map_or(true, |s| strand.status.as_str() == s)
                && filters.name_search.as_deref().map_or(true, |n| {
                    strand.name.to_lowercase().contains(&n.to_lowercase())
                })
                && filters
                    .age_min
                    .map_or(true, |min| strand.background.age.map_or(false, |a| a as i32 >= min))
                && filters
                    .age_max
                    .map_or(true, |max| strand.background.age.map_or(false, |a| a as i32 <= max))
        });
        Ok(matches.into_iter().take(limit as usize).collect())
    }

    async fn search_by_trait(
        &self,
        trait_name: &str,
        limit: i64,
    ) -> Result<Vec<NpcSummary>, StrandError> {
        let needle = trait_name.to_lowercase();
        let matches = self.summaries(|strand| {
            strand
                .personality
                .traits
                .iter()
                .any(|t| t.to_lowercase().contains(&needle))
        });
        Ok(matches.into_iter().take(limit.max(0) as usize).collect())
    }

    async fn search_by_embedding(
        &self,
        query_vector: &[f32],
        limit: i64,
    ) -> Result<Vec<VectorHit>, StrandError> {
        self.check_dimensions(query_vector)?;
        let records = lock(&self.records);
        let mut hits: Vec<VectorHit> = records
            .iter()
            .filter(|(_, r)| r.strand.status != RecordStatus::Archived)
            .filter_map(|(id, r)| {
                r.embedding.as_ref().map(|embedding| VectorHit {
                    id: *id,
                    name: Some(r.strand.name.clone()),
                    similarity: cosine_similarity(query_vector, embedding),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit.max(0) as usize);
        Ok(hits)
    }

    async fn upsert_embedding(&self, id: Uuid, vector: &[f32]) -> Result<(), StrandError> {
        self.check_dimensions(vector)?;
        let mut records = lock(&self.records);
        let Some(record) = records.get_mut(&id) else {
            return Err(StrandError::NotFound);
        };
        record.embedding = Some(vector.to_vec());
        record.strand.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn clear_embedding(&self, id: Uuid) -> Result<(), StrandError> {
        if let Some(record) = lock(&self.records).get_mut(&id) {
            record.embedding = None;
            record.strand.updated_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn stats(&self) -> Result<serde_json::Value, StrandError> {
        let records = lock(&self.records);
        let active = records
            .values()
            .filter(|r| r.strand.status != RecordStatus::Archived)
            .count();
        let archived = records.len() - active;
        let total_memories: usize = records
            .values()
            .filter(|r| r.strand.status != RecordStatus::Archived)
            .map(|r| r.strand.memories.len())
            .sum();
        Ok(serde_json::json!({
            "active_npcs": active,
            "archived_npcs": archived,
            "total_memories": total_memories,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strands_types::Knowledge;

    fn store() -> MemoryCharacterStore {
        MemoryCharacterStore::new(4)
    }

    fn alice() -> LifeStrand {
        let mut strand = LifeStrand::new("Alice");
        strand.faction = Some("merchants".to_string());
        strand.background.age = Some(28);
        strand.background.location = Some("Tech District".to_string());
        strand.personality.traits = vec!["analytical".to_string(), "curious".to_string()];
        strand
    }

    #[tokio::test]
    async fn create_get_round_trip_assigns_identity() {
        let store = store();
        let id = store.create(alice()).await.unwrap();
        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.id, Some(id));
        assert_eq!(loaded.name, "Alice");
        assert!(loaded.created_at.is_some());
        assert_eq!(loaded.created_at, loaded.updated_at);
    }

    #[tokio::test]
    async fn create_rejects_invalid_records() {
        let store = store();
        let mut strand = alice();
        strand.personality.traits.clear();
        let err = store.create(strand).await.unwrap_err();
        assert!(matches!(err, StrandError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn update_merges_and_refreshes_updated_at() {
        let store = store();
        let id = store.create(alice()).await.unwrap();
        let created_at = store.get(id).await.unwrap().unwrap().created_at;

        let update = LifeStrandUpdate {
            knowledge: vec![Knowledge {
                topic: "Harvest".to_string(),
                content: "starts next week".to_string(),
                source: None,
                confidence: 7,
                acquired_at: None,
            }],
            ..LifeStrandUpdate::default()
        };
        assert!(store.update(id, &update).await.unwrap());
        // Re-applying the same update merges to the same record.
        assert!(store.update(id, &update).await.unwrap());

        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.knowledge.len(), 1);
        assert_eq!(loaded.created_at, created_at);
        assert!(loaded.updated_at >= created_at);
        assert!(!store.update(Uuid::new_v4(), &update).await.unwrap());
    }

    #[tokio::test]
    async fn archive_hides_and_restore_reactivates() {
        let store = store();
        let id = store.create(alice()).await.unwrap();

        assert!(store.archive(id).await.unwrap());
        assert!(store.get(id).await.unwrap().is_none());
        assert!(store.list(50, 0).await.unwrap().is_empty());
        assert_eq!(
            store.record_status(id).await.unwrap(),
            Some(RecordStatus::Archived)
        );
        // Archiving twice is a no-op.
        assert!(!store.archive(id).await.unwrap());

        store.restore(id).await.unwrap();
        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RecordStatus::Active);
        // Restoring an active record is an error.
        assert!(store.restore(id).await.is_err());
    }

    #[tokio::test]
    async fn vector_search_orders_by_similarity_and_skips_archived() {
        let store = store();
        let near = store.create(alice()).await.unwrap();
        let far = store.create(LifeStrand::new("Bob")).await.unwrap();
        let gone = store.create(LifeStrand::new("Cara")).await.unwrap();

        store.upsert_embedding(near, &[1.0, 0.0, 0.0, 0.0]).await.unwrap();
        store.upsert_embedding(far, &[0.0, 1.0, 0.0, 0.0]).await.unwrap();
        store.upsert_embedding(gone, &[0.9, 0.1, 0.0, 0.0]).await.unwrap();
        store.archive(gone).await.unwrap();

        let hits = store
            .search_by_embedding(&[1.0, 0.0, 0.0, 0.0], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, near);
        assert!(hits[0].similarity > hits[1].similarity);
        assert!(!hits.iter().any(|h| h.id == gone));
    }

    #[tokio::test]
    async fn embedding_dimension_mismatch_is_rejected_not_coerced() {
        let store = store();
        let id = store.create(alice()).await.unwrap();
        let err = store.upsert_embedding(id, &[1.0, 0.0]).await.unwrap_err();
        assert!(matches!(err, StrandError::ValidationFailed(_)));
        let err = store.search_by_embedding(&[1.0], 10).await.unwrap_err();
        assert!(matches!(err, StrandError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn upsert_embedding_is_idempotent() {
        let store = store();
        let id = store.create(alice()).await.unwrap();
        let vector = [0.5, 0.5, 0.0, 0.0];
        store.upsert_embedding(id, &vector).await.unwrap();
        store.upsert_embedding(id, &vector).await.unwrap();
        let stored = lock(&store.records).get(&id).unwrap().embedding.clone();
        assert_eq!(stored, Some(vector.to_vec()));
    }

    #[tokio::test]
    async fn query_filters_compose() {
        let store = store();
        store.create(alice()).await.unwrap();
        let mut bob = LifeStrand::new("Bob");
        bob.background.age = Some(55);
        bob.background.location = Some("Old Town".to_string());
        store.create(bob).await.unwrap();

        let filters = NpcQuery {
            location: Some("Tech District".to_string()),
            age_max: Some(40),
            limit: 10,
            ..NpcQuery::default()
        };
        let matches = store.query(&filters).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].name.as_deref(), Some("Alice"));

        let by_trait = store.search_by_trait("curious", 10).await.unwrap();
        assert_eq!(by_trait.len(), 1);
    }
}

