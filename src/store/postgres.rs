use async_trait::async_trait;
use pgvector::Vector;
use tokio_postgres::{Client, NoTls, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{FileEmbeddingRecord, ScoredRecord};
use crate::store::{EmbeddingStore, ProjectStats};

const COLUMNS: &str = "id, project_id, file_name, source_code, summary, embedding";

/// pgvector-backed store. Rows live in `file_embeddings`, unique per
/// `(project_id, file_name)`; `seq` records insertion order.
pub struct PgEmbeddingStore {
    client: Client,
}

impl PgEmbeddingStore {
    /// Connect and create the extension, table and index if missing.
    pub async fn connect(database_url: &str, dims: usize) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!("postgres connection error: {err}");
            }
        });

        let store = Self { client };
        store.prepare(dims).await?;
        Ok(store)
    }

    async fn prepare(&self, dims: usize) -> Result<()> {
        if dims == 0 {
            return Err(Error::Config("embedding dimension must be positive".into()));
        }
        self.client
            .execute("CREATE EXTENSION IF NOT EXISTS vector", &[])
            .await?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS file_embeddings (
                id UUID PRIMARY KEY,
                seq BIGSERIAL,
                project_id UUID NOT NULL,
                file_name TEXT NOT NULL,
                source_code TEXT NOT NULL,
                summary TEXT NOT NULL,
                embedding VECTOR({dims}),
                UNIQUE (project_id, file_name)
            )"
        );
        self.client.execute(&ddl, &[]).await?;
        self.client
            .execute(
                "CREATE INDEX IF NOT EXISTS file_embeddings_project_idx ON file_embeddings (project_id)",
                &[],
            )
            .await?;
        Ok(())
    }
}

fn row_to_record(row: &Row) -> Result<FileEmbeddingRecord> {
    let embedding: Option<Vector> = row.try_get("embedding")?;
    Ok(FileEmbeddingRecord {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        file_name: row.try_get("file_name")?,
        source_code: row.try_get("source_code")?,
        summary: row.try_get("summary")?,
        embedding: embedding.map(Vec::from),
    })
}

#[async_trait]
impl EmbeddingStore for PgEmbeddingStore {
    async fn upsert(
        &self,
        project_id: Uuid,
        file_name: &str,
        source_code: &str,
        summary: &str,
    ) -> Result<Uuid> {
        let row = self
            .client
            .query_one(
                "INSERT INTO file_embeddings (id, project_id, file_name, source_code, summary, embedding) \
                 VALUES ($1, $2, $3, $4, $5, NULL) \
                 ON CONFLICT (project_id, file_name) DO UPDATE SET \
                    source_code = EXCLUDED.source_code, \
                    summary = EXCLUDED.summary, \
                    embedding = NULL \
                 RETURNING id",
                &[&Uuid::new_v4(), &project_id, &file_name, &source_code, &summary],
            )
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn set_embedding(&self, id: Uuid, embedding: &[f32]) -> Result<()> {
        let vector = Vector::from(embedding.to_vec());
        let updated = self
            .client
            .execute(
                "UPDATE file_embeddings SET embedding = $1 WHERE id = $2",
                &[&vector, &id],
            )
            .await?;
        if updated == 0 {
            return Err(Error::store(format!("set embedding: no record {id}")));
        }
        Ok(())
    }

    async fn similarity_search(
        &self,
        project_id: Uuid,
        query: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>> {
        let vector = Vector::from(query.to_vec());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {COLUMNS}, 1 - (embedding <=> $1) AS similarity \
             FROM file_embeddings \
             WHERE project_id = $2 \
               AND embedding IS NOT NULL \
               AND 1 - (embedding <=> $1) > $3 \
             ORDER BY embedding <=> $1 ASC, seq ASC \
             LIMIT $4"
        );
        let rows = self
            .client
            .query(&sql, &[&vector, &project_id, &f64::from(threshold), &limit])
            .await?;

        rows.iter()
            .map(|row| {
                let similarity: f64 = row.try_get("similarity")?;
                Ok(ScoredRecord {
                    record: row_to_record(row)?,
                    similarity: similarity as f32,
                })
            })
            .collect()
    }

    async fn find_file(&self, project_id: Uuid, name: &str) -> Result<Option<FileEmbeddingRecord>> {
        let exact = format!(
            "SELECT {COLUMNS} FROM file_embeddings WHERE project_id = $1 AND file_name = $2 LIMIT 1"
        );
        if let Some(row) = self.client.query_opt(&exact, &[&project_id, &name]).await? {
            return row_to_record(&row).map(Some);
        }

        let fuzzy = format!(
            "SELECT {COLUMNS} FROM file_embeddings \
             WHERE project_id = $1 AND strpos(lower(file_name), lower($2)) > 0 \
             ORDER BY length(file_name), seq LIMIT 1"
        );
        match self.client.query_opt(&fuzzy, &[&project_id, &name]).await? {
            Some(row) => row_to_record(&row).map(Some),
            None => Ok(None),
        }
    }

    async fn list_file_names(&self, project_id: Uuid, prefix: Option<&str>) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT file_name FROM file_embeddings \
                 WHERE project_id = $1 \
                   AND ($2::text IS NULL OR starts_with(lower(file_name), lower($2))) \
                 ORDER BY file_name COLLATE \"C\"",
                &[&project_id, &prefix],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get("file_name").map_err(Error::from))
            .collect()
    }

    async fn stats(&self, project_id: Uuid) -> Result<ProjectStats> {
        let row = self
            .client
            .query_one(
                "SELECT count(*) AS records, count(embedding) AS embedded \
                 FROM file_embeddings WHERE project_id = $1",
                &[&project_id],
            )
            .await?;
        let records: i64 = row.try_get("records")?;
        let embedded: i64 = row.try_get("embedded")?;
        Ok(ProjectStats {
            records: records as usize,
            embedded: embedded as usize,
        })
    }

    async fn delete_project(&self, project_id: Uuid) -> Result<usize> {
        let removed = self
            .client
            .execute(
                "DELETE FROM file_embeddings WHERE project_id = $1",
                &[&project_id],
            )
            .await?;
        Ok(removed as usize)
    }
}
