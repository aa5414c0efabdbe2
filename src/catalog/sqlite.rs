use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};

use crate::common::types::{MediaId, PartId};

use super::{CatalogError, CatalogStore, Media, Part};

#[derive(FromRow)]
struct MediaRow {
    id: i64,
    total_size: i64,
    duration_secs: Option<i64>,
}

#[derive(FromRow)]
struct PartRow {
    id: i64,
    media_id: i64,
    idx: i64,
    size: i64,
    start_byte: i64,
    end_byte: i64,
    channel: i64,
    message: i64,
    handle: String,
}

/// `CatalogStore` backed by a sqlite database via `sqlx`. The schema mirrors
/// spec §6.1's `Media`/`Part` shape; ordering of parts is enforced by the
/// `ORDER BY idx` clause rather than relying on insertion order.
pub struct SqlxCatalogStore {
    pool: SqlitePool,
}

impl SqlxCatalogStore {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogStore for SqlxCatalogStore {
    async fn get_media(&self, media_id: MediaId) -> Result<Option<Media>, CatalogError> {
        let media_row: Option<MediaRow> = sqlx::query_as(
            "SELECT id, total_size, duration_secs FROM media WHERE id = ?",
        )
        .bind(media_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CatalogError::Store(e.to_string()))?;

        let Some(media_row) = media_row else {
            return Ok(None);
        };

        let part_rows: Vec<PartRow> = sqlx::query_as(
            "SELECT id, media_id, idx, size, start_byte, end_byte, channel, message, handle \
             FROM part WHERE media_id = ? ORDER BY idx ASC",
        )
        .bind(media_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CatalogError::Store(e.to_string()))?;

        let parts = part_rows
            .into_iter()
            .map(|r| Part {
                id: PartId(r.id),
                media_id: MediaId(r.media_id),
                index: r.idx as u32,
                size: r.size as u64,
                start_byte: r.start_byte as u64,
                end_byte: r.end_byte as u64,
                channel: r.channel,
                message: r.message,
                handle: r.handle,
            })
            .collect();

        Ok(Some(Media {
            id: MediaId(media_row.id),
            total_size: media_row.total_size as u64,
            parts,
            duration_secs: media_row.duration_secs.map(|d| d as u64),
        }))
    }
}

/// Runs idempotent `CREATE TABLE IF NOT EXISTS` statements for the media and
/// part tables. Intended for local/dev bootstrap; production deployments are
/// expected to manage the schema externally.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS media (
            id INTEGER PRIMARY KEY,
            total_size INTEGER NOT NULL,
            duration_secs INTEGER
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS part (
            id INTEGER PRIMARY KEY,
            media_id INTEGER NOT NULL REFERENCES media(id),
            idx INTEGER NOT NULL,
            size INTEGER NOT NULL,
            start_byte INTEGER NOT NULL,
            end_byte INTEGER NOT NULL,
            channel INTEGER NOT NULL,
            message INTEGER NOT NULL,
            handle TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}
