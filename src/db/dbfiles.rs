use async_trait::async_trait;
use sea_query::{ColumnDef, Expr, Iden, Index, PostgresQueryBuilder, Query, Table};
use sea_query_binder::SqlxBinder;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Error as SqlxError;
use std::time::Duration;
use tracing::{error, info};

use crate::persistence::{FileRecord, FileStore, StorageError};

#[derive(Iden)]
enum RoomFiles {
    Table,
    RoomId,
    Name,
    Language,
    Content,
    UpdatedAt,
}

/// File row from the database
#[derive(Debug, Clone, sqlx::FromRow)]
struct FileRow {
    name: String,
    language: String,
    content: String,
}

/// Postgres-backed file store
pub struct PgFileStore {
    pool: PgPool,
}

impl PgFileStore {
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn new(database_url: &str) -> Result<Self, SqlxError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    /// Create the `room_files` table when it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), SqlxError> {
        let sql = Table::create()
            .table(RoomFiles::Table)
            .if_not_exists()
            .col(ColumnDef::new(RoomFiles::RoomId).text().not_null())
            .col(ColumnDef::new(RoomFiles::Name).text().not_null())
            .col(ColumnDef::new(RoomFiles::Language).text().not_null())
            .col(ColumnDef::new(RoomFiles::Content).text().not_null().default(""))
            .col(
                ColumnDef::new(RoomFiles::UpdatedAt)
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::cust("NOW()")),
            )
            .primary_key(Index::create().col(RoomFiles::RoomId).col(RoomFiles::Name))
            .to_string(PostgresQueryBuilder);

        sqlx::query(&sql).execute(&self.pool).await?;
        info!("room_files schema ready");
        Ok(())
    }

    fn log_pool(&self, action: &str, room_id: &str, file_name: &str) {
        let pool_idle = self.pool.num_idle() as u32;
        let pool_size = self.pool.size();
        info!(
            "{} {}:{}. Pool connections: {} idle, {} in use",
            action,
            room_id,
            file_name,
            pool_idle,
            pool_size.saturating_sub(pool_idle)
        );
    }
}

#[async_trait]
impl FileStore for PgFileStore {
    async fn get_file(&self, room_id: &str, file_name: &str) -> Result<Option<FileRecord>, StorageError> {
        self.log_pool("Loading", room_id, file_name);

        let (sql, values) = Query::select()
            .columns([RoomFiles::Name, RoomFiles::Language, RoomFiles::Content])
            .from(RoomFiles::Table)
            .and_where(Expr::col(RoomFiles::RoomId).eq(room_id))
            .and_where(Expr::col(RoomFiles::Name).eq(file_name))
            .build_sqlx(PostgresQueryBuilder);

        let row = sqlx::query_as_with::<_, FileRow, _>(&sql, values)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to load {}:{}: {}", room_id, file_name, e);
                e
            })?;

        Ok(row.map(|row| FileRecord {
            name: row.name,
            language: row.language,
            content: row.content,
        }))
    }

    async fn put_file(&self, room_id: &str, file_name: &str, content: &str) -> Result<(), StorageError> {
        self.log_pool("Saving", room_id, file_name);

        let (sql, values) = Query::update()
            .table(RoomFiles::Table)
            .values([
                (RoomFiles::Content, content.into()),
                (RoomFiles::UpdatedAt, Expr::cust("NOW()")),
            ])
            .and_where(Expr::col(RoomFiles::RoomId).eq(room_id))
            .and_where(Expr::col(RoomFiles::Name).eq(file_name))
            .build_sqlx(PostgresQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&self.pool).await.map_err(|e| {
            error!("Failed to save {}:{}: {}", room_id, file_name, e);
            e
        })?;

        if result.rows_affected() == 0 {
            error!("File not found for update: room={}, file={}", room_id, file_name);
            return Err(StorageError::NotFound {
                room_id: room_id.to_string(),
                file_name: file_name.to_string(),
            });
        }
        Ok(())
    }
}
