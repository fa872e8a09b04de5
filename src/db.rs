use sqlx::{postgres::PgPoolOptions, PgPool};

const SCHEMA: &str = include_str!("../migrations/0001_lead_flows.sql");

pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        // Statements are idempotent (IF NOT EXISTS), safe on every boot
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }
}
