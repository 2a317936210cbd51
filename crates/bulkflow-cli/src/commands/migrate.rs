//! `bulkflow migrate` - apply the database schema

use bulkflow_engine::db;

use super::load_config;
use crate::error::Result;

pub async fn run() -> Result<()> {
    let config = load_config()?;
    let pool = db::create_pool(&config.database).await?;
    db::health_check(&pool).await?;
    db::run_migrations(&pool).await?;
    println!("Database schema is up to date");
    Ok(())
}
