// src/utils/db_connect.rs
//
// One pool serves the whole `reconcile` process: the mapping store, the
// mirrored-record providers, the audit log and the run tracker all borrow from
// it. A bulk run works through records one at a time, so the pool stays small.
use anyhow::{Context, Result};
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use log::info;
use std::time::Duration;
use tokio_postgres::{Config, NoTls};

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

const DEFAULT_POOL_SIZE: u32 = 4;

/// Where the reconciliation schema lives and how many connections to hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbSettings {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub pool_size: u32,
}

impl DbSettings {
    /// `POSTGRES_*` for the server, `RECON_DB_POOL_SIZE` for the pool.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        Self {
            host: or("POSTGRES_HOST", "127.0.0.1"),
            port: lookup("POSTGRES_PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(5432),
            dbname: or("POSTGRES_DB", "postgres"),
            user: or("POSTGRES_USER", "postgres"),
            password: lookup("POSTGRES_PASSWORD").unwrap_or_default(),
            pool_size: lookup("RECON_DB_POOL_SIZE")
                .and_then(|s| s.trim().parse().ok())
                .filter(|size| *size > 0)
                .unwrap_or(DEFAULT_POOL_SIZE),
        }
    }

    fn pg_config(&self) -> Config {
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.dbname)
            .user(&self.user)
            .password(&self.password)
            .application_name("project_reconciliation")
            .connect_timeout(Duration::from_secs(10));
        config
    }
}

/// Opens the pool and makes sure the server answers before any run starts.
pub async fn connect() -> Result<PgPool> {
    connect_with(&DbSettings::from_env()).await
}

pub async fn connect_with(settings: &DbSettings) -> Result<PgPool> {
    info!(
        "🗄️  Connecting to {}@{}:{}/{} (pool of {})",
        settings.user, settings.host, settings.port, settings.dbname, settings.pool_size
    );
    let manager = PostgresConnectionManager::new(settings.pg_config(), NoTls);
    let pool = Pool::builder()
        .max_size(settings.pool_size)
        .min_idle(Some(1))
        .connection_timeout(Duration::from_secs(15))
        .build(manager)
        .await
        .context("Failed to build reconciliation connection pool")?;

    let conn = pool
        .get()
        .await
        .context("Failed to check out a connection for the startup check")?;
    conn.query_one("SELECT 1", &[])
        .await
        .context("Startup query against the reconciliation database failed")?;
    drop(conn);

    info!("Reconciliation database pool ready");
    Ok(pool)
}

/// (total connections, idle connections, in use)
pub fn get_pool_status(pool: &PgPool) -> (u32, u32, u32) {
    let state = pool.state();
    (
        state.connections,
        state.idle_connections,
        state.connections - state.idle_connections,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_settings_defaults_and_overrides() {
        let defaults = DbSettings::from_lookup(|_| None);
        assert_eq!(defaults.host, "127.0.0.1");
        assert_eq!(defaults.port, 5432);
        assert_eq!(defaults.pool_size, DEFAULT_POOL_SIZE);

        let vars: HashMap<&str, &str> = [
            ("POSTGRES_HOST", "db.internal"),
            ("POSTGRES_PORT", "not-a-port"),
            ("POSTGRES_DB", "recon"),
            ("RECON_DB_POOL_SIZE", "0"),
        ]
        .into_iter()
        .collect();
        let settings = DbSettings::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(settings.host, "db.internal");
        assert_eq!(settings.port, 5432);
        assert_eq!(settings.dbname, "recon");
        assert_eq!(settings.pool_size, DEFAULT_POOL_SIZE);
    }
}
