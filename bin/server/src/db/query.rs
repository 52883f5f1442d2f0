//! The Postgres driver behind `database` nodes.
//!
//! Row-returning statements are wrapped in a CTE and come back as a JSON
//! array of row objects, built by Postgres itself with `json_agg`. Anything
//! else returns `{"rowsAffected": n}`.

use async_trait::async_trait;
use flowforge_engine::DatabaseClient;
use flowforge_integration::ConnectorError;
use serde_json::{Value as JsonValue, json};
use sqlx::PgPool;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

const POOL_SIZE: u32 = 4;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs user queries against external Postgres databases.
///
/// One small pool is kept per connection URL.
#[derive(Default)]
pub struct PgDatabaseClient {
    pools: Mutex<HashMap<String, PgPool>>,
}

impl PgDatabaseClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn pool(&self, url: &str) -> flowforge_core::Result<PgPool, ConnectorError> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(url) {
            return Ok(pool.clone());
        }
        let pool = PgPoolOptions::new()
            .max_connections(POOL_SIZE)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy(url)
            .map_err(|e| ConnectorError::InvalidParameters {
                operation: "database".to_string(),
                reason: format!("invalid connection string: {e}"),
            })?;
        pools.insert(url.to_string(), pool.clone());
        Ok(pool)
    }
}

/// Whether `query` produces rows.
fn returns_rows(query: &str) -> bool {
    let keyword: String = query
        .trim_start()
        .chars()
        .take_while(char::is_ascii_alphabetic)
        .collect();
    matches!(
        keyword.to_ascii_uppercase().as_str(),
        "SELECT" | "WITH" | "VALUES" | "TABLE"
    ) || query
        .split_whitespace()
        .any(|word| word.eq_ignore_ascii_case("RETURNING"))
}

fn bind_all<'q>(
    mut query: Query<'q, sqlx::Postgres, PgArguments>,
    params: &[JsonValue],
) -> Query<'q, sqlx::Postgres, PgArguments> {
    for param in params {
        query = match param {
            JsonValue::Null => query.bind(None::<String>),
            JsonValue::Bool(b) => query.bind(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64()),
            },
            JsonValue::String(s) => query.bind(s.clone()),
            JsonValue::Array(_) | JsonValue::Object(_) => query.bind(param.clone()),
        };
    }
    query
}

fn classify(e: sqlx::Error) -> ConnectorError {
    match e {
        sqlx::Error::PoolTimedOut => ConnectorError::Timeout,
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::Tls(_) => {
            ConnectorError::ConnectionFailed {
                reason: e.to_string(),
            }
        }
        sqlx::Error::Database(db) => ConnectorError::InvalidParameters {
            operation: "database".to_string(),
            reason: db.message().to_string(),
        },
        other => ConnectorError::ProtocolError {
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl DatabaseClient for PgDatabaseClient {
    #[instrument(skip_all, fields(params = params.len()))]
    async fn query(
        &self,
        url: &str,
        query: &str,
        params: &[JsonValue],
    ) -> flowforge_core::Result<JsonValue, ConnectorError> {
        let pool = self.pool(url).await?;
        let statement = query.trim().trim_end_matches(';');

        if returns_rows(statement) {
            let wrapped = format!(
                "WITH q AS ({statement}) SELECT COALESCE(json_agg(row_to_json(q)), '[]'::json) FROM q"
            );
            let rows: JsonValue = bind_all(sqlx::query(&wrapped), params)
                .fetch_one(&pool)
                .await
                .and_then(|row| sqlx::Row::try_get(&row, 0))
                .map_err(classify)?;
            debug!(rows = rows.as_array().map_or(0, Vec::len), "query returned rows");
            return Ok(rows);
        }

        let result = bind_all(sqlx::query(statement), params)
            .execute(&pool)
            .await
            .map_err(classify)?;
        debug!(rows_affected = result.rows_affected(), "statement executed");
        Ok(json!({ "rowsAffected": result.rows_affected() }))
    }
}
