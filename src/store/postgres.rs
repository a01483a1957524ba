//! PostgreSQL layout store for production use.
//!
//! ## Configuration
//!
//! All settings can be configured via environment variables:
//! - `DATABASE_URL`: PostgreSQL connection string (required)
//! - `DB_MAX_CONNECTIONS`: Maximum pool size (default: 10)
//! - `DB_MIN_CONNECTIONS`: Minimum idle connections (default: 2)
//! - `DB_CONNECT_TIMEOUT_SECS`: Connection timeout (default: 10)
//! - `DB_IDLE_TIMEOUT_SECS`: Idle connection timeout (default: 300)
//! - `DB_MAX_LIFETIME_SECS`: Max connection lifetime (default: 1800)
//!
//! ## Tables
//!
//! - `km_nodes`, `km_edges`: the knowledge map. Layout runs only write the
//!   derived placement columns.
//! - `km_layout_scratch`: per-run `in_degree`, wave claim, provisional order
//!   and layer, keyed by `(run_id, node_id)`.
//!
//! Id ordering uses `COLLATE "C"` so it matches `NodeId`'s byte-wise `Ord`.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;

use crate::error::Retryable;
use crate::types::{
    BlockPlacement, Edge, LayeredNode, NodeFilter, NodeId, OrderedNode, Pin, RunId,
};
use super::{LayoutStore, RunCounts};

/// Configuration for PostgreSQL connection pool.
///
/// Defaults favor failing fast: short acquire timeout, idle connections
/// released after five minutes, connections recycled every half hour.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum connections in pool (default: 10).
    pub max_connections: u32,
    /// Minimum idle connections to keep warm (default: 2).
    pub min_connections: u32,
    /// Connection acquire timeout in seconds (default: 10).
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds (default: 300 = 5 min).
    pub idle_timeout_secs: u64,
    /// Maximum connection lifetime in seconds (default: 1800 = 30 min).
    pub max_lifetime_secs: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl PostgresConfig {
    /// Load configuration from environment variables with production defaults.
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/knowledge_map".to_string()),
            max_connections: env_or("DB_MAX_CONNECTIONS", 10),
            min_connections: env_or("DB_MIN_CONNECTIONS", 2),
            connect_timeout_secs: env_or("DB_CONNECT_TIMEOUT_SECS", 10),
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", 300),
            max_lifetime_secs: env_or("DB_MAX_LIFETIME_SECS", 1800),
        }
    }

    /// Override the connection URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    /// Current pool size.
    pub size: u32,
    /// Number of idle connections.
    pub idle: usize,
    /// Maximum pool size.
    pub max: u32,
}

/// Error type for PostgreSQL store.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Retryable for PostgresError {
    fn is_transient(&self) -> bool {
        let Self::Database(e) = self;
        match e {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
            sqlx::Error::Database(db) => db.code().is_some_and(|code| {
                // connection exceptions, serialization failure, deadlock,
                // too many connections, admin shutdown
                code.starts_with("08")
                    || matches!(code.as_ref(), "40001" | "40P01" | "53300" | "57P01")
            }),
            _ => false,
        }
    }
}

/// PostgreSQL layout store.
pub struct PostgresLayoutStore {
    pool: PgPool,
}

impl PostgresLayoutStore {
    /// Create a new store with the given configuration.
    pub async fn new(config: PostgresConfig) -> Result<Self, sqlx::Error> {
        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            connect_timeout_secs = config.connect_timeout_secs,
            idle_timeout_secs = config.idle_timeout_secs,
            max_lifetime_secs = config.max_lifetime_secs,
            "Initializing PostgreSQL connection pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Create a store from environment variables.
    pub async fn from_env() -> Result<Self, sqlx::Error> {
        Self::new(PostgresConfig::from_env()).await
    }

    /// Get the connection pool, e.g. to share it with the task broker.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    /// Get pool statistics for monitoring.
    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max: self.pool.options().get_max_connections(),
        }
    }

    /// Create the graph and scratch tables if missing.
    pub async fn migrate(&self) -> Result<(), PostgresError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS km_nodes (
                id TEXT PRIMARY KEY,
                labels TEXT[] NOT NULL DEFAULT '{}',
                properties JSONB NOT NULL DEFAULT '{}'::jsonb,
                is_pinned BOOLEAN NOT NULL DEFAULT FALSE,
                level_id INTEGER,
                sublevel_id INTEGER,
                physical_scale INTEGER,
                layer INTEGER,
                topo_order BIGINT,
                x DOUBLE PRECISION,
                y DOUBLE PRECISION
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS km_edges (
                source_id TEXT NOT NULL REFERENCES km_nodes (id) ON DELETE CASCADE,
                target_id TEXT NOT NULL REFERENCES km_nodes (id) ON DELETE CASCADE,
                PRIMARY KEY (source_id, target_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS km_edges_target ON km_edges (target_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS km_layout_scratch (
                run_id UUID NOT NULL,
                node_id TEXT NOT NULL,
                in_degree INTEGER NOT NULL DEFAULT 0,
                claimed BOOLEAN NOT NULL DEFAULT FALSE,
                released BOOLEAN NOT NULL DEFAULT FALSE,
                topo_order BIGINT,
                layer INTEGER,
                PRIMARY KEY (run_id, node_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "ALTER TABLE km_layout_scratch \
             ADD COLUMN IF NOT EXISTS released BOOLEAN NOT NULL DEFAULT FALSE",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS km_layout_scratch_order \
             ON km_layout_scratch (run_id, topo_order)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn parse_pin(row: &PgRow) -> Result<Option<Pin>, sqlx::Error> {
        let pinned: bool = row.try_get("is_pinned")?;
        if !pinned {
            return Ok(None);
        }
        let level: Option<i32> = row.try_get("level_id")?;
        let sublevel: Option<i32> = row.try_get("sublevel_id")?;
        let scale: Option<i32> = row.try_get("physical_scale")?;
        // A NULL sublevel pins the level only
        let mut pin = Pin::at_level(level.unwrap_or(0) as u32, scale.unwrap_or(0));
        pin.sublevel_id = sublevel.map(|s| s as u32);
        Ok(Some(pin))
    }

    fn ids(ids: &[NodeId]) -> Vec<String> {
        ids.iter().map(|id| id.as_str().to_string()).collect()
    }
}

#[async_trait]
impl LayoutStore for PostgresLayoutStore {
    type Error = PostgresError;

    async fn begin_run(&self, run: &RunId, filter: &NodeFilter) -> Result<RunCounts, Self::Error> {
        let properties = serde_json::Value::Object(
            filter
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM km_layout_scratch WHERE run_id = $1")
            .bind(run.as_uuid())
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO km_layout_scratch (run_id, node_id)
            SELECT $1, n.id FROM km_nodes n
            WHERE (cardinality($2::text[]) = 0 OR n.labels && $2::text[])
              AND n.properties @> $3::jsonb
            "#,
        )
        .bind(run.as_uuid())
        .bind(&filter.labels)
        .bind(properties)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE km_layout_scratch s SET in_degree = d.cnt
            FROM (
                SELECT e.target_id, count(*)::int AS cnt
                FROM km_edges e
                JOIN km_layout_scratch a ON a.run_id = $1 AND a.node_id = e.source_id
                JOIN km_layout_scratch b ON b.run_id = $1 AND b.node_id = e.target_id
                GROUP BY e.target_id
            ) d
            WHERE s.run_id = $1 AND s.node_id = d.target_id
            "#,
        )
        .bind(run.as_uuid())
        .execute(&mut *tx)
        .await?;

        let links: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(in_degree), 0)::bigint FROM km_layout_scratch WHERE run_id = $1",
        )
        .bind(run.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RunCounts {
            nodes: inserted.rows_affected() as usize,
            links: links as usize,
        })
    }

    async fn claim_frontier(&self, run: &RunId) -> Result<usize, Self::Error> {
        let result = sqlx::query(
            r#"
            UPDATE km_layout_scratch SET claimed = TRUE
            WHERE run_id = $1 AND topo_order IS NULL AND NOT claimed AND in_degree = 0
            "#,
        )
        .bind(run.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn frontier_batch(&self, run: &RunId, limit: usize) -> Result<Vec<NodeId>, Self::Error> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT node_id FROM km_layout_scratch
            WHERE run_id = $1 AND claimed AND topo_order IS NULL
            ORDER BY node_id COLLATE "C"
            LIMIT $2
            "#,
        )
        .bind(run.as_uuid())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(NodeId::from).collect())
    }

    async fn assign_orders(&self, run: &RunId, orders: &[(NodeId, u64)]) -> Result<(), Self::Error> {
        let ids: Vec<String> = orders.iter().map(|(id, _)| id.as_str().to_string()).collect();
        let values: Vec<i64> = orders.iter().map(|(_, o)| *o as i64).collect();
        sqlx::query(
            r#"
            UPDATE km_layout_scratch s SET topo_order = v.ord
            FROM UNNEST($2::text[], $3::bigint[]) AS v(id, ord)
            WHERE s.run_id = $1 AND s.node_id = v.id
            "#,
        )
        .bind(run.as_uuid())
        .bind(ids)
        .bind(values)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_successors(&self, run: &RunId, ids: &[NodeId]) -> Result<(), Self::Error> {
        // Sources are flagged in the same statement, so a retry after a lost
        // acknowledgement decrements nothing twice
        sqlx::query(
            r#"
            WITH fresh AS (
                UPDATE km_layout_scratch SET released = TRUE
                WHERE run_id = $1 AND node_id = ANY($2) AND NOT released
                RETURNING node_id
            )
            UPDATE km_layout_scratch s SET in_degree = GREATEST(s.in_degree - d.cnt, 0)
            FROM (
                SELECT e.target_id, count(*)::int AS cnt
                FROM km_edges e
                JOIN fresh f ON f.node_id = e.source_id
                GROUP BY e.target_id
            ) d
            WHERE s.run_id = $1 AND s.node_id = d.target_id AND s.topo_order IS NULL
            "#,
        )
        .bind(run.as_uuid())
        .bind(Self::ids(ids))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unordered_batch(&self, run: &RunId, limit: usize) -> Result<Vec<NodeId>, Self::Error> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT node_id FROM km_layout_scratch
            WHERE run_id = $1 AND topo_order IS NULL
            ORDER BY node_id COLLATE "C"
            LIMIT $2
            "#,
        )
        .bind(run.as_uuid())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(NodeId::from).collect())
    }

    async fn ordered_page(
        &self,
        run: &RunId,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<OrderedNode>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT s.node_id, s.topo_order, n.is_pinned, n.level_id, n.sublevel_id,
                   n.physical_scale, n.layer
            FROM km_layout_scratch s
            JOIN km_nodes n ON n.id = s.node_id
            WHERE s.run_id = $1 AND s.topo_order > $2
            ORDER BY s.topo_order
            LIMIT $3
            "#,
        )
        .bind(run.as_uuid())
        .bind(after.map_or(-1, |a| a as i64))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("node_id")?;
                let order: i64 = row.try_get("topo_order")?;
                let layer: Option<i32> = row.try_get("layer")?;
                Ok(OrderedNode {
                    id: NodeId::from(id),
                    topo_order: order as u64,
                    pin: Self::parse_pin(row)?,
                    stored_layer: layer.map(|l| l as u32),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(PostgresError::from)
    }

    async fn incoming_edges(&self, run: &RunId, ids: &[NodeId]) -> Result<Vec<Edge>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT e.source_id, e.target_id
            FROM km_edges e
            JOIN km_layout_scratch s ON s.run_id = $1 AND s.node_id = e.source_id
            WHERE e.target_id = ANY($2)
            "#,
        )
        .bind(run.as_uuid())
        .bind(Self::ids(ids))
        .fetch_all(&self.pool)
        .await?;

        let mut edges: Vec<Edge> = rows
            .iter()
            .map(|row| {
                let source: String = row.get("source_id");
                let target: String = row.get("target_id");
                Edge::new(source, target)
            })
            .collect();
        edges.sort();
        Ok(edges)
    }

    async fn layers_of(&self, run: &RunId, ids: &[NodeId]) -> Result<Vec<(NodeId, u32)>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT node_id, layer FROM km_layout_scratch
            WHERE run_id = $1 AND node_id = ANY($2) AND layer IS NOT NULL
            "#,
        )
        .bind(run.as_uuid())
        .bind(Self::ids(ids))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let id: String = row.get("node_id");
                let layer: i32 = row.get("layer");
                (NodeId::from(id), layer as u32)
            })
            .collect())
    }

    async fn reset_layers(&self, run: &RunId) -> Result<(), Self::Error> {
        sqlx::query("UPDATE km_layout_scratch SET layer = NULL WHERE run_id = $1")
            .bind(run.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn assign_layers(&self, run: &RunId, layers: &[(NodeId, u32)]) -> Result<(), Self::Error> {
        let ids: Vec<String> = layers.iter().map(|(id, _)| id.as_str().to_string()).collect();
        let values: Vec<i32> = layers.iter().map(|(_, l)| *l as i32).collect();
        sqlx::query(
            r#"
            UPDATE km_layout_scratch s SET layer = v.layer
            FROM UNNEST($2::text[], $3::int[]) AS v(id, layer)
            WHERE s.run_id = $1 AND s.node_id = v.id
            "#,
        )
        .bind(run.as_uuid())
        .bind(ids)
        .bind(values)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn layered_page(
        &self,
        run: &RunId,
        after: Option<&NodeId>,
        limit: usize,
    ) -> Result<Vec<LayeredNode>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT s.node_id, s.topo_order, s.layer, n.is_pinned, n.level_id, n.sublevel_id,
                   n.physical_scale,
                   NOT EXISTS (
                       SELECT 1 FROM km_edges e
                       JOIN km_layout_scratch o ON o.run_id = $1 AND o.node_id = e.target_id
                       WHERE e.source_id = s.node_id
                   ) AND NOT EXISTS (
                       SELECT 1 FROM km_edges e
                       JOIN km_layout_scratch o ON o.run_id = $1 AND o.node_id = e.source_id
                       WHERE e.target_id = s.node_id
                   ) AS isolated
            FROM km_layout_scratch s
            JOIN km_nodes n ON n.id = s.node_id
            WHERE s.run_id = $1 AND ($2::text IS NULL OR s.node_id COLLATE "C" > $2::text)
            ORDER BY s.node_id COLLATE "C"
            LIMIT $3
            "#,
        )
        .bind(run.as_uuid())
        .bind(after.map(|a| a.as_str().to_string()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("node_id")?;
                let order: Option<i64> = row.try_get("topo_order")?;
                let layer: Option<i32> = row.try_get("layer")?;
                Ok(LayeredNode {
                    id: NodeId::from(id),
                    topo_order: order.unwrap_or(0) as u64,
                    layer: layer.unwrap_or(0) as u32,
                    pin: Self::parse_pin(row)?,
                    isolated: row.try_get("isolated")?,
                    parents: Vec::new(),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(PostgresError::from)
    }

    async fn end_run(&self, run: &RunId) -> Result<(), Self::Error> {
        sqlx::query("DELETE FROM km_layout_scratch WHERE run_id = $1")
            .bind(run.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn successors(&self, id: &NodeId) -> Result<Vec<NodeId>, Self::Error> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT target_id FROM km_edges
            WHERE source_id = $1
            ORDER BY target_id COLLATE "C"
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(NodeId::from).collect())
    }

    async fn insert_edge(&self, edge: &Edge) -> Result<(), Self::Error> {
        sqlx::query(
            "INSERT INTO km_edges (source_id, target_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(edge.source_id.as_str())
        .bind(edge.target_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_placements(&self, placements: &[BlockPlacement]) -> Result<(), Self::Error> {
        let ids: Vec<String> = placements.iter().map(|p| p.id.as_str().to_string()).collect();
        let orders: Vec<i64> = placements.iter().map(|p| p.topo_order as i64).collect();
        let layers: Vec<i32> = placements.iter().map(|p| p.layer as i32).collect();
        let levels: Vec<i32> = placements.iter().map(|p| p.level as i32).collect();
        let sublevels: Vec<i32> = placements.iter().map(|p| p.sublevel_id as i32).collect();
        let xs: Vec<f64> = placements.iter().map(|p| p.x).collect();
        let ys: Vec<f64> = placements.iter().map(|p| p.y).collect();

        // Pinned level, sublevel and scale are inputs, never outputs
        sqlx::query(
            r#"
            UPDATE km_nodes n SET
                topo_order = v.topo_order,
                layer = v.layer,
                level_id = CASE WHEN n.is_pinned THEN n.level_id ELSE v.level_id END,
                sublevel_id = CASE WHEN n.is_pinned THEN n.sublevel_id ELSE v.sublevel_id END,
                x = v.x,
                y = v.y
            FROM UNNEST($1::text[], $2::bigint[], $3::int[], $4::int[], $5::int[],
                        $6::float8[], $7::float8[])
                 AS v(id, topo_order, layer, level_id, sublevel_id, x, y)
            WHERE n.id = v.id
            "#,
        )
        .bind(ids)
        .bind(orders)
        .bind(layers)
        .bind(levels)
        .bind(sublevels)
        .bind(xs)
        .bind(ys)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), Self::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
