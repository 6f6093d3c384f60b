//! The database facade.
//!
//! A [`Database`] owns the connection pool, the query result cache, the
//! model registry, and the shared record-header cache. It is cheap to clone
//! and safe to share across tasks. The `run`/`one`/`all` conveniences open a
//! single-operation transaction scope, perform the operation, and commit;
//! anything needing a longer scope goes through `get_cursor` or
//! `get_connection`.

use crate::cache::QueryCache;
use crate::config::DatabaseConfig;
use crate::connection::PooledConnection;
use crate::cursor::{CursorConn, CursorOptions, FetchOptions, SimpleCursor};
use crate::db::params::Params;
use crate::db::pool::create_pool;
use crate::error::{Error, Result};
use crate::orm::{ModelClass, ModelRegistry, fetch_composite_meta};
use crate::rows::{BackAs, RecordHeaderCache, Row};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

struct Shared {
    pool: PgPool,
    cache: Arc<QueryCache>,
    registry: Arc<ModelRegistry>,
    headers: Arc<RecordHeaderCache>,
    back_as: BackAs,
    readonly: bool,
}

/// A handle to one Postgres database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Shared>,
}

impl Database {
    /// Connect using a URL. Recognized query parameters configure the
    /// library; see [`DatabaseConfig::parse`].
    pub async fn connect(url: &str) -> Result<Self> {
        Self::with_config(DatabaseConfig::parse(url)?).await
    }

    /// Connect using an explicit configuration.
    pub async fn with_config(config: DatabaseConfig) -> Result<Self> {
        let pool = create_pool(&config).await?;
        info!(back_as = ?config.back_as, readonly = config.readonly, "database ready");
        Ok(Self {
            inner: Arc::new(Shared {
                pool,
                cache: Arc::new(QueryCache::new(config.cache_max_size)),
                registry: Arc::new(ModelRegistry::new()),
                headers: Arc::new(RecordHeaderCache::new()),
                back_as: config.back_as,
                readonly: config.readonly,
            }),
        })
    }

    /// The underlying pool, for direct driver use.
    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    /// The query result cache.
    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.inner.cache
    }

    /// Execute a statement in its own transaction scope.
    pub async fn run(&self, sql: &str, params: &Params) -> Result<()> {
        let mut cursor = self.get_cursor(CursorOptions::default()).await?;
        cursor.run(sql, params).await?;
        cursor.commit().await
    }

    /// Fetch exactly zero or one row in its own transaction scope.
    pub async fn one(&self, sql: &str, params: &Params) -> Result<Option<Row>> {
        self.one_with(sql, params, &FetchOptions::new()).await
    }

    pub async fn one_with(
        &self,
        sql: &str,
        params: &Params,
        opts: &FetchOptions,
    ) -> Result<Option<Row>> {
        let mut cursor = self.get_cursor(CursorOptions::default()).await?;
        let row = cursor.one_with(sql, params, opts).await?;
        cursor.commit().await?;
        Ok(row)
    }

    /// Fetch all rows in their own transaction scope.
    pub async fn all(&self, sql: &str, params: &Params) -> Result<Vec<Row>> {
        self.all_with(sql, params, &FetchOptions::new()).await
    }

    pub async fn all_with(
        &self,
        sql: &str,
        params: &Params,
        opts: &FetchOptions,
    ) -> Result<Vec<Row>> {
        let mut cursor = self.get_cursor(CursorOptions::default()).await?;
        let rows = cursor.all_with(sql, params, opts).await?;
        cursor.commit().await?;
        Ok(rows)
    }

    /// Open a cursor in a fresh transaction scope (or on a bare connection
    /// with `autocommit`). The caller ends the scope with `commit` or
    /// `close`; a dropped cursor rolls back.
    pub async fn get_cursor(&self, opts: CursorOptions) -> Result<SimpleCursor<'static>> {
        let readonly = opts.readonly.unwrap_or(self.inner.readonly);
        let back_as = opts.back_as.unwrap_or(self.inner.back_as);

        let conn = if opts.autocommit {
            let mut conn = self.inner.pool.acquire().await?;
            if readonly {
                // No transaction to flag, so flag the session; the cursor
                // resets or detaches the connection when its scope ends.
                sqlx::query("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY")
                    .execute(&mut *conn)
                    .await?;
            }
            CursorConn::Raw(conn)
        } else {
            let mut tx = self.inner.pool.begin().await?;
            if readonly {
                sqlx::query("SET TRANSACTION READ ONLY")
                    .execute(&mut *tx)
                    .await?;
            }
            CursorConn::Tx(tx)
        };

        Ok(SimpleCursor::new(
            conn,
            back_as,
            readonly,
            self.inner.cache.clone(),
            self.inner.registry.clone(),
            self.inner.headers.clone(),
        ))
    }

    /// Check out a connection scope that the library never commits; see
    /// [`PooledConnection`].
    pub async fn get_connection(&self) -> Result<PooledConnection> {
        let tx = self.inner.pool.begin().await?;
        Ok(PooledConnection::new(
            tx,
            self.inner.back_as,
            self.inner.cache.clone(),
            self.inner.registry.clone(),
            self.inner.headers.clone(),
        ))
    }

    /// Register a model class for a composite type. The type must exist in
    /// the catalog and not be claimed by another model. With no explicit
    /// `type_name`, the class's own declaration is used.
    pub async fn register_model(
        &self,
        model: Arc<dyn ModelClass>,
        type_name: Option<&str>,
    ) -> Result<()> {
        let class_name = model.class_name();
        if class_name.trim().is_empty() {
            return Err(Error::NotAModel {
                class_name: class_name.to_string(),
            });
        }
        let type_name = match type_name.or(model.type_name()) {
            Some(name) => name.to_string(),
            None => {
                return Err(Error::NoTypeSpecified {
                    class_name: class_name.to_string(),
                });
            }
        };

        let mut conn = self.inner.pool.acquire().await?;
        let meta = fetch_composite_meta(&mut conn, &type_name)
            .await?
            .ok_or_else(|| Error::NoSuchType {
                type_name: type_name.clone(),
            })?;
        self.inner.registry.register(model, &type_name, meta)
    }

    /// Drop every registration held by a model class.
    pub fn unregister_model(&self, model: &dyn ModelClass) -> Result<()> {
        self.inner.registry.unregister(model)
    }

    /// The composite type names a model class is registered for, sorted.
    pub fn check_registration(
        &self,
        model: &dyn ModelClass,
        include_subclasses: bool,
    ) -> Result<Vec<String>> {
        self.inner.registry.check_registration(model, include_subclasses)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("back_as", &self.inner.back_as)
            .field("readonly", &self.inner.readonly)
            .field("cached_queries", &self.inner.cache.len())
            .finish_non_exhaustive()
    }
}
