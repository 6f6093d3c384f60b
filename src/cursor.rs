//! Transaction-scoped cursors.
//!
//! A [`SimpleCursor`] owns one transaction scope (or, in autocommit mode, one
//! pooled connection) and exposes the query API: `run` for statements,
//! `one` and `all` for fetches. The scope ends explicitly with `commit` or
//! `close`; a cursor dropped without either rolls back through the driver.
//! Every operation after the scope ends fails with `ClosedCursor`.

use crate::cache::{CachedResult, QueryCache};
use crate::db::decode::{columns_of, decode_rows};
use crate::db::params::{Params, QueryParam, bind_param, render_query};
use crate::error::{Error, Result};
use crate::orm::ModelRegistry;
use crate::rows::{BackAs, Cell, Column, RecordHeaderCache, Row, shape_row};
use sqlx::pool::PoolConnection;
use sqlx::{Executor as _, PgConnection, Postgres, Statement as _, Transaction};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Options for opening a cursor.
#[derive(Debug, Clone, Default)]
pub struct CursorOptions {
    /// Run without a transaction, on a bare pooled connection. Statements
    /// take effect immediately and `commit`/`close` only end the scope.
    pub autocommit: bool,
    /// Open the transaction read-only. Defaults to the database-wide setting.
    /// A read-only cursor's `commit` rolls back instead.
    pub readonly: Option<bool>,
    /// Row shape for this cursor's fetches. Defaults to the database-wide
    /// setting.
    pub back_as: Option<BackAs>,
}

impl CursorOptions {
    pub fn autocommit() -> Self {
        Self {
            autocommit: true,
            ..Self::default()
        }
    }

    pub fn readonly(readonly: bool) -> Self {
        Self {
            readonly: Some(readonly),
            ..Self::default()
        }
    }

    pub fn back_as(back_as: BackAs) -> Self {
        Self {
            back_as: Some(back_as),
            ..Self::default()
        }
    }
}

/// What `one` yields when the query produces zero rows, or a NULL scalar
/// after dereferencing.
#[derive(Debug, Clone, Default)]
pub enum Fallback {
    /// Yield `Ok(None)`.
    #[default]
    None,
    /// Yield this row instead.
    Value(Row),
    /// Fail with a row-count error.
    Raise,
}

/// Per-fetch options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Row shape for this fetch. When unset, single-column rows dereference
    /// to their bare cell and multi-column rows use the cursor's shape.
    pub back_as: Option<BackAs>,
    /// Serve from the query cache when a result no older than this exists;
    /// fetch and cache otherwise.
    pub max_age: Option<Duration>,
    /// Zero-row behavior for `one`.
    pub default: Fallback,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn back_as(mut self, back_as: BackAs) -> Self {
        self.back_as = Some(back_as);
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn default_row(mut self, row: Row) -> Self {
        self.default = Fallback::Value(row);
        self
    }

    /// Make zero rows an error instead of a default.
    pub fn strict(mut self) -> Self {
        self.default = Fallback::Raise;
        self
    }
}

pub(crate) enum CursorConn<'c> {
    Tx(Transaction<'static, Postgres>),
    Raw(PoolConnection<Postgres>),
    Borrowed(&'c mut PgConnection),
    Closed,
}

/// A cursor bound to one transaction scope.
pub struct SimpleCursor<'c> {
    conn: CursorConn<'c>,
    back_as: BackAs,
    readonly: bool,
    cache: Arc<QueryCache>,
    registry: Arc<ModelRegistry>,
    headers: Arc<RecordHeaderCache>,
}

impl<'c> SimpleCursor<'c> {
    pub(crate) fn new(
        conn: CursorConn<'c>,
        back_as: BackAs,
        readonly: bool,
        cache: Arc<QueryCache>,
        registry: Arc<ModelRegistry>,
        headers: Arc<RecordHeaderCache>,
    ) -> Self {
        Self {
            conn,
            back_as,
            readonly,
            cache,
            registry,
            headers,
        }
    }

    /// The row shape this cursor's fetches default to.
    pub fn back_as(&self) -> BackAs {
        self.back_as
    }

    /// Whether this cursor's transaction is read-only.
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Whether this cursor's scope has ended.
    pub fn is_closed(&self) -> bool {
        matches!(self.conn, CursorConn::Closed)
    }

    fn executor(&mut self) -> Result<&mut PgConnection> {
        match &mut self.conn {
            CursorConn::Tx(tx) => Ok(&mut **tx),
            CursorConn::Raw(conn) => Ok(&mut **conn),
            CursorConn::Borrowed(conn) => Ok(&mut **conn),
            CursorConn::Closed => Err(Error::ClosedCursor),
        }
    }

    /// Execute a statement, discarding any result set.
    pub async fn run(&mut self, sql: &str, params: &Params) -> Result<()> {
        let (sql, values) = params.prepare(sql)?;
        let conn = self.executor()?;
        if values.is_empty() {
            // Simple protocol: multi-statement strings work here.
            conn.execute(sql.as_str()).await?;
        } else {
            let mut query = sqlx::query(&sql);
            for value in &values {
                query = bind_param(query, value);
            }
            query.execute(&mut *conn).await?;
        }
        debug!(sql = %sql, "executed statement");
        Ok(())
    }

    /// Fetch exactly zero or one row.
    ///
    /// Zero rows yield the fetch default; more than one row, or a statement
    /// with no result set at all, is a row-count error. A single-column row
    /// fetched with no explicit `back_as` dereferences to its bare cell, and
    /// a NULL cell re-applies the default.
    pub async fn one(&mut self, sql: &str, params: &Params) -> Result<Option<Row>> {
        self.one_with(sql, params, &FetchOptions::new()).await
    }

    pub async fn one_with(
        &mut self,
        sql: &str,
        params: &Params,
        opts: &FetchOptions,
    ) -> Result<Option<Row>> {
        let (columns, mut rows, rowcount) = self.fetch(sql, params, opts).await?;

        let row = match rows.pop() {
            Some(row) if rows.is_empty() => row,
            Some(_) => return Err(Error::too_many(rowcount, 0, 1)),
            None if rowcount < 0 => return Err(Error::too_few(rowcount, 0, 1)),
            None => return fallback(&opts.default),
        };

        if columns.len() == 1 && opts.back_as.is_none() {
            let Some(cell) = row.into_iter().next() else {
                return fallback(&opts.default);
            };
            if cell.is_null() {
                return fallback(&opts.default);
            }
            return Ok(Some(Row::Cell(cell)));
        }
        let back_as = opts.back_as.unwrap_or(self.back_as);
        Ok(Some(shape_row(back_as, &columns, row, &self.headers)))
    }

    /// Fetch all rows. Single-column results with no explicit `back_as`
    /// dereference to bare cells.
    pub async fn all(&mut self, sql: &str, params: &Params) -> Result<Vec<Row>> {
        self.all_with(sql, params, &FetchOptions::new()).await
    }

    pub async fn all_with(
        &mut self,
        sql: &str,
        params: &Params,
        opts: &FetchOptions,
    ) -> Result<Vec<Row>> {
        let (columns, rows, _) = self.fetch(sql, params, opts).await?;

        if columns.len() == 1 && opts.back_as.is_none() {
            return Ok(rows
                .into_iter()
                .map(|row| Row::Cell(row.into_iter().next().unwrap_or_else(Cell::null)))
                .collect());
        }
        let back_as = opts.back_as.unwrap_or(self.back_as);
        Ok(rows
            .into_iter()
            .map(|row| shape_row(back_as, &columns, row, &self.headers))
            .collect())
    }

    async fn fetch(
        &mut self,
        sql: &str,
        params: &Params,
        opts: &FetchOptions,
    ) -> Result<(Arc<Vec<Column>>, Vec<Vec<Cell>>, i64)> {
        let (sql, values) = params.prepare(sql)?;
        match opts.max_age {
            Some(max_age) => {
                let key = render_query(&sql, &values);
                let result = self.cached_fetch(&key, &sql, &values, max_age).await?;
                let rowcount = result.rows.len() as i64;
                Ok((result.columns.clone(), result.rows.clone(), rowcount))
            }
            None => self.fetch_uncached(&sql, &values).await,
        }
    }

    /// Serve a fetch through the cache: check, lock the entry, re-check,
    /// and populate on a confirmed miss. Concurrent misses for the same
    /// rendered query coalesce into one fetch.
    async fn cached_fetch(
        &mut self,
        key: &str,
        sql: &str,
        values: &[QueryParam],
        max_age: Duration,
    ) -> Result<Arc<CachedResult>> {
        let cache = self.cache.clone();
        if let Some(hit) = cache.lookup(key, max_age) {
            debug!(query = %key, "query cache hit");
            return Ok(hit);
        }
        let entry = cache.get_lock(key);
        let _populating = entry.lock().await;
        if let Some(hit) = cache.lookup(key, max_age) {
            return Ok(hit);
        }
        let (columns, rows, _) = self.fetch_uncached(sql, values).await?;
        let result = Arc::new(CachedResult { columns, rows });
        cache.insert(key, &entry, max_age, result.clone());
        debug!(query = %key, "populated query cache");
        Ok(result)
    }

    /// Prepare, execute, and decode. A statement whose prepared form has no
    /// result columns produced no result set; it is still executed, and the
    /// row count comes back as -1.
    async fn fetch_uncached(
        &mut self,
        sql: &str,
        values: &[QueryParam],
    ) -> Result<(Arc<Vec<Column>>, Vec<Vec<Cell>>, i64)> {
        let registry = self.registry.clone();
        let conn = self.executor()?;

        let stmt = (&mut *conn).prepare(sql).await?;
        let columns = Arc::new(columns_of(stmt.columns()));

        let mut query = stmt.query();
        for value in values {
            query = bind_param(query, value);
        }

        if columns.is_empty() {
            query.execute(&mut *conn).await?;
            return Ok((columns, Vec::new(), -1));
        }

        let pg_rows = query.fetch_all(&mut *conn).await?;
        let rows = decode_rows(conn, &registry, &columns, &pg_rows).await?;
        let rowcount = rows.len() as i64;
        Ok((columns, rows, rowcount))
    }

    /// Open a nested scope on this cursor, optionally overriding its row
    /// shape for the duration. The override is restored when the guard
    /// drops; transaction control stays with this cursor.
    pub fn subtransaction(&mut self, back_as: Option<BackAs>) -> Result<Subtransaction<'_, 'c>> {
        if self.is_closed() {
            return Err(Error::ClosedCursor);
        }
        let saved = back_as.map(|b| std::mem::replace(&mut self.back_as, b));
        Ok(Subtransaction {
            cursor: self,
            saved,
        })
    }

    /// End the scope, committing the transaction. A read-only cursor rolls
    /// back instead; an autocommit cursor just releases its connection.
    pub async fn commit(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.conn, CursorConn::Closed) {
            CursorConn::Tx(tx) => {
                if self.readonly {
                    rollback_quietly(tx).await
                } else {
                    tx.commit().await?;
                    Ok(())
                }
            }
            CursorConn::Raw(conn) => release_raw(conn, self.readonly).await,
            CursorConn::Borrowed(_) => Ok(()),
            CursorConn::Closed => Err(Error::ClosedCursor),
        }
    }

    /// End the scope, rolling the transaction back. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.conn, CursorConn::Closed) {
            CursorConn::Tx(tx) => rollback_quietly(tx).await,
            CursorConn::Raw(conn) => release_raw(conn, self.readonly).await,
            CursorConn::Borrowed(_) | CursorConn::Closed => Ok(()),
        }
    }
}

impl Drop for SimpleCursor<'_> {
    fn drop(&mut self) {
        // A read-only session must not be handed to the next checkout. The
        // async scope enders reset it; here we can only detach, which closes
        // the connection instead of pooling it.
        if self.readonly && matches!(self.conn, CursorConn::Raw(_)) {
            if let CursorConn::Raw(conn) = std::mem::replace(&mut self.conn, CursorConn::Closed) {
                drop(conn.detach());
            }
        }
    }
}

/// Return an autocommit connection to the pool, undoing a read-only session
/// flag first. A connection whose reset fails is detached rather than pooled.
async fn release_raw(mut conn: PoolConnection<Postgres>, readonly: bool) -> Result<()> {
    if !readonly {
        return Ok(());
    }
    let reset = sqlx::query("SET SESSION CHARACTERISTICS AS TRANSACTION READ WRITE")
        .execute(&mut *conn)
        .await;
    if let Err(err) = reset {
        drop(conn.detach());
        if connection_is_gone(&err) {
            warn!(error = %err, "connection lost while resetting session");
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

async fn rollback_quietly(tx: Transaction<'static, Postgres>) -> Result<()> {
    match tx.rollback().await {
        Ok(()) => Ok(()),
        Err(err) if connection_is_gone(&err) => {
            warn!(error = %err, "connection lost during rollback");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn connection_is_gone(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed | sqlx::Error::Io(_)
    )
}

fn fallback(default: &Fallback) -> Result<Option<Row>> {
    match default {
        Fallback::None => Ok(None),
        Fallback::Value(row) => Ok(Some(row.clone())),
        Fallback::Raise => Err(Error::too_few(0, 1, 1)),
    }
}

/// A nested scope borrowing its parent cursor. Dereferences to the cursor;
/// restores any row-shape override on drop.
pub struct Subtransaction<'a, 'c> {
    cursor: &'a mut SimpleCursor<'c>,
    saved: Option<BackAs>,
}

impl<'c> Deref for Subtransaction<'_, 'c> {
    type Target = SimpleCursor<'c>;

    fn deref(&self) -> &Self::Target {
        self.cursor
    }
}

impl DerefMut for Subtransaction<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.cursor
    }
}

impl Drop for Subtransaction<'_, '_> {
    fn drop(&mut self) {
        if let Some(back_as) = self.saved.take() {
            self.cursor.back_as = back_as;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_cursor(back_as: BackAs) -> SimpleCursor<'static> {
        SimpleCursor::new(
            CursorConn::Closed,
            back_as,
            false,
            Arc::new(QueryCache::new(8)),
            Arc::new(ModelRegistry::new()),
            Arc::new(RecordHeaderCache::new()),
        )
    }

    #[tokio::test]
    async fn test_closed_cursor_refuses_operations() {
        let mut cursor = detached_cursor(BackAs::Record);
        let err = cursor.run("SELECT 1", &Params::None).await.unwrap_err();
        assert!(matches!(err, Error::ClosedCursor));
        let err = cursor.one("SELECT 1", &Params::None).await.unwrap_err();
        assert!(matches!(err, Error::ClosedCursor));
        let err = cursor.commit().await.unwrap_err();
        assert!(matches!(err, Error::ClosedCursor));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut cursor = detached_cursor(BackAs::Record);
        cursor.close().await.unwrap();
        cursor.close().await.unwrap();
    }

    #[test]
    fn test_subtransaction_restores_back_as() {
        let mut cursor = detached_cursor(BackAs::Record);
        {
            let sub = cursor.subtransaction(Some(BackAs::Mapping)).unwrap();
            assert_eq!(sub.back_as(), BackAs::Mapping);
        }
        assert_eq!(cursor.back_as(), BackAs::Record);
    }

    #[test]
    fn test_subtransaction_without_override_keeps_back_as() {
        let mut cursor = detached_cursor(BackAs::Tuple);
        {
            let sub = cursor.subtransaction(None).unwrap();
            assert_eq!(sub.back_as(), BackAs::Tuple);
        }
        assert_eq!(cursor.back_as(), BackAs::Tuple);
    }

    #[test]
    fn test_fallback_variants() {
        assert!(matches!(fallback(&Fallback::None), Ok(None)));
        assert!(matches!(
            fallback(&Fallback::Value(Row::Cell(Cell::null()))),
            Ok(Some(_))
        ));
        assert!(matches!(
            fallback(&Fallback::Raise),
            Err(Error::TooFew {
                count: 0,
                lo: 1,
                hi: 1
            })
        ));
    }
}
