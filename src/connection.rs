//! Checked-out connection scopes.
//!
//! A [`PooledConnection`] wraps one transaction on one pool connection. The
//! library never commits it: the scope rolls back when the value drops, and
//! callers that want durability issue `COMMIT` themselves (typically to
//! start a fresh transaction and keep working on the same connection).
//! Cursors opened on the scope borrow its transaction and leave transaction
//! control with the scope.

use crate::cache::QueryCache;
use crate::cursor::{CursorConn, CursorOptions, SimpleCursor};
use crate::orm::ModelRegistry;
use crate::rows::{BackAs, RecordHeaderCache};
use sqlx::{PgConnection, Postgres, Transaction};
use std::sync::Arc;
use tracing::debug;

pub struct PooledConnection {
    tx: Transaction<'static, Postgres>,
    back_as: BackAs,
    cache: Arc<QueryCache>,
    registry: Arc<ModelRegistry>,
    headers: Arc<RecordHeaderCache>,
}

impl PooledConnection {
    pub(crate) fn new(
        tx: Transaction<'static, Postgres>,
        back_as: BackAs,
        cache: Arc<QueryCache>,
        registry: Arc<ModelRegistry>,
        headers: Arc<RecordHeaderCache>,
    ) -> Self {
        Self {
            tx,
            back_as,
            cache,
            registry,
            headers,
        }
    }

    /// The raw connection, for direct driver use.
    pub fn executor(&mut self) -> &mut PgConnection {
        &mut *self.tx
    }

    /// Open a cursor on this scope. The cursor shares the scope's
    /// transaction; its `commit` and `close` end only the cursor, never the
    /// transaction.
    pub fn cursor(&mut self, opts: CursorOptions) -> SimpleCursor<'_> {
        let back_as = opts.back_as.unwrap_or(self.back_as);
        SimpleCursor::new(
            CursorConn::Borrowed(&mut *self.tx),
            back_as,
            false,
            self.cache.clone(),
            self.registry.clone(),
            self.headers.clone(),
        )
    }

    /// End the scope now, rolling back anything uncommitted. Dropping the
    /// value does the same through the driver; this form surfaces errors.
    pub async fn rollback(self) -> crate::error::Result<()> {
        debug!("rolling back connection scope");
        self.tx.rollback().await?;
        Ok(())
    }
}
