//! Checked-out pool connection

use std::ops::Deref;
use std::sync::Arc;

use super::Pool;
use crate::connection::Connection;

/// A connection borrowed from a [`Pool`]. Dropping the guard returns the
/// connection; [`PooledConnection::invalidate`] closes it instead.
pub struct PooledConnection {
    pool: Arc<Pool>,
    connection: Option<Connection>,
    invalid: bool,
}

impl PooledConnection {
    pub(crate) fn new(pool: Arc<Pool>, connection: Connection) -> Self {
        Self {
            pool,
            connection: Some(connection),
            invalid: false,
        }
    }

    /// Close the connection when the guard is dropped
    pub fn invalidate(&mut self) {
        self.invalid = true;
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // only taken in drop
        self.connection
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled connection used after release"))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.check_in(connection, self.invalid);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name())
            .field("connection", &self.connection)
            .field("invalid", &self.invalid)
            .finish()
    }
}
