//! Connection pool and transactional retry engine.
//!
//! The pool bounds concurrency with two queues: `free` holds idle live
//! connections, `potential` holds capacity tokens for connections that have
//! not been created yet. At every steady state
//! `|free| + checked out + |potential| = max_conns`. Acquire races a free
//! connection, a token (materialised into a new connection on demand), and
//! the caller's deadline.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::codec::CodecRegistry;
use crate::connection::Connection;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::protocol::Cardinality;
use crate::value::{FromValue, Value};

/// Pool size used when the caller leaves both bounds zero.
pub const DEFAULT_MIN_CONNS: usize = 1;
pub const DEFAULT_MAX_CONNS: usize = 16;

const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(100);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Connection and pool options.
#[derive(Debug, Clone)]
pub struct Options {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Connections created eagerly at connect. Zero together with
    /// `max_conns` selects the defaults.
    pub min_conns: usize,
    /// Upper bound on live connections.
    pub max_conns: usize,
    /// Prepared-plan cache entries per connection.
    pub plan_cache_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            host: "localhost".to_string(),
            port: 5656,
            user: "quarry".to_string(),
            password: String::new(),
            database: "quarry".to_string(),
            min_conns: 0,
            max_conns: 0,
            plan_cache_capacity: 100,
        }
    }
}

/// Validate and default the pool bounds.
fn resolve_pool_size(min_conns: usize, max_conns: usize) -> Result<(usize, usize)> {
    if min_conns == 0 && max_conns == 0 {
        return Ok((DEFAULT_MIN_CONNS, DEFAULT_MAX_CONNS));
    }
    if max_conns < min_conns {
        return Err(Error::Configuration(format!(
            "MaxConns ({}) may not be less than MinConns ({})",
            max_conns, min_conns
        )));
    }
    if min_conns == 0 {
        return Err(Error::Configuration(
            "MinConns (0) may not be less than 1".to_string(),
        ));
    }
    Ok((min_conns, max_conns))
}

struct PoolInner {
    options: Options,
    min_conns: usize,
    max_conns: usize,
    registry: Arc<CodecRegistry>,
    free_tx: mpsc::Sender<Connection>,
    free_rx: AsyncMutex<mpsc::Receiver<Connection>>,
    potential_tx: mpsc::Sender<()>,
    potential_rx: AsyncMutex<mpsc::Receiver<()>>,
    closed: Mutex<bool>,
}

/// A bounded connection pool. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

/// Open a pool against the configured server. `min_conns` connections are
/// created eagerly; the rest of the capacity materialises on demand.
pub async fn connect(ctx: &Context, options: Options) -> Result<Pool> {
    let (min_conns, max_conns) = resolve_pool_size(options.min_conns, options.max_conns)?;
    let pool = Pool::with_sizes(options, min_conns, max_conns);

    for created in 0..min_conns {
        match Connection::connect(ctx, &pool.inner.options, Arc::clone(&pool.inner.registry)).await
        {
            Ok(conn) => {
                // capacity min_conns is reserved for exactly these sends
                let _ = pool.inner.free_tx.try_send(conn);
            }
            Err(e) => {
                debug!(created, error = %e, "eager connection failed, closing pool");
                let _ = pool.close_after(created).await;
                return Err(e);
            }
        }
    }
    debug!(min_conns, max_conns, "pool ready");
    Ok(pool)
}

impl Pool {
    fn with_sizes(options: Options, min_conns: usize, max_conns: usize) -> Pool {
        let (free_tx, free_rx) = mpsc::channel(max_conns.max(1));
        let (potential_tx, potential_rx) = mpsc::channel(max_conns.max(1));
        for _ in min_conns..max_conns {
            // capacity max_conns - min_conns is available by construction
            let _ = potential_tx.try_send(());
        }
        Pool {
            inner: Arc::new(PoolInner {
                options,
                min_conns,
                max_conns,
                registry: Arc::new(CodecRegistry::new()),
                free_tx,
                free_rx: AsyncMutex::new(free_rx),
                potential_tx,
                potential_rx: AsyncMutex::new(potential_rx),
                closed: Mutex::new(false),
            }),
        }
    }

    pub fn min_conns(&self) -> usize {
        self.inner.min_conns
    }

    pub fn max_conns(&self) -> usize {
        self.inner.max_conns
    }

    fn check_open(&self) -> Result<()> {
        if *self.inner.closed.lock() {
            return Err(Error::Interface("pool is closed".to_string()));
        }
        Ok(())
    }

    /// Check a connection out of the pool.
    ///
    /// Races a free connection, a capacity token, and the context. A
    /// context that has already fired wins the race unconditionally, even
    /// if a connection is ready.
    pub async fn acquire(&self, ctx: &Context) -> Result<PoolConn> {
        self.check_open()?;
        ctx.check()?;

        enum Event {
            Free(Option<Connection>),
            Token(Option<()>),
            Done(Error),
        }

        let event = tokio::select! {
            biased;
            conn = async { self.inner.free_rx.lock().await.recv().await } => Event::Free(conn),
            tok = async { self.inner.potential_rx.lock().await.recv().await } => Event::Token(tok),
            err = ctx.done() => Event::Done(err),
        };

        let conn = match event {
            Event::Free(Some(conn)) => conn,
            Event::Token(Some(())) => {
                match Connection::connect(ctx, &self.inner.options, Arc::clone(&self.inner.registry))
                    .await
                {
                    Ok(conn) => conn,
                    Err(e) => {
                        // hand the capacity back before surfacing the error
                        let _ = self.inner.potential_tx.try_send(());
                        return Err(e);
                    }
                }
            }
            Event::Free(None) | Event::Token(None) => {
                return Err(Error::Interface("pool is closed".to_string()))
            }
            Event::Done(err) => return Err(err),
        };

        Ok(PoolConn {
            conn: Some(conn),
            pool: self.clone(),
            had_error: false,
        })
    }

    /// Return a connection or its capacity to the pool.
    async fn release(&self, mut conn: Connection, had_error: bool) {
        if !had_error && conn.is_healthy() {
            if self.inner.free_tx.try_send(conn).is_err() {
                warn!("free queue refused a released connection");
            }
            return;
        }
        conn.terminate(&Context::background()).await;
        if self.inner.potential_tx.try_send(()).is_err() {
            warn!("potential queue refused a returned token");
        }
    }

    /// Run a query and collect every row into `dest`.
    pub async fn query<T: FromValue>(
        &self,
        ctx: &Context,
        command: &str,
        dest: &mut Vec<T>,
        args: &[Value],
    ) -> Result<()> {
        let mut conn = self.acquire(ctx).await?;
        let result = conn.query(ctx, command, dest, args).await;
        conn.release().await?;
        result
    }

    /// Run a query that must return exactly one row.
    pub async fn query_one<T: FromValue>(
        &self,
        ctx: &Context,
        command: &str,
        dest: &mut T,
        args: &[Value],
    ) -> Result<()> {
        let mut conn = self.acquire(ctx).await?;
        let result = conn.query_one(ctx, command, dest, args).await;
        conn.release().await?;
        result
    }

    /// Run a script, discarding results.
    pub async fn execute(&self, ctx: &Context, script: &str) -> Result<()> {
        let mut conn = self.acquire(ctx).await?;
        let result = conn.execute(ctx, script).await;
        conn.release().await?;
        result
    }

    /// Run `body` inside a transaction, retrying up to three times on
    /// retryable failures with capped exponential backoff. Each attempt
    /// acquires a fresh connection so a slot is not pinned across backoffs.
    pub async fn retry<T, F>(&self, ctx: &Context, mut body: F) -> Result<T>
    where
        F: for<'t> FnMut(&'t mut Tx) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 't>>,
    {
        let mut attempt = 1u32;
        loop {
            let conn = self.acquire(ctx).await?;
            let mut tx = Tx { conn, ctx: ctx.clone() };

            let result = match tx.begin().await {
                Ok(()) => match body(&mut tx).await {
                    Ok(value) => tx.commit().await.map(|_| value),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => {
                    tx.conn.release().await?;
                    return Ok(value);
                }
                Err(e) => {
                    // best-effort rollback before the slot is recycled
                    let _ = tx.rollback().await;
                    tx.conn.had_error = true;
                    tx.conn.release().await?;
                    if !(e.is_retryable() && attempt < MAX_RETRY_ATTEMPTS) {
                        return Err(e);
                    }
                    debug!(attempt, error = %e, "transaction failed, retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Close the pool, draining every slot. Exactly one caller succeeds;
    /// concurrent and subsequent calls fail with an interface error.
    pub async fn close(&self) -> Result<()> {
        {
            let mut closed = self.inner.closed.lock();
            if *closed {
                return Err(Error::Interface("pool is already closed".to_string()));
            }
            *closed = true;
        }
        self.drain(self.inner.max_conns).await;
        Ok(())
    }

    /// Close used when eager creation fails partway: only `created`
    /// connections plus the token capacity exist yet.
    async fn close_after(&self, created: usize) -> Result<()> {
        {
            let mut closed = self.inner.closed.lock();
            if *closed {
                return Err(Error::Interface("pool is already closed".to_string()));
            }
            *closed = true;
        }
        self.drain(created + (self.inner.max_conns - self.inner.min_conns))
            .await;
        Ok(())
    }

    async fn drain(&self, slots: usize) {
        let ctx = Context::background();
        let mut free_rx = self.inner.free_rx.lock().await;
        let mut potential_rx = self.inner.potential_rx.lock().await;
        for _ in 0..slots {
            tokio::select! {
                conn = free_rx.recv() => {
                    if let Some(mut conn) = conn {
                        conn.terminate(&ctx).await;
                    }
                }
                _ = potential_rx.recv() => {}
            }
        }
        debug!(slots, "pool drained");
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let delay = RETRY_BACKOFF_BASE.saturating_mul(1u32 << (attempt - 1).min(16));
    delay.min(RETRY_BACKOFF_CAP)
}

/// A connection checked out of the pool.
///
/// Dropping without an explicit [`PoolConn::release`] still returns the
/// slot, but cannot send the termination message for unhealthy
/// connections; prefer releasing.
pub struct PoolConn {
    conn: Option<Connection>,
    pool: Pool,
    had_error: bool,
}

impl PoolConn {
    fn conn_mut(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::Interface("connection has been released".to_string()))
    }

    /// Run a query and collect every row into `dest`.
    pub async fn query<T: FromValue>(
        &mut self,
        ctx: &Context,
        command: &str,
        dest: &mut Vec<T>,
        args: &[Value],
    ) -> Result<()> {
        let conn = self.conn_mut()?;
        match conn.query_values(ctx, command, args, Cardinality::Many).await {
            Ok(rows) => {
                dest.clear();
                dest.reserve(rows.len());
                for row in rows {
                    dest.push(T::from_value(row)?);
                }
                Ok(())
            }
            Err(e) => {
                self.had_error = true;
                Err(e)
            }
        }
    }

    /// Run a query that must return exactly one row.
    pub async fn query_one<T: FromValue>(
        &mut self,
        ctx: &Context,
        command: &str,
        dest: &mut T,
        args: &[Value],
    ) -> Result<()> {
        let conn = self.conn_mut()?;
        match conn.query_values(ctx, command, args, Cardinality::One).await {
            Ok(mut rows) => {
                let row = rows.pop().ok_or_else(|| {
                    Error::NoData(format!("query returned no rows: {:?}", command))
                })?;
                *dest = T::from_value(row)?;
                Ok(())
            }
            Err(e) => {
                self.had_error = true;
                Err(e)
            }
        }
    }

    /// Run a script, discarding results.
    pub async fn execute(&mut self, ctx: &Context, script: &str) -> Result<()> {
        let conn = self.conn_mut()?;
        match conn.execute_script(ctx, script).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.had_error = true;
                Err(e)
            }
        }
    }

    /// Return the connection to the pool. Releasing twice is an error but
    /// leaves the pool untouched.
    pub async fn release(&mut self) -> Result<()> {
        let conn = self.conn.take().ok_or_else(|| {
            Error::Interface("connection released more than once".to_string())
        })?;
        self.pool.release(conn, self.had_error).await;
        Ok(())
    }
}

impl Drop for PoolConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.had_error && conn.is_healthy() {
                if self.pool.inner.free_tx.try_send(conn).is_err() {
                    warn!("free queue refused a dropped connection");
                }
            } else {
                // dropping the socket closes it without Terminate
                drop(conn);
                if self.pool.inner.potential_tx.try_send(()).is_err() {
                    warn!("potential queue refused a returned token");
                }
            }
        }
    }
}

/// Transaction handle passed to [`Pool::retry`] bodies.
pub struct Tx {
    conn: PoolConn,
    ctx: Context,
}

impl Tx {
    async fn begin(&mut self) -> Result<()> {
        let ctx = self.ctx.clone();
        self.conn.conn_mut()?.begin(&ctx).await
    }

    async fn commit(&mut self) -> Result<()> {
        let ctx = self.ctx.clone();
        self.conn.conn_mut()?.commit(&ctx).await
    }

    async fn rollback(&mut self) -> Result<()> {
        let ctx = self.ctx.clone();
        self.conn.conn_mut()?.rollback(&ctx).await
    }

    /// Run a query on the transaction's connection.
    pub async fn query<T: FromValue>(
        &mut self,
        ctx: &Context,
        command: &str,
        dest: &mut Vec<T>,
        args: &[Value],
    ) -> Result<()> {
        self.conn.query(ctx, command, dest, args).await
    }

    /// Run a query that must return exactly one row.
    pub async fn query_one<T: FromValue>(
        &mut self,
        ctx: &Context,
        command: &str,
        dest: &mut T,
        args: &[Value],
    ) -> Result<()> {
        self.conn.query_one(ctx, command, dest, args).await
    }

    /// Run a script, discarding results.
    pub async fn execute(&mut self, ctx: &Context, script: &str) -> Result<()> {
        self.conn.execute(ctx, script).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(min_conns: usize, max_conns: usize) -> Pool {
        Pool::with_sizes(Options::default(), min_conns, max_conns)
    }

    #[test]
    fn zero_bounds_select_the_defaults() {
        assert_eq!(
            resolve_pool_size(0, 0).unwrap(),
            (DEFAULT_MIN_CONNS, DEFAULT_MAX_CONNS)
        );
        assert_eq!(resolve_pool_size(2, 8).unwrap(), (2, 8));
    }

    #[test]
    fn max_below_min_names_both_values() {
        match resolve_pool_size(5, 1) {
            Err(Error::Configuration(msg)) => {
                assert_eq!(msg, "MaxConns (1) may not be less than MinConns (5)");
            }
            other => panic!("expected ConfigurationError, got {:?}", other),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(100));
        assert_eq!(backoff_delay(2), Duration::from_millis(200));
        assert_eq!(backoff_delay(3), Duration::from_millis(400));
        assert_eq!(backoff_delay(10), RETRY_BACKOFF_CAP);
    }

    #[tokio::test]
    async fn acquire_from_a_closed_pool_fails_fast() {
        let pool = test_pool(0, 0);
        *pool.inner.closed.lock() = true;

        match pool.acquire(&Context::background()).await {
            Err(Error::Interface(msg)) => assert!(msg.contains("closed")),
            other => panic!("expected InterfaceError, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn acquire_with_an_expired_context_never_observes_the_pool() {
        let pool = test_pool(0, 2);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let ctx = Context::with_timeout(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(2)).await;

        match pool.acquire(&ctx).await {
            Err(Error::DeadlineExceeded) => {}
            other => panic!("expected DeadlineExceeded, got {:?}", other.err()),
        }
        // both capacity tokens are still in the queue
        let mut rx = pool.inner.potential_rx.lock().await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_succeeds_once_then_reports_interface_errors() {
        let pool = test_pool(0, 0);
        pool.close().await.unwrap();
        match pool.close().await {
            Err(Error::Interface(_)) => {}
            other => panic!("expected InterfaceError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn concurrent_close_has_exactly_one_winner() {
        let pool = test_pool(0, 0);
        let a = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.close().await })
        };
        let b = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.close().await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];
        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1, "exactly one close call may succeed");
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::Interface(_)))));
    }

    #[tokio::test]
    async fn releasing_twice_is_an_interface_error_and_a_no_op() {
        let pool = test_pool(0, 1);
        let mut conn = PoolConn {
            conn: None,
            pool: pool.clone(),
            had_error: false,
        };
        match conn.release().await {
            Err(Error::Interface(msg)) => assert!(msg.contains("more than once")),
            other => panic!("expected InterfaceError, got {:?}", other),
        }
        // the untouched token is still available
        assert!(pool.inner.potential_rx.lock().await.try_recv().is_ok());
    }
}
