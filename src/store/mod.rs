// SPDX-License-Identifier: MIT
//! Store client — a thin wrapper around a Redis-protocol connection.
//!
//! Works against any Redis-protocol-compatible server; deployments here run
//! KVRocks for disk-backed durability. The [`redis::aio::MultiplexedConnection`]
//! is cheaply clonable — all clones share one TCP connection, so handlers just
//! grab a clone per operation.

pub mod scripts;

use redis::aio::MultiplexedConnection;

use crate::error::{CoreError, CoreResult};

#[derive(Clone)]
pub struct Store {
    conn: MultiplexedConnection,
}

impl Store {
    /// Connect to the store at `url` (`redis://[:<password>@]<host>:<port>[/<db>]`).
    /// Fails fast when the connection cannot be established.
    pub async fn connect(url: &str) -> CoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| CoreError::Storage(format!("invalid store url: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CoreError::Storage(format!("store connect failed: {e}")))?;
        Ok(Self { conn })
    }

    /// Clone of the shared connection for one operation.
    pub fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// Liveness probe.
    pub async fn ping(&self) -> CoreResult<()> {
        let mut conn = self.conn();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(CoreError::Storage(format!("unexpected PING reply: {pong}")))
        }
    }
}
