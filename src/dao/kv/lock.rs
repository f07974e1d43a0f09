use std::time::Duration;
use std::{fmt, io, str::FromStr};

use crate::error::Error;
use crate::helpers::now_ms;
use crate::keys;
use crate::model::Store;
use crate::provider::{KvHandle, SetOptions};

/// Default ceiling for HTTP request-scoped critical sections.
pub const REQUEST_LOCK_TTL: Duration = Duration::from_secs(30);

/// Default ceiling for worker-scoped critical sections.
pub const WORKER_LOCK_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOperation {
    Vote,
    Transaction,
    Settlement,
    Rebalance,
}

impl fmt::Display for LockOperation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LockOperation::Vote => write!(f, "vote"),
            LockOperation::Transaction => write!(f, "transaction"),
            LockOperation::Settlement => write!(f, "settlement"),
            LockOperation::Rebalance => write!(f, "rebalance"),
        }
    }
}

impl FromStr for LockOperation {
    type Err = io::Error;

    fn from_str(value: &str) -> Result<LockOperation, Self::Err> {
        match value {
            "vote" => Ok(LockOperation::Vote),
            "transaction" => Ok(LockOperation::Transaction),
            "settlement" => Ok(LockOperation::Settlement),
            "rebalance" => Ok(LockOperation::Rebalance),
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                "LockOperation not supported",
            )),
        }
    }
}

/// A distributed lock attempt. `release` only deletes the key while it
/// still holds this owner's token, and is a no-op when acquisition
/// failed, so callers can release unconditionally.
#[derive(Debug)]
pub struct OperationLock {
    kv: KvHandle,
    key: String,
    token: String,
    pub acquired: bool,
}

impl OperationLock {
    pub async fn release(&self) -> Result<(), Error> {
        if !self.acquired {
            return Ok(());
        }
        if let Some(value) = self.kv.get(&self.key).await? {
            if value.into_plain() == self.token {
                self.kv.del(&self.key).await?;
            }
        }
        Ok(())
    }
}

fn owner_token() -> String {
    format!("{}-{:08x}", now_ms(), rand::random::<u32>())
}

impl Store<OperationLock> {
    pub async fn acquire(
        &self,
        operation: LockOperation,
        id: Option<&str>,
        ttl: Duration,
    ) -> Result<OperationLock, Error> {
        let key = keys::operation_lock(&operation.to_string(), id);
        let token = owner_token();
        let acquired = self
            .kv
            .set(&key, &token, SetOptions::nx_ex(ttl))
            .await?;
        Ok(OperationLock {
            kv: self.kv.clone(),
            key,
            token,
            acquired,
        })
    }

    /// Busy-wait variant with a fixed delay between attempts.
    pub async fn acquire_with_retry(
        &self,
        operation: LockOperation,
        id: Option<&str>,
        ttl: Duration,
        max_retries: u32,
        delay: Duration,
    ) -> Result<OperationLock, Error> {
        let mut attempt = 0;
        loop {
            let lock = self.acquire(operation, id, ttl).await?;
            if lock.acquired || attempt >= max_retries {
                return Ok(lock);
            }
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn is_locked(
        &self,
        operation: LockOperation,
        id: Option<&str>,
    ) -> Result<bool, Error> {
        self.kv
            .exists(&keys::operation_lock(&operation.to_string(), id))
            .await
    }
}
