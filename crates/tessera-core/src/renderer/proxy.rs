//! Client RPC proxy: correlates requests with responses.
//!
//! Each call takes the next id from a counter and parks a oneshot resolver
//! under it. The reader side feeds every response to [`RpcProxy::settle`],
//! which removes and fires the resolver, so each id settles at most once and
//! responses may arrive in any order.

use crate::cache::Fetcher;
use crate::channel::{validate_channel_name, Channel};
use crate::config::ProxyConfig;
use crate::error::{BridgeError, Result};
use crate::ipc::protocol::{Envelope, InvocationRequest, InvocationResponse, RequestId};
use crate::ipc::transport::Transport;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Resolver = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct PendingCalls {
    resolvers: HashMap<RequestId, Resolver>,
    closed: bool,
}

pub struct RpcProxy {
    transport: Arc<dyn Transport>,
    config: ProxyConfig,
    next_id: AtomicU64,
    pending: Mutex<PendingCalls>,
}

/// Clears a call's resolver if the call ends without being settled
/// (timeout, post failure, or the caller dropping the future).
struct PendingGuard<'a> {
    proxy: &'a RpcProxy,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.proxy.lock().resolvers.remove(&self.id);
    }
}

impl RpcProxy {
    pub fn new(transport: Arc<dyn Transport>, config: ProxyConfig) -> Self {
        Self {
            transport,
            config,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingCalls::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingCalls> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Invoke `channel` on the backend and wait for its response.
    pub async fn call(&self, channel: &str, args: Value) -> Result<Value> {
        validate_channel_name(channel)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.lock();
            if pending.closed {
                return Err(BridgeError::transport("IPC connection is closed"));
            }
            pending.resolvers.insert(id, tx);
        }
        let _guard = PendingGuard { proxy: self, id };

        debug!("Invoking '{}' as request {}", channel, id);
        self.transport
            .post(Envelope::Request(InvocationRequest {
                id,
                channel: channel.to_string(),
                args,
            }))
            .await?;

        let settled = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(settled) => settled,
                Err(_) => {
                    warn!("Request {} on '{}' timed out after {:?}", id, channel, limit);
                    return Err(BridgeError::timeout(limit));
                }
            },
            None => rx.await,
        };

        settled.unwrap_or_else(|_| Err(BridgeError::transport("Call was dropped before a response arrived")))
    }

    /// Invoke a typed channel.
    pub async fn call_typed<C: Channel>(&self, args: C::Args) -> Result<C::Output> {
        let args = serde_json::to_value(args).map_err(|e| {
            BridgeError::serialization(format!("Unserializable arguments for '{}': {}", C::NAME, e))
        })?;
        let value = self.call(C::NAME, args).await?;
        serde_json::from_value(value).map_err(|e| {
            BridgeError::serialization(format!("Unexpected result from '{}': {}", C::NAME, e))
        })
    }

    /// Hand a response to the call waiting on its id.
    ///
    /// Returns `false` for ids nobody waits on: duplicates, or answers to
    /// calls that already timed out or were dropped.
    pub fn settle(&self, response: InvocationResponse) -> bool {
        let resolver = self.lock().resolvers.remove(&response.id);
        match resolver {
            Some(resolver) => {
                // The receiver may have been dropped between removal and send.
                let _ = resolver.send(response.outcome.into_result());
                true
            }
            None => {
                debug!("Discarding response {}: no call is waiting for it", response.id);
                false
            }
        }
    }

    /// Reject every pending call with `error` and refuse new ones.
    ///
    /// Returns how many calls were rejected.
    pub fn fail_all(&self, error: BridgeError) -> usize {
        let resolvers: Vec<Resolver> = {
            let mut pending = self.lock();
            pending.closed = true;
            pending.resolvers.drain().map(|(_, resolver)| resolver).collect()
        };
        let count = resolvers.len();
        for resolver in resolvers {
            let _ = resolver.send(Err(error.clone()));
        }
        if count > 0 {
            debug!("Rejected {} pending call(s): {}", count, error);
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of calls waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.lock().resolvers.len()
    }
}

#[async_trait]
impl Fetcher for RpcProxy {
    async fn fetch(&self, channel: &str, args: Value) -> Result<Value> {
        self.call(channel, args).await
    }
}
