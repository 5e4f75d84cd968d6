//! Backend Registry: one health-checked handle per backend name.
//!
//! Construction runs outside the cache lock. Concurrent first callers for the
//! same name share one in-flight attempt, so a handle is never built twice and
//! every waiter sees the same handle or the same error. Failures are returned
//! but not cached.

use crate::backend::Backend;
use crate::error::BackendError;
use crate::model::BackendName;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

type ConnectResult<H> = Result<Arc<H>, BackendError>;

struct PendingConnect<H> {
    attempt: u64,
    future: Shared<BoxFuture<'static, ConnectResult<H>>>,
}

struct RegistryState<H> {
    handles: HashMap<BackendName, Arc<H>>,
    pending: HashMap<BackendName, PendingConnect<H>>,
    next_attempt: u64,
}

pub struct Registry<B: Backend> {
    backend: Arc<B>,
    connect_timeout: Duration,
    default: Option<BackendName>,
    state: RwLock<RegistryState<B::Handle>>,
}

impl<B: Backend> Registry<B> {
    pub fn new(backend: Arc<B>, connect_timeout: Duration, default: Option<BackendName>) -> Self {
        Self {
            backend,
            connect_timeout,
            default,
            state: RwLock::new(RegistryState {
                handles: HashMap::new(),
                pending: HashMap::new(),
                next_attempt: 0,
            }),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// The backend used by commands that do not name one.
    pub fn current_default(&self) -> Option<&BackendName> {
        self.default.as_ref()
    }

    pub fn cached(&self, name: &BackendName) -> Option<Arc<B::Handle>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handles
            .get(name)
            .cloned()
    }

    pub async fn connect(&self, name: &BackendName) -> ConnectResult<B::Handle> {
        if let Some(handle) = self.cached(name) {
            return Ok(handle);
        }

        let (attempt, future) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(handle) = state.handles.get(name) {
                return Ok(handle.clone());
            }
            match state.pending.get(name) {
                Some(pending) => {
                    debug!("joining in-flight connect to {name}");
                    (pending.attempt, pending.future.clone())
                }
                None => {
                    state.next_attempt += 1;
                    let attempt = state.next_attempt;
                    let future = self.build(name.clone());
                    state.pending.insert(
                        name.clone(),
                        PendingConnect {
                            attempt,
                            future: future.clone(),
                        },
                    );
                    (attempt, future)
                }
            }
        };

        let result = future.await;

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let owns_attempt = state
            .pending
            .get(name)
            .is_some_and(|pending| pending.attempt == attempt);
        if owns_attempt {
            state.pending.remove(name);
            if let Ok(handle) = &result {
                state.handles.insert(name.clone(), handle.clone());
            }
        }

        result
    }

    fn build(&self, name: BackendName) -> Shared<BoxFuture<'static, ConnectResult<B::Handle>>> {
        let backend = self.backend.clone();
        let after = self.connect_timeout;
        async move {
            info!("connecting to {name}");
            match tokio::time::timeout(after, backend.connect(&name)).await {
                Ok(Ok(handle)) => {
                    let info = backend.describe(&handle);
                    info!(
                        "connected to {name} (server {}, namespace {})",
                        info.server_version, info.default_namespace
                    );
                    Ok(Arc::new(handle))
                }
                Ok(Err(error)) => {
                    warn!("connect to {name} failed: {error}");
                    Err(error)
                }
                Err(_) => {
                    warn!("connect to {name} timed out after {}s", after.as_secs());
                    Err(BackendError::Timeout {
                        backend: name,
                        operation: "connect",
                        after,
                    })
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Drops a cached handle, and any attempt still in flight, so the next
    /// `connect` rebuilds from scratch.
    pub fn evict(&self, name: &BackendName) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let had_pending = state.pending.remove(name).is_some();
        let had_handle = state.handles.remove(name).is_some();
        if had_handle || had_pending {
            info!("evicted connection for {name}");
        }
        had_handle
    }
}
