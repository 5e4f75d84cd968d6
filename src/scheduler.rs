//! Command/Message scheduler.
//!
//! Commands describe asynchronous work. Each dispatched command runs on its
//! own task and reports back as exactly one [`Message`] on the inbound queue.
//! Only the reducer consuming that queue mutates application state.

use crate::backend::{Backend, BackendInfo};
use crate::error::BackendError;
use crate::model::{BackendName, NamespaceScope, PaneId, PodRef, ResourceKind, ResourceRow};
use crate::registry::Registry;
use crate::stream::{READ_CHUNK, StreamEvent, StreamInbox};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// `request` tags are issued by the reducer and echoed back unchanged in the
/// matching message, so a result that was superseded while in flight can be
/// recognised and dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect {
        backend: BackendName,
        request: u64,
    },
    /// Evicts the cached handle first.
    Reconnect {
        backend: BackendName,
        request: u64,
    },
    Fetch {
        backend: BackendName,
        kind: ResourceKind,
        scope: NamespaceScope,
        request: u64,
    },
    /// Pulls the next chunk of one pane's current stream.
    ReadStream {
        inbox: StreamInbox,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Connected {
        backend: BackendName,
        request: u64,
        result: Result<BackendInfo, BackendError>,
    },
    RowsFetched {
        backend: BackendName,
        kind: ResourceKind,
        request: u64,
        result: Result<Vec<ResourceRow>, BackendError>,
    },
    StreamChunk {
        pane: PaneId,
        generation: u64,
        events: Vec<StreamEvent>,
    },
    StreamClosed {
        pane: PaneId,
        generation: u64,
    },
    /// Selection change applied in one step, deselections first.
    BackendsChanged {
        selected: Vec<BackendName>,
        deselected: Vec<BackendName>,
    },
    PodChosen {
        pane: PaneId,
        pod: PodRef,
    },
    PaneCleared {
        pane: PaneId,
    },
    ErrorsCleared,
    RefreshDue,
}

pub struct Scheduler<B: Backend> {
    registry: Arc<Registry<B>>,
    fetch_timeout: Duration,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl<B: Backend> Scheduler<B> {
    pub fn new(registry: Arc<Registry<B>>, fetch_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            registry,
            fetch_timeout,
            tx,
            rx,
        }
    }

    pub fn dispatch(&self, command: Command) {
        debug!("dispatch {}", describe(&command));
        let registry = self.registry.clone();
        let fetch_timeout = self.fetch_timeout;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let message = execute(registry, fetch_timeout, command).await;
            if tx.send(message).is_err() {
                debug!("scheduler inbox closed, dropping result");
            }
        });
    }

    pub fn dispatch_all(&self, commands: impl IntoIterator<Item = Command>) {
        for command in commands {
            self.dispatch(command);
        }
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

fn describe(command: &Command) -> String {
    match command {
        Command::Connect { backend, request } => format!("connect {backend} #{request}"),
        Command::Reconnect { backend, request } => format!("reconnect {backend} #{request}"),
        Command::Fetch {
            backend,
            kind,
            scope,
            request,
        } => format!("fetch {kind} on {backend} ({scope}) #{request}"),
        Command::ReadStream { inbox } => {
            format!("read {} generation {}", inbox.pane, inbox.generation)
        }
    }
}

async fn execute<B: Backend>(
    registry: Arc<Registry<B>>,
    fetch_timeout: Duration,
    command: Command,
) -> Message {
    match command {
        Command::Connect { backend, request } => {
            let result = registry
                .connect(&backend)
                .await
                .map(|handle| registry.backend().describe(handle.as_ref()));
            Message::Connected {
                backend,
                request,
                result,
            }
        }
        Command::Reconnect { backend, request } => {
            registry.evict(&backend);
            let result = registry
                .connect(&backend)
                .await
                .map(|handle| registry.backend().describe(handle.as_ref()));
            Message::Connected {
                backend,
                request,
                result,
            }
        }
        Command::Fetch {
            backend,
            kind,
            scope,
            request,
        } => {
            let result = fetch(&registry, fetch_timeout, &backend, kind, &scope).await;
            if let Err(error) = &result {
                warn!("{error}");
            }
            Message::RowsFetched {
                backend,
                kind,
                request,
                result,
            }
        }
        Command::ReadStream { inbox } => {
            let events = inbox.next_chunk(READ_CHUNK).await;
            if events.is_empty() {
                Message::StreamClosed {
                    pane: inbox.pane,
                    generation: inbox.generation,
                }
            } else {
                Message::StreamChunk {
                    pane: inbox.pane,
                    generation: inbox.generation,
                    events,
                }
            }
        }
    }
}

async fn fetch<B: Backend>(
    registry: &Registry<B>,
    after: Duration,
    backend: &BackendName,
    kind: ResourceKind,
    scope: &NamespaceScope,
) -> Result<Vec<ResourceRow>, BackendError> {
    let handle = registry.connect(backend).await?;
    match tokio::time::timeout(after, registry.backend().list(handle.as_ref(), kind, scope)).await
    {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout {
            backend: backend.clone(),
            operation: "fetch",
            after,
        }),
    }
}
