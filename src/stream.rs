//! Stream Router: one cancellable log producer per pane, bridged to the
//! reducer through a bounded per-generation queue.
//!
//! Replacing a pane's stream bumps its generation. Anything the superseded
//! producer still manages to enqueue carries the old generation and is
//! dropped by [`PaneLog::apply`].

use crate::backend::Backend;
use crate::error::{BackendError, compact_error};
use crate::model::{LogLine, PaneId, PodDetail, PodRef};
use crate::registry::Registry;
use chrono::Local;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on events pulled from one inbox per reducer pass.
pub const READ_CHUNK: usize = 64;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StreamEvent {
    /// The pod was found and its logs opened. Always precedes any line.
    Opened {
        generation: u64,
        detail: PodDetail,
    },
    Line(LogLine),
    Ended {
        generation: u64,
        error: Option<BackendError>,
    },
}

impl StreamEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Opened { generation, .. } => *generation,
            Self::Line(line) => line.generation,
            Self::Ended { generation, .. } => *generation,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub pane: PaneId,
    pub generation: u64,
    cancel: CancellationToken,
}

impl StreamHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Consumer end of one stream generation.
#[derive(Clone)]
pub struct StreamInbox {
    pub pane: PaneId,
    pub generation: u64,
    rx: Arc<Mutex<mpsc::Receiver<StreamEvent>>>,
}

impl StreamInbox {
    /// Waits for one event, then drains whatever else is already queued, up
    /// to `max` in total. An empty result means the producer is gone.
    pub async fn next_chunk(&self, max: usize) -> Vec<StreamEvent> {
        let mut rx = self.rx.lock().await;
        let Some(first) = rx.recv().await else {
            return Vec::new();
        };
        let mut events = vec![first];
        while events.len() < max {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }
        events
    }
}

impl Debug for StreamInbox {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamInbox")
            .field("pane", &self.pane)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl PartialEq for StreamInbox {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.rx, &other.rx)
    }
}

struct ActiveStream {
    handle: StreamHandle,
    pod: PodRef,
    inbox: StreamInbox,
    task: JoinHandle<()>,
}

pub struct StreamRouter<B: Backend> {
    registry: Arc<Registry<B>>,
    queue_depth: usize,
    active: HashMap<PaneId, ActiveStream>,
    generations: HashMap<PaneId, u64>,
}

impl<B: Backend> StreamRouter<B> {
    pub fn new(registry: Arc<Registry<B>>, queue_depth: usize) -> Self {
        Self {
            registry,
            queue_depth: queue_depth.max(1),
            active: HashMap::new(),
            generations: HashMap::new(),
        }
    }

    /// Supersedes any stream on `pane` and spawns a producer for `pod`.
    pub fn start_stream(&mut self, pane: PaneId, pod: PodRef) -> (StreamHandle, StreamInbox) {
        self.stop_stream(pane);

        let generation = {
            let counter = self.generations.entry(pane).or_insert(0);
            *counter += 1;
            *counter
        };
        let handle = StreamHandle {
            pane,
            generation,
            cancel: CancellationToken::new(),
        };
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let inbox = StreamInbox {
            pane,
            generation,
            rx: Arc::new(Mutex::new(rx)),
        };

        info!("{pane}: streaming {pod} (generation {generation})");
        let task = tokio::spawn(produce(
            self.registry.clone(),
            pod.clone(),
            handle.clone(),
            tx,
        ));
        self.active.insert(
            pane,
            ActiveStream {
                handle: handle.clone(),
                pod,
                inbox: inbox.clone(),
                task,
            },
        );
        (handle, inbox)
    }

    /// Signals the producer to exit. Returns false when the pane was idle.
    pub fn stop_stream(&mut self, pane: PaneId) -> bool {
        let Some(active) = self.active.remove(&pane) else {
            return false;
        };
        active.handle.cancel();
        debug!(
            "{pane}: stopped generation {} ({})",
            active.handle.generation, active.pod
        );
        true
    }

    pub fn is_current(&self, pane: PaneId, generation: u64) -> bool {
        self.active
            .get(&pane)
            .is_some_and(|active| active.handle.generation == generation)
    }

    pub fn inbox(&self, pane: PaneId) -> Option<StreamInbox> {
        self.active.get(&pane).map(|active| active.inbox.clone())
    }

    pub fn active_panes(&self) -> usize {
        self.active.len()
    }

    /// Cancels every producer and aborts any that has not exited yet.
    pub fn shutdown(&mut self) {
        for (pane, active) in self.active.drain() {
            active.handle.cancel();
            if !active.task.is_finished() {
                debug!("{pane}: aborting producer");
                active.task.abort();
            }
        }
    }
}

async fn produce<B: Backend>(
    registry: Arc<Registry<B>>,
    pod: PodRef,
    handle: StreamHandle,
    tx: mpsc::Sender<StreamEvent>,
) {
    let pane = handle.pane;
    let generation = handle.generation;

    let opened = tokio::select! {
        _ = handle.cancel.cancelled() => return,
        opened = open_logs(&registry, &pod) => opened,
    };
    let (detail, mut lines) = match opened {
        Ok(opened) => opened,
        Err(error) => {
            warn!("{pane}: cannot open logs for {pod}: {error:#}");
            let ended = StreamEvent::Ended {
                generation,
                error: Some(BackendError::Stream {
                    pane,
                    message: compact_error(&error),
                }),
            };
            deliver(&handle, &tx, ended).await;
            return;
        }
    };

    debug!(
        "{pane}: {pod} runs {} on {} ({} of {} containers)",
        detail.image, detail.node, detail.container, detail.containers
    );
    if !deliver(&handle, &tx, StreamEvent::Opened { generation, detail }).await {
        return;
    }

    let mut seq = 0_u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => {
                debug!("{pane}: producer for generation {generation} cancelled");
                return;
            }
            next = lines.next() => next,
        };

        let event = match next {
            Some(Ok(text)) => {
                seq += 1;
                StreamEvent::Line(LogLine {
                    pane,
                    generation,
                    seq,
                    text,
                    received_at: Local::now(),
                })
            }
            Some(Err(error)) => {
                warn!("{pane}: log stream for {pod} failed: {error:#}");
                let ended = StreamEvent::Ended {
                    generation,
                    error: Some(BackendError::Stream {
                        pane,
                        message: compact_error(&error),
                    }),
                };
                deliver(&handle, &tx, ended).await;
                return;
            }
            None => {
                info!("{pane}: log stream for {pod} ended after {seq} lines");
                deliver(&handle, &tx, StreamEvent::Ended { generation, error: None }).await;
                return;
            }
        };

        if !deliver(&handle, &tx, event).await {
            return;
        }
    }
}

/// Looks the pod up first so the stream follows a concrete container.
async fn open_logs<B: Backend>(
    registry: &Registry<B>,
    pod: &PodRef,
) -> anyhow::Result<(PodDetail, crate::backend::LogLines)> {
    let connection = registry.connect(&pod.backend).await?;
    let detail = registry
        .backend()
        .pod_detail(connection.as_ref(), pod)
        .await?;
    let target = PodRef {
        container: Some(detail.container.clone()),
        ..pod.clone()
    };
    let lines = registry
        .backend()
        .stream_logs(connection.as_ref(), &target)
        .await?;
    Ok((detail, lines))
}

/// Blocks while the queue is full, unless the stream gets cancelled.
async fn deliver(handle: &StreamHandle, tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tokio::select! {
        _ = handle.cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PaneStatus {
    Empty,
    Starting,
    Streaming,
    Ended,
    Failed(String),
}

impl PaneStatus {
    pub fn label(&self) -> &str {
        match self {
            Self::Empty => "empty",
            Self::Starting => "starting",
            Self::Streaming => "streaming",
            Self::Ended => "ended",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Streaming)
    }
}

/// Consumer-side buffer of one pane: the most recent `max_lines` lines of the
/// current generation.
#[derive(Debug, Clone)]
pub struct PaneLog {
    pub id: PaneId,
    pub pod: Option<PodRef>,
    pub status: PaneStatus,
    pub follow: bool,
    pub scroll: usize,
    detail: Option<PodDetail>,
    generation: u64,
    last_seq: u64,
    lines: VecDeque<LogLine>,
    max_lines: usize,
    evicted: u64,
}

impl PaneLog {
    pub fn new(id: PaneId, max_lines: usize, follow: bool) -> Self {
        Self {
            id,
            pod: None,
            status: PaneStatus::Empty,
            follow,
            scroll: 0,
            detail: None,
            generation: 0,
            last_seq: 0,
            lines: VecDeque::new(),
            max_lines: max_lines.max(1),
            evicted: 0,
        }
    }

    pub fn begin(&mut self, pod: PodRef, generation: u64) {
        self.pod = Some(pod);
        self.detail = None;
        self.generation = generation;
        self.last_seq = 0;
        self.lines.clear();
        self.evicted = 0;
        self.scroll = 0;
        self.status = PaneStatus::Starting;
    }

    pub fn reset(&mut self) {
        self.pod = None;
        self.detail = None;
        self.generation = 0;
        self.last_seq = 0;
        self.lines.clear();
        self.evicted = 0;
        self.scroll = 0;
        self.status = PaneStatus::Empty;
    }

    /// Applies events of the current generation in order. Stale or
    /// out-of-order events are skipped. Returns the number of lines kept.
    pub fn apply(&mut self, events: Vec<StreamEvent>) -> usize {
        let mut applied = 0;
        for event in events {
            if self.generation == 0 || event.generation() != self.generation {
                continue;
            }
            match event {
                StreamEvent::Opened { detail, .. } => {
                    if self.status != PaneStatus::Starting {
                        continue;
                    }
                    if let Some(pod) = &mut self.pod {
                        pod.container = Some(detail.container.clone());
                    }
                    self.detail = Some(detail);
                    self.status = PaneStatus::Streaming;
                }
                StreamEvent::Line(line) => {
                    if line.seq <= self.last_seq || !self.status.is_live() {
                        continue;
                    }
                    self.last_seq = line.seq;
                    self.push(line);
                    self.status = PaneStatus::Streaming;
                    applied += 1;
                }
                StreamEvent::Ended { error, .. } => {
                    self.status = match error {
                        Some(error) => PaneStatus::Failed(error.summary()),
                        None => PaneStatus::Ended,
                    };
                }
            }
        }
        applied
    }

    /// Marks a live stream as ended when its producer went away silently.
    pub fn close(&mut self, generation: u64) {
        if generation == self.generation && self.status.is_live() {
            self.status = PaneStatus::Ended;
        }
    }

    fn push(&mut self, line: LogLine) {
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
            self.evicted += 1;
            if !self.follow {
                self.scroll = self.scroll.saturating_sub(1);
            }
        }
        self.lines.push_back(line);
    }

    pub fn clear_buffer(&mut self) {
        self.evicted += self.lines.len() as u64;
        self.lines.clear();
        self.scroll = 0;
    }

    pub fn toggle_follow(&mut self) -> bool {
        self.follow = !self.follow;
        if self.follow {
            self.scroll = self.lines.len().saturating_sub(1);
        }
        self.follow
    }

    /// `scroll` is the index of the bottom visible line. Scrolling leaves
    /// follow mode starting from the tail.
    pub fn scroll_by(&mut self, delta: isize) {
        if self.follow {
            self.follow = false;
            self.scroll = self.lines.len().saturating_sub(1);
        }
        let max = self.lines.len().saturating_sub(1);
        self.scroll = self.scroll.saturating_add_signed(delta).min(max);
    }

    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn detail(&self) -> Option<&PodDetail> {
        self.detail.as_ref()
    }

    pub fn lines(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines
    }
}
