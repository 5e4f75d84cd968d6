//! The capability the dashboard core needs from a cluster: connect, list and
//! follow logs. `KubeBackend` in `k8s.rs` is the production implementation.

use crate::error::BackendError;
use crate::model::{BackendName, NamespaceScope, PodDetail, PodRef, ResourceKind, ResourceRow};
use futures::stream::BoxStream;
use std::future::Future;

/// Lines of one followed log, ending on EOF or on the first error.
pub type LogLines = BoxStream<'static, anyhow::Result<String>>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BackendInfo {
    pub name: BackendName,
    pub server_version: String,
    pub default_namespace: String,
}

pub trait Backend: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    /// Builds a connection and health-probes it. No caching happens here.
    fn connect(
        &self,
        name: &BackendName,
    ) -> impl Future<Output = Result<Self::Handle, BackendError>> + Send;

    fn describe(&self, handle: &Self::Handle) -> BackendInfo;

    /// Rows come back in the order the backend returned them.
    fn list(
        &self,
        handle: &Self::Handle,
        kind: ResourceKind,
        scope: &NamespaceScope,
    ) -> impl Future<Output = Result<Vec<ResourceRow>, BackendError>> + Send;

    /// Resolves the container to follow: the requested one, or the first
    /// container declared in the pod spec.
    fn pod_detail(
        &self,
        handle: &Self::Handle,
        pod: &PodRef,
    ) -> impl Future<Output = anyhow::Result<PodDetail>> + Send;

    fn stream_logs(
        &self,
        handle: &Self::Handle,
        pod: &PodRef,
    ) -> impl Future<Output = anyhow::Result<LogLines>> + Send;
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory backend for exercising the registry, scheduler and reducer
    //! without a cluster.

    use super::{Backend, BackendInfo, LogLines};
    use crate::error::BackendError;
    use crate::model::{BackendName, NamespaceScope, PodDetail, PodRef, ResourceKind, ResourceRow};
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    pub(crate) struct FakeHandle {
        pub info: BackendInfo,
        pub serial: usize,
    }

    enum LogScript {
        Lines { lines: Vec<String>, keep_open: bool },
        Feed(mpsc::UnboundedReceiver<anyhow::Result<String>>),
        OpenError(String),
    }

    #[derive(Default)]
    struct FakeState {
        rows: HashMap<(BackendName, ResourceKind), Result<Vec<ResourceRow>, String>>,
        scoped_rows: HashMap<(BackendName, ResourceKind, NamespaceScope), Vec<ResourceRow>>,
        connect_errors: HashMap<BackendName, String>,
        connect_delays: HashMap<BackendName, Duration>,
        fetch_delays: HashMap<BackendName, Duration>,
        scoped_fetch_delays: HashMap<(BackendName, NamespaceScope), Duration>,
        connect_attempts: HashMap<BackendName, usize>,
        containers: HashMap<String, Vec<(String, String)>>,
        logs: HashMap<String, LogScript>,
        log_opens: usize,
        streamed_containers: Vec<Option<String>>,
    }

    #[derive(Default)]
    pub(crate) struct FakeBackend {
        state: Mutex<FakeState>,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self::default()
        }

        fn with_state<T>(&self, apply: impl FnOnce(&mut FakeState) -> T) -> T {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            apply(&mut state)
        }

        pub fn set_rows(&self, backend: &str, kind: ResourceKind, names: &[&str]) {
            let backend = BackendName::new(backend);
            let rows = names
                .iter()
                .map(|name| pod_row(&backend, name))
                .collect::<Vec<_>>();
            self.with_state(|state| {
                state.rows.insert((backend, kind), Ok(rows));
            });
        }

        /// Rows served only for fetches in `scope`; other scopes fall back to
        /// `set_rows`.
        pub fn set_rows_in(
            &self,
            backend: &str,
            kind: ResourceKind,
            scope: NamespaceScope,
            names: &[&str],
        ) {
            let backend = BackendName::new(backend);
            let rows = names
                .iter()
                .map(|name| pod_row(&backend, name))
                .collect::<Vec<_>>();
            self.with_state(|state| {
                state.scoped_rows.insert((backend, kind, scope), rows);
            });
        }

        pub fn fail_list(&self, backend: &str, kind: ResourceKind, message: &str) {
            self.with_state(|state| {
                state
                    .rows
                    .insert((BackendName::new(backend), kind), Err(message.to_string()));
            });
        }

        pub fn fail_connect(&self, backend: &str, message: &str) {
            self.with_state(|state| {
                state
                    .connect_errors
                    .insert(BackendName::new(backend), message.to_string());
            });
        }

        pub fn heal_connect(&self, backend: &str) {
            self.with_state(|state| {
                state.connect_errors.remove(&BackendName::new(backend));
            });
        }

        pub fn delay_connect(&self, backend: &str, delay: Duration) {
            self.with_state(|state| {
                state
                    .connect_delays
                    .insert(BackendName::new(backend), delay);
            });
        }

        pub fn delay_fetch(&self, backend: &str, delay: Duration) {
            self.with_state(|state| {
                state.fetch_delays.insert(BackendName::new(backend), delay);
            });
        }

        pub fn delay_fetch_in(&self, backend: &str, scope: NamespaceScope, delay: Duration) {
            self.with_state(|state| {
                state
                    .scoped_fetch_delays
                    .insert((BackendName::new(backend), scope), delay);
            });
        }

        /// Declares the pod's containers as (name, image) pairs. Pods without
        /// a declaration have a single `app` container.
        pub fn set_containers(&self, pod: &str, containers: &[(&str, &str)]) {
            let containers = containers
                .iter()
                .map(|(name, image)| (name.to_string(), image.to_string()))
                .collect();
            self.with_state(|state| {
                state.containers.insert(pod.to_string(), containers);
            });
        }

        pub fn script_logs(&self, pod: &str, lines: &[&str], keep_open: bool) {
            let lines = lines.iter().map(|line| line.to_string()).collect();
            self.with_state(|state| {
                state
                    .logs
                    .insert(pod.to_string(), LogScript::Lines { lines, keep_open });
            });
        }

        pub fn feed_logs(&self, pod: &str) -> mpsc::UnboundedSender<anyhow::Result<String>> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.with_state(|state| {
                state.logs.insert(pod.to_string(), LogScript::Feed(rx));
            });
            tx
        }

        pub fn fail_logs(&self, pod: &str, message: &str) {
            self.with_state(|state| {
                state
                    .logs
                    .insert(pod.to_string(), LogScript::OpenError(message.to_string()));
            });
        }

        pub fn connect_attempts(&self, backend: &str) -> usize {
            self.with_state(|state| {
                state
                    .connect_attempts
                    .get(&BackendName::new(backend))
                    .copied()
                    .unwrap_or(0)
            })
        }

        pub fn log_opens(&self) -> usize {
            self.with_state(|state| state.log_opens)
        }

        /// Container passed to every `stream_logs` call, in call order.
        pub fn streamed_containers(&self) -> Vec<Option<String>> {
            self.with_state(|state| state.streamed_containers.clone())
        }
    }

    pub(crate) fn pod_row(backend: &BackendName, name: &str) -> ResourceRow {
        ResourceRow {
            backend: backend.clone(),
            name: name.to_string(),
            namespace: Some("default".to_string()),
            columns: vec![
                name.to_string(),
                "default".to_string(),
                "Running".to_string(),
                backend.to_string(),
            ],
        }
    }

    impl Backend for FakeBackend {
        type Handle = FakeHandle;

        async fn connect(&self, name: &BackendName) -> Result<FakeHandle, BackendError> {
            let (delay, failure, serial) = self.with_state(|state| {
                let attempts = state.connect_attempts.entry(name.clone()).or_insert(0);
                *attempts += 1;
                (
                    state.connect_delays.get(name).copied(),
                    state.connect_errors.get(name).cloned(),
                    *attempts,
                )
            });
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = failure {
                return Err(BackendError::Connection {
                    backend: name.clone(),
                    message,
                });
            }
            Ok(FakeHandle {
                info: BackendInfo {
                    name: name.clone(),
                    server_version: "v1.30.0-fake".to_string(),
                    default_namespace: "default".to_string(),
                },
                serial,
            })
        }

        fn describe(&self, handle: &FakeHandle) -> BackendInfo {
            handle.info.clone()
        }

        async fn list(
            &self,
            handle: &FakeHandle,
            kind: ResourceKind,
            scope: &NamespaceScope,
        ) -> Result<Vec<ResourceRow>, BackendError> {
            let backend = handle.info.name.clone();
            let (delay, result) = self.with_state(|state| {
                let delay = state
                    .scoped_fetch_delays
                    .get(&(backend.clone(), scope.clone()))
                    .or_else(|| state.fetch_delays.get(&backend))
                    .copied();
                let rows = match state
                    .scoped_rows
                    .get(&(backend.clone(), kind, scope.clone()))
                {
                    Some(rows) => Some(Ok(rows.clone())),
                    None => state.rows.get(&(backend.clone(), kind)).cloned(),
                };
                (delay, rows)
            });
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match result {
                Some(Ok(rows)) => Ok(rows),
                Some(Err(message)) => Err(BackendError::Fetch {
                    backend,
                    kind,
                    message,
                }),
                None => Ok(Vec::new()),
            }
        }

        async fn pod_detail(&self, _handle: &FakeHandle, pod: &PodRef) -> anyhow::Result<PodDetail> {
            let containers = self.with_state(|state| {
                state
                    .containers
                    .get(&pod.name)
                    .cloned()
                    .unwrap_or_else(|| vec![("app".to_string(), "fake/app:1".to_string())])
            });
            let chosen = match &pod.container {
                Some(requested) => containers.iter().find(|(name, _)| name == requested),
                None => containers.first(),
            };
            let Some((container, image)) = chosen else {
                anyhow::bail!(
                    "container {} is not valid for pod {}",
                    pod.container.as_deref().unwrap_or("<none>"),
                    pod.name
                );
            };
            Ok(PodDetail {
                container: container.clone(),
                containers: containers.len(),
                image: image.clone(),
                node: "node-1".to_string(),
            })
        }

        async fn stream_logs(&self, _handle: &FakeHandle, pod: &PodRef) -> anyhow::Result<LogLines> {
            let script = self.with_state(|state| {
                state.log_opens += 1;
                state.streamed_containers.push(pod.container.clone());
                state.logs.remove(&pod.name)
            });
            match script {
                Some(LogScript::Lines { lines, keep_open }) => {
                    let lines = futures::stream::iter(lines.into_iter().map(Ok));
                    if keep_open {
                        Ok(lines.chain(futures::stream::pending()).boxed())
                    } else {
                        Ok(lines.boxed())
                    }
                }
                Some(LogScript::Feed(rx)) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                })
                .boxed()),
                Some(LogScript::OpenError(message)) => Err(anyhow::anyhow!(message)),
                None => Ok(futures::stream::empty().boxed()),
            }
        }
    }
}
