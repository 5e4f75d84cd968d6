//! kube-rs implementation of the backend capability. Every kubeconfig context
//! is one backend.

use crate::backend::{Backend, BackendInfo, LogLines};
use crate::error::BackendError;
use crate::model::{
    BackendName, ContextEntry, NamespaceScope, PodDetail, PodRef, ResourceKind, ResourceRow,
};
use anyhow::{Context, Result};
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ListParams, LogParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, ResourceExt};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::debug;

const IN_CLUSTER: &str = "in-cluster";
const FALLBACK_NAMESPACE: &str = "default";

pub struct KubeBackend {
    kubeconfig: Option<Kubeconfig>,
}

pub struct KubeConnection {
    client: Client,
    info: BackendInfo,
}

impl KubeBackend {
    /// Reads kubeconfig from `path`, or from the usual locations. Without any
    /// kubeconfig the only backend offered is the in-cluster service account.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let kubeconfig = match path {
            Some(path) => Some(
                Kubeconfig::read_from(path)
                    .with_context(|| format!("failed to read kubeconfig {}", path.display()))?,
            ),
            None => Kubeconfig::read().ok(),
        };
        Ok(Self { kubeconfig })
    }

    pub fn contexts(&self) -> Vec<ContextEntry> {
        let Some(kubeconfig) = &self.kubeconfig else {
            return vec![ContextEntry {
                name: BackendName::new(IN_CLUSTER),
                cluster: IN_CLUSTER.to_string(),
                default_namespace: FALLBACK_NAMESPACE.to_string(),
            }];
        };
        context_catalog(kubeconfig)
    }

    pub fn current_context(&self) -> Option<BackendName> {
        match &self.kubeconfig {
            Some(kubeconfig) => kubeconfig
                .current_context
                .as_deref()
                .filter(|context| !context.is_empty())
                .map(BackendName::new),
            None => Some(BackendName::new(IN_CLUSTER)),
        }
    }

    async fn build(&self, name: &BackendName) -> Result<KubeConnection> {
        let config = match &self.kubeconfig {
            Some(kubeconfig) => {
                let options = KubeConfigOptions {
                    context: Some(name.to_string()),
                    cluster: None,
                    user: None,
                };
                Config::from_custom_kubeconfig(kubeconfig.clone(), &options)
                    .await
                    .with_context(|| format!("failed to load context {name}"))?
            }
            None if name.as_str() == IN_CLUSTER => Config::infer()
                .await
                .context("failed to infer Kubernetes configuration")?,
            None => anyhow::bail!("kubeconfig not found; only {IN_CLUSTER} is available"),
        };

        let default_namespace = config.default_namespace.clone();
        let client = Client::try_from(config).context("failed to initialize Kubernetes client")?;
        let version = client
            .apiserver_version()
            .await
            .context("failed to reach the API server")?;

        Ok(KubeConnection {
            client,
            info: BackendInfo {
                name: name.clone(),
                server_version: version.git_version,
                default_namespace,
            },
        })
    }
}

impl Backend for KubeBackend {
    type Handle = KubeConnection;

    async fn connect(&self, name: &BackendName) -> Result<KubeConnection, BackendError> {
        self.build(name)
            .await
            .map_err(|error| BackendError::connection(name, &error))
    }

    fn describe(&self, handle: &KubeConnection) -> BackendInfo {
        handle.info.clone()
    }

    async fn list(
        &self,
        handle: &KubeConnection,
        kind: ResourceKind,
        scope: &NamespaceScope,
    ) -> Result<Vec<ResourceRow>, BackendError> {
        let rows = match kind {
            ResourceKind::Pods => fetch_pods(handle, scope).await,
            ResourceKind::Deployments => fetch_deployments(handle, scope).await,
        };
        rows.map_err(|error| BackendError::fetch(&handle.info.name, kind, &error))
    }

    async fn pod_detail(&self, handle: &KubeConnection, pod: &PodRef) -> Result<PodDetail> {
        let pods: Api<Pod> = Api::namespaced(handle.client.clone(), &pod.namespace);
        let found = pods
            .get(&pod.name)
            .await
            .with_context(|| format!("pod {}/{} not found", pod.namespace, pod.name))?;
        resolve_container(&found, pod.container.as_deref())
    }

    async fn stream_logs(&self, handle: &KubeConnection, pod: &PodRef) -> Result<LogLines> {
        let pods: Api<Pod> = Api::namespaced(handle.client.clone(), &pod.namespace);
        let params = LogParams {
            container: pod.container.clone(),
            follow: true,
            timestamps: false,
            ..LogParams::default()
        };

        // The log reader borrows its Api, so it lives on a task of its own
        // and hands lines over one at a time.
        let (tx, rx) = mpsc::channel::<Result<String>>(1);
        let name = pod.name.clone();
        let label = pod.to_string();
        tokio::spawn(async move {
            let reader = match pods.log_stream(&name, &params).await {
                Ok(reader) => reader,
                Err(error) => {
                    let _ = tx
                        .send(Err(anyhow::Error::new(error).context("failed to open log stream")))
                        .await;
                    return;
                }
            };
            let mut lines = reader.lines();
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    next = lines.next() => next,
                };
                let Some(line) = next else {
                    break;
                };
                let line = line.context("log read failed");
                let failed = line.is_err();
                if tx.send(line).await.is_err() || failed {
                    break;
                }
            }
            debug!("log reader for {label} finished");
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|line| (line, rx))
        })
        .boxed())
    }
}

/// Picks the requested container, or the first one in the pod spec.
fn resolve_container(pod: &Pod, requested: Option<&str>) -> Result<PodDetail> {
    let name = pod.name_any();
    let spec = pod
        .spec
        .as_ref()
        .with_context(|| format!("pod {name} has no spec"))?;
    let chosen = match requested {
        Some(requested) => spec
            .containers
            .iter()
            .find(|container| container.name == requested)
            .with_context(|| format!("container {requested} is not valid for pod {name}"))?,
        None => spec
            .containers
            .first()
            .with_context(|| format!("pod {name} has no containers"))?,
    };
    Ok(PodDetail {
        container: chosen.name.clone(),
        containers: spec.containers.len(),
        image: chosen.image.clone().unwrap_or_else(|| "-".to_string()),
        node: spec
            .node_name
            .clone()
            .unwrap_or_else(|| "unscheduled".to_string()),
    })
}

fn context_catalog(kubeconfig: &Kubeconfig) -> Vec<ContextEntry> {
    let mut entries = kubeconfig
        .contexts
        .iter()
        .filter_map(|named| {
            let context = named.context.as_ref()?;
            Some(ContextEntry {
                name: BackendName::new(&named.name),
                cluster: context.cluster.clone(),
                default_namespace: context
                    .namespace
                    .clone()
                    .filter(|namespace| !namespace.is_empty())
                    .unwrap_or_else(|| FALLBACK_NAMESPACE.to_string()),
            })
        })
        .collect::<Vec<_>>();

    entries.sort_by(|left, right| left.name.cmp(&right.name));
    entries.dedup_by(|left, right| left.name == right.name);
    entries
}

fn scoped_api<K>(client: &Client, scope: &NamespaceScope) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match scope {
        NamespaceScope::All => Api::all(client.clone()),
        NamespaceScope::Named(namespace) => Api::namespaced(client.clone(), namespace),
    }
}

async fn fetch_pods(handle: &KubeConnection, scope: &NamespaceScope) -> Result<Vec<ResourceRow>> {
    let pods: Api<Pod> = scoped_api(&handle.client, scope);
    let list = pods.list(&list_params()).await?;
    Ok(list
        .into_iter()
        .map(|pod| pod_row(&handle.info.name, &pod))
        .collect())
}

async fn fetch_deployments(
    handle: &KubeConnection,
    scope: &NamespaceScope,
) -> Result<Vec<ResourceRow>> {
    let deployments: Api<Deployment> = scoped_api(&handle.client, scope);
    let list = deployments.list(&list_params()).await?;
    Ok(list
        .into_iter()
        .map(|deployment| deployment_row(&handle.info.name, &deployment))
        .collect())
}

fn pod_row(backend: &BackendName, pod: &Pod) -> ResourceRow {
    let name = pod.name_any();
    let namespace = pod.namespace();
    let (ready, total, restarts) = pod.status.as_ref().map(pod_readiness).unwrap_or((0, 0, 0));

    ResourceRow {
        backend: backend.clone(),
        name: name.clone(),
        namespace: namespace.clone(),
        columns: vec![
            name,
            namespace.unwrap_or_else(|| "-".to_string()),
            pod_status(pod),
            format!("{ready}/{total}"),
            restarts.to_string(),
            human_age(pod.metadata.creation_timestamp.as_ref()),
            backend.to_string(),
        ],
    }
}

fn deployment_row(backend: &BackendName, deployment: &Deployment) -> ResourceRow {
    let name = deployment.name_any();
    let namespace = deployment.namespace();
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let status = deployment.status.as_ref();
    let ready = status.and_then(|status| status.ready_replicas).unwrap_or(0);
    let updated = status
        .and_then(|status| status.updated_replicas)
        .unwrap_or(0);
    let available = status
        .and_then(|status| status.available_replicas)
        .unwrap_or(0);

    ResourceRow {
        backend: backend.clone(),
        name: name.clone(),
        namespace: namespace.clone(),
        columns: vec![
            name,
            namespace.unwrap_or_else(|| "-".to_string()),
            format!("{ready}/{desired}"),
            updated.to_string(),
            available.to_string(),
            human_age(deployment.metadata.creation_timestamp.as_ref()),
            backend.to_string(),
        ],
    }
}

/// Mirrors the STATUS column of `kubectl get pods`: terminating first, then
/// the first container waiting or terminated reason, then the phase.
fn pod_status(pod: &Pod) -> String {
    if pod.metadata.deletion_timestamp.is_some() {
        return "Terminating".to_string();
    }
    let Some(status) = pod.status.as_ref() else {
        return "Unknown".to_string();
    };

    let reason = status
        .container_statuses
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .filter_map(|container| container.state.as_ref())
        .find_map(|state| {
            state
                .waiting
                .as_ref()
                .and_then(|waiting| waiting.reason.clone())
                .or_else(|| {
                    state
                        .terminated
                        .as_ref()
                        .and_then(|terminated| terminated.reason.clone())
                })
        })
        .filter(|reason| !reason.is_empty());

    reason
        .or_else(|| status.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn list_params() -> ListParams {
    ListParams::default().limit(500)
}

fn pod_readiness(status: &PodStatus) -> (usize, usize, i32) {
    let container_statuses = status.container_statuses.as_deref().unwrap_or(&[]);
    let total = container_statuses.len();
    let ready = container_statuses
        .iter()
        .filter(|container| container.ready)
        .count();
    let restarts = container_statuses
        .iter()
        .map(|container| container.restart_count)
        .sum();

    (ready, total, restarts)
}

fn human_age(timestamp: Option<&Time>) -> String {
    let Some(timestamp) = timestamp else {
        return "-".to_string();
    };

    let now = k8s_openapi::jiff::Timestamp::now().as_second();
    format_elapsed_seconds((now - timestamp.0.as_second()).max(0))
}

fn format_elapsed_seconds(seconds: i64) -> String {
    if seconds >= 86_400 {
        return format!("{}d", seconds / 86_400);
    }

    if seconds >= 3_600 {
        return format!("{}h", seconds / 3_600);
    }

    if seconds >= 60 {
        return format!("{}m", seconds / 60);
    }

    format!("{seconds}s")
}
