use chrono::{DateTime, Local};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Name of one independently reachable backend (a kubeconfig context).
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BackendName(Arc<str>);

impl BackendName {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BackendName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for BackendName {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// One selectable backend as listed in kubeconfig.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ContextEntry {
    pub name: BackendName,
    pub cluster: String,
    pub default_namespace: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ResourceKind {
    Pods,
    Deployments,
}

impl ResourceKind {
    pub const ALL: [Self; 2] = [Self::Pods, Self::Deployments];

    pub fn title(self) -> &'static str {
        match self {
            Self::Pods => "Pods",
            Self::Deployments => "Deployments",
        }
    }

    pub fn short_token(self) -> &'static str {
        match self {
            Self::Pods => "po",
            Self::Deployments => "deploy",
        }
    }

    pub fn headers(self) -> Vec<String> {
        let headers: &[&str] = match self {
            Self::Pods => &[
                "Name",
                "Namespace",
                "Status",
                "Ready",
                "Restarts",
                "Age",
                "Context",
            ],
            Self::Deployments => &[
                "Name",
                "Namespace",
                "Ready",
                "Up-to-date",
                "Available",
                "Age",
                "Context",
            ],
        };
        headers.iter().map(|header| header.to_string()).collect()
    }

    pub fn next(self) -> Self {
        let index = Self::ALL.iter().position(|kind| *kind == self).unwrap_or(0);
        Self::ALL[(index + 1) % Self::ALL.len()]
    }

    pub fn previous(self) -> Self {
        let index = Self::ALL.iter().position(|kind| *kind == self).unwrap_or(0);
        Self::ALL[(index + Self::ALL.len() - 1) % Self::ALL.len()]
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.title())
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum NamespaceScope {
    All,
    Named(String),
}

impl NamespaceScope {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "all" | "*" | "-A" => Self::All,
            namespace => Self::Named(namespace.to_string()),
        }
    }
}

impl Display for NamespaceScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Named(namespace) => write!(f, "{namespace}"),
        }
    }
}

/// One fetched item of one resource kind from one backend.
///
/// Rows are never patched: a later fetch replaces the whole row set for its
/// (backend, kind) pair.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResourceRow {
    pub backend: BackendName,
    pub name: String,
    pub namespace: Option<String>,
    pub columns: Vec<String>,
}

impl ResourceRow {
    pub fn matches_filter(&self, query: &str) -> bool {
        let query = query.trim();
        if query.is_empty() {
            return true;
        }

        let query_lower = query.to_ascii_lowercase();

        if self.name.to_ascii_lowercase().contains(&query_lower) {
            return true;
        }

        if let Some(namespace) = &self.namespace
            && namespace.to_ascii_lowercase().contains(&query_lower)
        {
            return true;
        }

        self.columns
            .iter()
            .any(|column| column.to_ascii_lowercase().contains(&query_lower))
    }
}

/// Address of one pod (and optionally one container) on one backend.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PodRef {
    pub backend: BackendName,
    pub namespace: String,
    pub name: String,
    pub container: Option<String>,
}

impl PodRef {
    pub fn from_row(row: &ResourceRow) -> Option<Self> {
        let namespace = row.namespace.clone()?;
        Some(Self {
            backend: row.backend.clone(),
            namespace,
            name: row.name.clone(),
            container: None,
        })
    }
}

impl Display for PodRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.backend, self.namespace, self.name)?;
        if let Some(container) = &self.container {
            write!(f, ":{container}")?;
        }
        Ok(())
    }
}

/// What a pod lookup resolved before its logs were opened.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PodDetail {
    pub container: String,
    pub containers: usize,
    pub image: String,
    pub node: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PaneId(pub usize);

impl Display for PaneId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "pane {}", self.0)
    }
}

/// A single log line produced by a pane's current stream.
///
/// `seq` starts at 1 for every new stream generation and strictly increases.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogLine {
    pub pane: PaneId,
    pub generation: u64,
    pub seq: u64,
    pub text: String,
    pub received_at: DateTime<Local>,
}

#[cfg(test)]
mod tests {
    use super::{BackendName, NamespaceScope, PodRef, ResourceKind, ResourceRow};

    fn row(name: &str, namespace: Option<&str>) -> ResourceRow {
        ResourceRow {
            backend: BackendName::new("alpha"),
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
            columns: vec![name.to_string(), "Running".to_string()],
        }
    }

    #[test]
    fn kind_cycling_wraps_around() {
        assert_eq!(ResourceKind::Pods.next(), ResourceKind::Deployments);
        assert_eq!(ResourceKind::Deployments.next(), ResourceKind::Pods);
        assert_eq!(ResourceKind::Pods.previous(), ResourceKind::Deployments);
    }

    #[test]
    fn headers_end_with_context_column() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.headers().last().map(String::as_str), Some("Context"));
        }
    }

    #[test]
    fn namespace_scope_parses_all_aliases() {
        assert_eq!(NamespaceScope::parse("all"), NamespaceScope::All);
        assert_eq!(NamespaceScope::parse(" "), NamespaceScope::All);
        assert_eq!(
            NamespaceScope::parse("kube-system"),
            NamespaceScope::Named("kube-system".to_string())
        );
    }

    #[test]
    fn row_filter_matches_name_namespace_and_columns() {
        let row = row("web-1", Some("shop"));
        assert!(row.matches_filter(""));
        assert!(row.matches_filter("WEB"));
        assert!(row.matches_filter("sho"));
        assert!(row.matches_filter("running"));
        assert!(!row.matches_filter("billing"));
    }

    #[test]
    fn pod_ref_requires_namespace() {
        assert!(PodRef::from_row(&row("node-1", None)).is_none());
        let pod = PodRef::from_row(&row("web-1", Some("shop"))).expect("pod ref");
        assert_eq!(pod.to_string(), "alpha:shop/web-1");
    }
}
