use crate::backend::{Backend, BackendInfo};
use crate::config::Preferences;
use crate::input::Action;
use crate::model::{
    BackendName, ContextEntry, NamespaceScope, PaneId, PodRef, ResourceKind, ResourceRow,
};
use crate::registry::Registry;
use crate::scheduler::{Command, Message};
use crate::store::{ResourceStore, Snapshot};
use crate::stream::{PaneLog, PaneStatus, StreamRouter};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SLOW_REDUCE: Duration = Duration::from_millis(16);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InputMode {
    Normal,
    Filter,
    Namespace,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Focus {
    Contexts,
    Table,
    Panes,
}

impl Focus {
    fn next(self) -> Self {
        match self {
            Self::Contexts => Self::Table,
            Self::Table => Self::Panes,
            Self::Panes => Self::Contexts,
        }
    }
}

/// Application state owned by the reducer.
///
/// `update` is the only entry point for scheduler results and selection
/// events; `apply_action` turns key actions into local state changes or
/// into messages that go through `update` as well.
pub struct App<B: Backend> {
    running: bool,
    mode: InputMode,
    focus: Focus,
    show_help: bool,
    status: String,
    filter: String,
    input: String,
    kind: ResourceKind,
    selected: HashMap<ResourceKind, usize>,
    table_page_size: usize,
    catalog: Vec<ContextEntry>,
    context_cursor: usize,
    marked: BTreeSet<BackendName>,
    namespace_override: Option<NamespaceScope>,
    scopes: HashMap<BackendName, NamespaceScope>,
    infos: HashMap<BackendName, BackendInfo>,
    last_request: u64,
    connect_requests: HashMap<BackendName, u64>,
    fetch_requests: HashMap<(BackendName, ResourceKind), u64>,
    store: Arc<ResourceStore>,
    registry: Arc<Registry<B>>,
    router: StreamRouter<B>,
    panes: Vec<PaneLog>,
    active_pane: usize,
    show_timestamps: bool,
}

impl<B: Backend> App<B> {
    pub fn new(
        registry: Arc<Registry<B>>,
        preferences: &Preferences,
        catalog: Vec<ContextEntry>,
        namespace_override: Option<NamespaceScope>,
    ) -> Self {
        let panes = (0..preferences.panes.max(1))
            .map(|index| {
                PaneLog::new(
                    PaneId(index),
                    preferences.max_log_lines,
                    preferences.follow_by_default,
                )
            })
            .collect();
        let context_cursor = registry
            .current_default()
            .and_then(|default| catalog.iter().position(|entry| &entry.name == default))
            .unwrap_or(0);

        Self {
            running: true,
            mode: InputMode::Normal,
            focus: Focus::Contexts,
            show_help: false,
            status: "Ready".to_string(),
            filter: String::new(),
            input: String::new(),
            kind: ResourceKind::Pods,
            selected: HashMap::new(),
            table_page_size: 10,
            catalog,
            context_cursor,
            marked: BTreeSet::new(),
            namespace_override,
            scopes: HashMap::new(),
            infos: HashMap::new(),
            last_request: 0,
            connect_requests: HashMap::new(),
            fetch_requests: HashMap::new(),
            store: Arc::new(ResourceStore::new()),
            router: StreamRouter::new(registry.clone(), preferences.stream_queue_depth),
            registry,
            panes,
            active_pane: 0,
            show_timestamps: preferences.show_timestamps,
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn focus(&self) -> Focus {
        self.focus
    }

    pub fn show_help(&self) -> bool {
        self.show_help
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn catalog(&self) -> &[ContextEntry] {
        &self.catalog
    }

    pub fn context_cursor(&self) -> usize {
        self.context_cursor
    }

    pub fn is_marked(&self, name: &BackendName) -> bool {
        self.marked.contains(name)
    }

    pub fn info(&self, name: &BackendName) -> Option<&BackendInfo> {
        self.infos.get(name)
    }

    pub fn scope(&self, name: &BackendName) -> NamespaceScope {
        self.scopes
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_scope(name))
    }

    pub fn panes(&self) -> &[PaneLog] {
        &self.panes
    }

    pub fn active_pane(&self) -> usize {
        self.active_pane
    }

    pub fn live_streams(&self) -> usize {
        self.router.active_panes()
    }

    pub fn show_timestamps(&self) -> bool {
        self.show_timestamps
    }

    pub fn default_backend(&self) -> Option<&BackendName> {
        self.registry.current_default()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.store.snapshot()
    }

    pub fn visible_rows<'a>(&self, snapshot: &'a Snapshot) -> Vec<&'a ResourceRow> {
        snapshot
            .rows(self.kind)
            .iter()
            .filter(|row| row.matches_filter(&self.filter))
            .collect()
    }

    pub fn selected_index(&self) -> usize {
        self.selected.get(&self.kind).copied().unwrap_or(0)
    }

    pub fn set_table_page_size(&mut self, rows: usize) {
        self.table_page_size = rows.max(1);
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = normalize_status_text(status.into());
    }

    /// Commands that bring up the contexts requested on startup.
    pub fn preselect(&mut self, contexts: &[String]) -> Vec<Command> {
        let known = contexts
            .iter()
            .filter_map(|name| {
                let found = self
                    .catalog
                    .iter()
                    .any(|entry| entry.name.as_str() == name.as_str());
                if !found {
                    warn!("context {name} is not in kubeconfig, skipping");
                }
                found.then(|| BackendName::new(name))
            })
            .collect::<Vec<_>>();
        if known.is_empty() {
            return Vec::new();
        }
        self.marked.extend(known.iter().cloned());
        self.update(Message::BackendsChanged {
            selected: known,
            deselected: Vec::new(),
        })
    }

    /// Stops every producer. Called once when the event loop exits.
    pub fn shutdown(&mut self) {
        self.router.shutdown();
    }

    pub fn update(&mut self, message: Message) -> Vec<Command> {
        let started = Instant::now();
        let label = message_label(&message);
        let commands = self.reduce(message);
        let elapsed = started.elapsed();
        if elapsed > SLOW_REDUCE {
            debug!(
                "slow reduce: {label} took {}ms and produced {} commands",
                elapsed.as_millis(),
                commands.len()
            );
        }
        commands
    }

    fn reduce(&mut self, message: Message) -> Vec<Command> {
        match message {
            Message::Connected {
                backend,
                request,
                result,
            } => self.on_connected(backend, request, result),
            Message::RowsFetched {
                backend,
                kind,
                request,
                result,
            } => {
                self.on_rows_fetched(backend, kind, request, result);
                Vec::new()
            }
            Message::StreamChunk {
                pane,
                generation,
                events,
            } => self.on_stream_chunk(pane, generation, events),
            Message::StreamClosed { pane, generation } => {
                if self.router.is_current(pane, generation) {
                    self.router.stop_stream(pane);
                    if let Some(log) = self.panes.get_mut(pane.0) {
                        log.close(generation);
                    }
                }
                Vec::new()
            }
            Message::BackendsChanged {
                selected,
                deselected,
            } => self.on_backends_changed(selected, deselected),
            Message::PodChosen { pane, pod } => self.start_pane(pane, pod),
            Message::PaneCleared { pane } => {
                self.router.stop_stream(pane);
                if let Some(log) = self.panes.get_mut(pane.0) {
                    log.reset();
                }
                Vec::new()
            }
            Message::ErrorsCleared => {
                let cleared = self.store.clear_errors();
                self.set_status(format!("Cleared {cleared} errors"));
                Vec::new()
            }
            Message::RefreshDue => self.refresh_commands(false),
        }
    }

    fn on_connected(
        &mut self,
        backend: BackendName,
        request: u64,
        result: Result<BackendInfo, crate::error::BackendError>,
    ) -> Vec<Command> {
        if !self.store.is_selected(&backend) {
            debug!("ignoring connect result for deselected {backend}");
            return Vec::new();
        }
        if self.connect_requests.get(&backend) != Some(&request) {
            debug!("dropping superseded connect #{request} for {backend}");
            return Vec::new();
        }

        match result {
            Ok(info) => {
                self.set_status(format!(
                    "Connected to {backend} ({})",
                    info.server_version
                ));
                self.infos.insert(backend.clone(), info);
                self.fetch_commands(&backend, true)
            }
            Err(error) => {
                self.infos.remove(&backend);
                for kind in ResourceKind::ALL {
                    self.store.set_error(&backend, kind, error.summary());
                }
                self.set_status(error.to_string());
                Vec::new()
            }
        }
    }

    /// Only the latest fetch issued for a (backend, kind) pair may land; an
    /// older one still in flight after a scope change or reselect is dropped.
    fn on_rows_fetched(
        &mut self,
        backend: BackendName,
        kind: ResourceKind,
        request: u64,
        result: Result<Vec<ResourceRow>, crate::error::BackendError>,
    ) {
        if self.fetch_requests.get(&(backend.clone(), kind)) != Some(&request) {
            debug!("dropping superseded fetch #{request} of {kind} on {backend}");
            return;
        }
        match result {
            Ok(rows) => {
                let count = rows.len();
                if self.store.set_rows(&backend, kind, rows) {
                    debug!("{backend}: {count} {kind}");
                    self.clamp_selection();
                }
            }
            Err(error) => {
                if self.store.set_error(&backend, kind, error.summary()) {
                    self.set_status(error.to_string());
                }
            }
        }
    }

    fn on_backends_changed(
        &mut self,
        selected: Vec<BackendName>,
        deselected: Vec<BackendName>,
    ) -> Vec<Command> {
        for backend in &deselected {
            if !self.store.remove_backend(backend) {
                continue;
            }
            info!("deselected {backend}");
            self.infos.remove(backend);
            self.forget_requests(backend);
            let streaming = self
                .panes
                .iter()
                .filter(|log| log.pod.as_ref().is_some_and(|pod| &pod.backend == backend))
                .map(|log| log.id)
                .collect::<Vec<_>>();
            for pane in streaming {
                self.router.stop_stream(pane);
                self.panes[pane.0].reset();
            }
        }

        let mut commands = Vec::new();
        for backend in selected {
            if !self.store.add_backend(&backend) {
                continue;
            }
            info!("selected {backend} ({})", self.scope(&backend));
            for kind in ResourceKind::ALL {
                self.store.set_loading(&backend, kind, true);
            }
            let request = self.issue_connect(&backend);
            commands.push(Command::Connect { backend, request });
        }
        self.clamp_selection();
        commands
    }

    fn on_stream_chunk(
        &mut self,
        pane: PaneId,
        generation: u64,
        events: Vec<crate::stream::StreamEvent>,
    ) -> Vec<Command> {
        if !self.router.is_current(pane, generation) {
            debug!(
                "{pane}: dropping {} events from stale generation {generation}",
                events.len()
            );
            return Vec::new();
        }
        let Some(log) = self.panes.get_mut(pane.0) else {
            return Vec::new();
        };

        log.apply(events);
        match &log.status {
            PaneStatus::Starting | PaneStatus::Streaming => self
                .router
                .inbox(pane)
                .map(|inbox| vec![Command::ReadStream { inbox }])
                .unwrap_or_default(),
            PaneStatus::Failed(message) => {
                let status = format!("{pane}: log stream failed: {message}");
                self.router.stop_stream(pane);
                self.set_status(status);
                Vec::new()
            }
            PaneStatus::Ended | PaneStatus::Empty => {
                self.router.stop_stream(pane);
                Vec::new()
            }
        }
    }

    fn start_pane(&mut self, pane: PaneId, pod: PodRef) -> Vec<Command> {
        if pane.0 >= self.panes.len() {
            warn!("{pane} does not exist");
            return Vec::new();
        }
        if !self.store.is_selected(&pod.backend) {
            self.set_status(format!("{} is not selected", pod.backend));
            return Vec::new();
        }

        let (handle, inbox) = self.router.start_stream(pane, pod.clone());
        self.panes[pane.0].begin(pod.clone(), handle.generation);
        self.set_status(format!("{pane}: following {pod}"));
        vec![Command::ReadStream { inbox }]
    }

    /// One fetch per tracked kind. Without `force`, kinds still loading are
    /// skipped so a slow backend does not pile up requests.
    fn fetch_commands(&mut self, backend: &BackendName, force: bool) -> Vec<Command> {
        let scope = self.scope(backend);
        let mut commands = Vec::new();
        for kind in ResourceKind::ALL {
            if !force && self.store.is_loading(backend, kind) {
                continue;
            }
            self.store.set_loading(backend, kind, true);
            let request = self.next_request();
            self.fetch_requests.insert((backend.clone(), kind), request);
            commands.push(Command::Fetch {
                backend: backend.clone(),
                kind,
                scope: scope.clone(),
                request,
            });
        }
        commands
    }

    fn next_request(&mut self) -> u64 {
        self.last_request += 1;
        self.last_request
    }

    fn issue_connect(&mut self, backend: &BackendName) -> u64 {
        let request = self.next_request();
        self.connect_requests.insert(backend.clone(), request);
        request
    }

    fn forget_requests(&mut self, backend: &BackendName) {
        self.connect_requests.remove(backend);
        self.fetch_requests.retain(|(tracked, _), _| tracked != backend);
    }

    fn refresh_commands(&mut self, force: bool) -> Vec<Command> {
        let connected = self
            .store
            .selected()
            .into_iter()
            .filter(|backend| self.infos.contains_key(backend))
            .collect::<Vec<_>>();
        connected
            .iter()
            .flat_map(|backend| self.fetch_commands(backend, force))
            .collect()
    }

    fn default_scope(&self, name: &BackendName) -> NamespaceScope {
        if let Some(scope) = &self.namespace_override {
            return scope.clone();
        }
        if let Some(info) = self.infos.get(name) {
            return NamespaceScope::Named(info.default_namespace.clone());
        }
        self.catalog
            .iter()
            .find(|entry| &entry.name == name)
            .map(|entry| NamespaceScope::Named(entry.default_namespace.clone()))
            .unwrap_or_else(|| NamespaceScope::Named("default".to_string()))
    }

    pub fn apply_action(&mut self, action: Action) -> Vec<Command> {
        if self.show_help && !matches!(action, Action::ToggleHelp) {
            self.show_help = false;
        }

        match action {
            Action::Quit => {
                self.running = false;
                self.status = "Exit requested".to_string();
                Vec::new()
            }
            Action::Down => {
                self.move_cursor(1);
                Vec::new()
            }
            Action::Up => {
                self.move_cursor(-1);
                Vec::new()
            }
            Action::PageDown => {
                self.move_cursor(self.table_page_size as isize);
                Vec::new()
            }
            Action::PageUp => {
                self.move_cursor(-(self.table_page_size as isize));
                Vec::new()
            }
            Action::Top => {
                self.move_cursor(isize::MIN / 2);
                Vec::new()
            }
            Action::Bottom => {
                self.move_cursor(isize::MAX / 2);
                Vec::new()
            }
            Action::NextKind => {
                self.kind = self.kind.next();
                self.clamp_selection();
                Vec::new()
            }
            Action::PrevKind => {
                self.kind = self.kind.previous();
                self.clamp_selection();
                Vec::new()
            }
            Action::CycleFocus => {
                self.focus = self.focus.next();
                Vec::new()
            }
            Action::ToggleHelp => {
                self.show_help = !self.show_help;
                Vec::new()
            }
            Action::ToggleMark => {
                if let Some(entry) = self.catalog.get(self.context_cursor) {
                    let name = entry.name.clone();
                    if !self.marked.remove(&name) {
                        self.marked.insert(name);
                    }
                }
                Vec::new()
            }
            Action::Activate => match self.focus {
                Focus::Contexts => self.apply_marks(),
                Focus::Table | Focus::Panes => self.open_selected_in_active_pane(),
            },
            Action::SelectPane(number) => {
                let index = usize::from(number).saturating_sub(1);
                if index < self.panes.len() {
                    self.active_pane = index;
                    self.set_status(format!("Active {}", PaneId(index)));
                }
                Vec::new()
            }
            Action::ToggleFollow => {
                let pane = self.active_pane;
                let follow = self.panes[pane].toggle_follow();
                self.set_status(format!(
                    "{}: follow {}",
                    PaneId(pane),
                    if follow { "on" } else { "off" }
                ));
                Vec::new()
            }
            Action::ClearPaneBuffer => {
                self.panes[self.active_pane].clear_buffer();
                Vec::new()
            }
            Action::StopStream => self.update(Message::PaneCleared {
                pane: PaneId(self.active_pane),
            }),
            Action::ToggleTimestamps => {
                self.show_timestamps = !self.show_timestamps;
                Vec::new()
            }
            Action::Refresh => {
                let commands = self.refresh_commands(false);
                self.set_status(format!("Refreshing ({} fetches)", commands.len()));
                commands
            }
            Action::Reconnect => self.reconnect_target(),
            Action::ClearErrors => self.update(Message::ErrorsCleared),
            Action::StartFilter => {
                self.mode = InputMode::Filter;
                self.input = self.filter.clone();
                Vec::new()
            }
            Action::StartNamespace => {
                self.mode = InputMode::Namespace;
                self.input.clear();
                Vec::new()
            }
            Action::ClearFilter => {
                self.filter.clear();
                self.clamp_selection();
                Vec::new()
            }
            Action::SubmitInput => self.submit_input(),
            Action::CancelInput => {
                self.mode = InputMode::Normal;
                self.input.clear();
                Vec::new()
            }
            Action::Backspace => {
                self.input.pop();
                if self.mode == InputMode::Filter {
                    self.filter = self.input.clone();
                    self.clamp_selection();
                }
                Vec::new()
            }
            Action::InputChar(c) => {
                self.input.push(c);
                if self.mode == InputMode::Filter {
                    self.filter = self.input.clone();
                    self.clamp_selection();
                }
                Vec::new()
            }
        }
    }

    /// Turns the marked set into one selection change: everything selected
    /// but unmarked is dropped, everything marked but unselected is added.
    fn apply_marks(&mut self) -> Vec<Command> {
        let current = self.store.selected();
        let deselected = current
            .iter()
            .filter(|name| !self.marked.contains(*name))
            .cloned()
            .collect::<Vec<_>>();
        let selected = self
            .catalog
            .iter()
            .map(|entry| entry.name.clone())
            .filter(|name| self.marked.contains(name) && !current.contains(name))
            .collect::<Vec<_>>();

        if selected.is_empty() && deselected.is_empty() {
            self.set_status("Selection unchanged");
            return Vec::new();
        }
        self.set_status(format!(
            "Selecting {} and dropping {} contexts",
            selected.len(),
            deselected.len()
        ));
        self.update(Message::BackendsChanged {
            selected,
            deselected,
        })
    }

    fn open_selected_in_active_pane(&mut self) -> Vec<Command> {
        if self.kind != ResourceKind::Pods {
            self.set_status("Logs are available for pods only");
            return Vec::new();
        }
        let snapshot = self.store.snapshot();
        let pod = self
            .visible_rows(&snapshot)
            .get(self.selected_index())
            .and_then(|row| PodRef::from_row(row));
        let Some(pod) = pod else {
            self.set_status("No pod selected");
            return Vec::new();
        };
        self.update(Message::PodChosen {
            pane: PaneId(self.active_pane),
            pod,
        })
    }

    fn reconnect_target(&mut self) -> Vec<Command> {
        let target = match self.focus {
            Focus::Contexts => self
                .catalog
                .get(self.context_cursor)
                .map(|entry| entry.name.clone()),
            Focus::Table | Focus::Panes => {
                let snapshot = self.store.snapshot();
                self.visible_rows(&snapshot)
                    .get(self.selected_index())
                    .map(|row| row.backend.clone())
            }
        };
        let Some(backend) = target.or_else(|| self.registry.current_default().cloned()) else {
            self.set_status("Nothing to reconnect");
            return Vec::new();
        };
        if !self.store.is_selected(&backend) {
            self.set_status(format!("{backend} is not selected"));
            return Vec::new();
        }

        self.infos.remove(&backend);
        self.forget_requests(&backend);
        for kind in ResourceKind::ALL {
            self.store.set_loading(&backend, kind, true);
        }
        self.set_status(format!("Reconnecting {backend}"));
        let request = self.issue_connect(&backend);
        vec![Command::Reconnect { backend, request }]
    }

    fn submit_input(&mut self) -> Vec<Command> {
        let mode = self.mode;
        let input = std::mem::take(&mut self.input);
        self.mode = InputMode::Normal;
        match mode {
            InputMode::Normal => Vec::new(),
            InputMode::Filter => {
                self.filter = input.trim().to_string();
                self.clamp_selection();
                Vec::new()
            }
            InputMode::Namespace => {
                let scope = NamespaceScope::parse(&input);
                let targets = match self.focus {
                    Focus::Contexts => self
                        .catalog
                        .get(self.context_cursor)
                        .map(|entry| vec![entry.name.clone()])
                        .unwrap_or_default(),
                    Focus::Table | Focus::Panes => self.store.selected(),
                };
                let mut commands = Vec::new();
                for backend in targets {
                    self.scopes.insert(backend.clone(), scope.clone());
                    if self.infos.contains_key(&backend) {
                        commands.extend(self.fetch_commands(&backend, true));
                    }
                }
                self.set_status(format!("Namespace {scope}"));
                commands
            }
        }
    }

    fn move_cursor(&mut self, delta: isize) {
        match self.focus {
            Focus::Contexts => {
                self.context_cursor = step(self.context_cursor, delta, self.catalog.len());
            }
            Focus::Table => {
                let snapshot = self.store.snapshot();
                let len = self.visible_rows(&snapshot).len();
                let next = step(self.selected_index(), delta, len);
                self.selected.insert(self.kind, next);
            }
            Focus::Panes => {
                let clamped = delta.clamp(-(u16::MAX as isize), u16::MAX as isize);
                self.panes[self.active_pane].scroll_by(clamped);
            }
        }
    }

    fn clamp_selection(&mut self) {
        let snapshot = self.store.snapshot();
        let len = self.visible_rows(&snapshot).len();
        let current = self.selected_index();
        self.selected
            .insert(self.kind, current.min(len.saturating_sub(1)));
    }
}

fn step(current: usize, delta: isize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let max_index = len.saturating_sub(1) as isize;
    let current = current.min(max_index as usize) as isize;
    current.saturating_add(delta).clamp(0, max_index) as usize
}

fn message_label(message: &Message) -> &'static str {
    match message {
        Message::Connected { .. } => "connected",
        Message::RowsFetched { .. } => "rows-fetched",
        Message::StreamChunk { .. } => "stream-chunk",
        Message::StreamClosed { .. } => "stream-closed",
        Message::BackendsChanged { .. } => "backends-changed",
        Message::PodChosen { .. } => "pod-chosen",
        Message::PaneCleared { .. } => "pane-cleared",
        Message::ErrorsCleared => "errors-cleared",
        Message::RefreshDue => "refresh-due",
    }
}

fn normalize_status_text(status: String) -> String {
    const MAX_STATUS_LEN: usize = 180;
    let status = status
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
        .unwrap_or(status);
    if status.chars().count() <= MAX_STATUS_LEN {
        return status;
    }

    let mut shortened = status
        .chars()
        .take(MAX_STATUS_LEN.saturating_sub(1))
        .collect::<String>();
    shortened.push('…');
    shortened
}
