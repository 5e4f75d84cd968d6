mod app;
mod backend;
mod cli;
mod config;
mod error;
mod input;
mod k8s;
mod model;
mod registry;
mod scheduler;
mod store;
mod stream;
mod ui;

use anyhow::{Context, Result};
use app::App;
use clap::Parser;
use cli::CliArgs;
use config::{Preferences, RuntimeConfig};
use crossterm::event::{
    Event, EventStream, KeyEventKind, KeyboardEnhancementFlags, PopKeyboardEnhancementFlags,
    PushKeyboardEnhancementFlags,
};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
    supports_keyboard_enhancement,
};
use futures::StreamExt;
use k8s::KubeBackend;
use model::NamespaceScope;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use registry::Registry;
use scheduler::{Message, Scheduler};
use std::fs::File;
use std::io::{self, Stdout};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args)?;

    let runtime = RuntimeConfig::load()?;
    if let Some(source) = &runtime.source {
        info!("loaded runtime config from {source}");
    }
    let preferences = runtime.preferences.apply_cli(&args);

    let backend = KubeBackend::load(preferences.kubeconfig_path.as_deref())?;
    let catalog = backend.contexts();
    let default = backend.current_context();
    info!(
        "{} contexts available, default {}",
        catalog.len(),
        default.as_ref().map(|name| name.as_str()).unwrap_or("none")
    );

    let registry = Arc::new(Registry::new(
        Arc::new(backend),
        Duration::from_secs(preferences.connect_timeout_secs),
        default,
    ));
    let scheduler = Scheduler::new(
        registry.clone(),
        Duration::from_secs(preferences.fetch_timeout_secs),
    );
    let mut app = App::new(
        registry.clone(),
        &preferences,
        catalog,
        resolve_namespace_override(&args),
    );

    let startup = if preferences.default_contexts.is_empty() {
        registry
            .current_default()
            .map(|name| vec![name.to_string()])
            .unwrap_or_default()
    } else {
        preferences.default_contexts.clone()
    };
    let commands = app.preselect(&startup);
    scheduler.dispatch_all(commands);

    run(&mut app, scheduler, &preferences).await
}

fn init_tracing(args: &CliArgs) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .compact();

    // The terminal belongs to the UI, so output goes to a file or nowhere.
    let _ = match &args.log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder.with_writer(Mutex::new(file)).try_init()
        }
        None => builder.with_writer(io::sink).try_init(),
    };

    Ok(())
}

fn resolve_namespace_override(args: &CliArgs) -> Option<NamespaceScope> {
    if args.all_namespaces {
        if args.namespace.is_some() {
            warn!("both --all-namespaces and --namespace were provided, using all namespaces");
        }
        return Some(NamespaceScope::All);
    }
    args.namespace
        .as_deref()
        .map(|namespace| NamespaceScope::Named(namespace.to_string()))
}

async fn run(
    app: &mut App<KubeBackend>,
    scheduler: Scheduler<KubeBackend>,
    preferences: &Preferences,
) -> Result<()> {
    let (mut terminal, keyboard_enhanced) = init_terminal()?;
    let run_result = run_loop(&mut terminal, app, scheduler, preferences).await;
    app.shutdown();
    let restore_result = restore_terminal(&mut terminal, keyboard_enhanced);

    match (run_result, restore_result) {
        (Err(run_error), Err(restore_error)) => Err(anyhow::anyhow!(
            "{run_error:#}\nterminal restore error: {restore_error:#}"
        )),
        (Err(error), _) => Err(error),
        (_, Err(error)) => Err(error),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn init_terminal() -> Result<(TuiTerminal, bool)> {
    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    let keyboard_enhanced = matches!(supports_keyboard_enhancement(), Ok(true));
    if keyboard_enhanced {
        execute!(
            stdout,
            EnterAlternateScreen,
            PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES)
        )
        .context("failed to enter alternate screen with keyboard enhancement")?;
    } else {
        execute!(stdout, EnterAlternateScreen).context("failed to enter alternate screen")?;
    }
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("failed to create terminal backend")?;
    terminal.clear().context("failed to clear terminal")?;
    Ok((terminal, keyboard_enhanced))
}

fn restore_terminal(terminal: &mut TuiTerminal, keyboard_enhanced: bool) -> Result<()> {
    if keyboard_enhanced {
        execute!(terminal.backend_mut(), PopKeyboardEnhancementFlags)
            .context("failed to pop keyboard enhancement flags")?;
    }
    disable_raw_mode().context("failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("failed to leave alternate screen")?;
    terminal.show_cursor().context("failed to show cursor")?;
    Ok(())
}

async fn run_loop(
    terminal: &mut TuiTerminal,
    app: &mut App<KubeBackend>,
    mut scheduler: Scheduler<KubeBackend>,
    preferences: &Preferences,
) -> Result<()> {
    let mut reader = EventStream::new();
    let refresh_enabled = preferences.refresh_interval_secs > 0;
    let mut ticker = interval(Duration::from_secs(preferences.refresh_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; startup already dispatched fetches.
    ticker.tick().await;

    loop {
        terminal
            .draw(|frame| ui::render(frame, app))
            .context("failed to render terminal frame")?;

        if !app.running() {
            break;
        }

        tokio::select! {
            maybe_event = reader.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        if let Some(action) = input::map_key(app.mode(), key) {
                            debug!("action={action:?}");
                            let commands = app.apply_action(action);
                            scheduler.dispatch_all(commands);
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        app.set_status(format!("terminal event error: {error}"));
                    }
                    None => {
                        app.set_status("terminal event stream closed");
                        break;
                    }
                }
            }
            maybe_message = scheduler.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };
                let mut commands = app.update(message);
                // Drain what is already queued so one redraw covers a burst.
                while let Some(message) = scheduler.try_recv() {
                    commands.extend(app.update(message));
                }
                scheduler.dispatch_all(commands);
            }
            _ = ticker.tick(), if refresh_enabled => {
                let commands = app.update(Message::RefreshDue);
                scheduler.dispatch_all(commands);
            }
        }
    }

    Ok(())
}
