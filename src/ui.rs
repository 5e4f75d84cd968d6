use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, TableState, Wrap};
use std::ops::Range;

use crate::app::{App, Focus, InputMode};
use crate::backend::Backend;
use crate::model::{ContextEntry, ResourceKind};
use crate::store::Snapshot;
use crate::stream::{PaneLog, PaneStatus};

const BG: Color = Color::Rgb(9, 15, 25);
const PANEL: Color = Color::Rgb(16, 27, 44);
const ACCENT: Color = Color::Rgb(52, 211, 153);
const MUTED: Color = Color::Rgb(140, 156, 178);
const WARN: Color = Color::Rgb(251, 191, 36);
const ERROR: Color = Color::Rgb(248, 113, 113);
const PL_A: Color = Color::Rgb(17, 94, 89);
const PL_B: Color = Color::Rgb(30, 64, 175);
const PL_C: Color = Color::Rgb(55, 48, 163);

const CONTEXTS_WIDTH: u16 = 34;

pub fn render<B: Backend>(frame: &mut Frame, app: &mut App<B>) {
    let snapshot = app.snapshot();
    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(6),
            Constraint::Length(1),
        ])
        .split(frame.area());

    render_header(frame, root[0], app, &snapshot);
    render_body(frame, root[1], app, &snapshot);
    render_footer(frame, root[2], app);

    if app.show_help() {
        render_help_modal(frame, app);
    }
}

fn render_header<B: Backend>(frame: &mut Frame, area: Rect, app: &App<B>, snapshot: &Snapshot) {
    let mut spans = Vec::new();
    push_powerline_segment(&mut spans, " ktails ", Color::White, PL_A, PL_B);
    let tabs = ResourceKind::ALL
        .iter()
        .map(|kind| {
            if *kind == app.kind() {
                format!("[{}]", kind.short_token())
            } else {
                kind.short_token().to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    push_powerline_segment(&mut spans, format!(" {tabs} "), Color::White, PL_B, PL_C);
    push_powerline_segment(
        &mut spans,
        format!(
            " {} selected, {} streams ",
            snapshot.backends.len(),
            app.live_streams()
        ),
        Color::White,
        PL_C,
        BG,
    );
    if snapshot.any_loading() {
        spans.push(Span::styled(" loading…", Style::default().fg(WARN).bg(BG)));
    }
    let errors = snapshot.errors.values().map(|kinds| kinds.len()).sum::<usize>();
    if errors > 0 {
        spans.push(Span::styled(
            format!(" {errors} errors (ctrl+e clears)"),
            Style::default().fg(ERROR).bg(BG),
        ));
    }

    let right = app
        .default_backend()
        .map(|name| format!("default {} ", compact_text(name.as_str(), 24)))
        .unwrap_or_default();
    let right_width = right.chars().count() as u16;
    if right_width == 0 || right_width + 40 >= area.width {
        frame.render_widget(
            Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
            area,
        );
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(1), Constraint::Length(right_width)])
        .split(area);
    frame.render_widget(
        Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
        chunks[0],
    );
    frame.render_widget(
        Paragraph::new(right).style(Style::default().bg(BG).fg(MUTED)),
        chunks[1],
    );
}

fn render_body<B: Backend>(frame: &mut Frame, area: Rect, app: &mut App<B>, snapshot: &Snapshot) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(CONTEXTS_WIDTH), Constraint::Min(20)])
        .split(area);
    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(45), Constraint::Min(4)])
        .split(columns[1]);

    app.set_table_page_size(table_rows_visible(right[0]));

    render_contexts(frame, columns[0], app, snapshot);
    render_table(frame, right[0], app, snapshot);
    render_panes(frame, right[1], app);
}

fn render_contexts<B: Backend>(frame: &mut Frame, area: Rect, app: &App<B>, snapshot: &Snapshot) {
    let focused = app.focus() == Focus::Contexts;
    let rows = app.catalog().iter().map(|entry| {
        let (state, color) = context_state(app, snapshot, entry);
        let mark = if app.is_marked(&entry.name) { "[x]" } else { "[ ]" };
        Row::new(vec![
            Cell::from(mark).style(Style::default().fg(MUTED)),
            Cell::from(compact_text(entry.name.as_str(), 18)).style(Style::default().fg(Color::White)),
            Cell::from(state).style(Style::default().fg(color)),
        ])
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(9),
        ],
    )
    .block(panel_block("Contexts".to_string(), focused))
    .column_spacing(1)
    .row_highlight_style(
        Style::default()
            .bg(Color::Rgb(24, 36, 58))
            .add_modifier(Modifier::BOLD),
    );

    let mut state = TableState::default();
    if !app.catalog().is_empty() {
        state.select(Some(app.context_cursor()));
    }
    frame.render_stateful_widget(table, area, &mut state);
}

fn context_state<B: Backend>(
    app: &App<B>,
    snapshot: &Snapshot,
    entry: &ContextEntry,
) -> (String, Color) {
    if !snapshot.backends.contains(&entry.name) {
        return (String::new(), MUTED);
    }
    if snapshot.error(&entry.name).is_some() {
        return ("error".to_string(), ERROR);
    }
    if ResourceKind::ALL
        .iter()
        .any(|kind| snapshot.is_loading(&entry.name, *kind))
    {
        return ("loading".to_string(), WARN);
    }
    match app.info(&entry.name) {
        Some(info) => (compact_text(&info.server_version, 9), ACCENT),
        None => ("idle".to_string(), MUTED),
    }
}

fn render_table<B: Backend>(frame: &mut Frame, area: Rect, app: &App<B>, snapshot: &Snapshot) {
    let focused = app.focus() == Focus::Table;
    let kind = app.kind();
    let visible_rows = app.visible_rows(snapshot);

    let failing = snapshot
        .backends
        .iter()
        .filter_map(|name| snapshot.error_for(name, kind).map(|error| (name, error)))
        .collect::<Vec<_>>();

    let table_area = if failing.is_empty() {
        area
    } else {
        let height = (failing.len() as u16 + 2).min(area.height / 2).max(3);
        let split = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(3), Constraint::Length(height)])
            .split(area);
        let lines = failing
            .iter()
            .map(|(name, error)| {
                Line::from(vec![
                    Span::styled(format!("{name}: "), Style::default().fg(WARN)),
                    Span::styled(error.to_string(), Style::default().fg(ERROR)),
                ])
            })
            .collect::<Vec<_>>();
        let panel = Paragraph::new(lines)
            .wrap(Wrap { trim: true })
            .block(
                Block::default()
                    .title(format!("{kind} errors"))
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(ERROR))
                    .style(Style::default().bg(PANEL)),
            );
        frame.render_widget(panel, split[1]);
        split[0]
    };

    let headers = kind.headers();
    let header_row = Row::new(headers.iter().map(|header| {
        Cell::from(header.clone()).style(Style::default().add_modifier(Modifier::BOLD))
    }))
    .height(1)
    .style(Style::default().fg(ACCENT));

    let rows = visible_rows.iter().map(|row| {
        Row::new(
            row.columns
                .iter()
                .map(|column| Cell::from(column.clone()).style(Style::default().fg(Color::White))),
        )
    });

    let mut title = format!("{} ({})", kind.title(), visible_rows.len());
    if !app.filter().is_empty() {
        title.push_str(&format!(" /{}", compact_text(app.filter(), 20)));
    }
    if snapshot
        .backends
        .iter()
        .any(|name| snapshot.is_loading(name, kind))
    {
        title.push_str(" loading…");
    }

    let table = Table::new(rows, column_constraints(headers.len()))
        .header(header_row)
        .block(panel_block(title, focused))
        .column_spacing(1)
        .row_highlight_style(
            Style::default()
                .bg(Color::Rgb(24, 36, 58))
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");

    let mut state = TableState::default();
    if !visible_rows.is_empty() {
        state.select(Some(app.selected_index()));
    }
    frame.render_stateful_widget(table, table_area, &mut state);
}

fn render_panes<B: Backend>(frame: &mut Frame, area: Rect, app: &App<B>) {
    let panes = app.panes();
    if panes.is_empty() {
        return;
    }
    let constraints = vec![Constraint::Ratio(1, panes.len() as u32); panes.len()];
    let areas = Layout::default()
        .direction(Direction::Horizontal)
        .constraints(constraints)
        .split(area);

    for (index, (log, pane_area)) in panes.iter().zip(areas.iter()).enumerate() {
        let active = index == app.active_pane();
        let focused = active && app.focus() == Focus::Panes;
        render_pane(frame, *pane_area, log, active, focused, app.show_timestamps());
    }
}

fn pane_title(log: &PaneLog, active: bool) -> String {
    let target = log
        .pod
        .as_ref()
        .map(|pod| compact_text(&pod.to_string(), 40))
        .unwrap_or_else(|| "no pod".to_string());
    let follow = if log.follow { "follow" } else { "paused" };
    let marker = if active { "*" } else { "" };
    let mut title = format!("{}{marker} {target}", log.id.0 + 1);
    if let Some(detail) = log.detail() {
        title.push_str(&format!(
            " {} on {}",
            compact_text(&detail.image, 32),
            detail.node
        ));
    }
    title.push_str(&format!(
        " [{}] {follow} {}/{}",
        log.status.label(),
        log.len(),
        log.max_lines()
    ));
    if log.evicted() > 0 {
        title.push_str(&format!(" (+{} dropped)", log.evicted()));
    }
    title
}

fn render_pane(
    frame: &mut Frame,
    area: Rect,
    log: &PaneLog,
    active: bool,
    focused: bool,
    show_timestamps: bool,
) {
    let title = pane_title(log, active);

    let height = area.height.saturating_sub(2) as usize;
    let mut lines = Vec::new();
    if let PaneStatus::Failed(message) = &log.status {
        lines.push(Line::from(Span::styled(
            message.clone(),
            Style::default().fg(ERROR),
        )));
    }
    let window = visible_window(log.len(), height.saturating_sub(lines.len()), log.follow, log.scroll);
    lines.extend(
        log.lines()
            .skip(window.start)
            .take(window.len())
            .map(|line| {
                if show_timestamps {
                    Line::from(vec![
                        Span::styled(
                            line.received_at.format("%H:%M:%S ").to_string(),
                            Style::default().fg(MUTED),
                        ),
                        Span::raw(line.text.clone()),
                    ])
                } else {
                    Line::from(line.text.clone())
                }
            }),
    );
    if log.pod.is_none() && log.is_empty() {
        lines.push(Line::from(Span::styled(
            "Enter on a pod opens its logs here",
            Style::default().fg(MUTED),
        )));
    }

    let border = match (&log.status, focused, active) {
        (PaneStatus::Failed(_), _, _) => ERROR,
        (_, true, _) => ACCENT,
        (_, false, true) => WARN,
        _ => MUTED,
    };
    let paragraph = Paragraph::new(lines)
        .block(
            Block::default()
                .title(title)
                .borders(Borders::ALL)
                .border_style(Style::default().fg(border))
                .style(Style::default().bg(PANEL)),
        )
        .style(Style::default().fg(Color::White));
    frame.render_widget(paragraph, area);
}

/// Lines of a buffer of `len` lines that fit in `height` rows. Following
/// shows the tail; otherwise `anchor` is the bottom visible line.
fn visible_window(len: usize, height: usize, follow: bool, anchor: usize) -> Range<usize> {
    if len == 0 || height == 0 {
        return 0..0;
    }
    let bottom = if follow { len - 1 } else { anchor.min(len - 1) };
    let end = bottom + 1;
    end.saturating_sub(height)..end
}

fn render_footer<B: Backend>(frame: &mut Frame, area: Rect, app: &App<B>) {
    let mut spans = Vec::new();
    match app.mode() {
        InputMode::Normal => {
            push_powerline_segment(&mut spans, " nrm ", Color::White, PL_A, PL_B);
            let width = area.width.saturating_sub(24).min(160) as usize;
            let status = compact_text(app.status(), width);
            let status_color = if looks_like_error(&status) {
                ERROR
            } else {
                Color::White
            };
            push_powerline_segment(&mut spans, format!(" {status} "), status_color, PL_B, BG);
            spans.push(Span::styled(" ? help", Style::default().fg(MUTED).bg(BG)));
        }
        InputMode::Filter | InputMode::Namespace => {
            let label = if app.mode() == InputMode::Filter {
                " filter "
            } else {
                " namespace "
            };
            push_powerline_segment(&mut spans, label, Color::Black, WARN, BG);
            spans.push(Span::styled(
                format!(" {}█", app.input()),
                Style::default().fg(Color::White).bg(BG),
            ));
        }
    }
    frame.render_widget(
        Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
        area,
    );
}

fn looks_like_error(status: &str) -> bool {
    let lower = status.to_ascii_lowercase();
    ["error", "failed", "timed out", "denied", "forbidden"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn push_powerline_segment(
    spans: &mut Vec<Span<'static>>,
    content: impl Into<String>,
    fg: Color,
    bg: Color,
    next_bg: Color,
) {
    spans.push(Span::styled(
        content.into(),
        Style::default().fg(fg).bg(bg).add_modifier(Modifier::BOLD),
    ));
    spans.push(Span::styled("", Style::default().fg(bg).bg(next_bg)));
}

fn panel_block(title: String, focused: bool) -> Block<'static> {
    Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(if focused {
            Style::default().fg(ACCENT)
        } else {
            Style::default().fg(MUTED)
        })
        .style(Style::default().bg(PANEL))
}

fn render_help_modal<B: Backend>(frame: &mut Frame, app: &App<B>) {
    let area = centered_rect(70, 70, frame.area());
    frame.render_widget(Clear, area);

    let mut lines = vec![
        Line::from(format!(
            "ktails help  kind:{}  panes:{}  active:{}",
            app.kind().title(),
            app.panes().len(),
            app.active_pane() + 1
        )),
        Line::from(""),
    ];
    lines.extend(HELP_LINES.iter().map(|line| Line::from(*line)));

    let modal = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(
            Block::default()
                .title("Help")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(ACCENT))
                .style(Style::default().bg(PANEL)),
        )
        .style(Style::default().fg(Color::White));

    frame.render_widget(modal, area);
}

const HELP_LINES: &[&str] = &[
    "tab           cycle focus: contexts, table, panes",
    "j/k, arrows   move cursor or scroll the active pane",
    "g/G, pgup/dn  jump to top, bottom, page",
    "h/l           previous or next resource kind",
    "space         mark or unmark a context",
    "enter         apply marks (contexts) or open the pod in the active pane",
    "1-4           choose the active pane",
    "f             toggle follow in the active pane",
    "c             clear the active pane buffer",
    "x             stop the active pane stream",
    "t             toggle timestamps",
    "r / F5        refresh selected contexts",
    "R             reconnect the context under the cursor",
    "ctrl+e        clear all errors",
    "/             filter rows, esc clears",
    "n             namespace for the context (all, * or empty means every namespace)",
    "q / ctrl+c    quit",
];

fn table_rows_visible(area: Rect) -> usize {
    area.height.saturating_sub(3).max(1) as usize
}

fn compact_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }

    if max_chars <= 1 {
        return "…".to_string();
    }

    let mut out = value
        .chars()
        .take(max_chars.saturating_sub(1))
        .collect::<String>();
    out.push('…');
    out
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn column_constraints(columns: usize) -> Vec<Constraint> {
    if columns == 0 {
        return vec![Constraint::Percentage(100)];
    }

    let width = (100 / columns as u16).max(1);
    (0..columns)
        .map(|_| Constraint::Percentage(width))
        .collect()
}
