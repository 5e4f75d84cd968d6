use crate::app::InputMode;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Quit,
    Down,
    Up,
    PageDown,
    PageUp,
    Top,
    Bottom,
    NextKind,
    PrevKind,
    CycleFocus,
    ToggleHelp,
    /// Space on the context list: mark or unmark a context.
    ToggleMark,
    /// Enter: apply marks on the context list, open the pod on the table.
    Activate,
    SelectPane(u8),
    ToggleFollow,
    ClearPaneBuffer,
    StopStream,
    ToggleTimestamps,
    Refresh,
    Reconnect,
    ClearErrors,
    StartFilter,
    StartNamespace,
    ClearFilter,
    SubmitInput,
    CancelInput,
    Backspace,
    InputChar(char),
}

pub fn map_key(mode: InputMode, key: KeyEvent) -> Option<Action> {
    match mode {
        InputMode::Normal => map_normal_mode_key(key),
        InputMode::Filter | InputMode::Namespace => map_input_mode_key(key),
    }
}

fn map_normal_mode_key(key: KeyEvent) -> Option<Action> {
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Action::Quit),
        KeyCode::Char('e') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(Action::ClearErrors)
        }
        KeyCode::Char('d') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(Action::PageDown)
        }
        KeyCode::Char('u') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Action::PageUp),
        KeyCode::Char('q') => Some(Action::Quit),
        KeyCode::Char(c @ '1'..='4') if key.modifiers.is_empty() => {
            Some(Action::SelectPane(c.to_digit(10).unwrap_or(1) as u8))
        }
        KeyCode::Char('j') if key.modifiers.is_empty() => Some(Action::Down),
        KeyCode::Down => Some(Action::Down),
        KeyCode::Char('k') if key.modifiers.is_empty() => Some(Action::Up),
        KeyCode::Up => Some(Action::Up),
        KeyCode::Char('h') | KeyCode::Left => Some(Action::PrevKind),
        KeyCode::Char('l') | KeyCode::Right => Some(Action::NextKind),
        KeyCode::Char('g') | KeyCode::Home => Some(Action::Top),
        KeyCode::Char('G') | KeyCode::End => Some(Action::Bottom),
        KeyCode::PageDown => Some(Action::PageDown),
        KeyCode::PageUp => Some(Action::PageUp),
        KeyCode::Tab => Some(Action::CycleFocus),
        KeyCode::Char(' ') => Some(Action::ToggleMark),
        KeyCode::Enter => Some(Action::Activate),
        KeyCode::Char('?') => Some(Action::ToggleHelp),
        KeyCode::Char('f') => Some(Action::ToggleFollow),
        KeyCode::Char('c') => Some(Action::ClearPaneBuffer),
        KeyCode::Char('x') => Some(Action::StopStream),
        KeyCode::Char('t') => Some(Action::ToggleTimestamps),
        KeyCode::Char('r') | KeyCode::F(5) => Some(Action::Refresh),
        KeyCode::Char('R') => Some(Action::Reconnect),
        KeyCode::Char('/') => Some(Action::StartFilter),
        KeyCode::Char('n') => Some(Action::StartNamespace),
        KeyCode::Esc => Some(Action::ClearFilter),
        _ => None,
    }
}

fn map_input_mode_key(key: KeyEvent) -> Option<Action> {
    match key.code {
        KeyCode::Esc => Some(Action::CancelInput),
        KeyCode::Enter => Some(Action::SubmitInput),
        KeyCode::Char('m') | KeyCode::Char('j')
            if key.modifiers.contains(KeyModifiers::CONTROL) =>
        {
            Some(Action::SubmitInput)
        }
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(Action::CancelInput)
        }
        KeyCode::Backspace => Some(Action::Backspace),
        KeyCode::Char(c) if key.modifiers.is_empty() || key.modifiers == KeyModifiers::SHIFT => {
            Some(Action::InputChar(c))
        }
        _ => None,
    }
}
