use std::io::{self, Write};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

#[derive(Debug, PartialEq, Eq)]
enum PromptStep {
    Continue,
    Submit,
    Abort,
}

/// Reads a line from the terminal without echoing it. Blocking.
pub(crate) fn read_password(label: &str) -> anyhow::Result<String> {
    let mut stderr = io::stderr();
    write!(stderr, "{label}")?;
    stderr.flush()?;

    enable_raw_mode()?;
    let result = read_until_submit();
    disable_raw_mode()?;
    writeln!(stderr)?;

    match result? {
        Some(password) => Ok(password),
        None => anyhow::bail!("password prompt aborted"),
    }
}

fn read_until_submit() -> anyhow::Result<Option<String>> {
    let mut buffer = String::new();
    loop {
        if let Event::Key(key) = event::read()? {
            if key.kind == KeyEventKind::Release {
                continue;
            }
            match apply_key(&mut buffer, key) {
                PromptStep::Continue => {}
                PromptStep::Submit => return Ok(Some(buffer)),
                PromptStep::Abort => return Ok(None),
            }
        }
    }
}

fn apply_key(buffer: &mut String, key: KeyEvent) -> PromptStep {
    match key.code {
        KeyCode::Enter => PromptStep::Submit,
        KeyCode::Char('c') | KeyCode::Char('d')
            if key.modifiers.contains(KeyModifiers::CONTROL) =>
        {
            PromptStep::Abort
        }
        KeyCode::Esc => PromptStep::Abort,
        KeyCode::Backspace => {
            buffer.pop();
            PromptStep::Continue
        }
        KeyCode::Char(ch) => {
            buffer.push(ch);
            PromptStep::Continue
        }
        _ => PromptStep::Continue,
    }
}
