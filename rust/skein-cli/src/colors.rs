//! ANSI color helpers for CLI output. Honors `NO_COLOR`.

use skein_core::ThreadStatus;
use std::sync::OnceLock;

fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("NO_COLOR").is_none())
}

fn paint(code: &str, s: &str) -> String {
    if enabled() {
        format!("\x1b[{}m{}\x1b[0m", code, s)
    } else {
        s.to_string()
    }
}

pub fn green(s: &str) -> String {
    paint("32", s)
}

pub fn red(s: &str) -> String {
    paint("31", s)
}

pub fn yellow(s: &str) -> String {
    paint("33", s)
}

pub fn bold(s: &str) -> String {
    paint("1", s)
}

pub fn gray(s: &str) -> String {
    paint("90", s)
}

/// Right-aligned bold green label, cargo style.
pub fn status_label(label: &str) -> String {
    paint("1;32", &format!("{:>12}", label))
}

/// Thread status colored by outcome.
pub fn thread_status(status: ThreadStatus) -> String {
    let text = status.to_string();
    match status {
        ThreadStatus::Resolved => green(&text),
        ThreadStatus::Failed => red(&text),
        ThreadStatus::Suspended => yellow(&text),
        ThreadStatus::Running => gray(&text),
    }
}
