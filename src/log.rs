//! Colored console logging with a process-wide verbosity toggle.

use color_print::cprintln;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static INFO_ENABLED: AtomicBool = AtomicBool::new(true);

/// How long a traced critical section lingers so interleavings across
/// replicas can be watched by eye.
const CRITIC_HOLD: Duration = Duration::from_secs(5);

pub fn set_enabled(enabled: bool) {
    INFO_ENABLED.store(enabled, Ordering::Relaxed);
}

fn enabled() -> bool {
    INFO_ENABLED.load(Ordering::Relaxed)
}

pub fn info(message: &str) {
    if enabled() {
        cprintln!("<yellow, bold>(info)</> {}", message);
    }
}

pub fn success(message: &str) {
    if enabled() {
        cprintln!("<green, bold>(ok)</> {}", message);
    }
}

pub fn warning(message: &str) {
    if enabled() {
        cprintln!("<magenta, bold>(warn)</> {}", message);
    }
}

/// Errors always print, regardless of the verbosity toggle.
pub fn error(message: &str) {
    cprintln!("<red, bold>(error)</> {}", message);
}

/// Markers around a held critical section. Disabled traces are free.
pub struct CriticalTrace {
    id: Option<String>,
    label: &'static str,
}

impl CriticalTrace {
    pub async fn begin(enabled: bool, label: &'static str) -> Self {
        if !enabled {
            return Self { id: None, label };
        }
        let id = format!("{:08x}", rand::rng().random::<u32>());
        cprintln!("<red, bold>CRITIC START [{}]</> {}", id, label);
        tokio::time::sleep(CRITIC_HOLD).await;
        Self { id: Some(id), label }
    }

    pub fn end(self) {
        if let Some(id) = self.id {
            cprintln!("<red, bold>CRITIC END   [{}]</> {}", id, self.label);
        }
    }
}
