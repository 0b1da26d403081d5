//! Capability traits for the host's display surfaces.
//!
//! The core never reaches into a global editor environment. Output and
//! status text are pushed into whatever sinks the host injects.

use tracing::info;

/// Receives text produced by the backend process (stdout/stderr lines).
pub trait OutputSink: Send + Sync {
    fn write_output(&self, text: &str);
}

/// Receives short human-readable status updates (status bar text).
pub trait StatusSink: Send + Sync {
    fn show_status(&self, status: &str);
}

impl<F> OutputSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn write_output(&self, text: &str) {
        self(text)
    }
}

impl<F> StatusSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn show_status(&self, status: &str) {
        self(status)
    }
}

/// Sink that forwards everything to `tracing`.
///
/// Used when the host has no dedicated output surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn write_output(&self, text: &str) {
        info!(target: "evalbridge::backend", "{}", text);
    }
}

impl StatusSink for TracingSink {
    fn show_status(&self, status: &str) {
        info!("status: {}", status);
    }
}
