//! Ambient diagnostics (§10.1): host-controlled `tracing` initialization and
//! a process-wide ring buffer of recent warnings/errors, surfaced via
//! `get_system_status()`.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::DiagnosticsSection;
use crate::error::{PenguinError, Result};

const DEFAULT_RING_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
}

/// Bounded ring buffer of recent diagnostic records, independent of the
/// `tracing` subscriber's own output — used by `get_system_status()` to
/// surface recent trouble without a log-tailing integration.
pub struct DiagnosticRing {
    records: Mutex<VecDeque<DiagnosticRecord>>,
    capacity: usize,
}

impl Default for DiagnosticRing {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl DiagnosticRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, severity: Severity, message: impl Into<String>) {
        let mut records = self.records.lock().expect("diagnostic ring lock poisoned");
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(DiagnosticRecord {
            timestamp: Utc::now(),
            severity,
            message: message.into(),
        });
    }

    pub fn recent(&self, limit: usize) -> Vec<DiagnosticRecord> {
        let records = self.records.lock().expect("diagnostic ring lock poisoned");
        records.iter().rev().take(limit).cloned().collect()
    }
}

/// Initializes the global `tracing` subscriber from the merged
/// `diagnostics` config section. A host calls this once at startup; the
/// crate itself never calls `tracing_subscriber::fmt().init()` on its own
/// (§10.1).
pub fn init_tracing(config: &DiagnosticsSection) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if config.log_to_file {
        let log_path = config
            .log_path
            .clone()
            .unwrap_or_else(|| "penguin.log".to_string());
        if let Some(parent) = std::path::Path::new(&log_path).parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(PenguinError::from)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(PenguinError::from)?;
        let file = std::sync::Arc::new(file);
        let make_writer = move || file.try_clone().expect("log file handle clone");
        registry
            .with(fmt::layer().with_writer(make_writer).with_ansi(false))
            .try_init()
            .map_err(|e| PenguinError::Config(format!("failed to install tracing subscriber: {e}")))?;
    } else {
        registry
            .with(fmt::layer())
            .try_init()
            .map_err(|e| PenguinError::Config(format!("failed to install tracing subscriber: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let ring = DiagnosticRing::new(2);
        ring.push(Severity::Warning, "first");
        ring.push(Severity::Warning, "second");
        ring.push(Severity::Error, "third");
        let recent = ring.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "third");
        assert_eq!(recent[1].message, "second");
    }

    #[test]
    fn recent_respects_limit() {
        let ring = DiagnosticRing::new(10);
        for i in 0..5 {
            ring.push(Severity::Warning, format!("entry {i}"));
        }
        assert_eq!(ring.recent(2).len(), 2);
    }

    #[test]
    fn disabled_diagnostics_skips_initialization() {
        let config = DiagnosticsSection {
            enabled: false,
            log_to_file: false,
            log_path: None,
            max_context_tokens: None,
        };
        assert!(init_tracing(&config).is_ok());
    }
}
