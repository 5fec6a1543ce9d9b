//! Diagnostic wire trace: an optional line-oriented file the pumps write
//! raw protocol activity to, independent of structured logging.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
#[cfg(test)]
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use crate::types::SessionState;

/// Verbosity of the wire trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum TraceLevel {
    None,
    /// Request/response envelopes.
    Messages,
    /// Push events.
    Events,
    /// Session state transitions.
    StateChanges,
    All,
}

/// What a single trace line describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TraceKind {
    Message,
    Event,
    StateChange,
}

/// Trace configuration: level plus target file, stored once and re-applied
/// to whichever session handle is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    pub level: TraceLevel,
    pub path: PathBuf,
}

/// Replaces the reserved `'#'` placeholder so templated paths become
/// valid file names.
pub(crate) fn sanitize_trace_path(raw: &str) -> PathBuf {
    PathBuf::from(raw.replace('#', "-"))
}

/// Open trace file. Dropping the sink closes the file.
pub(crate) struct TraceSink {
    level: TraceLevel,
    file: Mutex<BufWriter<File>>,
}

impl TraceSink {
    pub(crate) fn open(config: &TraceConfig) -> std::io::Result<Self> {
        let file = File::create(&config.path)?;
        Ok(Self {
            level: config.level,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    fn enabled(&self, kind: TraceKind) -> bool {
        match self.level {
            TraceLevel::None => false,
            TraceLevel::All => true,
            TraceLevel::Messages => kind == TraceKind::Message,
            TraceLevel::Events => kind == TraceKind::Event,
            TraceLevel::StateChanges => kind == TraceKind::StateChange,
        }
    }

    /// Appends one line, flushed immediately so a crash loses nothing.
    pub(crate) fn record(&self, kind: TraceKind, line: &str) {
        if !self.enabled(kind) {
            return;
        }
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{line}");
            let _ = file.flush();
        }
    }

    #[cfg(test)]
    pub(crate) fn path_for_test(config: &TraceConfig) -> &Path {
        &config.path
    }
}

/// Shared handle to the session's current sink. `None` until `set_trace`
/// is applied; replaced wholesale when the configuration changes.
pub(crate) type TraceSlot = Arc<RwLock<Option<Arc<TraceSink>>>>;

/// Records a line through the slot, if a sink is installed.
pub(crate) fn record_to(slot: &TraceSlot, kind: TraceKind, line: &str) {
    if let Ok(guard) = slot.read()
        && let Some(sink) = guard.as_ref()
    {
        sink.record(kind, line);
    }
}

/// Records a session state transition.
pub(crate) fn record_state_change(slot: &TraceSlot, old: SessionState, new: SessionState) {
    record_to(slot, TraceKind::StateChange, &format!("state {old:?} -> {new:?}"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_placeholder() {
        let p = sanitize_trace_path("/tmp/trace#01#.log");
        assert_eq!(p, PathBuf::from("/tmp/trace-01-.log"));
    }

    #[test]
    fn sanitize_leaves_clean_paths_alone() {
        let p = sanitize_trace_path("/tmp/trace.log");
        assert_eq!(p, PathBuf::from("/tmp/trace.log"));
    }

    #[test]
    fn sink_filters_by_level() {
        let dir = tempfile::tempdir().unwrap();
        let config = TraceConfig {
            level: TraceLevel::Messages,
            path: dir.path().join("trace.log"),
        };
        let sink = TraceSink::open(&config).unwrap();

        sink.record(TraceKind::Message, ">> invoke register");
        sink.record(TraceKind::Event, "event clientConnected");
        sink.record(TraceKind::StateChange, "Connecting -> Connected");
        drop(sink);

        let contents = std::fs::read_to_string(TraceSink::path_for_test(&config)).unwrap();
        assert!(contents.contains("invoke register"));
        assert!(!contents.contains("clientConnected"));
        assert!(!contents.contains("Connecting"));
    }

    #[test]
    fn sink_all_records_everything() {
        let dir = tempfile::tempdir().unwrap();
        let config = TraceConfig {
            level: TraceLevel::All,
            path: dir.path().join("trace.log"),
        };
        let sink = TraceSink::open(&config).unwrap();

        sink.record(TraceKind::Message, "m");
        sink.record(TraceKind::Event, "e");
        sink.record(TraceKind::StateChange, "s");
        drop(sink);

        let contents = std::fs::read_to_string(dir.path().join("trace.log")).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn sink_none_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = TraceConfig {
            level: TraceLevel::None,
            path: dir.path().join("trace.log"),
        };
        let sink = TraceSink::open(&config).unwrap();
        sink.record(TraceKind::Message, "m");
        drop(sink);

        let contents = std::fs::read_to_string(dir.path().join("trace.log")).unwrap();
        assert!(contents.is_empty());
    }
}
