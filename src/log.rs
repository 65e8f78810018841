use std::sync::{Arc, Mutex};

/// Append-only sink for backend build output.
///
/// Cheap to clone; all clones share the same buffer. Backends append lines
/// as they stream in, and the accumulated contents become
/// `BuildResult::build_log` and the log portion of build errors. Each line
/// is also emitted as a `tracing` event so embedding applications can
/// stream build output live.
#[derive(Debug, Clone, Default)]
pub struct BuildLog {
    buffer: Arc<Mutex<String>>,
}

impl BuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, line: &str) {
        tracing::debug!(target: "bosun_build::output", "{}", line);
        let mut buffer = self.buffer.lock().expect("build log lock poisoned");
        buffer.push_str(line);
        buffer.push('\n');
    }

    pub fn contents(&self) -> String {
        self.buffer.lock().expect("build log lock poisoned").clone()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().expect("build log lock poisoned").is_empty()
    }
}
