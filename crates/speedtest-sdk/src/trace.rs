/// Diagnostic output abstraction shared by the controller and the worker.
///
/// Components never call `tracing` macros for their operational messages
/// directly; they hold an `Arc<dyn TraceWriter>` so tests can swap in a
/// collecting writer and assert on what was reported.
pub trait TraceWriter: Send + Sync {
    /// Log an informational message.
    fn info(&self, message: &str);

    /// Log a verbose / debug message.
    fn verbose(&self, message: &str);

    /// Log a warning message.
    fn warning(&self, message: &str) {
        self.info(&format!("[warning] {message}"));
    }

    /// Log an error message.
    fn error(&self, message: &str) {
        self.info(&format!("[error] {message}"));
    }
}

/// A trace writer that forwards to the `tracing` crate, tagging every event
/// with the owning component's name.
#[derive(Debug, Clone)]
pub struct TracingTraceWriter {
    component: String,
}

impl TracingTraceWriter {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// The component name attached to each event.
    pub fn component(&self) -> &str {
        &self.component
    }
}

impl TraceWriter for TracingTraceWriter {
    fn info(&self, message: &str) {
        tracing::info!(component = %self.component, "{}", message);
    }

    fn verbose(&self, message: &str) {
        tracing::debug!(component = %self.component, "{}", message);
    }

    fn warning(&self, message: &str) {
        tracing::warn!(component = %self.component, "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(component = %self.component, "{}", message);
    }
}

/// A no-op trace writer that discards all messages.
#[derive(Debug, Clone)]
pub struct NullTraceWriter;

impl TraceWriter for NullTraceWriter {
    fn info(&self, _message: &str) {}
    fn verbose(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// A trace writer that collects all messages into a `Vec`.
#[derive(Debug)]
pub struct CollectingTraceWriter {
    messages: parking_lot::Mutex<Vec<(TraceLevel, String)>>,
}

/// The level of a collected trace message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    Info,
    Verbose,
    Warning,
    Error,
}

impl CollectingTraceWriter {
    pub fn new() -> Self {
        Self {
            messages: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Return all collected messages.
    pub fn messages(&self) -> Vec<(TraceLevel, String)> {
        self.messages.lock().clone()
    }

    /// Return the collected messages of one level.
    pub fn messages_at(&self, level: TraceLevel) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Clear collected messages.
    pub fn clear(&self) {
        self.messages.lock().clear();
    }

    fn push(&self, level: TraceLevel, message: &str) {
        self.messages.lock().push((level, message.to_string()));
    }
}

impl Default for CollectingTraceWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceWriter for CollectingTraceWriter {
    fn info(&self, message: &str) {
        self.push(TraceLevel::Info, message);
    }

    fn verbose(&self, message: &str) {
        self.push(TraceLevel::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.push(TraceLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.push(TraceLevel::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_writer_keeps_order_and_levels() {
        let writer = CollectingTraceWriter::new();
        writer.info("hello");
        writer.warning("warn");
        writer.error("err");
        writer.verbose("verb");
        let msgs = writer.messages();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0], (TraceLevel::Info, "hello".into()));
        assert_eq!(msgs[1], (TraceLevel::Warning, "warn".into()));
        assert_eq!(msgs[2], (TraceLevel::Error, "err".into()));
        assert_eq!(msgs[3], (TraceLevel::Verbose, "verb".into()));
        assert_eq!(writer.messages_at(TraceLevel::Error), vec!["err".to_string()]);

        writer.clear();
        assert!(writer.messages().is_empty());
    }

    #[test]
    fn default_warning_routes_through_info() {
        struct InfoOnly(parking_lot::Mutex<Vec<String>>);
        impl TraceWriter for InfoOnly {
            fn info(&self, message: &str) {
                self.0.lock().push(message.to_string());
            }
            fn verbose(&self, _message: &str) {}
        }

        let writer = InfoOnly(parking_lot::Mutex::new(Vec::new()));
        writer.warning("slow worker");
        writer.error("bad reply");
        let got = writer.0.lock().clone();
        assert_eq!(got, vec!["[warning] slow worker", "[error] bad reply"]);
    }

    #[test]
    fn tracing_writer_keeps_component_name() {
        let writer = TracingTraceWriter::new("Speedtest");
        assert_eq!(writer.component(), "Speedtest");
        // No subscriber installed; must not panic.
        writer.info("test");
        writer.error("test");
    }
}
