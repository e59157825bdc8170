//! Diagnostics collection.
//!
//! Warnings and fatal messages produced during resolution and scanning are
//! routed through one `Diagnostics` value. Messages go to `tracing` and, if
//! installed, to a caller-supplied sink, so embedders (tests, drivers) can
//! capture them without scraping log output.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Fatal,
}

pub type DiagnosticSink = Box<dyn FnMut(Severity, &str)>;

#[derive(Default)]
pub struct Diagnostics {
    sink: Option<DiagnosticSink>,
    warnings: usize,
    fatals: usize,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a callback invoked for every warning and fatal message.
    pub fn set_sink(&mut self, sink: DiagnosticSink) {
        self.sink = Some(sink);
    }

    pub fn warn(&mut self, message: &str) {
        tracing::warn!("{message}");
        self.warnings += 1;
        if let Some(sink) = self.sink.as_mut() {
            sink(Severity::Warning, message);
        }
    }

    pub fn fatal(&mut self, message: &str) {
        tracing::error!("{message}");
        self.fatals += 1;
        if let Some(sink) = self.sink.as_mut() {
            sink(Severity::Fatal, message);
        }
    }

    pub fn warning_count(&self) -> usize {
        self.warnings
    }

    pub fn fatal_count(&self) -> usize {
        self.fatals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn sink_sees_severity_and_message() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let captured = Rc::clone(&seen);
        let mut diag = Diagnostics::new();
        diag.set_sink(Box::new(move |severity, message| {
            captured.borrow_mut().push((severity, message.to_string()));
        }));
        diag.warn("size mismatch");
        diag.fatal("multiple definition");
        assert_eq!(diag.warning_count(), 1);
        assert_eq!(diag.fatal_count(), 1);
        let seen = seen.borrow();
        assert_eq!(seen[0], (Severity::Warning, "size mismatch".to_string()));
        assert_eq!(seen[1], (Severity::Fatal, "multiple definition".to_string()));
    }
}
