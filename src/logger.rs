//! Logging collaborators.
//!
//! The orchestrator reports run progress through a [`Logger`], addressed by
//! section (usually a dataset alias). Gateway operations only need the
//! narrower [`OperationLogger`] view, bound to one section.
//!
//! [`TracingLogger`] is the default implementation and forwards everything
//! to `tracing`. UI layers supply their own.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::OrgCheckError;

/// Section-addressed progress logger.
pub trait Logger: Send + Sync {
    /// Progress within a section.
    fn log(&self, section: &str, message: Option<&str>);

    /// A section completed.
    fn ended(&self, section: &str, message: Option<&str>);

    /// A section failed.
    fn failed(&self, section: &str, error: Option<&OrgCheckError>);
}

/// Per-operation logger view handed to gateway calls and dataset callbacks.
pub trait OperationLogger: Send + Sync {
    fn log(&self, message: &str);
    fn debug(&self, message: &str);
}

/// [`Logger`] backed by `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, section: &str, message: Option<&str>) {
        info!(section, message = message.unwrap_or_default(), "in progress");
    }

    fn ended(&self, section: &str, message: Option<&str>) {
        info!(section, message = message.unwrap_or_default(), "ended");
    }

    fn failed(&self, section: &str, error: Option<&OrgCheckError>) {
        match error {
            Some(e) => error!(section, error = %e, "failed"),
            None => error!(section, "failed"),
        }
    }
}

/// [`OperationLogger`] bound to one section of a [`Logger`].
#[derive(Clone)]
pub struct SectionLogger {
    logger: Arc<dyn Logger>,
    section: String,
}

impl SectionLogger {
    pub fn new(logger: Arc<dyn Logger>, section: impl Into<String>) -> Self {
        Self {
            logger,
            section: section.into(),
        }
    }

    pub fn section(&self) -> &str {
        &self.section
    }
}

impl OperationLogger for SectionLogger {
    fn log(&self, message: &str) {
        self.logger.log(&self.section, Some(message));
    }

    fn debug(&self, message: &str) {
        debug!(section = %self.section, message);
    }
}

/// [`OperationLogger`] that only emits `tracing` debug events.
///
/// Handy for ad-hoc gateway calls outside an orchestrated run.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuietLogger;

impl OperationLogger for QuietLogger {
    fn log(&self, message: &str) {
        debug!(message);
    }

    fn debug(&self, message: &str) {
        debug!(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        lines: Mutex<Vec<String>>,
    }

    impl Logger for Recording {
        fn log(&self, section: &str, message: Option<&str>) {
            self.lines
                .lock()
                .unwrap()
                .push(format!("{section}: {}", message.unwrap_or_default()));
        }

        fn ended(&self, _section: &str, _message: Option<&str>) {}

        fn failed(&self, _section: &str, _error: Option<&OrgCheckError>) {}
    }

    #[test]
    fn section_logger_prefixes_section() {
        let recording = Arc::new(Recording::default());
        let logger = SectionLogger::new(recording.clone(), "apex-classes");
        logger.log("fetched 12 rows");
        logger.debug("not forwarded");

        let lines = recording.lines.lock().unwrap();
        assert_eq!(lines.as_slice(), ["apex-classes: fetched 12 rows"]);
    }
}
