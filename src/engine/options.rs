use std::sync::Arc;

use crate::error::SegmentError;
use crate::observe::trace::{default_tracer, noop_tracer};
use crate::observe::{Logger, Tracer, TracingLogger};
use crate::types::ErrorContext;

/// Default capacity of each matcher's argument memo
pub const DEFAULT_MEMO_CAPACITY: usize = 1024;

/// Observer notified of every contained failure, after the logger.
pub type ErrorObserver = Arc<dyn Fn(&SegmentError, &ErrorContext) + Send + Sync>;

/// Which tracer the engine emits spans through.
#[derive(Clone, Default)]
pub enum TracerOption {
    #[default]
    Disabled,
    /// The crate's `tracing`-backed tracer
    Enabled,
    Custom(Arc<dyn Tracer>),
}

impl TracerOption {
    pub(crate) fn resolve(&self) -> Arc<dyn Tracer> {
        match self {
            TracerOption::Disabled => noop_tracer(),
            TracerOption::Enabled => default_tracer(),
            TracerOption::Custom(tracer) => tracer.clone(),
        }
    }
}

impl From<bool> for TracerOption {
    fn from(enabled: bool) -> Self {
        if enabled {
            TracerOption::Enabled
        } else {
            TracerOption::Disabled
        }
    }
}

impl<T: Tracer + 'static> From<Arc<T>> for TracerOption {
    fn from(tracer: Arc<T>) -> Self {
        TracerOption::Custom(tracer)
    }
}

impl std::fmt::Debug for TracerOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TracerOption::Disabled => f.write_str("Disabled"),
            TracerOption::Enabled => f.write_str("Enabled"),
            TracerOption::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Engine options
#[derive(Clone)]
pub struct EngineOptions {
    /// Error sink; `None` uses [`TracingLogger`]
    pub logger: Option<Arc<dyn Logger>>,
    pub tracer: TracerOption,
    pub on_error: Option<ErrorObserver>,
    /// Capacity of each matcher's argument memo
    pub memo_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            logger: None,
            tracer: TracerOption::Disabled,
            on_error: None,
            memo_capacity: DEFAULT_MEMO_CAPACITY,
        }
    }
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logger<L: Logger + 'static>(mut self, logger: L) -> Self {
        self.logger = Some(Arc::new(logger));
        self
    }

    /// Enable or disable spans, or supply a tracer.
    pub fn with_tracer(mut self, tracer: impl Into<TracerOption>) -> Self {
        self.tracer = tracer.into();
        self
    }

    pub fn with_on_error<F>(mut self, observer: F) -> Self
    where
        F: Fn(&SegmentError, &ErrorContext) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(observer));
        self
    }

    pub fn with_memo_capacity(mut self, capacity: usize) -> Self {
        self.memo_capacity = capacity;
        self
    }

    pub(crate) fn resolve_logger(&self) -> Arc<dyn Logger> {
        self.logger
            .clone()
            .unwrap_or_else(|| Arc::new(TracingLogger))
    }
}

impl std::fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOptions")
            .field("logger", &self.logger.is_some())
            .field("tracer", &self.tracer)
            .field("on_error", &self.on_error.is_some())
            .field("memo_capacity", &self.memo_capacity)
            .finish()
    }
}
