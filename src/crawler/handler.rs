//! Handler registry
//!
//! Handlers are registered by task name when the crawler is built. A task
//! whose name has no handler produces `HandlerError::NoHandler` instead of
//! being dropped silently. Every call is wrapped in `catch_unwind` so a
//! panicking handler is reported like any other handler error.

use crate::task::{Data, Task};
use crate::transport::NetworkResult;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by handlers or while resolving them
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("no handler registered for task '{0}'")]
    NoHandler(String),

    #[error("no data handler registered for '{0}'")]
    NoDataHandler(String),

    /// The response arrived but its content failed validation; the task
    /// is tried again
    #[error("response not valid: {0}")]
    ResponseNotValid(String),

    #[error("handler failed: {0}")]
    Failed(String),

    /// Stops the whole run
    #[error("fatal handler error: {0}")]
    Fatal(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Short name used in counters
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoHandler(_) => "no-handler",
            Self::NoDataHandler(_) => "no-data-handler",
            Self::ResponseNotValid(_) => "response-not-valid",
            Self::Failed(_) => "failed",
            Self::Fatal(_) => "fatal",
            Self::Panicked(_) => "panicked",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// One item produced by a handler
#[derive(Debug)]
pub enum HandlerOutput {
    Task(Task),
    Data(Data),
    Error(HandlerError),
}

impl From<Task> for HandlerOutput {
    fn from(task: Task) -> Self {
        Self::Task(task)
    }
}

impl From<Data> for HandlerOutput {
    fn from(data: Data) -> Self {
        Self::Data(data)
    }
}

pub type Handler =
    Arc<dyn Fn(&NetworkResult, &Task) -> Result<Vec<HandlerOutput>, HandlerError> + Send + Sync>;
pub type DataHandler = Arc<dyn Fn(&Data) -> Result<(), HandlerError> + Send + Sync>;
/// Runs for tasks rejected by the try limits
pub type FallbackHandler = Arc<dyn Fn(&Task) + Send + Sync>;

/// Handlers keyed by task or data name
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
    data_handlers: HashMap<String, DataHandler>,
    fallbacks: HashMap<String, FallbackHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&NetworkResult, &Task) -> Result<Vec<HandlerOutput>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn register_data_handler<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Data) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.data_handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn register_fallback<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        self.fallbacks.insert(name.into(), Arc::new(handler));
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn handler_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Runs the handler for `task.name`
    pub fn call_handler(
        &self,
        result: &NetworkResult,
        task: &Task,
    ) -> Result<Vec<HandlerOutput>, HandlerError> {
        let handler = self
            .handlers
            .get(&task.name)
            .ok_or_else(|| HandlerError::NoHandler(task.name.clone()))?;

        catch_unwind(AssertUnwindSafe(|| handler(result, task)))
            .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload))))
    }

    /// Runs the data handler for `data.handler_name`
    pub fn call_data_handler(&self, data: &Data) -> Result<(), HandlerError> {
        let handler = self
            .data_handlers
            .get(&data.handler_name)
            .ok_or_else(|| HandlerError::NoDataHandler(data.handler_name.clone()))?;

        catch_unwind(AssertUnwindSafe(|| handler(data)))
            .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload))))
    }

    /// Runs the fallback for `task.name`; returns false when none is registered
    pub fn call_fallback(&self, task: &Task) -> Result<bool, HandlerError> {
        let Some(fallback) = self.fallbacks.get(&task.name) else {
            return Ok(false);
        };

        catch_unwind(AssertUnwindSafe(|| fallback(task)))
            .map(|()| true)
            .map_err(|payload| HandlerError::Panicked(panic_message(payload)))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
