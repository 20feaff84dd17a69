//! Failure supervisor for a bounded unit of work
//!
//! An [`ErrorBoundary`] runs a closure, catches a panic raised while that closure
//! executes and hands back a fallback value instead. Once tripped it keeps
//! returning the fallback until [`ErrorBoundary::reset`] is called; there is no
//! automatic recovery.
//!
//! Only panics unwinding through the closure itself are caught. Work the closure
//! hands off to another thread or schedules for later runs outside the boundary.

use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
};

use log::warn;

#[derive(Debug, Clone)]
pub struct ErrorBoundary {
    label: String,
    error: Option<String>,
}

impl ErrorBoundary {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            error: None,
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Message of the caught panic, if the boundary is tripped
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Run `work`, or produce `fallback(message)` if it panics or the boundary is tripped
    pub fn render<T>(&mut self, work: impl FnOnce() -> T, fallback: impl FnOnce(&str) -> T) -> T {
        if let Some(message) = &self.error {
            return fallback(message);
        }
        match catch_unwind(AssertUnwindSafe(work)) {
            Ok(value) => value,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!("Boundary '{}' caught a panic: {message}", self.label);
                fallback(self.error.insert(message))
            }
        }
    }

    /// Clear the error so the next `render` runs the work again
    pub fn reset(&mut self) {
        self.error = None;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
