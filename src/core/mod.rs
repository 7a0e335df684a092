//! Core types shared by every component: the error taxonomy and cancellation.

pub mod cancel;
pub mod error;

pub use cancel::CancelToken;
pub use error::{ErrorContext, Severity, UpdateError, user_friendly_error};
