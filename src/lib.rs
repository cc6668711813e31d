//! HAL assistant: async task execution with suspend and resume on OAuth.

pub mod auth;
pub mod callback;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod runtime;
pub mod state;
pub mod task;

pub use dispatch::Dispatcher;
pub use error::{Error, Result};
pub use handlers::{HandlerRegistry, IntentHandler, Services};
pub use runtime::Runtime;
pub use state::{Outcome, StateEvent};
pub use task::Task;
