mod authorization;
mod batch_buffer;
mod batch_function;
mod cache;
mod config;
mod context;
mod deferred;
mod error;
mod identity;
mod loader;
pub mod loaders;
#[cfg(feature = "stats")]
mod stats;

pub use authorization::{Authorizer, Gate};
pub use batch_function::{BatchFunction, Loaded};
pub use config::DispatchConfig;
pub use context::ExecutionContext;
pub use deferred::Deferred;
pub use error::{BoxError, LoadError, SharedError};
pub use identity::{LoaderIdentity, LoaderKind};
pub use loader::Loader;
#[cfg(feature = "stats")]
pub use stats::DispatchStats;
