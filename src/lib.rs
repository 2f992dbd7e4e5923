//! `refetch` is an async data-fetching controller.
//!
//! A [`FetchController`] owns one logical request and exposes its
//! loading/data/error lifecycle, layering three policies on top of a
//! [`Transport`]:
//! - retry with a fixed delay on failure
//! - polling after a success
//! - latest-wins cancellation of in-flight attempts
//!
//! [`HttpTransport`] is the bundled `reqwest` implementation.

mod controller;
mod error;
mod options;
mod state;
mod transport;

pub use controller::FetchController;
pub use error::{ErrorInfo, FetchError};
pub use options::{
    ErrorHook, FetchConfig, SuccessHook, Transformer, TransportOptions, DEFAULT_MIN_LOADING,
};
pub use state::{FetchState, FetchStatus};
pub use tokio_util::sync::CancellationToken;
pub use transport::{HttpTransport, Transport};

pub type Result<T> = std::result::Result<T, FetchError>;
