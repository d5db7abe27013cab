use std::time::Duration;

use thiserror::Error;

/// An error that happens when loading a resource from its source.
///
/// This error enum is intended for fan-out: a single failed fetch is
/// delivered to every request coalesced onto it, so the type is cheap to
/// clone and carries owned messages instead of error sources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The resource was not found at the source location.
    #[error("not found")]
    NotFound,
    /// The resource could not be fetched due to missing permissions.
    ///
    /// The attached string contains the source's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The resource could not be fetched within the configured timeout.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The textual locator could not be parsed into a source location.
    ///
    /// This is the only error reported synchronously, before a request is
    /// created.
    #[error("invalid locator: {0}")]
    InvalidLocator(String),
    /// The resource could not be fetched due to another problem, like
    /// connection loss, DNS resolution, or a 5xx server response.
    ///
    /// The attached string contains the underlying cause.
    #[error("fetch failed: {0}")]
    Fetch(String),
}

/// The outcome of a load stage, either `Ok(T)` or the error delivered to
/// every waiter of the resource.
pub type LoadResult<T = ()> = Result<T, LoadError>;
