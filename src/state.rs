use crate::ErrorInfo;

/// Lifecycle phase of a [`FetchController`](crate::FetchController).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FetchStatus {
    #[default]
    Idle,
    Loading,
    /// A failed attempt is waiting for its retry delay.
    Retrying,
    Success,
    Failed,
    /// Terminal; set by `dispose()`.
    Disposed,
}

/// Read model published to consumers on every change.
#[derive(Clone, Debug)]
pub struct FetchState<T> {
    pub data: Option<T>,
    pub error: Option<ErrorInfo>,
    pub loading: bool,
    pub status: FetchStatus,
}

impl<T> FetchState<T> {
    pub(crate) fn initial(auto_fetch: bool) -> Self {
        Self {
            data: None,
            error: None,
            loading: auto_fetch,
            status: if auto_fetch {
                FetchStatus::Loading
            } else {
                FetchStatus::Idle
            },
        }
    }

    /// `true` once `dispose()` has run.
    pub fn is_disposed(&self) -> bool {
        self.status == FetchStatus::Disposed
    }
}

impl<T> Default for FetchState<T> {
    fn default() -> Self {
        Self::initial(false)
    }
}
