use crate::{ControllerId, QueryClient, QueryError, QueryResult, QuerySpec, Result};
use can_transport::{CanBus, TransportError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Async front end over a [`QueryClient`].
///
/// Each query runs to completion on a blocking task, even when the returned
/// future is dropped early, so an abandoned query still consumes its reply and
/// the bus stays consistent for the next caller.
pub struct AsyncQueryClient<B> {
    inner: Arc<QueryClient<B>>,
}

impl<B> Clone for AsyncQueryClient<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: CanBus + Send + 'static> AsyncQueryClient<B> {
    pub fn new(client: QueryClient<B>) -> Self {
        Self {
            inner: Arc::new(client),
        }
    }

    pub fn client(&self) -> &QueryClient<B> {
        &self.inner
    }

    /// Start a query; the round trip begins immediately, not on first poll.
    pub fn query(
        &self,
        controller: ControllerId,
        spec: &QuerySpec,
        timeout: Duration,
    ) -> impl Future<Output = Result<QueryResult>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let spec = spec.clone();
        let task = Handle::try_current()
            .map(|rt| rt.spawn_blocking(move || inner.query(controller, &spec, timeout)));
        async move {
            match task {
                Ok(handle) => match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(QueryError::Transport(TransportError::Io(format!(
                        "query task failed: {e}"
                    )))),
                },
                Err(_) => Err(QueryError::InvalidConfig(
                    "async query needs a tokio runtime".into(),
                )),
            }
        }
    }
}
