use std::future::Future;

use async_trait::async_trait;

use stockpulse_core::{BridgeError, ChangeEvent};

/// Receives every decoded change event.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    /// Name used in logs when the handler fails.
    fn name(&self) -> &str;

    async fn handle(&self, event: &ChangeEvent) -> Result<(), BridgeError>;
}

/// Adapter turning an async closure into a [`ChangeHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Wrap `f` as a named handler. The closure gets its own copy of the event.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BridgeError>> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> ChangeHandler for FnHandler<F>
where
    F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BridgeError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &ChangeEvent) -> Result<(), BridgeError> {
        (self.f)(event.clone()).await
    }
}
