use std::{future::Future, pin::Pin};

/// A trait for spawning a future onto an asynchronous runtime.
///
/// Detached work (early refreshes, hit-count refreshes) goes through the
/// cache's spawner so the triggering caller's cancellation never reaches it.
pub trait TaskSpawner: Send + Sync + 'static {
  /// Spawns a type-erased future.
  fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>);
}

/// Spawns onto a Tokio runtime.
///
/// With no explicit handle the runtime of the calling task is used at spawn
/// time, so a cache built outside a runtime still works once called inside
/// one.
#[derive(Debug, Clone, Default)]
pub struct TokioSpawner(Option<tokio::runtime::Handle>);

impl TokioSpawner {
  /// Creates a spawner that resolves the current Tokio runtime on each spawn.
  pub fn new() -> Self {
    Self(None)
  }

  /// Creates a spawner pinned to the given runtime.
  pub fn with_handle(handle: tokio::runtime::Handle) -> Self {
    Self(Some(handle))
  }
}

impl TaskSpawner for TokioSpawner {
  fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
    match &self.0 {
      Some(handle) => {
        handle.spawn(future);
      }
      None => match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
          handle.spawn(future);
        }
        Err(_) => tracing::warn!("no tokio runtime available; background task dropped"),
      },
    }
  }
}
