//! Records which strategy and key served each call.
//!
//! Wrap any future in [`observe`] to collect an [`Observation`] for every
//! call a strategy answered from cache or wrote into cache while the future
//! ran. Scopes are task-local and nest: an inner scope's records are also
//! seen by every enclosing scope. Detached background work is not observed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// One cache interaction made by a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
  pub key: String,
  /// Name of the strategy, e.g. `"early"`.
  pub strategy: &'static str,
  /// Name of the backend that served the key.
  pub backend: String,
  pub ttl: Option<Duration>,
  /// The operation error a cached value was served in place of.
  pub error: Option<String>,
}

type Sink = Arc<Mutex<Vec<Observation>>>;

tokio::task_local! {
  static SINKS: Vec<Sink>;
}

/// Runs `future`, returning its output and the observations it produced.
pub async fn observe<F: Future>(future: F) -> (F::Output, Vec<Observation>) {
  let sink: Sink = Arc::default();
  let mut sinks = SINKS.try_with(Clone::clone).unwrap_or_default();
  sinks.push(sink.clone());
  let output = SINKS.scope(sinks, future).await;
  let records = std::mem::take(&mut *sink.lock());
  (output, records)
}

/// Returns `true` inside an [`observe`] scope.
pub fn is_observing() -> bool {
  SINKS.try_with(|sinks| !sinks.is_empty()).unwrap_or(false)
}

pub(crate) fn record(observation: Observation) {
  let _ = SINKS.try_with(|sinks| {
    for sink in sinks {
      sink.lock().push(observation.clone());
    }
  });
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample(key: &str) -> Observation {
    Observation {
      key: key.to_string(),
      strategy: "simple",
      backend: "memory".to_string(),
      ttl: None,
      error: None,
    }
  }

  #[tokio::test]
  async fn nested_scopes_propagate_outwards() {
    let (((), inner), outer) = observe(async {
      record(sample("a"));
      observe(async { record(sample("b")) }).await
    })
    .await;

    assert_eq!(inner.iter().map(|o| o.key.as_str()).collect::<Vec<_>>(), vec!["b"]);
    assert_eq!(outer.iter().map(|o| o.key.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
  }

  #[tokio::test]
  async fn records_outside_a_scope_are_dropped() {
    assert!(!is_observing());
    record(sample("lost"));
    let (_, records) = observe(async { assert!(is_observing()) }).await;
    assert!(records.is_empty());
  }
}
