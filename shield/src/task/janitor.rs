use crate::backend::memory::MemoryStore;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Upper bound on a single sleep so a stop request is noticed promptly.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(50);

/// The background thread that sweeps expired entries out of a memory backend.
pub(crate) struct Janitor {
  handle: Option<JoinHandle<()>>,
  stop_flag: Arc<AtomicBool>,
}

impl Janitor {
  /// Spawns a new janitor thread.
  pub(crate) fn spawn(store: Arc<MemoryStore>, tick_interval: Duration) -> Self {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_clone = stop_flag.clone();

    let handle = thread::Builder::new()
      .name("fibre-shield-janitor".to_string())
      .spawn(move || {
        while !stop_clone.load(Ordering::Relaxed) {
          let tick_start = Instant::now();

          let removed = store.purge_expired();
          if removed > 0 {
            tracing::trace!(removed, "janitor swept expired entries");
          }

          // Sleep out the rest of the tick in short slices.
          while !stop_clone.load(Ordering::Relaxed) {
            match tick_interval.checked_sub(tick_start.elapsed()) {
              Some(remaining) if !remaining.is_zero() => {
                thread::sleep(remaining.min(MAX_SLEEP_SLICE))
              }
              _ => break,
            }
          }
        }
      });

    let handle = match handle {
      Ok(handle) => Some(handle),
      Err(e) => {
        tracing::warn!(error = %e, "failed to start janitor thread; expired entries are dropped lazily");
        None
      }
    };

    Self { handle, stop_flag }
  }

  /// Signals the janitor thread to stop. The thread exits on its own.
  pub(crate) fn stop(mut self) {
    self.stop_flag.store(true, Ordering::Relaxed);
    drop(self.handle.take());
  }
}
