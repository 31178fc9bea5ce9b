//! Debounced aggregation of bursty channel messages.
//!
//! Servers often push many small updates for one channel in quick
//! succession (a timetable sends one message per departure). An aggregator
//! collects them per source into an id → value map and hands the whole
//! collection to the caller once the source has been idle for the debounce
//! window.
//!
//! Each source has its own timer; a message on `timetable_1` never delays
//! delivery for `timetable_2`.

pub mod departures;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

pub use departures::{debounce_departures, sort_and_filter_departures, Departure};

use crate::channel::{InboundMessage, Listener};

/// Per-source trailing-edge debouncer.
///
/// Scheduling a task for a source aborts the task still pending for that
/// source. Pending tasks are aborted when the debouncer is dropped.
#[derive(Debug)]
pub struct Debouncer {
    timeout: Duration,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Debouncer {
    /// Debouncer with the given idle window.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Run `task` once `source` has been quiet for the idle window.
    ///
    /// Outside a tokio runtime the task runs immediately.
    pub fn schedule(&self, source: &str, task: impl FnOnce() + Send + 'static) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::trace!("[Realtime] No runtime, delivering {} without debounce", source);
            task();
            return;
        };

        let timeout = self.timeout;
        let timer = handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            task();
        });

        let mut timers = self.timers.lock().expect("debounce timers lock poisoned");
        timers.retain(|_, pending| !pending.is_finished());
        if let Some(previous) = timers.insert(source.to_string(), timer) {
            previous.abort();
        }
    }

    /// Abort every pending task.
    pub fn cancel_all(&self) {
        let mut timers = self.timers.lock().expect("debounce timers lock poisoned");
        for (_, timer) in timers.drain() {
            timer.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

type IdFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;

/// Values collected for one source, in arrival order.
struct Collected<T> {
    values: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T> Default for Collected<T> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> Collected<T> {
    fn upsert(&mut self, id: Option<String>, value: T) {
        match id {
            Some(id) => match self.index.get(&id) {
                Some(&pos) => self.values[pos] = value,
                None => {
                    self.index.insert(id, self.values.len());
                    self.values.push(value);
                }
            },
            None => self.values.push(value),
        }
    }
}

/// Listener appending every message content to a per-source list.
///
/// `on_update` receives the full list for a source after it was idle for
/// `timeout`.
pub fn debounce_messages<T, F>(on_update: F, timeout: Duration) -> Listener
where
    T: DeserializeOwned + Clone + Send + 'static,
    F: Fn(Vec<T>) + Send + Sync + 'static,
{
    aggregate(on_update, None, timeout)
}

/// Like [`debounce_messages`] but keyed by `id_of`: a later value with the
/// same id replaces the earlier one in place.
pub fn debounce_messages_by_id<T, F, I>(on_update: F, id_of: I, timeout: Duration) -> Listener
where
    T: DeserializeOwned + Clone + Send + 'static,
    F: Fn(Vec<T>) + Send + Sync + 'static,
    I: Fn(&T) -> String + Send + Sync + 'static,
{
    aggregate(on_update, Some(Arc::new(id_of)), timeout)
}

fn aggregate<T, F>(on_update: F, id_of: Option<IdFn<T>>, timeout: Duration) -> Listener
where
    T: DeserializeOwned + Clone + Send + 'static,
    F: Fn(Vec<T>) + Send + Sync + 'static,
{
    let collected: Arc<Mutex<HashMap<String, Collected<T>>>> = Arc::default();
    let on_update = Arc::new(on_update);
    let debouncer = Debouncer::new(timeout);

    Listener::new(move |msg: &InboundMessage| {
        let value: T = match serde_json::from_value(msg.content.clone()) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("[Realtime] Dropping unreadable {} message: {}", msg.source, e);
                return;
            }
        };
        let id = id_of.as_ref().map(|id_of| id_of(&value));
        collected
            .lock()
            .expect("aggregate lock poisoned")
            .entry(msg.source.clone())
            .or_default()
            .upsert(id, value);

        let collected = Arc::clone(&collected);
        let on_update = Arc::clone(&on_update);
        let source = msg.source.clone();
        debouncer.schedule(&msg.source, move || {
            let values = collected
                .lock()
                .expect("aggregate lock poisoned")
                .get(&source)
                .map(|c| c.values.clone())
                .unwrap_or_default();
            on_update(values);
        });
    })
}
