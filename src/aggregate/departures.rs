//! Station departures from `timetable_<station>` channels.
//!
//! The server sends one message per departure. They are collected per
//! station by `call_id`, then sorted and cleaned up before delivery:
//!
//! 1. Departures with an on-site display (`has_fzo`) that are `HIDDEN`,
//!    `LEAVING` or `BOARDING` come first, in that order. The rest follow
//!    by ascending time; departures without a time go last.
//! 2. Departures outside `now ± max_age` are dropped.
//! 3. Only the latest `BOARDING` departure per platform stays boarding;
//!    the others on that platform become `HIDDEN`.
//! 4. Of two neighbours heading to the same first destination on the same
//!    line less than a second apart, the later one becomes `HIDDEN`.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::Debouncer;
use crate::channel::{InboundMessage, Listener};
use crate::constants::DUPLICATE_DEPARTURE_WINDOW_MS;

/// Departure state: vehicle is at the platform.
pub const BOARDING: &str = "BOARDING";
/// Departure state: vehicle is leaving.
pub const LEAVING: &str = "LEAVING";
/// Departure state: not to be shown.
pub const HIDDEN: &str = "HIDDEN";

const TOP_STATES: [&str; 3] = [HIDDEN, LEAVING, BOARDING];
const CANCELLED_STATES: [&str; 2] = ["STOP_CANCELLED", "JOURNEY_CANCELLED"];

/// Line served by a departure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DepartureLine {
    /// Public line name (e.g. `S3`).
    #[serde(default)]
    pub name: String,
    /// Background colour, `#rrggbb`.
    #[serde(default)]
    pub color: Option<String>,
    /// Text colour, `#rrggbb`.
    #[serde(default)]
    pub text_color: Option<String>,
}

/// One departure of a station timetable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Departure {
    /// Stable id of this stop call.
    #[serde(default, deserialize_with = "string_or_number")]
    pub call_id: Option<String>,
    /// Destinations, first one is displayed.
    #[serde(default)]
    pub to: Vec<String>,
    /// Line.
    #[serde(default)]
    pub line: DepartureLine,
    /// Platform.
    #[serde(default, deserialize_with = "string_or_number")]
    pub platform: Option<String>,
    /// Realtime state (`BOARDING`, `LEAVING`, `HIDDEN`, `JOURNEY_CANCELLED`, ...).
    #[serde(default)]
    pub state: Option<String>,
    /// Whether an on-site display reports this departure.
    #[serde(default)]
    pub has_fzo: bool,
    /// Departure time in epoch milliseconds.
    #[serde(default, deserialize_with = "epoch_millis")]
    pub time: Option<i64>,
    /// Earliest arrival time in epoch milliseconds.
    #[serde(default, deserialize_with = "epoch_millis")]
    pub min_arrival_time: Option<i64>,
    /// Set when the state reports a cancellation.
    #[serde(default)]
    pub cancelled: bool,
    /// Remaining fields, passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Departure {
    fn state_is(&self, state: &str) -> bool {
        self.state.as_deref() == Some(state)
    }

    fn top_rank(&self) -> Option<usize> {
        if !self.has_fzo {
            return None;
        }
        let state = self.state.as_deref()?;
        TOP_STATES.iter().position(|s| *s == state)
    }

    fn sort_time(&self, by_min_arrival_time: bool) -> Option<i64> {
        if by_min_arrival_time {
            self.min_arrival_time.or(self.time)
        } else {
            self.time
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Accepts epoch milliseconds or an RFC 3339 timestamp.
fn epoch_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.timestamp_millis()),
        _ => None,
    })
}

fn compare(a: &Departure, b: &Departure, by_min_arrival_time: bool) -> Ordering {
    match (a.top_rank(), b.top_rank()) {
        (Some(x), Some(y)) if x != y => return x.cmp(&y),
        (Some(_), None) => return Ordering::Less,
        (None, Some(_)) => return Ordering::Greater,
        _ => {}
    }
    match (a.sort_time(by_min_arrival_time), b.sort_time(by_min_arrival_time)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Sort departures and apply the display rules described in the module docs.
///
/// `now_ms` is epoch milliseconds. Departures without a time are never
/// dropped by the age window.
#[must_use]
pub fn sort_and_filter_departures(
    departures: impl IntoIterator<Item = Departure>,
    sort_by_min_arrival_time: bool,
    max_age_minutes: i64,
    now_ms: i64,
) -> Vec<Departure> {
    let mut list: Vec<Departure> = departures.into_iter().collect();
    list.sort_by(|a, b| compare(a, b, sort_by_min_arrival_time));

    let window = max_age_minutes * 60_000;
    list.retain(|d| {
        d.time
            .map_or(true, |t| t > now_ms - window && t < now_ms + window)
    });

    for departure in &mut list {
        if let Some(state) = departure.state.as_deref() {
            if CANCELLED_STATES.iter().any(|s| state.contains(s)) {
                departure.cancelled = true;
            }
        }
    }

    // Walk backwards so the latest departure keeps the platform.
    let mut boarding_platforms = HashSet::new();
    for departure in list.iter_mut().rev() {
        if departure.state_is(BOARDING) && !boarding_platforms.insert(departure.platform.clone()) {
            departure.state = Some(HIDDEN.to_string());
        }
    }

    for i in 1..list.len() {
        let (head, tail) = list.split_at_mut(i);
        let previous = &head[i - 1];
        let current = &mut tail[0];
        if is_duplicate(previous, current) {
            log::trace!(
                "[Realtime] Hiding duplicate departure {:?} of line {}",
                current.call_id,
                current.line.name
            );
            current.state = Some(HIDDEN.to_string());
        }
    }

    list
}

fn is_duplicate(a: &Departure, b: &Departure) -> bool {
    let (Some(ta), Some(tb)) = (a.time, b.time) else {
        return false;
    };
    a.to.first().is_some()
        && a.to.first() == b.to.first()
        && a.line.name == b.line.name
        && (tb - ta).abs() < DUPLICATE_DEPARTURE_WINDOW_MS
}

/// Listener collecting departures per station and delivering the cleaned
/// list once the timetable channel is quiet for `timeout`.
///
/// Departures are keyed by `call_id`; departures without one are appended.
pub fn debounce_departures<F>(
    on_update: F,
    sort_by_min_arrival_time: bool,
    max_age_minutes: i64,
    timeout: Duration,
) -> Listener
where
    F: Fn(Vec<Departure>) + Send + Sync + 'static,
{
    let by_station: Arc<Mutex<HashMap<String, Vec<Departure>>>> = Arc::default();
    let on_update = Arc::new(on_update);
    let debouncer = Debouncer::new(timeout);

    Listener::new(move |msg: &InboundMessage| {
        let departure: Departure = match serde_json::from_value(msg.content.clone()) {
            Ok(departure) => departure,
            Err(e) => {
                log::warn!("[Realtime] Dropping unreadable departure on {}: {}", msg.source, e);
                return;
            }
        };

        {
            let mut by_station = by_station.lock().expect("departures lock poisoned");
            let station = by_station.entry(msg.source.clone()).or_default();
            let existing = departure
                .call_id
                .as_ref()
                .and_then(|id| station.iter().position(|d| d.call_id.as_ref() == Some(id)));
            match existing {
                Some(pos) => station[pos] = departure,
                None => station.push(departure),
            }
        }

        let by_station = Arc::clone(&by_station);
        let on_update = Arc::clone(&on_update);
        let source = msg.source.clone();
        debouncer.schedule(&msg.source, move || {
            let departures = by_station
                .lock()
                .expect("departures lock poisoned")
                .get(&source)
                .cloned()
                .unwrap_or_default();
            let now_ms = Utc::now().timestamp_millis();
            on_update(sort_and_filter_departures(
                departures,
                sort_by_min_arrival_time,
                max_age_minutes,
                now_ms,
            ));
        });
    })
}
