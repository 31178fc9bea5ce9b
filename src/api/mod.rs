//! Typed API of the realtime tracker server.
//!
//! [`RealtimeApi`] wraps a [`ChannelClient`] and knows the channel names,
//! the control commands (`PROJECTION`, `BBOX`, `BUFFER`, `RESET`) and which
//! channels come in topographic and schematic flavours.
//!
//! Control values are remembered. Setting one while connected sends it
//! right away; every (re)connect sends all of them again before the
//! subscriptions are replayed, so the server always sees the viewport
//! before it starts streaming.

pub mod channels;
pub mod extra_geoms;

use std::sync::{Arc, Mutex, MutexGuard};

pub use channels::{Generalization, RealtimeMode};
pub use extra_geoms::ExtraGeoms;

use crate::aggregate::{debounce_departures, Departure};
use crate::channel::client::OnOpen;
use crate::channel::{
    ChannelClient, ClientOptions, Command, ConnectionState, ErrorListener, InboundMessage,
    Listener, RequestParams,
};
use crate::constants::{DEBOUNCE_TIMEOUT, MAX_DEPARTURE_AGE_MINUTES};

/// Viewport sent with `BBOX`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bbox {
    /// `[minX, minY, maxX, maxY]` in the configured projection.
    pub extent: [f64; 4],
    /// Integer map zoom.
    pub zoom: Option<u32>,
    /// Only vehicles of this tenant.
    pub tenant: Option<String>,
    /// Generalization level of served geometries.
    pub generalization: Option<Generalization>,
}

impl Bbox {
    /// Bbox without extra tokens.
    #[must_use]
    pub fn new(extent: [f64; 4]) -> Self {
        Self {
            extent,
            ..Self::default()
        }
    }

    /// Set the zoom token.
    #[must_use]
    pub fn with_zoom(mut self, zoom: u32) -> Self {
        self.zoom = Some(zoom);
        self
    }

    /// Set the `tenant=` token.
    #[must_use]
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Set the `gen=` token.
    #[must_use]
    pub fn with_generalization(mut self, generalization: Generalization) -> Self {
        self.generalization = Some(generalization);
        self
    }

    fn extra_tokens(&self) -> Vec<String> {
        let mut tokens = Vec::new();
        if let Some(zoom) = self.zoom {
            tokens.push(zoom.to_string());
        }
        if let Some(tenant) = &self.tenant {
            tokens.push(format!("tenant={tenant}"));
        }
        if let Some(generalization) = self.generalization {
            tokens.push(format!("gen={}", generalization.level()));
        }
        tokens
    }

    /// The `BBOX` line for this viewport.
    #[must_use]
    pub fn command(&self) -> String {
        let extra = self.extra_tokens();
        Command::Bbox {
            extent: self.extent,
            extra: &extra,
        }
        .to_string()
    }
}

#[derive(Debug, Default)]
struct ControlState {
    url: Option<String>,
    mode: RealtimeMode,
    projection: Option<String>,
    bbox: Option<Bbox>,
    buffer: Option<(u32, u32)>,
}

impl ControlState {
    /// Lines re-sent on every open, in server order.
    fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(projection) = &self.projection {
            lines.push(Command::Projection(projection).to_string());
        }
        if let Some(bbox) = &self.bbox {
            lines.push(bbox.command());
        }
        if let Some((x, y)) = self.buffer {
            lines.push(Command::Buffer(x, y).to_string());
        }
        lines
    }
}

/// Realtime tracker API.
///
/// Cheap to clone; clones share the connection and the control state.
#[derive(Debug, Clone)]
pub struct RealtimeApi {
    client: ChannelClient,
    control: Arc<Mutex<ControlState>>,
}

impl RealtimeApi {
    /// API for `url` (not connected yet). Must run inside a tokio runtime.
    #[must_use]
    pub fn new(url: impl Into<String>, options: ClientOptions) -> Self {
        let url = url.into();
        Self {
            client: ChannelClient::new(options),
            control: Arc::new(Mutex::new(ControlState {
                url: Some(url).filter(|u| !u.is_empty()),
                ..ControlState::default()
            })),
        }
    }

    fn control(&self) -> MutexGuard<'_, ControlState> {
        self.control.lock().expect("control state lock poisoned")
    }

    /// Underlying channel client.
    #[must_use]
    pub fn client(&self) -> &ChannelClient {
        &self.client
    }

    /// Connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    /// Configured server URL.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        self.control().url.clone()
    }

    /// Default mode of trajectory, deleted-vehicle and station channels.
    #[must_use]
    pub fn mode(&self) -> RealtimeMode {
        self.control().mode
    }

    /// Change the default mode. Existing subscriptions are not moved.
    pub fn set_mode(&self, mode: RealtimeMode) {
        self.control().mode = mode;
    }

    /// Connect with the current URL. Returns `false` if no URL is set.
    pub fn open(&self) -> bool {
        let Some(url) = self.url() else {
            log::warn!("[Realtime] Cannot open: no URL configured");
            return false;
        };
        let control = Arc::clone(&self.control);
        let on_open: OnOpen = Arc::new(move || {
            control
                .lock()
                .expect("control state lock poisoned")
                .lines()
        });
        self.client.connect(&url, Some(on_open));
        true
    }

    /// Close the connection. Subscriptions are kept for the next [`Self::open`].
    pub fn close(&self) {
        self.client.close();
    }

    /// Change the server URL. Returns whether it reconnected.
    ///
    /// An open connection, one being opened and one waiting out the
    /// reconnect delay all move to the new URL right away. A closed or never
    /// opened client only remembers it for the next [`Self::open`].
    pub fn set_url(&self, url: impl Into<String>) -> bool {
        let url = url.into();
        {
            let mut control = self.control();
            if control.url.as_deref() == Some(url.as_str()) {
                return false;
            }
            control.url = Some(url);
        }
        if !self.client.is_active() {
            return false;
        }
        self.open()
    }

    /// Change the projection. Returns whether `PROJECTION` was sent.
    pub fn set_projection(&self, projection: impl Into<String>) -> bool {
        let projection = projection.into();
        {
            let mut control = self.control();
            if control.projection.as_deref() == Some(projection.as_str()) {
                return false;
            }
            control.projection = Some(projection.clone());
        }
        self.send_if_open(Command::Projection(&projection).to_string())
    }

    /// Change the viewport. Returns whether `BBOX` was sent.
    pub fn set_bbox(&self, bbox: Bbox) -> bool {
        let line = bbox.command();
        {
            let mut control = self.control();
            if control.bbox.as_ref() == Some(&bbox) {
                return false;
            }
            control.bbox = Some(bbox);
        }
        self.send_if_open(line)
    }

    /// Change server-side buffering. Returns whether `BUFFER` was sent.
    pub fn set_buffer(&self, x: u32, y: u32) -> bool {
        {
            let mut control = self.control();
            if control.buffer == Some((x, y)) {
                return false;
            }
            control.buffer = Some((x, y));
        }
        self.send_if_open(Command::Buffer(x, y).to_string())
    }

    /// Current viewport.
    #[must_use]
    pub fn bbox(&self) -> Option<Bbox> {
        self.control().bbox.clone()
    }

    /// Ask the server to drop trajectory subscriptions.
    ///
    /// The server resumes on the next `BBOX`, so the remembered viewport is
    /// forgotten: the next [`Self::set_bbox`] sends even an unchanged one.
    pub fn reset(&self) {
        self.control().bbox = None;
        self.client.send(Command::Reset.to_string());
    }

    fn send_if_open(&self, line: String) -> bool {
        if !self.client.is_open() {
            return false;
        }
        self.client.send(line);
        true
    }

    // ---- Trajectories ----

    /// Subscribe to trajectories in the viewport.
    pub fn subscribe_trajectory(&self, listener: Listener, quiet: bool) {
        self.unsubscribe_trajectory(&listener);
        let channel = channels::trajectory(self.mode());
        self.client
            .subscribe(RequestParams::new(channel), listener, None, quiet);
    }

    /// Remove `listener` from both trajectory channels.
    pub fn unsubscribe_trajectory(&self, listener: &Listener) {
        for mode in RealtimeMode::ALL {
            self.client
                .unsubscribe(&channels::trajectory(mode), Some(listener));
        }
    }

    /// Subscribe to vehicle deletions.
    pub fn subscribe_deleted_vehicles(&self, listener: Listener, quiet: bool) {
        self.unsubscribe_deleted_vehicles(&listener);
        let channel = channels::deleted_vehicles(self.mode());
        self.client
            .subscribe(RequestParams::new(channel), listener, None, quiet);
    }

    /// Remove `listener` from both deleted-vehicle channels.
    pub fn unsubscribe_deleted_vehicles(&self, listener: &Listener) {
        for mode in RealtimeMode::ALL {
            self.client
                .unsubscribe(&channels::deleted_vehicles(mode), Some(listener));
        }
    }

    /// Subscribe to the full route geometry of vehicle `id`.
    pub fn subscribe_full_trajectory(
        &self,
        id: &str,
        generalization: Option<Generalization>,
        listener: Listener,
    ) {
        self.unsubscribe_full_trajectory(id, Some(&listener));
        let channel = channels::full_trajectory(id, self.mode(), generalization);
        self.client
            .subscribe(RequestParams::new(channel), listener, None, false);
    }

    /// Remove `listener` (or every listener) from the full trajectory of `id`.
    pub fn unsubscribe_full_trajectory(&self, id: &str, listener: Option<&Listener>) {
        for channel in channels::full_trajectory_variants(id) {
            self.client.unsubscribe(&channel, listener);
        }
    }

    /// Fetch the full route geometry of vehicle `id` once.
    pub fn get_full_trajectory(
        &self,
        id: &str,
        generalization: Option<Generalization>,
        listener: Listener,
        on_error: Option<ErrorListener>,
    ) {
        let channel = channels::full_trajectory(id, self.mode(), generalization);
        self.client
            .get(RequestParams::new(channel), listener, on_error);
    }

    // ---- Stop sequences ----

    /// Subscribe to the stop sequence of vehicle `id`.
    pub fn subscribe_stop_sequence(&self, id: &str, listener: Listener) {
        self.client.subscribe(
            RequestParams::new(channels::stop_sequence(id)),
            listener,
            None,
            false,
        );
    }

    /// Remove `listener` (or every listener) from the stop sequence of `id`.
    pub fn unsubscribe_stop_sequence(&self, id: &str, listener: Option<&Listener>) {
        self.client
            .unsubscribe(&channels::stop_sequence(id), listener);
    }

    /// Fetch the stop sequence of vehicle `id` once.
    pub fn get_stop_sequence(&self, id: &str, listener: Listener, on_error: Option<ErrorListener>) {
        self.client.get(
            RequestParams::new(channels::stop_sequence(id)),
            listener,
            on_error,
        );
    }

    // ---- Stations ----

    /// Subscribe to stations in the viewport.
    pub fn subscribe_stations(&self, listener: Listener) {
        self.unsubscribe_stations(&listener);
        self.client.subscribe(
            RequestParams::new(channels::station(self.mode())),
            listener,
            None,
            false,
        );
    }

    /// Remove `listener` from both station channels.
    pub fn unsubscribe_stations(&self, listener: &Listener) {
        for mode in RealtimeMode::ALL {
            self.client
                .unsubscribe(&channels::station(mode), Some(listener));
        }
    }

    /// Fetch one station by UIC once.
    pub fn get_station(&self, uic: &str, listener: Listener, on_error: Option<ErrorListener>) {
        let params = RequestParams::new(channels::station(self.mode())).with_args(uic);
        self.client.get(params, listener, on_error);
    }

    // ---- Departures ----

    /// Subscribe to the departures of `station_id`.
    ///
    /// `on_update` receives the sorted, cleaned list after each burst of
    /// updates. The returned listener unsubscribes via
    /// [`Self::unsubscribe_departures`].
    pub fn subscribe_departures<F>(
        &self,
        station_id: &str,
        sort_by_min_arrival_time: bool,
        on_update: F,
    ) -> Listener
    where
        F: Fn(Vec<Departure>) + Send + Sync + 'static,
    {
        let listener = debounce_departures(
            on_update,
            sort_by_min_arrival_time,
            MAX_DEPARTURE_AGE_MINUTES,
            DEBOUNCE_TIMEOUT,
        );
        self.client.subscribe(
            RequestParams::new(channels::timetable(station_id)),
            listener.clone(),
            None,
            false,
        );
        listener
    }

    /// Remove `listener` (or every listener) from the departures of `station_id`.
    pub fn unsubscribe_departures(&self, station_id: &str, listener: Option<&Listener>) {
        self.client
            .unsubscribe(&channels::timetable(station_id), listener);
    }

    // ---- Misc channels ----

    /// Subscribe to service disruptions.
    pub fn subscribe_disruptions(&self, listener: Listener) {
        self.client.subscribe(
            RequestParams::new(channels::NEWSTICKER),
            listener,
            None,
            false,
        );
    }

    /// Remove `listener` (or every listener) from disruptions.
    pub fn unsubscribe_disruptions(&self, listener: Option<&Listener>) {
        self.client.unsubscribe(channels::NEWSTICKER, listener);
    }

    /// Subscribe to server health reports.
    pub fn subscribe_health_check(&self, listener: Listener) {
        self.client.subscribe(
            RequestParams::new(channels::HEALTHCHECK),
            listener,
            None,
            false,
        );
    }

    /// Remove `listener` (or every listener) from health reports.
    pub fn unsubscribe_health_check(&self, listener: Option<&Listener>) {
        self.client.unsubscribe(channels::HEALTHCHECK, listener);
    }

    /// Subscribe to extra geometries.
    ///
    /// `on_update` receives the whole current set after every change.
    pub fn subscribe_extra_geoms<F>(&self, on_update: F) -> Listener
    where
        F: Fn(&ExtraGeoms) + Send + Sync + 'static,
    {
        let state = Mutex::new(ExtraGeoms::new());
        let listener = Listener::new(move |msg: &InboundMessage| {
            let mut geoms = state.lock().expect("extra geoms lock poisoned");
            if geoms.apply(msg) {
                on_update(&geoms);
            }
        });
        self.client.subscribe(
            RequestParams::new(channels::EXTRA_GEOMS),
            listener.clone(),
            None,
            false,
        );
        listener
    }

    /// Remove `listener` (or every listener) from extra geometries.
    pub fn unsubscribe_extra_geoms(&self, listener: Option<&Listener>) {
        self.client.unsubscribe(channels::EXTRA_GEOMS, listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> RealtimeApi {
        RealtimeApi::new("ws://127.0.0.1:1/", ClientOptions::default())
    }

    #[test]
    fn test_bbox_command() {
        let bbox = Bbox::new([1.0, 2.0, 3.0, 4.0])
            .with_zoom(12)
            .with_tenant("sbb")
            .with_generalization(Generalization::Gen30);
        assert_eq!(bbox.command(), "BBOX 1 2 3 4 12 tenant=sbb gen=30");
        assert_eq!(Bbox::new([0.5, 0.0, 1.0, 1.0]).command(), "BBOX 0.5 0 1 1");
    }

    #[test]
    fn test_control_lines_order() {
        let state = ControlState {
            projection: Some("EPSG:3857".into()),
            bbox: Some(Bbox::new([0.0, 0.0, 1.0, 1.0])),
            buffer: Some((100, 100)),
            ..ControlState::default()
        };
        assert_eq!(
            state.lines(),
            ["PROJECTION EPSG:3857", "BBOX 0 0 1 1", "BUFFER 100 100"]
        );
        assert!(ControlState::default().lines().is_empty());
    }

    #[tokio::test]
    async fn test_setters_compare_values_and_only_send_when_open() {
        let api = api();
        assert!(!api.set_projection("EPSG:3857"));
        assert!(!api.set_projection("EPSG:3857"));
        assert!(!api.set_bbox(Bbox::new([0.0, 0.0, 1.0, 1.0])));
        assert!(!api.set_buffer(100, 100));
        assert_eq!(api.bbox(), Some(Bbox::new([0.0, 0.0, 1.0, 1.0])));
        assert_eq!(
            api.control().lines(),
            ["PROJECTION EPSG:3857", "BBOX 0 0 1 1", "BUFFER 100 100"]
        );
    }

    #[tokio::test]
    async fn test_set_url_while_disconnected_does_not_connect() {
        let api = api();
        assert!(!api.set_url("ws://127.0.0.1:1/"));
        assert!(!api.set_url("ws://127.0.0.1:2/"));
        assert_eq!(api.url().as_deref(), Some("ws://127.0.0.1:2/"));
        assert_eq!(api.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reset_forgets_bbox() {
        let api = api();
        let bbox = Bbox::new([0.0, 0.0, 1.0, 1.0]);
        api.set_bbox(bbox.clone());
        api.reset();
        assert_eq!(api.bbox(), None);
        assert!(api.control().lines().is_empty());

        api.set_bbox(bbox.clone());
        assert_eq!(api.bbox(), Some(bbox));
    }

    #[tokio::test]
    async fn test_open_without_url_fails() {
        let api = RealtimeApi::new("", ClientOptions::default());
        assert!(!api.open());
    }

    #[tokio::test]
    async fn test_subscribe_trajectory_moves_listener_between_modes() {
        let api = api();
        let listener = Listener::new(|_| {});

        api.subscribe_trajectory(listener.clone(), false);
        assert_eq!(api.client().listener_count("trajectory"), 1);

        api.set_mode(RealtimeMode::Schematic);
        api.subscribe_trajectory(listener.clone(), false);
        assert_eq!(api.client().listener_count("trajectory"), 0);
        assert_eq!(api.client().listener_count("trajectory_schematic"), 1);

        api.unsubscribe_trajectory(&listener);
        assert_eq!(api.client().listener_count("trajectory_schematic"), 0);
    }

    #[tokio::test]
    async fn test_full_trajectory_unsubscribe_covers_generalizations() {
        let api = api();
        let listener = Listener::new(|_| {});
        api.subscribe_full_trajectory("sbb_1", Some(Generalization::Gen10), listener.clone());
        assert_eq!(api.client().listener_count("full_trajectory_sbb_1_gen10"), 1);

        api.unsubscribe_full_trajectory("sbb_1", Some(&listener));
        assert_eq!(api.client().listener_count("full_trajectory_sbb_1_gen10"), 0);
    }

    #[tokio::test]
    async fn test_departures_and_extra_geoms_return_listeners() {
        let api = api();
        let departures = api.subscribe_departures("8503000", false, |_| {});
        assert_eq!(api.client().listener_count("timetable_8503000"), 1);
        api.unsubscribe_departures("8503000", Some(&departures));
        assert_eq!(api.client().listener_count("timetable_8503000"), 0);

        let geoms = api.subscribe_extra_geoms(|_| {});
        assert_eq!(api.client().listener_count("extra_geoms"), 1);
        api.unsubscribe_extra_geoms(Some(&geoms));
        assert_eq!(api.client().listener_count("extra_geoms"), 0);
    }
}
