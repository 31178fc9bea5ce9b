//! Realtime trajectory engine.
//!
//! Keeps the vehicles of the `trajectory` channel, moves them along their
//! geometries and renders a frame per animation tick.
//!
//! # Architecture
//!
//! ```text
//!   RealtimeApi ── trajectory / deleted_vehicles ──► TrajectoryStore
//!                                                        │ snapshot
//!   animation task (tokio interval) ── RenderRequest ──► RenderWorker thread
//!        ▲                                                    │
//!        └──────────────────── Frame ◄────────────────────────┘
//!        │
//!        └─► on_frame callback, last frame for hit-testing
//! ```
//!
//! The host supplies the view through a pulled `view_state` callback. The
//! engine never decides what is visible; it only draws what the view covers.

pub mod filter;
pub mod interpolate;
pub mod render;
pub mod store;
pub mod style;
pub mod trajectory;
pub mod view;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

pub use filter::TrajectoryFilter;
pub use interpolate::{interpolate, Interpolated};
pub use render::{Frame, RenderOptions, RenderRequest, RenderedVehicle, Renderer};
pub use store::TrajectoryStore;
pub use style::{CircleStyle, StyleCache, StyleContext, StyleKey, VehicleStyle};
pub use trajectory::{Geometry, Trajectory};
pub use view::ViewState;

use crate::api::{Bbox, Generalization, RealtimeApi};
use crate::channel::{InboundMessage, Listener};
use crate::constants::{FRAME_INTERVAL, HIT_TOLERANCE_PX, STYLE_CACHE_CAPACITY, TRAJECTORY_TTL};
use render::RenderWorker;

/// Errors of the trajectory engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Geometry type that cannot be interpolated.
    UnsupportedGeometry(String),
    /// Line without coordinates.
    EmptyGeometry,
    /// Trajectory message that could not be read.
    InvalidTrajectory(String),
    /// The render thread could not be started.
    WorkerUnavailable(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedGeometry(kind) => write!(f, "Unsupported geometry: {kind}"),
            Self::EmptyGeometry => write!(f, "Empty geometry"),
            Self::InvalidTrajectory(msg) => write!(f, "Invalid trajectory: {msg}"),
            Self::WorkerUnavailable(msg) => write!(f, "Render worker unavailable: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Pulls the current view from the host. `None` skips the frame.
pub type ViewStateFn = Arc<dyn Fn() -> Option<ViewState> + Send + Sync>;

/// Receives every rendered frame.
pub type FrameFn = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Animation tick.
    pub frame_interval: Duration,
    /// Trajectories not updated for this long are dropped.
    pub trajectory_ttl: Duration,
    /// Sprites kept by the style cache.
    pub style_cache_capacity: usize,
    /// Hit-test radius in CSS pixels.
    pub hit_tolerance: f64,
    /// Tenant sent with `BBOX`.
    pub tenant: Option<String>,
    /// Level of the selected vehicle's full trajectory.
    pub full_trajectory_generalization: Option<Generalization>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            frame_interval: FRAME_INTERVAL,
            trajectory_ttl: TRAJECTORY_TTL,
            style_cache_capacity: STYLE_CACHE_CAPACITY,
            hit_tolerance: HIT_TOLERANCE_PX,
            tenant: None,
            full_trajectory_generalization: None,
        }
    }
}

struct Selection {
    id: String,
    listener: Listener,
}

/// State shared with listeners and the animation task.
struct Inner {
    store: Mutex<TrajectoryStore>,
    hovered: Mutex<Option<String>>,
    selected: Mutex<Option<Selection>>,
    selected_full: Mutex<Option<Value>>,
    last_frame: Mutex<Option<Arc<Frame>>>,
    on_frame: Mutex<Option<FrameFn>>,
}

impl Inner {
    fn store(&self) -> MutexGuard<'_, TrajectoryStore> {
        self.store.lock().expect("trajectory store lock poisoned")
    }

    fn on_trajectory(&self, msg: &InboundMessage) {
        match Trajectory::from_content(&msg.content) {
            Ok(trajectory) => {
                self.store().upsert(trajectory, Instant::now());
            }
            Err(e) => log::warn!("[Engine] Dropping trajectory from {}: {}", msg.source, e),
        }
    }

    fn on_deleted(&self, msg: &InboundMessage) {
        if let Some(id) = trajectory::deleted_vehicle_id(&msg.content) {
            if self.store().remove(&id).is_some() {
                log::trace!("[Engine] Removed {}", id);
            }
        }
    }

    fn render_options(&self) -> RenderOptions {
        RenderOptions {
            hovered_id: self.hovered.lock().expect("hover lock poisoned").clone(),
            selected_id: self
                .selected
                .lock()
                .expect("selection lock poisoned")
                .as_ref()
                .map(|s| s.id.clone()),
        }
    }

    /// Store and announce a frame of the run owning `live`.
    ///
    /// `live` is read under the frame lock that [`RealtimeEngine::stop`]
    /// holds while clearing it, so nothing is stored once `stop` returned.
    fn publish(&self, frame: Frame, live: &AtomicBool) {
        let frame = Arc::new(frame);
        {
            let mut last_frame = self.last_frame.lock().expect("frame lock poisoned");
            if !live.load(Ordering::SeqCst) {
                log::trace!("[Engine] Discarding frame rendered after stop");
                return;
            }
            *last_frame = Some(Arc::clone(&frame));
        }
        let on_frame = self.on_frame.lock().expect("on_frame lock poisoned").clone();
        if let Some(on_frame) = on_frame {
            on_frame(&frame);
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    live: Arc<AtomicBool>,
    trajectory_listener: Listener,
    deleted_listener: Listener,
}

/// Realtime trajectory engine.
pub struct RealtimeEngine {
    api: RealtimeApi,
    view_state: ViewStateFn,
    style: Arc<dyn VehicleStyle>,
    options: EngineOptions,
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for RealtimeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeEngine")
            .field("api", &self.api)
            .field("options", &self.options)
            .field("running", &self.is_running())
            .field("trajectories", &self.trajectory_count())
            .finish_non_exhaustive()
    }
}

impl RealtimeEngine {
    /// Engine drawing with the default [`CircleStyle`].
    pub fn new(
        api: RealtimeApi,
        view_state: impl Fn() -> Option<ViewState> + Send + Sync + 'static,
        options: EngineOptions,
    ) -> Self {
        Self {
            api,
            view_state: Arc::new(view_state),
            style: Arc::new(CircleStyle::default()),
            inner: Arc::new(Inner {
                store: Mutex::new(TrajectoryStore::new(options.trajectory_ttl)),
                hovered: Mutex::new(None),
                selected: Mutex::new(None),
                selected_full: Mutex::new(None),
                last_frame: Mutex::new(None),
                on_frame: Mutex::new(None),
            }),
            options,
            running: Mutex::new(None),
        }
    }

    /// Replace the vehicle style. Takes effect on the next [`Self::start`].
    #[must_use]
    pub fn with_style(mut self, style: Arc<dyn VehicleStyle>) -> Self {
        self.style = style;
        self
    }

    /// API the engine subscribes through.
    #[must_use]
    pub fn api(&self) -> &RealtimeApi {
        &self.api
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().expect("engine state lock poisoned")
    }

    /// Whether the engine is started.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Subscribe to trajectories and start animating.
    ///
    /// Opens the API connection if it is not open yet. Must run inside a
    /// tokio runtime.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut running = self.running();
        if running.is_some() {
            return Ok(());
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let renderer = Renderer::new(Arc::clone(&self.style), self.options.style_cache_capacity);
        let worker = RenderWorker::spawn(renderer, frame_tx)
            .map_err(|e| EngineError::WorkerUnavailable(e.to_string()))?;

        let inner = Arc::clone(&self.inner);
        let trajectory_listener = Listener::new(move |msg| inner.on_trajectory(msg));
        let inner = Arc::clone(&self.inner);
        let deleted_listener = Listener::new(move |msg| inner.on_deleted(msg));

        self.api.subscribe_trajectory(trajectory_listener.clone(), false);
        self.api
            .subscribe_deleted_vehicles(deleted_listener.clone(), false);
        if !self.api.client().is_active() {
            self.api.open();
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let live = Arc::new(AtomicBool::new(true));
        tokio::spawn(animate(
            Animation {
                inner: Arc::clone(&self.inner),
                api: self.api.clone(),
                view_state: Arc::clone(&self.view_state),
                options: self.options.clone(),
                live: Arc::clone(&live),
            },
            worker,
            frame_rx,
            shutdown_rx,
        ));

        *running = Some(Running {
            shutdown,
            live,
            trajectory_listener,
            deleted_listener,
        });
        log::info!("[Engine] Started in {} mode", self.api.mode());
        Ok(())
    }

    /// Stop animating, unsubscribe and forget every trajectory.
    ///
    /// No frame is published once this returns. The animation task and the
    /// render thread wind down in the background.
    pub fn stop(&self) {
        let Some(running) = self.running().take() else {
            return;
        };
        {
            let mut last_frame = self.inner.last_frame.lock().expect("frame lock poisoned");
            running.live.store(false, Ordering::SeqCst);
            *last_frame = None;
        }
        let _ = running.shutdown.send(true);
        self.api.unsubscribe_trajectory(&running.trajectory_listener);
        self.api
            .unsubscribe_deleted_vehicles(&running.deleted_listener);
        self.inner.store().clear();
        log::info!("[Engine] Stopped");
    }

    /// Replace the trajectory filter. Stored vehicles it rejects are dropped.
    pub fn set_filter(&self, filter: TrajectoryFilter) {
        self.inner.store().set_filter(filter);
    }

    /// Register the frame callback. It runs on the runtime; keep it short.
    pub fn set_on_frame(&self, on_frame: impl Fn(&Frame) + Send + Sync + 'static) {
        *self.inner.on_frame.lock().expect("on_frame lock poisoned") = Some(Arc::new(on_frame));
    }

    /// Number of stored trajectories.
    #[must_use]
    pub fn trajectory_count(&self) -> usize {
        self.inner.store().len()
    }

    /// Stored trajectory by id.
    #[must_use]
    pub fn trajectory(&self, id: &str) -> Option<Trajectory> {
        self.inner.store().get(id).cloned()
    }

    /// Ids of every stored trajectory, sorted.
    #[must_use]
    pub fn trajectory_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .store()
            .snapshot()
            .into_iter()
            .map(|t| t.id)
            .collect();
        ids.sort();
        ids
    }

    /// Most recent frame.
    #[must_use]
    pub fn last_frame(&self) -> Option<Arc<Frame>> {
        self.inner
            .last_frame
            .lock()
            .expect("frame lock poisoned")
            .clone()
    }

    /// Vehicle of the last frame nearest to `pixel`, projected with `view`
    /// (or the frame's own view).
    #[must_use]
    pub fn hit_test(&self, pixel: [f64; 2], view: Option<&ViewState>) -> Option<Trajectory> {
        let frame = self.last_frame()?;
        let view = view.unwrap_or(&frame.view);
        let hit =
            render::nearest_vehicle(&frame.vehicles, view, pixel, self.options.hit_tolerance)?;
        self.trajectory(&hit.id)
    }

    /// Hovered vehicle id.
    #[must_use]
    pub fn hovered_id(&self) -> Option<String> {
        self.inner.hovered.lock().expect("hover lock poisoned").clone()
    }

    /// Set the hovered vehicle. Returns whether it changed.
    pub fn set_hovered_id(&self, id: Option<&str>) -> bool {
        let mut hovered = self.inner.hovered.lock().expect("hover lock poisoned");
        if hovered.as_deref() == id {
            return false;
        }
        *hovered = id.map(str::to_string);
        true
    }

    /// Selected vehicle id.
    #[must_use]
    pub fn selected_id(&self) -> Option<String> {
        self.inner
            .selected
            .lock()
            .expect("selection lock poisoned")
            .as_ref()
            .map(|s| s.id.clone())
    }

    /// Select a vehicle and follow its full trajectory. Returns whether the
    /// selection changed.
    pub fn set_selected_id(&self, id: Option<&str>) -> bool {
        let previous = {
            let mut selected = self.inner.selected.lock().expect("selection lock poisoned");
            if selected.as_ref().map(|s| s.id.as_str()) == id {
                return false;
            }
            selected.take()
        };

        if let Some(previous) = previous {
            self.api
                .unsubscribe_full_trajectory(&previous.id, Some(&previous.listener));
        }
        *self
            .inner
            .selected_full
            .lock()
            .expect("full trajectory lock poisoned") = None;

        if let Some(id) = id {
            let inner = Arc::clone(&self.inner);
            let listener = Listener::new(move |msg: &InboundMessage| {
                *inner
                    .selected_full
                    .lock()
                    .expect("full trajectory lock poisoned") = Some(msg.content.clone());
            });
            self.api.subscribe_full_trajectory(
                id,
                self.options.full_trajectory_generalization,
                listener.clone(),
            );
            *self.inner.selected.lock().expect("selection lock poisoned") = Some(Selection {
                id: id.to_string(),
                listener,
            });
            log::debug!("[Engine] Selected {}", id);
        }
        true
    }

    /// Latest full trajectory of the selected vehicle.
    #[must_use]
    pub fn selected_full_trajectory(&self) -> Option<Value> {
        self.inner
            .selected_full
            .lock()
            .expect("full trajectory lock poisoned")
            .clone()
    }
}

impl Drop for RealtimeEngine {
    fn drop(&mut self) {
        self.stop();
        self.set_selected_id(None);
    }
}

/// Current time in epoch milliseconds.
fn now_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

fn bbox_for(view: &ViewState, tenant: Option<&String>) -> Bbox {
    let mut bbox = Bbox::new(view.extent).with_zoom(view.zoom.max(0.0).floor() as u32);
    if let Some(tenant) = tenant {
        bbox = bbox.with_tenant(tenant.clone());
    }
    bbox
}

/// What the animation task of one run works with.
struct Animation {
    inner: Arc<Inner>,
    api: RealtimeApi,
    view_state: ViewStateFn,
    options: EngineOptions,
    live: Arc<AtomicBool>,
}

async fn animate(
    animation: Animation,
    worker: RenderWorker,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Animation {
        inner,
        api,
        view_state,
        options,
        live,
    } = animation;
    let mut tick = tokio::time::interval(options.frame_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                inner.store().purge_stale(Instant::now());

                let Some(mut view) = view_state() else {
                    worker.cancel();
                    continue;
                };
                if view.time <= 0.0 {
                    view.time = now_ms();
                }
                api.set_bbox(bbox_for(&view, options.tenant.as_ref()));

                worker.request(RenderRequest {
                    trajectories: inner.store().snapshot(),
                    view,
                    options: inner.render_options(),
                });
            }
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    log::warn!("[Engine] Render worker exited");
                    break;
                };
                inner.publish(frame, &live);
            }
        }
    }

    // Joining the render thread blocks.
    tokio::task::spawn_blocking(move || worker.shutdown());
    log::debug!("[Engine] Animation task exited");
}
