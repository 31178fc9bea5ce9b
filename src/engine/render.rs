//! Frame rendering off the async runtime.
//!
//! The engine never touches pixels itself. Each animation tick it sends a
//! [`RenderRequest`] to a [`RenderWorker`] thread, which owns the style
//! cache, draws a [`Frame`] and sends it back. Requests that pile up while
//! a frame is being drawn are coalesced: only the newest one is rendered.

use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use image::RgbaImage;
use tokio::sync::mpsc as async_mpsc;

use super::interpolate::interpolate;
use super::style::{StyleCache, StyleContext, VehicleStyle};
use super::trajectory::{Coordinate, Trajectory};
use super::view::ViewState;

/// Highlight state of a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Hovered vehicle id.
    pub hovered_id: Option<String>,
    /// Selected vehicle id.
    pub selected_id: Option<String>,
}

/// Everything needed to draw one frame.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Vehicles to draw.
    pub trajectories: Vec<Trajectory>,
    /// View to draw for. `view.time` is the render time.
    pub view: ViewState,
    /// Highlights.
    pub options: RenderOptions,
}

/// A vehicle as drawn in a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedVehicle {
    /// Vehicle id.
    pub id: String,
    /// Interpolated map coordinate.
    pub coordinate: Coordinate,
    /// CSS pixel in the frame's view.
    pub pixel: [f64; 2],
    /// Heading in radians.
    pub rotation: Option<f64>,
}

/// One rendered frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Canvas in device pixels.
    pub image: RgbaImage,
    /// Vehicles drawn, bottom to top.
    pub vehicles: Vec<RenderedVehicle>,
    /// View the frame was drawn for.
    pub view: ViewState,
}

/// Draws frames with a style and a sprite cache.
pub struct Renderer {
    style: Arc<dyn VehicleStyle>,
    cache: StyleCache,
    // Vehicles already reported as unplaceable.
    unplaceable: HashSet<String>,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl Renderer {
    /// Renderer with a cache of `cache_capacity` sprites.
    #[must_use]
    pub fn new(style: Arc<dyn VehicleStyle>, cache_capacity: usize) -> Self {
        Self {
            style,
            cache: StyleCache::new(cache_capacity),
            unplaceable: HashSet::new(),
        }
    }

    /// Sprite cache.
    #[must_use]
    pub fn cache(&self) -> &StyleCache {
        &self.cache
    }

    /// Draw `request`.
    ///
    /// Vehicles whose geometry cannot be interpolated are skipped. Hovered
    /// and selected vehicles are drawn last, selected on top.
    pub fn render(&mut self, request: &RenderRequest) -> Frame {
        let view = &request.view;
        let (width, height) = view.canvas_size();
        let mut image = RgbaImage::new(width, height);
        let mut vehicles = Vec::new();

        let hovered = request.options.hovered_id.as_deref();
        let selected = request.options.selected_id.as_deref();
        let is_highlighted = |id: &str| Some(id) == hovered || Some(id) == selected;

        let regular = request
            .trajectories
            .iter()
            .filter(|t| !is_highlighted(t.id.as_str()));
        let highlighted = [hovered, selected]
            .into_iter()
            .flatten()
            .filter_map(|id| request.trajectories.iter().find(|t| t.id == id));

        for trajectory in regular.chain(highlighted) {
            let ctx = StyleContext {
                zoom: view.zoom,
                pixel_ratio: view.pixel_ratio,
                hovered: Some(trajectory.id.as_str()) == hovered,
                selected: Some(trajectory.id.as_str()) == selected,
            };
            if let Some(vehicle) = self.draw_vehicle(&mut image, trajectory, view, &ctx) {
                vehicles.push(vehicle);
            }
        }

        Frame {
            image,
            vehicles,
            view: view.clone(),
        }
    }

    fn draw_vehicle(
        &mut self,
        image: &mut RgbaImage,
        trajectory: &Trajectory,
        view: &ViewState,
        ctx: &StyleContext,
    ) -> Option<RenderedVehicle> {
        let position = match interpolate(trajectory, view.time) {
            Ok(position) => position,
            Err(e) => {
                if self.unplaceable.insert(trajectory.id.clone()) {
                    log::error!("[Render] Cannot place {}: {}", trajectory.id, e);
                }
                return None;
            }
        };

        let pixel = view.to_pixel(position.coordinate);
        let key = self.style.key(trajectory, ctx);
        let sprite = self.cache.get_or_draw(&key, self.style.as_ref());

        // Device-pixel centre; cull when the sprite cannot touch the canvas.
        let px = pixel[0] * view.pixel_ratio;
        let py = pixel[1] * view.pixel_ratio;
        let half_w = f64::from(sprite.width()) / 2.0;
        let half_h = f64::from(sprite.height()) / 2.0;
        if px + half_w < 0.0
            || py + half_h < 0.0
            || px - half_w > f64::from(image.width())
            || py - half_h > f64::from(image.height())
        {
            return None;
        }

        image::imageops::overlay(
            image,
            sprite.as_ref(),
            (px - half_w).round() as i64,
            (py - half_h).round() as i64,
        );

        Some(RenderedVehicle {
            id: trajectory.id.clone(),
            coordinate: position.coordinate,
            pixel,
            rotation: position.rotation,
        })
    }
}

/// Vehicle closest to `pixel` within `tolerance` CSS pixels.
///
/// Positions are projected with `view`, so the query works for a view that
/// moved since the frame was drawn.
#[must_use]
pub fn nearest_vehicle<'a>(
    vehicles: &'a [RenderedVehicle],
    view: &ViewState,
    pixel: [f64; 2],
    tolerance: f64,
) -> Option<&'a RenderedVehicle> {
    vehicles
        .iter()
        .map(|v| {
            let p = view.to_pixel(v.coordinate);
            (v, (p[0] - pixel[0]).hypot(p[1] - pixel[1]))
        })
        .filter(|(_, d)| *d <= tolerance)
        // Later vehicles are drawn on top and win ties.
        .min_by(|a, b| a.1.total_cmp(&b.1).then(std::cmp::Ordering::Greater))
        .map(|(v, _)| v)
}

enum WorkerMessage {
    Render(Box<RenderRequest>),
    Cancel,
    Shutdown,
}

/// Render thread fed through a request channel.
#[derive(Debug)]
pub struct RenderWorker {
    requests: mpsc::Sender<WorkerMessage>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Render(_) => f.write_str("Render"),
            Self::Cancel => f.write_str("Cancel"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl RenderWorker {
    /// Spawn the render thread. Frames are sent to `frames`.
    pub fn spawn(
        renderer: Renderer,
        frames: async_mpsc::UnboundedSender<Frame>,
    ) -> std::io::Result<Self> {
        let (requests, rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("trajcast-render".to_string())
            .spawn(move || run_worker(renderer, &rx, &frames))?;
        Ok(Self {
            requests,
            thread: Some(thread),
        })
    }

    /// Queue a frame. Supersedes any request not yet started.
    pub fn request(&self, request: RenderRequest) {
        if self
            .requests
            .send(WorkerMessage::Render(Box::new(request)))
            .is_err()
        {
            log::warn!("[Render] Worker is gone, dropping frame request");
        }
    }

    /// Drop any request not yet started.
    pub fn cancel(&self) {
        let _ = self.requests.send(WorkerMessage::Cancel);
    }

    /// Stop the thread and wait for it. Blocks; call it off the runtime.
    pub fn shutdown(mut self) {
        let _ = self.requests.send(WorkerMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("[Render] Worker thread panicked");
            }
        }
    }
}

impl Drop for RenderWorker {
    // Never joins: dropping may happen on the runtime. The thread exits on
    // its own once it sees the shutdown.
    fn drop(&mut self) {
        let _ = self.requests.send(WorkerMessage::Shutdown);
    }
}

fn run_worker(
    mut renderer: Renderer,
    requests: &mpsc::Receiver<WorkerMessage>,
    frames: &async_mpsc::UnboundedSender<Frame>,
) {
    log::debug!("[Render] Worker started");
    while let Ok(mut message) = requests.recv() {
        // Only the newest message counts; a shutdown is never superseded.
        while let Ok(newer) = requests.try_recv() {
            if matches!(message, WorkerMessage::Shutdown) {
                break;
            }
            message = newer;
        }

        match message {
            WorkerMessage::Render(request) => {
                let frame = renderer.render(&request);
                if frames.send(frame).is_err() {
                    break;
                }
            }
            WorkerMessage::Cancel => {}
            WorkerMessage::Shutdown => break,
        }
    }

    let cache = renderer.cache();
    if cache.is_empty() {
        log::debug!("[Render] Worker stopped");
    } else {
        let (hits, misses) = cache.stats();
        log::debug!(
            "[Render] Worker stopped ({} sprites, {} hits, {} misses)",
            cache.len(),
            hits,
            misses
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::style::CircleStyle;
    use crate::engine::trajectory::{fixtures, Geometry};
    use std::time::Duration;

    fn view() -> ViewState {
        // 100 x 100 px over map square [0, 100], render time mid-interval.
        ViewState::new([50.0, 50.0], 1.0, [100, 100]).with_time(1500.0)
    }

    fn renderer() -> Renderer {
        Renderer::new(Arc::new(CircleStyle::default()), 16)
    }

    fn at(id: &str, x: f64, y: f64) -> Trajectory {
        let mut t = fixtures::trajectory(id, "bus");
        t.geometry = Geometry::Point([x, y]);
        t
    }

    #[test]
    fn test_render_places_vehicles() {
        let request = RenderRequest {
            trajectories: vec![fixtures::trajectory("a", "bus")],
            view: view(),
            options: RenderOptions::default(),
        };
        let frame = renderer().render(&request);

        assert_eq!(frame.image.dimensions(), (100, 100));
        assert_eq!(frame.vehicles.len(), 1);
        // Halfway along [0,0] -> [100,0].
        assert_eq!(frame.vehicles[0].coordinate, [50.0, 0.0]);
        assert_eq!(frame.vehicles[0].pixel, [50.0, 100.0]);
    }

    #[test]
    fn test_out_of_view_vehicles_are_culled() {
        let request = RenderRequest {
            trajectories: vec![at("in", 50.0, 50.0), at("out", 500.0, 500.0)],
            view: view(),
            options: RenderOptions::default(),
        };
        let frame = renderer().render(&request);
        let ids: Vec<_> = frame.vehicles.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, ["in"]);
        assert!(frame.image.get_pixel(50, 50)[3] > 0);
    }

    #[test]
    fn test_highlighted_drawn_last_selected_on_top() {
        let request = RenderRequest {
            trajectories: vec![
                at("sel", 10.0, 10.0),
                at("hov", 20.0, 20.0),
                at("plain", 30.0, 30.0),
            ],
            view: view(),
            options: RenderOptions {
                hovered_id: Some("hov".into()),
                selected_id: Some("sel".into()),
            },
        };
        let frame = renderer().render(&request);
        let ids: Vec<_> = frame.vehicles.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, ["plain", "hov", "sel"]);
    }

    #[test]
    fn test_unsupported_geometry_is_skipped() {
        let mut broken = fixtures::trajectory("broken", "bus");
        broken.geometry = Geometry::Unsupported("Polygon".into());
        let request = RenderRequest {
            trajectories: vec![broken, at("ok", 50.0, 50.0)],
            view: view(),
            options: RenderOptions::default(),
        };
        let frame = renderer().render(&request);
        assert_eq!(frame.vehicles.len(), 1);
    }

    #[test]
    fn test_sprites_are_shared_through_the_cache() {
        let mut renderer = renderer();
        let request = RenderRequest {
            trajectories: vec![at("a", 40.0, 40.0), at("b", 60.0, 60.0)],
            view: view(),
            options: RenderOptions::default(),
        };
        renderer.render(&request);
        assert_eq!(renderer.cache().len(), 1);
        assert_eq!(renderer.cache().stats(), (1, 1));
    }

    #[test]
    fn test_nearest_vehicle() {
        let view = view();
        let vehicles = vec![
            RenderedVehicle {
                id: "a".into(),
                coordinate: [50.0, 50.0],
                pixel: [50.0, 50.0],
                rotation: None,
            },
            RenderedVehicle {
                id: "b".into(),
                coordinate: [56.0, 50.0],
                pixel: [56.0, 50.0],
                rotation: None,
            },
        ];

        let hit = nearest_vehicle(&vehicles, &view, [54.0, 50.0], 10.0).unwrap();
        assert_eq!(hit.id, "b");
        assert!(nearest_vehicle(&vehicles, &view, [90.0, 90.0], 10.0).is_none());

        // The same vehicles seen from a view shifted 20 map units east.
        let moved = ViewState::new([70.0, 50.0], 1.0, [100, 100]);
        let hit = nearest_vehicle(&vehicles, &moved, [30.0, 50.0], 2.0).unwrap();
        assert_eq!(hit.id, "a");
    }

    #[test]
    fn test_worker_renders_and_shuts_down() {
        let (tx, mut rx) = async_mpsc::unbounded_channel();
        let worker = RenderWorker::spawn(renderer(), tx).unwrap();
        worker.request(RenderRequest {
            trajectories: vec![at("a", 50.0, 50.0)],
            view: view(),
            options: RenderOptions::default(),
        });

        let mut frame = None;
        for _ in 0..200 {
            if let Ok(f) = rx.try_recv() {
                frame = Some(f);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(frame.expect("frame rendered").vehicles.len(), 1);
        worker.shutdown();
        assert!(rx.try_recv().is_err());
    }
}
