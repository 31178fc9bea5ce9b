//! Pointer interaction with rendered vehicles.
//!
//! Map adapters talk to the engine through these capability traits. Each
//! takes a CSS pixel and the view it was measured in; the query runs
//! against the vehicles of the last rendered frame.

use std::sync::Arc;

use crate::engine::{RealtimeEngine, Trajectory, ViewState};

/// Responds to clicks.
pub trait ClickSource {
    /// Handle a click. Returns the clicked vehicle, if any.
    fn click(&self, pixel: [f64; 2], view: &ViewState) -> Option<Trajectory>;
}

/// Responds to pointer moves.
pub trait HoverSource {
    /// Handle a pointer move. Returns the vehicle under the pointer, if any.
    fn hover(&self, pixel: [f64; 2], view: &ViewState) -> Option<Trajectory>;
}

/// Attribution of the displayed data.
pub trait CopyrightProvider {
    /// Attribution lines.
    fn copyrights(&self) -> Vec<String>;
}

/// Selects vehicles on click and highlights them on hover.
#[derive(Debug, Clone)]
pub struct RealtimeController {
    engine: Arc<RealtimeEngine>,
    copyrights: Vec<String>,
}

impl RealtimeController {
    /// Controller for `engine`.
    #[must_use]
    pub fn new(engine: Arc<RealtimeEngine>) -> Self {
        Self {
            engine,
            copyrights: Vec::new(),
        }
    }

    /// Set the attribution lines.
    #[must_use]
    pub fn with_copyrights<I, S>(mut self, copyrights: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.copyrights = copyrights.into_iter().map(Into::into).collect();
        self
    }

    /// Controlled engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<RealtimeEngine> {
        &self.engine
    }
}

impl ClickSource for RealtimeController {
    /// Selects the clicked vehicle; clicking empty map clears the selection.
    fn click(&self, pixel: [f64; 2], view: &ViewState) -> Option<Trajectory> {
        let hit = self.engine.hit_test(pixel, Some(view));
        self.engine
            .set_selected_id(hit.as_ref().map(|t| t.id.as_str()));
        hit
    }
}

impl HoverSource for RealtimeController {
    fn hover(&self, pixel: [f64; 2], view: &ViewState) -> Option<Trajectory> {
        let hit = self.engine.hit_test(pixel, Some(view));
        self.engine
            .set_hovered_id(hit.as_ref().map(|t| t.id.as_str()));
        hit
    }
}

impl CopyrightProvider for RealtimeController {
    fn copyrights(&self) -> Vec<String> {
        self.copyrights.clone()
    }
}
