//! Map view the engine renders for.

/// Resolution (map units per pixel) of web-mercator zoom 0 with 256 px tiles.
const ZOOM_0_RESOLUTION: f64 = 156_543.033_928_040_97;

/// Snapshot of the map view, pulled from the host for every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    /// Map coordinate at the canvas centre.
    pub center: [f64; 2],
    /// Visible extent `[minX, minY, maxX, maxY]` (unrotated).
    pub extent: [f64; 4],
    /// Map zoom.
    pub zoom: f64,
    /// Map units per CSS pixel.
    pub resolution: f64,
    /// View rotation in radians.
    pub rotation: f64,
    /// Canvas size in CSS pixels.
    pub size: [u32; 2],
    /// Device pixels per CSS pixel.
    pub pixel_ratio: f64,
    /// Render time in epoch ms. Zero means "now".
    pub time: f64,
}

impl ViewState {
    /// View centred on `center` at `resolution`.
    #[must_use]
    pub fn new(center: [f64; 2], resolution: f64, size: [u32; 2]) -> Self {
        let half_w = f64::from(size[0]) * resolution / 2.0;
        let half_h = f64::from(size[1]) * resolution / 2.0;
        Self {
            center,
            extent: [
                center[0] - half_w,
                center[1] - half_h,
                center[0] + half_w,
                center[1] + half_h,
            ],
            zoom: zoom_for_resolution(resolution),
            resolution,
            rotation: 0.0,
            size,
            pixel_ratio: 1.0,
            time: 0.0,
        }
    }

    /// View fitting `extent` into a canvas of `size`.
    #[must_use]
    pub fn fit(extent: [f64; 4], size: [u32; 2]) -> Self {
        let width = (extent[2] - extent[0]).abs();
        let height = (extent[3] - extent[1]).abs();
        let resolution =
            (width / f64::from(size[0].max(1))).max(height / f64::from(size[1].max(1)));
        let center = [
            (extent[0] + extent[2]) / 2.0,
            (extent[1] + extent[3]) / 2.0,
        ];
        Self::new(center, resolution, size)
    }

    /// Set the device pixel ratio.
    #[must_use]
    pub fn with_pixel_ratio(mut self, pixel_ratio: f64) -> Self {
        self.pixel_ratio = pixel_ratio;
        self
    }

    /// Set the view rotation.
    #[must_use]
    pub fn with_rotation(mut self, rotation: f64) -> Self {
        self.rotation = rotation;
        self
    }

    /// Set the render time.
    #[must_use]
    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    /// CSS pixel of a map coordinate.
    #[must_use]
    pub fn to_pixel(&self, coordinate: [f64; 2]) -> [f64; 2] {
        let dx = coordinate[0] - self.center[0];
        let dy = coordinate[1] - self.center[1];
        let (sin, cos) = self.rotation.sin_cos();
        let rx = dx * cos + dy * sin;
        let ry = -dx * sin + dy * cos;
        [
            f64::from(self.size[0]) / 2.0 + rx / self.resolution,
            f64::from(self.size[1]) / 2.0 - ry / self.resolution,
        ]
    }

    /// Canvas size in device pixels.
    #[must_use]
    pub fn canvas_size(&self) -> (u32, u32) {
        (
            (f64::from(self.size[0]) * self.pixel_ratio).round() as u32,
            (f64::from(self.size[1]) * self.pixel_ratio).round() as u32,
        )
    }
}

/// Web-mercator zoom matching `resolution`.
#[must_use]
pub fn zoom_for_resolution(resolution: f64) -> f64 {
    if resolution <= 0.0 {
        return 0.0;
    }
    (ZOOM_0_RESOLUTION / resolution).log2()
}

/// Resolution matching web-mercator `zoom`.
#[must_use]
pub fn resolution_for_zoom(zoom: f64) -> f64 {
    ZOOM_0_RESOLUTION / 2f64.powf(zoom)
}
