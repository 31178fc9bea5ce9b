//! Vehicle sprites.
//!
//! A [`VehicleStyle`] maps a trajectory to a [`StyleKey`] and draws a sprite
//! from that key alone, so sprites can be shared by every vehicle with the
//! same key. The [`StyleCache`] keeps the most recently used sprites.

use std::num::NonZeroUsize;
use std::sync::Arc;

use image::{Rgba, RgbaImage};
use lru::LruCache;

use super::trajectory::Trajectory;

/// Per-frame inputs of a style.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StyleContext {
    /// Map zoom.
    pub zoom: f64,
    /// Device pixels per CSS pixel.
    pub pixel_ratio: f64,
    /// Vehicle is hovered.
    pub hovered: bool,
    /// Vehicle is selected.
    pub selected: bool,
}

/// Delay class of a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DelayBucket {
    /// No realtime information.
    Unknown,
    /// Less than 3 minutes late.
    OnTime,
    /// 3 to 5 minutes.
    Minor,
    /// 5 to about 8 minutes.
    Moderate,
    /// Up to an hour.
    Major,
    /// An hour or more.
    Severe,
}

impl DelayBucket {
    /// Bucket of a delay in milliseconds.
    #[must_use]
    pub fn from_delay(delay_ms: Option<f64>) -> Self {
        match delay_ms {
            None => Self::Unknown,
            Some(d) if d >= 3_600_000.0 => Self::Severe,
            Some(d) if d >= 500_000.0 => Self::Major,
            Some(d) if d >= 300_000.0 => Self::Moderate,
            Some(d) if d >= 180_000.0 => Self::Minor,
            Some(_) => Self::OnTime,
        }
    }

    fn color(self) -> Rgba<u8> {
        match self {
            Self::Unknown => Rgba([160, 160, 160, 255]),
            Self::OnTime => Rgba([0, 160, 12, 255]),
            Self::Minor => Rgba([247, 191, 0, 255]),
            Self::Moderate => Rgba([255, 74, 0, 255]),
            Self::Major => Rgba([232, 0, 0, 255]),
            Self::Severe => Rgba([237, 0, 76, 255]),
        }
    }
}

/// Everything a sprite depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StyleKey {
    /// Integer zoom level.
    pub zoom_bucket: u8,
    /// Device pixel ratio in hundredths.
    pub pixel_ratio: u16,
    /// Mode of transport.
    pub mot: String,
    /// Fill colour, `#rrggbb`.
    pub color: String,
    /// Delay class.
    pub delay: DelayBucket,
    /// Journey cancelled.
    pub cancelled: bool,
    /// Hovered.
    pub hovered: bool,
    /// Selected.
    pub selected: bool,
    /// Line name and text colour, only when labels are drawn.
    pub label: Option<(String, String)>,
}

/// Sprite drawing strategy.
pub trait VehicleStyle: Send + Sync {
    /// Cache key of the sprite for `trajectory`.
    fn key(&self, trajectory: &Trajectory, ctx: &StyleContext) -> StyleKey;

    /// Draw the sprite for `key`. The vehicle sits at the sprite centre.
    fn draw(&self, key: &StyleKey) -> RgbaImage;
}

/// Coloured dot with a delay ring.
#[derive(Debug, Clone)]
pub struct CircleStyle {
    /// Zoom from which the line badge is drawn.
    pub label_min_zoom: f64,
}

impl Default for CircleStyle {
    fn default() -> Self {
        Self {
            label_min_zoom: 14.0,
        }
    }
}

impl CircleStyle {
    /// Dot radius in CSS pixels.
    #[must_use]
    pub fn radius(key: &StyleKey) -> f64 {
        let base: f64 = match key.zoom_bucket {
            0..=8 => 2.0,
            9..=11 => 4.0,
            12..=13 => 6.0,
            14..=15 => 9.0,
            _ => 12.0,
        };
        if key.hovered || key.selected {
            base + 3.0
        } else {
            base
        }
    }
}

fn default_color(mot: &str) -> &'static str {
    match mot {
        "tram" => "#cc0000",
        "subway" => "#0066cc",
        "rail" => "#e30613",
        "bus" => "#ffb200",
        "ferry" => "#0096d8",
        "cablecar" | "gondola" | "funicular" => "#8a6c4b",
        _ => "#666666",
    }
}

impl VehicleStyle for CircleStyle {
    fn key(&self, trajectory: &Trajectory, ctx: &StyleContext) -> StyleKey {
        let props = &trajectory.properties;
        let mot = props.mot.clone().unwrap_or_default();
        let line = props.line.as_ref();
        let color = line
            .and_then(|l| l.color.clone())
            .unwrap_or_else(|| default_color(&mot).to_string());
        let label = (ctx.zoom >= self.label_min_zoom)
            .then(|| line.filter(|l| !l.name.is_empty()))
            .flatten()
            .map(|l| {
                (
                    l.name.clone(),
                    l.text_color.clone().unwrap_or_else(|| "#ffffff".to_string()),
                )
            });

        StyleKey {
            zoom_bucket: ctx.zoom.clamp(0.0, 30.0).floor() as u8,
            pixel_ratio: (ctx.pixel_ratio * 100.0).round().clamp(1.0, 1000.0) as u16,
            mot,
            color,
            delay: DelayBucket::from_delay(props.delay),
            cancelled: props.cancelled,
            hovered: ctx.hovered,
            selected: ctx.selected,
            label,
        }
    }

    fn draw(&self, key: &StyleKey) -> RgbaImage {
        let scale = f64::from(key.pixel_ratio) / 100.0;
        let radius = Self::radius(key) * scale;
        let ring = (radius * 0.3).max(1.0);
        let halo = if key.selected || key.hovered { 2.0 * scale } else { 0.0 };

        let outer = radius + ring + halo;
        let size = (outer * 2.0).ceil() as u32 + 2;
        let mut sprite = RgbaImage::new(size, size);
        let c = f64::from(size) / 2.0;

        if key.selected {
            fill_circle(&mut sprite, c, c, outer, Rgba([255, 255, 255, 255]));
        } else if key.hovered {
            fill_circle(&mut sprite, c, c, outer, Rgba([255, 255, 255, 160]));
        }

        let ring_color = if key.cancelled {
            Rgba([255, 0, 0, 255])
        } else {
            key.delay.color()
        };
        fill_circle(&mut sprite, c, c, radius + ring, ring_color);

        let fill = parse_hex_color(&key.color).unwrap_or(Rgba([102, 102, 102, 255]));
        fill_circle(&mut sprite, c, c, radius, fill);

        // Glyphs are left to the host; the badge centre carries the text colour.
        if let Some((_, text_color)) = &key.label {
            if let Some(text) = parse_hex_color(text_color) {
                fill_circle(&mut sprite, c, c, radius * 0.4, text);
            }
        }

        sprite
    }
}

/// Parse `#rgb` or `#rrggbb`.
#[must_use]
pub fn parse_hex_color(s: &str) -> Option<Rgba<u8>> {
    let hex = s.strip_prefix('#').unwrap_or(s);
    let channel = |i: usize, len: usize| u8::from_str_radix(hex.get(i..i + len)?, 16).ok();
    match hex.len() {
        6 => Some(Rgba([channel(0, 2)?, channel(2, 2)?, channel(4, 2)?, 255])),
        3 => {
            let expand = |v: u8| v * 17;
            Some(Rgba([
                expand(channel(0, 1)?),
                expand(channel(1, 1)?),
                expand(channel(2, 1)?),
                255,
            ]))
        }
        _ => None,
    }
}

/// Anti-aliased filled circle, blended over the existing pixels.
pub(crate) fn fill_circle(img: &mut RgbaImage, cx: f64, cy: f64, r: f64, color: Rgba<u8>) {
    if r <= 0.0 {
        return;
    }
    let x0 = (cx - r - 1.0).floor().max(0.0) as u32;
    let y0 = (cy - r - 1.0).floor().max(0.0) as u32;
    let x1 = ((cx + r + 1.0).ceil() as u32).min(img.width());
    let y1 = ((cy + r + 1.0).ceil() as u32).min(img.height());

    for y in y0..y1 {
        for x in x0..x1 {
            let d = (f64::from(x) + 0.5 - cx).hypot(f64::from(y) + 0.5 - cy);
            let coverage = (r - d + 0.5).clamp(0.0, 1.0);
            if coverage > 0.0 {
                blend(img.get_pixel_mut(x, y), color, coverage);
            }
        }
    }
}

/// Source-over blend of `src` scaled by `coverage` onto `dst`.
pub(crate) fn blend(dst: &mut Rgba<u8>, src: Rgba<u8>, coverage: f64) {
    let sa = f64::from(src[3]) / 255.0 * coverage;
    let da = f64::from(dst[3]) / 255.0;
    let out_a = sa + da * (1.0 - sa);
    if out_a <= 0.0 {
        *dst = Rgba([0, 0, 0, 0]);
        return;
    }
    let mut out = [0u8; 4];
    for i in 0..3 {
        let s = f64::from(src[i]);
        let d = f64::from(dst[i]);
        out[i] = ((s * sa + d * da * (1.0 - sa)) / out_a).round() as u8;
    }
    out[3] = (out_a * 255.0).round() as u8;
    *dst = Rgba(out);
}

/// Sprites by style key, least recently used evicted first.
pub struct StyleCache {
    sprites: LruCache<StyleKey, Arc<RgbaImage>>,
    hits: u64,
    misses: u64,
}

impl std::fmt::Debug for StyleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StyleCache")
            .field("len", &self.sprites.len())
            .field("capacity", &self.sprites.cap())
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}

impl StyleCache {
    /// Cache holding at most `capacity` sprites (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            sprites: LruCache::new(cap),
            hits: 0,
            misses: 0,
        }
    }

    /// Cached sprite for `key`, drawing it on a miss.
    pub fn get_or_draw(&mut self, key: &StyleKey, style: &dyn VehicleStyle) -> Arc<RgbaImage> {
        if let Some(sprite) = self.sprites.get(key) {
            self.hits += 1;
            return Arc::clone(sprite);
        }
        self.misses += 1;
        let sprite = Arc::new(style.draw(key));
        self.sprites.put(key.clone(), Arc::clone(&sprite));
        sprite
    }

    /// Number of cached sprites.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sprites.len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sprites.is_empty()
    }

    /// `(hits, misses)` since creation.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
