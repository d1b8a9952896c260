//! Named colormaps as interpolated lookup tables.
//!
//! Anchor colors are sampled from the matplotlib maps the original heatmaps
//! were rendered with; values in between are linearly interpolated.

use crate::error::HeatmapError;

/// Sequential map, dark purple to light yellow.
const MAGMA: &[[u8; 3]] = &[
    [0, 0, 4],
    [28, 16, 68],
    [79, 18, 123],
    [129, 37, 129],
    [181, 54, 122],
    [229, 80, 100],
    [251, 135, 97],
    [254, 194, 135],
    [252, 253, 191],
];

const VIRIDIS: &[[u8; 3]] = &[
    [68, 1, 84],
    [72, 40, 120],
    [62, 74, 137],
    [49, 104, 142],
    [38, 130, 142],
    [31, 158, 137],
    [53, 183, 121],
    [109, 205, 89],
    [253, 231, 37],
];

const PLASMA: &[[u8; 3]] = &[
    [13, 8, 135],
    [84, 2, 163],
    [139, 10, 165],
    [185, 50, 137],
    [219, 92, 104],
    [244, 136, 73],
    [254, 188, 43],
    [240, 249, 33],
];

const INFERNO: &[[u8; 3]] = &[
    [0, 0, 4],
    [40, 11, 84],
    [87, 16, 110],
    [135, 33, 107],
    [188, 55, 84],
    [227, 89, 51],
    [249, 142, 9],
    [252, 255, 164],
];

/// Diverging blue-white-red map for scores around a neutral midpoint.
const COOLWARM: &[[u8; 3]] = &[
    [59, 76, 192],
    [98, 130, 234],
    [141, 176, 254],
    [184, 208, 249],
    [221, 221, 221],
    [245, 196, 173],
    [244, 154, 123],
    [222, 96, 77],
    [180, 4, 38],
];

const GRAY: &[[u8; 3]] = &[[0, 0, 0], [255, 255, 255]];

const AVAILABLE: &[(&str, &[[u8; 3]])] = &[
    ("magma", MAGMA),
    ("viridis", VIRIDIS),
    ("plasma", PLASMA),
    ("inferno", INFERNO),
    ("coolwarm", COOLWARM),
    ("gray", GRAY),
];

/// A resolved colormap: maps 0..1 to RGB.
#[derive(Debug, Clone, Copy)]
pub struct Colormap {
    anchors: &'static [[u8; 3]],
}

impl Colormap {
    /// Look up a colormap by name; the error lists the available names.
    pub fn by_name(name: &str) -> Result<Self, HeatmapError> {
        AVAILABLE
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, anchors)| Self { anchors })
            .ok_or_else(|| {
                let names: Vec<&str> = AVAILABLE.iter().map(|(n, _)| *n).collect();
                HeatmapError::UnknownColormap(name.to_string(), names.join(", "))
            })
    }

    /// Sample the map at `t` (clamped to 0..1).
    pub fn sample(&self, t: f32) -> [u8; 3] {
        let t = t.clamp(0.0, 1.0);
        let segments = (self.anchors.len() - 1) as f32;
        let pos = t * segments;
        let lo = (pos.floor() as usize).min(self.anchors.len() - 2);
        let frac = pos - lo as f32;

        let a = self.anchors[lo];
        let b = self.anchors[lo + 1];
        let mut rgb = [0u8; 3];
        for c in 0..3 {
            let v = a[c] as f32 * (1.0 - frac) + b[c] as f32 * frac;
            rgb[c] = v.round().clamp(0.0, 255.0) as u8;
        }
        rgb
    }
}
