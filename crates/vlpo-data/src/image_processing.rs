//! Image preprocessing for the supported vision-language architectures.
//!
//! Uses CLIP-style normalization and NCHW layout. Depending on the architecture an image
//! becomes a single view, an any-resolution patch stack, or padded tiles with aspect-ratio
//! metadata.

use std::path::Path;

use image::{imageops::FilterType, DynamicImage};
use mlx_rs::Array;
use vlpo_core::{ModelArchitecture, Result, VlpoError};

/// Tile grids (rows, columns) for tiled images; the aspect-ratio id is the 1-based position.
pub const SUPPORTED_TILE_GRIDS: [(u32, u32); 8] = [
    (1, 1),
    (1, 2),
    (1, 3),
    (1, 4),
    (2, 1),
    (2, 2),
    (3, 1),
    (4, 1),
];

/// How one image is laid out as pixel tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayoutMode {
    /// One resized view: `[1, 3, H, W]`.
    Single,
    /// Global view plus four quadrant crops: `[5, 3, H, W]`.
    AnyRes,
    /// Up to `max_tiles` tiles padded with zeros: `[max_tiles, 3, H, W]`.
    Tiled {
        /// Tile count every image is padded to.
        max_tiles: usize,
    },
}

impl ImageLayoutMode {
    /// Views produced per image.
    pub fn views(&self) -> usize {
        match self {
            Self::Single => 1,
            Self::AnyRes => 5,
            Self::Tiled { max_tiles } => *max_tiles,
        }
    }
}

/// Configuration for the image processor.
#[derive(Debug, Clone)]
pub struct ImageProcessorConfig {
    /// Target view size (width, height).
    pub size: (u32, u32),
    /// Normalization mean (RGB).
    pub mean: [f32; 3],
    /// Normalization standard deviation (RGB).
    pub std: [f32; 3],
    /// Rescaling factor (e.g., 1/255.0).
    pub rescale_factor: f32,
    /// View layout.
    pub mode: ImageLayoutMode,
}

impl Default for ImageProcessorConfig {
    fn default() -> Self {
        Self {
            size: (224, 224),
            // CLIP stats
            #[allow(clippy::excessive_precision)]
            mean: [0.48145466, 0.4578275, 0.40821073],
            #[allow(clippy::excessive_precision)]
            std: [0.26862954, 0.26130258, 0.27577711],
            rescale_factor: 1.0 / 255.0,
            mode: ImageLayoutMode::Single,
        }
    }
}

impl ImageProcessorConfig {
    /// Layout and view size used by an architecture family.
    pub fn for_architecture(arch: ModelArchitecture) -> Self {
        let (size, mode) = match arch {
            ModelArchitecture::Default => (224, ImageLayoutMode::Single),
            ModelArchitecture::Llava => (336, ImageLayoutMode::Single),
            ModelArchitecture::LlavaNext => (336, ImageLayoutMode::AnyRes),
            ModelArchitecture::Llama32Vision => (560, ImageLayoutMode::Tiled { max_tiles: 4 }),
        };
        Self {
            size: (size, size),
            mode,
            ..Default::default()
        }
    }
}

/// A preprocessed image with the metadata its architecture needs.
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    /// Pixel views `[views, 3, H, W]`.
    pub pixels: Array,
    /// Original `(height, width)` for any-resolution layouts.
    pub image_size: Option<(u32, u32)>,
    /// 1-based tile grid id for tiled layouts.
    pub aspect_ratio_id: Option<i32>,
    /// 1 for real tiles, 0 for padding.
    pub aspect_ratio_mask: Option<Vec<i32>>,
}

/// Pick the tile grid whose aspect ratio is closest to the image's, preferring fewer tiles.
///
/// Returns the 1-based grid id with its `(rows, cols)`.
pub fn select_tile_grid(width: u32, height: u32, max_tiles: usize) -> (i32, (u32, u32)) {
    let target = (width.max(1) as f64 / height.max(1) as f64).ln();
    let mut best: Option<(f64, usize, (i32, (u32, u32)))> = None;

    for (i, &(rows, cols)) in SUPPORTED_TILE_GRIDS.iter().enumerate() {
        let tiles = (rows * cols) as usize;
        if tiles > max_tiles {
            continue;
        }
        let score = (target - (cols as f64 / rows as f64).ln()).abs();
        let better = match best {
            None => true,
            Some((best_score, best_tiles, _)) => {
                score < best_score - 1e-9 || ((score - best_score).abs() <= 1e-9 && tiles < best_tiles)
            }
        };
        if better {
            best = Some((score, tiles, (i as i32 + 1, (rows, cols))));
        }
    }

    best.map(|(_, _, grid)| grid).unwrap_or((1, (1, 1)))
}

/// Image processor producing CLIP-normalized NCHW views.
#[derive(Debug, Clone)]
pub struct ImageProcessor {
    config: ImageProcessorConfig,
}

impl ImageProcessor {
    /// Create a new processor.
    pub fn new(config: ImageProcessorConfig) -> Self {
        Self { config }
    }

    /// Processor with the layout of an architecture family.
    pub fn for_architecture(arch: ModelArchitecture) -> Self {
        Self::new(ImageProcessorConfig::for_architecture(arch))
    }

    /// Processor configuration.
    pub fn config(&self) -> &ImageProcessorConfig {
        &self.config
    }

    /// Shape of [`ProcessedImage::pixels`].
    pub fn pixel_shape(&self) -> [i32; 4] {
        let (w, h) = self.config.size;
        [self.config.mode.views() as i32, 3, h as i32, w as i32]
    }

    /// Load and preprocess an image from file.
    pub fn preprocess(&self, image_path: impl AsRef<Path>) -> Result<ProcessedImage> {
        let path = image_path.as_ref();
        let img = image::open(path)
            .map_err(|e| VlpoError::Data(format!("failed to open image {}: {e}", path.display())))?;
        self.process_image(&img)
    }

    /// Process a loaded image according to the configured layout.
    pub fn process_image(&self, img: &DynamicImage) -> Result<ProcessedImage> {
        let (w, h) = self.config.size;
        let shape = self.pixel_shape();

        match self.config.mode {
            ImageLayoutMode::Single => Ok(ProcessedImage {
                pixels: Array::from_slice(&self.view(img), &shape),
                image_size: None,
                aspect_ratio_id: None,
                aspect_ratio_mask: None,
            }),

            ImageLayoutMode::AnyRes => {
                let (width, height) = (img.width(), img.height());
                let half_w = (width / 2).max(1);
                let half_h = (height / 2).max(1);

                let mut data = self.view(img);
                for (x, y) in [(0, 0), (half_w, 0), (0, half_h), (half_w, half_h)] {
                    let crop = img.crop_imm(x, y, half_w, half_h);
                    data.extend(self.view(&crop));
                }
                Ok(ProcessedImage {
                    pixels: Array::from_slice(&data, &shape),
                    image_size: Some((height, width)),
                    aspect_ratio_id: None,
                    aspect_ratio_mask: None,
                })
            }

            ImageLayoutMode::Tiled { max_tiles } => {
                let (id, (rows, cols)) = select_tile_grid(img.width(), img.height(), max_tiles);
                let canvas = img.resize_exact(cols * w, rows * h, FilterType::Triangle);

                let mut data = Vec::with_capacity(max_tiles * 3 * (w * h) as usize);
                for r in 0..rows {
                    for c in 0..cols {
                        let tile = canvas.crop_imm(c * w, r * h, w, h);
                        data.extend(self.view(&tile));
                    }
                }
                let real = (rows * cols) as usize;
                data.resize(max_tiles * 3 * (w * h) as usize, 0.0);

                let mut mask = vec![0; max_tiles];
                mask[..real].fill(1);
                Ok(ProcessedImage {
                    pixels: Array::from_slice(&data, &shape),
                    image_size: None,
                    aspect_ratio_id: Some(id),
                    aspect_ratio_mask: Some(mask),
                })
            }
        }
    }

    /// All-zero image standing in for a text-only row.
    pub fn placeholder(&self) -> Result<ProcessedImage> {
        let shape = self.pixel_shape();
        let pixels = mlx_rs::ops::zeros::<f32>(&shape)?;
        let (w, h) = self.config.size;
        let (image_size, aspect_ratio_id, aspect_ratio_mask) = match self.config.mode {
            ImageLayoutMode::Single => (None, None, None),
            ImageLayoutMode::AnyRes => (Some((h, w)), None, None),
            ImageLayoutMode::Tiled { max_tiles } => {
                let mut mask = vec![0; max_tiles];
                if let Some(first) = mask.first_mut() {
                    *first = 1;
                }
                (None, Some(1), Some(mask))
            }
        };
        Ok(ProcessedImage {
            pixels,
            image_size,
            aspect_ratio_id,
            aspect_ratio_mask,
        })
    }

    /// Resize one view and convert it to normalized CHW floats.
    fn view(&self, img: &DynamicImage) -> Vec<f32> {
        let resized =
            img.resize_exact(self.config.size.0, self.config.size.1, FilterType::Triangle);
        let rgb = resized.to_rgb8();
        let num_pixels = (rgb.width() * rgb.height()) as usize;
        let pixels = rgb.as_raw();

        let mut data = Vec::with_capacity(3 * num_pixels);
        for c in 0..3 {
            let mean = self.config.mean[c];
            let std = self.config.std[c];
            let scale = self.config.rescale_factor;
            // interleaved RGB to planar
            data.extend((0..num_pixels).map(|i| {
                let pixel_val = pixels[i * 3 + c] as f32;
                (pixel_val * scale - mean) / std
            }));
        }
        data
    }
}
