//! Conversion options and their wire encoding.
//!
//! The runtime receives options as a single string of `key=value` pairs
//! joined with `;`. Only keys that are set are written; every default is
//! decided by the runtime.
//!
//! Values are not escaped. None of the typed values below can contain `;` or
//! `=`, so the limitation only matters to code that builds wire strings by
//! hand.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Output image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Animated WebP.
    Webp = 0,
    /// Animated GIF (extended-format runtime builds only).
    Gif = 1,
}

impl OutputFormat {
    /// The ordinal the runtime expects on the wire.
    pub fn wire_value(self) -> u8 {
        self as u8
    }
}

/// The fixed set of option keys understood by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKey {
    Format,
    FrameRate,
    Height,
    Width,
    Loop,
    BackgroundColor,
    MinimizeSize,
    Quality,
    Level,
}

impl OptionKey {
    /// Every key, in the order they are written to the wire.
    pub const ALL: [OptionKey; 9] = [
        OptionKey::Format,
        OptionKey::FrameRate,
        OptionKey::Height,
        OptionKey::Width,
        OptionKey::Loop,
        OptionKey::BackgroundColor,
        OptionKey::MinimizeSize,
        OptionKey::Quality,
        OptionKey::Level,
    ];

    /// The key's wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            OptionKey::Format => "format",
            OptionKey::FrameRate => "frameRate",
            OptionKey::Height => "height",
            OptionKey::Width => "width",
            OptionKey::Loop => "loop",
            OptionKey::BackgroundColor => "backgroundColor",
            OptionKey::MinimizeSize => "minimizeSize",
            OptionKey::Quality => "quality",
            OptionKey::Level => "level",
        }
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sparse set of conversion options.
///
/// Unset fields are left out of the wire string so the runtime applies its
/// own defaults (WebP, the animation's own frame rate and size, infinite
/// loop, transparent background, quality 75, level 4).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConvertOptions {
    /// Output format.
    pub format: Option<OutputFormat>,
    /// Frames per second. Ignored by the runtime when above the animation's rate.
    pub frame_rate: Option<u32>,
    /// Output height in pixels.
    pub height: Option<u32>,
    /// Output width in pixels.
    pub width: Option<u32>,
    /// Number of times to repeat the animation, 0 meaning forever.
    #[serde(rename = "loop")]
    pub loop_count: Option<u32>,
    /// Background color as `0xRRGGBBAA`.
    pub background_color: Option<u32>,
    /// Trade a lot of encoding time for the smallest output.
    pub minimize_size: Option<bool>,
    /// Between 0 (smallest) and 100 (largest).
    pub quality: Option<f32>,
    /// Quality/speed trade-off between 0 (fast) and 6 (slower, better).
    pub level: Option<u8>,
}

impl ConvertOptions {
    /// Options with every key unset.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn format(mut self, format: OutputFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn loop_count(mut self, loop_count: u32) -> Self {
        self.loop_count = Some(loop_count);
        self
    }

    pub fn background_color(mut self, rgba: u32) -> Self {
        self.background_color = Some(rgba);
        self
    }

    pub fn minimize_size(mut self, minimize: bool) -> Self {
        self.minimize_size = Some(minimize);
        self
    }

    pub fn quality(mut self, quality: f32) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn level(mut self, level: u8) -> Self {
        self.level = Some(level);
        self
    }

    /// The wire text for `key`, or `None` when the key is unset.
    pub fn wire_value(&self, key: OptionKey) -> Option<String> {
        match key {
            OptionKey::Format => self.format.map(|f| f.wire_value().to_string()),
            OptionKey::FrameRate => self.frame_rate.map(|v| v.to_string()),
            OptionKey::Height => self.height.map(|v| v.to_string()),
            OptionKey::Width => self.width.map(|v| v.to_string()),
            OptionKey::Loop => self.loop_count.map(|v| v.to_string()),
            OptionKey::BackgroundColor => self.background_color.map(|v| v.to_string()),
            OptionKey::MinimizeSize => self.minimize_size.map(|v| v.to_string()),
            OptionKey::Quality => self.quality.map(|v| v.to_string()),
            OptionKey::Level => self.level.map(|v| v.to_string()),
        }
    }

    /// Serialize to the `key=value;...` wire string.
    pub fn encode(&self) -> String {
        encode(self)
    }
}

/// Serialize `options` to the `key=value;...` wire string.
///
/// `encode(&ConvertOptions::default())` is the empty string.
pub fn encode(options: &ConvertOptions) -> String {
    OptionKey::ALL
        .iter()
        .filter_map(|&key| options.wire_value(key).map(|value| format!("{key}={value}")))
        .collect::<Vec<_>>()
        .join(";")
}

/// An input buffer paired with the options to convert it with.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    input: Bytes,
    options: ConvertOptions,
}

impl ConversionRequest {
    pub fn new(input: impl Into<Bytes>, options: ConvertOptions) -> Self {
        Self {
            input: input.into(),
            options,
        }
    }

    /// The lottie JSON or gzipped TGS bytes.
    pub fn input(&self) -> &Bytes {
        &self.input
    }

    pub fn options(&self) -> &ConvertOptions {
        &self.options
    }
}
