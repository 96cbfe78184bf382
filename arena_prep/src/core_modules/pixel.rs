// THEORY (single-pixel color heuristics):
// The `pixel` module is the smallest unit of the segmentation layer: a "dumb"
// holder for one pixel in normalized sRGB plus the heuristics that need nothing
// but that pixel. Anything that compares two pixels (distance to a background
// pixel, distance to a palette color) takes the other pixel explicitly and
// stays a pure function.
//
// Heuristic families used by the segmenter:
// - Value (HSV):       max(R, G, B), the "is it bright enough" gate
// - Saturation (HSV):  chroma / value, the "is it a marker color" gate
// - Hue:               angle on the color wheel, reported for diagnostics
// - Distances:         Euclidean and squared RGB distances in [0, 1] space

pub mod pixel {
    pub type NormalizedChannel = f32;
    pub type Hue = f32;
    pub type SaturationHSV = f32;
    pub type ValueHSV = f32;
    pub type Chroma = f32;

    /// One pixel in normalized sRGB (each channel in 0..=1). Alpha is dropped:
    /// every raster the engine consumes is treated as opaque.
    #[derive(Debug, Clone, Copy, PartialEq, Default)]
    pub struct Pixel {
        pub red_normalized: NormalizedChannel,
        pub green_normalized: NormalizedChannel,
        pub blue_normalized: NormalizedChannel,
    }

    impl Pixel {
        pub fn new(red: u8, green: u8, blue: u8) -> Self {
            Pixel {
                red_normalized: red as NormalizedChannel / 255.0,
                green_normalized: green as NormalizedChannel / 255.0,
                blue_normalized: blue as NormalizedChannel / 255.0,
            }
        }

        /// Builds a pixel from an RGBA (or RGB) byte slice; extra channels are ignored.
        pub fn from_bytes(bytes: &[u8]) -> Self {
            Pixel::new(bytes[0], bytes[1], bytes[2])
        }

        fn max_channel(&self) -> f32 {
            self.red_normalized
                .max(self.green_normalized.max(self.blue_normalized))
        }

        fn min_channel(&self) -> f32 {
            self.red_normalized
                .min(self.green_normalized.min(self.blue_normalized))
        }

        /// HSV value: brightness as the maximum channel.
        pub fn value_hsv(&self) -> ValueHSV {
            self.max_channel()
        }

        /// Chroma: max(R,G,B) - min(R,G,B). Zero for any gray.
        pub fn chroma(&self) -> Chroma {
            self.max_channel() - self.min_channel()
        }

        /// HSV saturation: chroma relative to value. Zero for black.
        pub fn saturation_hsv(&self) -> SaturationHSV {
            let maximum_channel = self.max_channel();
            if maximum_channel <= 1e-6 {
                return 0.0;
            }
            self.chroma() / maximum_channel
        }

        /// Hue angle in degrees [0, 360).
        pub fn hue(&self) -> Hue {
            let maximum_channel = self.max_channel();
            let chroma = self.chroma();
            if chroma <= 1e-6 {
                return 0.0;
            }

            let (base_difference, sector_offset) = if maximum_channel == self.red_normalized {
                (self.green_normalized - self.blue_normalized, 0.0)
            } else if maximum_channel == self.green_normalized {
                (self.blue_normalized - self.red_normalized, 2.0)
            } else {
                (self.red_normalized - self.green_normalized, 4.0)
            };

            let mut hue_degrees = (base_difference / chroma + sector_offset) * 60.0;
            if hue_degrees < 0.0 {
                hue_degrees += 360.0;
            }
            hue_degrees
        }

        /// Squared Euclidean distance in normalized RGB.
        pub fn distance_squared(&self, other: &Pixel) -> f32 {
            let dr = self.red_normalized - other.red_normalized;
            let dg = self.green_normalized - other.green_normalized;
            let db = self.blue_normalized - other.blue_normalized;
            dr * dr + dg * dg + db * db
        }

        /// Euclidean distance in normalized RGB, in [0, sqrt(3)].
        pub fn distance(&self, other: &Pixel) -> f32 {
            self.distance_squared(other).sqrt()
        }
    }

    /// Parses `#rrggbb` (or `rrggbb`) into a pixel.
    pub fn parse_hex(color: &str) -> Option<Pixel> {
        let hex = color.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();
        Some(Pixel::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }
}
