use std::fmt;

use serde::Serialize;

/// Number of digit classes a label can take.
pub const DIGIT_CLASSES: usize = 10;

// ---------------------------------------------------------------------------
// SubsetKind – the three fixed partitions of the archive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsetKind {
    Training,
    Validation,
    Test,
}

impl SubsetKind {
    /// Archive order: training, validation, test.
    pub const ALL: [SubsetKind; 3] = [SubsetKind::Training, SubsetKind::Validation, SubsetKind::Test];
}

impl fmt::Display for SubsetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubsetKind::Training => write!(f, "Training"),
            SubsetKind::Validation => write!(f, "Validation"),
            SubsetKind::Test => write!(f, "Test"),
        }
    }
}

// ---------------------------------------------------------------------------
// PixelData – flat pixel buffer in the archive's element type
// ---------------------------------------------------------------------------

/// Pixel intensities kept in the element type the archive stored them in,
/// so the text rendering reproduces the stored values exactly.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
}

impl PixelData {
    pub fn len(&self) -> usize {
        match self {
            PixelData::F32(v) => v.len(),
            PixelData::F64(v) => v.len(),
            PixelData::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decimal text for the element at `index`.
    ///
    /// Floats use the shortest representation that round-trips, printed the
    /// way NumPy's `str()` does: a fractional part in positional form
    /// (`0.0`, `0.01171875`) and a signed two-digit exponent otherwise
    /// (`1e-05`, `1.5e+16`). Integers print bare.
    pub fn format_at(&self, index: usize) -> String {
        match self {
            PixelData::F32(v) => format_float(v[index] as f64, |x| format!("{:?}", x as f32)),
            PixelData::F64(v) => format_float(v[index], |x| format!("{x:?}")),
            PixelData::U8(v) => v[index].to_string(),
        }
    }
}

fn format_float(value: f64, shortest: impl Fn(f64) -> String) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value == f64::INFINITY {
        "inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        pad_exponent(shortest(value))
    }
}

/// `1e-5` becomes `1e-05`, `1e16` becomes `1e+16`.
fn pad_exponent(repr: String) -> String {
    match repr.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => repr,
    }
}

// ---------------------------------------------------------------------------
// Images – row-major image matrix
// ---------------------------------------------------------------------------

/// `rows` images of `width` pixels each, stored row-major in one buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Images {
    pixels: PixelData,
    rows: usize,
    width: usize,
}

impl Images {
    /// Returns `None` when the buffer does not hold exactly `rows * width` pixels.
    pub fn new(pixels: PixelData, rows: usize, width: usize) -> Option<Self> {
        let expected = rows.checked_mul(width)?;
        (pixels.len() == expected).then_some(Images { pixels, rows, width })
    }

    /// Number of images.
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Pixels per image.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn pixels(&self) -> &PixelData {
        &self.pixels
    }

    /// Decimal text of every pixel in image `row`, in pixel order.
    pub fn row_text(&self, row: usize) -> impl Iterator<Item = String> + '_ {
        let start = row * self.width;
        (start..start + self.width).map(move |i| self.pixels.format_at(i))
    }
}

// ---------------------------------------------------------------------------
// Subset / Archive
// ---------------------------------------------------------------------------

/// One partition: images paired positionally with their labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Subset {
    pub images: Images,
    /// Digit class of each image, each in `0..=9`.
    pub labels: Vec<u8>,
}

impl Subset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// The decoded dataset: training, validation and test subsets.
#[derive(Debug, Clone, PartialEq)]
pub struct Archive {
    pub training: Subset,
    pub validation: Subset,
    pub test: Subset,
}

impl Archive {
    pub fn subset(&self, kind: SubsetKind) -> &Subset {
        match kind {
            SubsetKind::Training => &self.training,
            SubsetKind::Validation => &self.validation,
            SubsetKind::Test => &self.test,
        }
    }

    /// Subsets in archive order.
    pub fn subsets(&self) -> impl Iterator<Item = (SubsetKind, &Subset)> + '_ {
        SubsetKind::ALL.into_iter().map(move |kind| (kind, self.subset(kind)))
    }

    /// Total labels across all three subsets.
    pub fn label_count(&self) -> usize {
        self.subsets().map(|(_, s)| s.len()).sum()
    }

    /// Pixels per image, shared by every subset.
    pub fn image_width(&self) -> usize {
        self.training.images.width()
    }
}

// ---------------------------------------------------------------------------
// DigitHistogram
// ---------------------------------------------------------------------------

/// Occurrence count per digit, indexed by the digit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DigitHistogram([usize; DIGIT_CLASSES]);

impl DigitHistogram {
    pub fn from_labels(labels: impl IntoIterator<Item = u8>) -> Self {
        let mut counts = [0usize; DIGIT_CLASSES];
        for label in labels {
            counts[usize::from(label)] += 1;
        }
        DigitHistogram(counts)
    }

    pub fn count(&self, digit: u8) -> usize {
        self.0[usize::from(digit)]
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }

    /// `(digit, count)` in ascending digit order, zero counts included.
    pub fn iter(&self) -> impl Iterator<Item = (u8, usize)> + '_ {
        (0u8..).zip(self.0.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_pixels_keep_fractional_part() {
        let pixels = PixelData::F32(vec![0.0, 0.01171875, 1.0, 0.1]);
        let text: Vec<String> = (0..4).map(|i| pixels.format_at(i)).collect();
        assert_eq!(text, ["0.0", "0.01171875", "1.0", "0.1"]);
    }

    #[test]
    fn float_exponents_are_signed_and_padded() {
        let pixels = PixelData::F32(vec![1e-5, 1.5e-5, 1e16, 0.0001]);
        let text: Vec<String> = (0..4).map(|i| pixels.format_at(i)).collect();
        assert_eq!(text, ["1e-05", "1.5e-05", "1e+16", "0.0001"]);
        assert_eq!(PixelData::F64(vec![2.5e-300]).format_at(0), "2.5e-300");
    }

    #[test]
    fn byte_pixels_print_bare() {
        let pixels = PixelData::U8(vec![0, 255]);
        assert_eq!(pixels.format_at(1), "255");
    }

    #[test]
    fn images_reject_wrong_buffer_length() {
        assert!(Images::new(PixelData::U8(vec![0; 5]), 2, 3).is_none());
        let images = Images::new(PixelData::U8(vec![1, 2, 3, 4, 5, 6]), 2, 3).unwrap();
        assert_eq!(images.row_text(1).collect::<Vec<_>>(), ["4", "5", "6"]);
    }

    #[test]
    fn histogram_counts_every_digit() {
        let hist = DigitHistogram::from_labels([5, 0, 3, 9, 5]);
        assert_eq!(hist.count(5), 2);
        assert_eq!(hist.count(1), 0);
        assert_eq!(hist.total(), 5);
        assert_eq!(hist.iter().count(), DIGIT_CLASSES);
    }
}
