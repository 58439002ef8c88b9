use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::data::model::{Archive, DigitHistogram, SubsetKind};
use crate::data::select::concatenated_labels;

// ---------------------------------------------------------------------------
// Per-operation summaries
// ---------------------------------------------------------------------------

/// Image count of each subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubsetCounts {
    pub training: usize,
    pub validation: usize,
    pub test: usize,
}

impl SubsetCounts {
    pub fn of(archive: &Archive) -> Self {
        SubsetCounts {
            training: archive.training.len(),
            validation: archive.validation.len(),
            test: archive.test.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelsSummary {
    pub labels: usize,
    pub subsets: SubsetCounts,
    pub histogram: DigitHistogram,
    pub output: PathBuf,
}

impl LabelsSummary {
    pub fn new(archive: &Archive, output: PathBuf) -> Self {
        LabelsSummary {
            labels: archive.label_count(),
            subsets: SubsetCounts::of(archive),
            histogram: DigitHistogram::from_labels(concatenated_labels(archive)),
            output,
        }
    }
}

impl fmt::Display for LabelsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Successfully processed {} labels", self.labels)?;
        writeln!(f, "Dataset composition:")?;
        writeln!(f, "Training set: {} images", self.subsets.training)?;
        writeln!(f, "Validation set: {} images", self.subsets.validation)?;
        writeln!(f, "Test set: {} images", self.subsets.test)?;
        writeln!(f, "Output written to: {}", self.output.display())?;
        writeln!(f)?;
        write!(f, "Digit distribution:")?;
        for (digit, count) in self.histogram.iter() {
            write!(f, "\nDigit {digit}: {count} images")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImagesSummary {
    pub images: usize,
    pub width: usize,
    pub subsets: Vec<SubsetKind>,
    pub output: PathBuf,
}

impl fmt::Display for ImagesSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Successfully processed {} images", self.images)?;
        writeln!(f, "Data shape: ({}, {})", self.images, self.width)?;
        write!(f, "Output written to: {}", self.output.display())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairsSummary {
    pub pairs: usize,
    pub width: usize,
    pub output: PathBuf,
}

impl fmt::Display for PairsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Successfully processed {} labelled images", self.pairs)?;
        writeln!(f, "Data shape: ({}, {})", self.pairs, self.width)?;
        write!(f, "Output written to: {}", self.output.display())
    }
}

// ---------------------------------------------------------------------------
// Summary – any of the above
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Summary {
    Labels(LabelsSummary),
    Images(ImagesSummary),
    Pairs(PairsSummary),
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Summary::Labels(s) => fmt::Display::fmt(s, f),
            Summary::Images(s) => fmt::Display::fmt(s, f),
            Summary::Pairs(s) => fmt::Display::fmt(s, f),
        }
    }
}

impl From<LabelsSummary> for Summary {
    fn from(s: LabelsSummary) -> Self {
        Summary::Labels(s)
    }
}

impl From<ImagesSummary> for Summary {
    fn from(s: ImagesSummary) -> Self {
        Summary::Images(s)
    }
}

impl From<PairsSummary> for Summary {
    fn from(s: PairsSummary) -> Self {
        Summary::Pairs(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels_summary() -> LabelsSummary {
        LabelsSummary {
            labels: 4,
            subsets: SubsetCounts {
                training: 2,
                validation: 1,
                test: 1,
            },
            histogram: DigitHistogram::from_labels([5, 0, 3, 9]),
            output: PathBuf::from("mnist_labels.txt"),
        }
    }

    #[test]
    fn labels_report_lists_every_digit() {
        let text = labels_summary().to_string();
        assert!(text.starts_with("Successfully processed 4 labels\n"));
        assert!(text.contains("Validation set: 1 images\n"));
        assert!(text.contains("\nDigit 0: 1 images\nDigit 1: 0 images\n"));
        assert!(text.ends_with("Digit 9: 1 images"));
        let digit_lines = text
            .lines()
            .filter(|l| l.starts_with("Digit ") && l.ends_with(" images"))
            .count();
        assert_eq!(digit_lines, 10);
    }

    #[test]
    fn summary_serializes_with_operation_tag() {
        let json = serde_json::to_value(Summary::from(labels_summary())).unwrap();
        assert_eq!(json["operation"], "labels");
        assert_eq!(json["histogram"][5], 1);
        assert_eq!(json["subsets"]["training"], 2);
    }

    #[test]
    fn images_report_shows_shape() {
        let summary = ImagesSummary {
            images: 3,
            width: 784,
            subsets: vec![SubsetKind::Training],
            output: PathBuf::from("out.txt"),
        };
        assert_eq!(
            summary.to_string(),
            "Successfully processed 3 images\nData shape: (3, 784)\nOutput written to: out.txt"
        );
    }
}
