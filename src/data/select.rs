use super::model::{Archive, Subset, SubsetKind};

// ---------------------------------------------------------------------------
// Subset selection
// ---------------------------------------------------------------------------

/// Which subsets an image export covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubsetSelection {
    #[default]
    Training,
    Validation,
    Test,
    /// All three, concatenated in archive order.
    All,
}

impl SubsetSelection {
    pub fn kinds(self) -> &'static [SubsetKind] {
        match self {
            SubsetSelection::Training => &[SubsetKind::Training],
            SubsetSelection::Validation => &[SubsetKind::Validation],
            SubsetSelection::Test => &[SubsetKind::Test],
            SubsetSelection::All => &SubsetKind::ALL,
        }
    }
}

/// The selected subsets, in archive order.
pub fn selected_subsets(archive: &Archive, selection: SubsetSelection) -> Vec<(SubsetKind, &Subset)> {
    selection
        .kinds()
        .iter()
        .map(|&kind| (kind, archive.subset(kind)))
        .collect()
}

/// Labels of training, validation and test, concatenated in that order.
pub fn concatenated_labels(archive: &Archive) -> impl Iterator<Item = u8> + '_ {
    archive
        .subsets()
        .flat_map(|(_, subset)| subset.labels.iter().copied())
}

/// `(label, image row)` pairs for the combined export: one per training
/// image, the label taken from the same position of the concatenated label
/// sequence.
///
/// Training comes first in the concatenation, so the label at position `i`
/// is always training label `i`.
pub fn training_pairs(archive: &Archive) -> impl Iterator<Item = (u8, usize)> + '_ {
    concatenated_labels(archive)
        .zip(0..archive.training.len())
}
