//! The three export operations: labels, images, and labelled images.
//!
//! Every operation loads the whole archive, writes its output file from
//! scratch and returns a summary of what it wrote. Output lines end in `\n`;
//! pixel rows are comma-joined with no header and no quoting.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use csv::{Terminator, Writer, WriterBuilder};
use log::{debug, info};

use crate::data::loader::load_archive;
use crate::data::model::{Archive, Images, Subset, SubsetKind};
use crate::data::select::{concatenated_labels, selected_subsets, training_pairs, SubsetSelection};
use crate::error::ExportError;
use crate::summary::{ImagesSummary, LabelsSummary, PairsSummary};

pub const DEFAULT_INPUT: &str = "../data/mnist.pkl.gz";
pub const DEFAULT_LABELS_OUTPUT: &str = "mnist_labels.txt";
pub const DEFAULT_IMAGES_OUTPUT: &str = "mnist_output.txt";

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Write every label (training, then validation, then test) one per line.
pub fn export_labels(input: &Path, output: &Path) -> Result<LabelsSummary, ExportError> {
    let archive = load_archive(input)?;
    let out = create_output(output)?;
    write_labels(&archive, out).map_err(|source| write_error(output, source))?;

    let summary = LabelsSummary::new(&archive, output.to_path_buf());
    info!("Wrote {} labels to {}", summary.labels, output.display());
    Ok(summary)
}

/// Write every training image as one comma-separated pixel row.
pub fn export_images(input: &Path, output: &Path) -> Result<ImagesSummary, ExportError> {
    export_images_of(input, output, SubsetSelection::Training)
}

/// Write the images of the selected subsets, in archive order, one row each.
pub fn export_images_of(
    input: &Path,
    output: &Path,
    selection: SubsetSelection,
) -> Result<ImagesSummary, ExportError> {
    let archive = load_archive(input)?;
    let subsets = selected_subsets(&archive, selection);
    let out = create_output(output)?;
    let images = write_images(&subsets, out).map_err(|source| write_error(output, source))?;

    info!("Wrote {images} images to {}", output.display());
    Ok(ImagesSummary {
        images,
        width: archive.image_width(),
        subsets: subsets.iter().map(|(kind, _)| *kind).collect(),
        output: output.to_path_buf(),
    })
}

/// For each training image write its label line, then its pixel row.
///
/// Any previous file at `output` is removed first. The label for image `i`
/// is entry `i` of the concatenated label sequence (see
/// [`training_pairs`]).
pub fn export_images_with_labels(input: &Path, output: &Path) -> Result<PairsSummary, ExportError> {
    let archive = load_archive(input)?;
    match fs::remove_file(output) {
        Ok(()) => debug!("Removed previous {}", output.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(ExportError::Io {
                context: "failed to remove",
                path: output.to_path_buf(),
                source,
            })
        }
    }
    let out = create_output(output)?;
    let pairs = write_pairs(&archive, out).map_err(|source| write_error(output, source))?;

    info!("Wrote {pairs} labelled images to {}", output.display());
    Ok(PairsSummary {
        pairs,
        width: archive.image_width(),
        output: output.to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

/// Concatenated labels, one per line.
pub fn write_labels<W: Write>(archive: &Archive, out: W) -> csv::Result<()> {
    let mut writer = text_writer(out);
    for label in concatenated_labels(archive) {
        writer.write_record([label.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Pixel rows of `subsets`, in order. Returns the number of rows written.
pub fn write_images<W: Write>(subsets: &[(SubsetKind, &Subset)], out: W) -> csv::Result<usize> {
    let mut writer = text_writer(out);
    let mut rows = 0;
    for (kind, subset) in subsets {
        debug!("Writing {} {kind} images", subset.images.len());
        for row in 0..subset.images.len() {
            write_row(&mut writer, &subset.images, row)?;
        }
        rows += subset.images.len();
    }
    writer.flush()?;
    Ok(rows)
}

/// Alternating label line / pixel row for each training image. Returns the
/// number of pairs written.
pub fn write_pairs<W: Write>(archive: &Archive, out: W) -> csv::Result<usize> {
    let mut writer = text_writer(out);
    let mut pairs = 0;
    for (label, row) in training_pairs(archive) {
        writer.write_record([label.to_string()])?;
        write_row(&mut writer, &archive.training.images, row)?;
        pairs += 1;
    }
    writer.flush()?;
    Ok(pairs)
}

fn write_row<W: Write>(writer: &mut Writer<W>, images: &Images, row: usize) -> csv::Result<()> {
    if images.width() == 0 {
        // csv writes an empty record as `""`; a pixel-less row is a bare newline
        writer.flush()?;
        writer.get_mut().write_all(b"\n")?;
        return Ok(());
    }
    writer.write_record(images.row_text(row))
}

fn text_writer<W: Write>(out: W) -> Writer<W> {
    WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(out)
}

fn create_output(path: &Path) -> Result<File, ExportError> {
    File::create(path).map_err(|source| ExportError::Io {
        context: "failed to create",
        path: path.to_path_buf(),
        source,
    })
}

fn write_error(path: &Path, source: csv::Error) -> ExportError {
    ExportError::Write {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::PixelData;

    fn subset(pixels: Vec<f32>, labels: Vec<u8>) -> Subset {
        let rows = labels.len();
        Subset {
            images: Images::new(PixelData::F32(pixels), rows, 3).unwrap(),
            labels,
        }
    }

    fn archive() -> Archive {
        Archive {
            training: subset(vec![0.0, 0.5, 1.0, 0.25, 0.0, 0.75], vec![5, 0]),
            validation: subset(vec![0.0, 0.0, 0.0], vec![3]),
            test: subset(vec![1.0, 1.0, 1.0], vec![9]),
        }
    }

    fn render(write: impl FnOnce(&mut Vec<u8>) -> csv::Result<()>) -> String {
        let mut buf = Vec::new();
        write(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn labels_one_per_line() {
        let text = render(|buf| write_labels(&archive(), buf));
        assert_eq!(text, "5\n0\n3\n9\n");
    }

    #[test]
    fn training_images_as_rows() {
        let archive = archive();
        let subsets = selected_subsets(&archive, SubsetSelection::Training);
        let text = render(|buf| write_images(&subsets, buf).map(|_| ()));
        assert_eq!(text, "0.0,0.5,1.0\n0.25,0.0,0.75\n");
    }

    #[test]
    fn all_subsets_concatenate() {
        let archive = archive();
        let subsets = selected_subsets(&archive, SubsetSelection::All);
        let mut buf = Vec::new();
        let rows = write_images(&subsets, &mut buf).unwrap();
        assert_eq!(rows, 4);
        assert_eq!(String::from_utf8(buf).unwrap().lines().count(), 4);
    }

    #[test]
    fn pairs_alternate_label_and_row() {
        let text = render(|buf| write_pairs(&archive(), buf).map(|_| ()));
        assert_eq!(text, "5\n0.0,0.5,1.0\n0\n0.25,0.0,0.75\n");
    }

    #[test]
    fn zero_width_rows_are_empty_lines() {
        let blank = Subset {
            images: Images::new(PixelData::F32(Vec::new()), 2, 0).unwrap(),
            labels: vec![4, 7],
        };
        let archive = Archive {
            training: blank.clone(),
            validation: blank.clone(),
            test: blank,
        };
        let subsets = selected_subsets(&archive, SubsetSelection::Training);
        let text = render(|buf| write_images(&subsets, buf).map(|_| ()));
        assert_eq!(text, "\n\n");
        let text = render(|buf| write_pairs(&archive, buf).map(|_| ()));
        assert_eq!(text, "4\n\n7\n\n");
    }
}
