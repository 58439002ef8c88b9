use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;

use mnist_export::data::encode::write_archive;
use mnist_export::{
    export_images, export_images_of, export_images_with_labels, export_labels, Archive,
    ExportError, Images, PixelData, Subset, SubsetKind, SubsetSelection,
};

const WIDTH: usize = 4;

fn subset(rows: &[[f32; WIDTH]], labels: &[u8]) -> Subset {
    let pixels = rows.iter().flatten().copied().collect();
    Subset {
        images: Images::new(PixelData::F32(pixels), rows.len(), WIDTH).unwrap(),
        labels: labels.to_vec(),
    }
}

/// training = [(v0, 5), (v1, 0)], validation = [(v2, 3)], test = [(v3, 9)]
fn four_sample_archive() -> Archive {
    Archive {
        training: subset(
            &[[0.0, 0.5, 0.25, 1.0], [0.01171875, 0.0, 0.0, 0.98828125]],
            &[5, 0],
        ),
        validation: subset(&[[0.0, 0.0, 0.0, 0.0]], &[3]),
        test: subset(&[[1.0, 1.0, 1.0, 1.0]], &[9]),
    }
}

fn fixture(dir: &TempDir, archive: &Archive) -> PathBuf {
    let path = dir.path().join("mnist.pkl.gz");
    write_archive(&path, archive).unwrap();
    path
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

#[test]
fn labels_export_concatenates_all_subsets() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir, &four_sample_archive());
    let output = dir.path().join("mnist_labels.txt");

    let summary = export_labels(&input, &output).unwrap();

    assert_eq!(read(&output), "5\n0\n3\n9\n");
    assert_eq!(summary.labels, 4);
    assert_eq!(summary.subsets.training, 2);
    assert_eq!(summary.subsets.validation, 1);
    assert_eq!(summary.subsets.test, 1);
    assert_eq!(summary.histogram.total(), summary.labels);
    for digit in 0..10u8 {
        let expected = usize::from(matches!(digit, 0 | 3 | 5 | 9));
        assert_eq!(summary.histogram.count(digit), expected, "digit {digit}");
    }
}

#[test]
fn images_export_writes_training_rows() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir, &four_sample_archive());
    let output = dir.path().join("mnist_output.txt");

    let summary = export_images(&input, &output).unwrap();

    let text = read(&output);
    assert_eq!(
        text,
        "0.0,0.5,0.25,1.0\n0.01171875,0.0,0.0,0.98828125\n"
    );
    assert_eq!(summary.images, 2);
    assert_eq!(summary.width, WIDTH);
    assert_eq!(summary.subsets, [SubsetKind::Training]);
    for line in text.lines() {
        assert_eq!(line.matches(',').count(), WIDTH - 1);
    }
}

#[test]
fn images_export_of_all_subsets() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir, &four_sample_archive());
    let output = dir.path().join("all.txt");

    let summary = export_images_of(&input, &output, SubsetSelection::All).unwrap();

    assert_eq!(summary.images, 4);
    let lines: Vec<String> = read(&output).lines().map(str::to_string).collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[3], "1.0,1.0,1.0,1.0");
}

#[test]
fn pairs_export_replaces_previous_output() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir, &four_sample_archive());
    let output = dir.path().join("mnist_output.txt");
    fs::write(&output, "stale contents that are longer than the new file\n".repeat(50)).unwrap();

    let summary = export_images_with_labels(&input, &output).unwrap();

    assert_eq!(summary.pairs, 2);
    assert_eq!(
        read(&output),
        "5\n0.0,0.5,0.25,1.0\n0\n0.01171875,0.0,0.0,0.98828125\n"
    );
}

#[test]
fn repeated_exports_are_byte_identical() {
    let dir = TempDir::new().unwrap();
    let input = fixture(&dir, &four_sample_archive());
    let labels = dir.path().join("labels.txt");
    let images = dir.path().join("images.txt");
    let pairs = dir.path().join("pairs.txt");
    let run_all = || {
        export_labels(&input, &labels).unwrap();
        export_images(&input, &images).unwrap();
        export_images_with_labels(&input, &pairs).unwrap();
        [&labels, &images, &pairs].map(|path| fs::read(path).unwrap())
    };

    let first = run_all();
    let second = run_all();

    assert_eq!(first, second);
}

#[test]
fn missing_input_reports_could_not_find() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("nope.pkl.gz");
    let output = dir.path().join("out.txt");

    let err = export_labels(&input, &output).unwrap_err();

    assert!(matches!(err, ExportError::MissingInput(_)));
    assert!(err.report_line().starts_with("Error: Could not find input file"));
    assert!(!output.exists());
}

#[test]
fn non_gzip_input_is_an_export_error() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("plain.pkl.gz");
    fs::write(&input, b"not gzip at all").unwrap();

    let err = export_images(&input, &dir.path().join("out.txt")).unwrap_err();

    assert!(matches!(err, ExportError::Io { context: "failed to decompress", .. }));
    assert!(err.report_line().starts_with("An error occurred: "));
}

#[test]
fn wrong_shape_archive_is_a_decode_error() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("empty-tuple.pkl.gz");
    // pickle.dumps((), protocol=2)
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&[0x80, 0x02, b')', b'.']).unwrap();
    fs::write(&input, gz.finish().unwrap()).unwrap();

    let err = export_labels(&input, &dir.path().join("out.txt")).unwrap_err();

    assert!(matches!(err, ExportError::Decode { .. }));
}
