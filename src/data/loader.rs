use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use log::{debug, info};

use super::model::{Archive, Images, PixelData, Subset, SubsetKind};
use super::pickle::{self, ElementKind, NdArray, Value};
use crate::error::{DecodeError, ExportError};

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Load and validate the gzip-compressed pickle archive at `path`.
///
/// A missing file is reported as [`ExportError::MissingInput`]; everything
/// else (gzip, pickle or schema problems) as the matching error variant.
pub fn load_archive(path: &Path) -> Result<Archive, ExportError> {
    let file = File::open(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => ExportError::MissingInput(path.to_path_buf()),
        _ => ExportError::Io {
            context: "failed to open",
            path: path.to_path_buf(),
            source,
        },
    })?;

    let mut raw = Vec::new();
    GzDecoder::new(BufReader::new(file))
        .read_to_end(&mut raw)
        .map_err(|source| ExportError::Io {
            context: "failed to decompress",
            path: path.to_path_buf(),
            source,
        })?;
    info!("Read {} bytes of pickle data from {}", raw.len(), path.display());

    let archive = decode_archive(&raw).map_err(|source| ExportError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    for (kind, subset) in archive.subsets() {
        info!("{kind} set: {} images", subset.len());
    }
    Ok(archive)
}

/// Decode an uncompressed pickle stream into a typed [`Archive`].
///
/// Expected layout:
///
/// ```text
/// ( (images, labels),   # training
///   (images, labels),   # validation
///   (images, labels) )  # test
/// ```
///
/// `images` is a 2-D float32 / float64 / uint8 array, `labels` a 1-D integer
/// array of the same length with every value in `0..=9`.
pub fn decode_archive(bytes: &[u8]) -> Result<Archive, DecodeError> {
    let root = pickle::from_slice(bytes)?;
    let [training, validation, test] = tuple_items::<3>(&root, "archive", "a 3-tuple of subsets")?;

    let training = decode_subset(SubsetKind::Training, training)?;
    let validation = decode_subset(SubsetKind::Validation, validation)?;
    let test = decode_subset(SubsetKind::Test, test)?;

    let width = training.images.width();
    for (kind, subset) in [(SubsetKind::Validation, &validation), (SubsetKind::Test, &test)] {
        if subset.images.width() != width {
            return Err(DecodeError::WidthMismatch {
                subset: kind,
                expected: width,
                found: subset.images.width(),
            });
        }
    }

    Ok(Archive {
        training,
        validation,
        test,
    })
}

// ---------------------------------------------------------------------------
// Typed decode helpers
// ---------------------------------------------------------------------------

fn tuple_items<'v, const N: usize>(
    value: &'v Value,
    context: &str,
    expected: &'static str,
) -> Result<&'v [Value; N], DecodeError> {
    match value {
        Value::Tuple(items) => items
            .as_slice()
            .try_into()
            .map_err(|_| DecodeError::schema(context, expected, value.describe())),
        other => Err(DecodeError::schema(context, expected, other.describe())),
    }
}

fn decode_subset(kind: SubsetKind, value: &Value) -> Result<Subset, DecodeError> {
    let context = format!("{kind} set");
    let [images, labels] = tuple_items::<2>(value, &context, "an (images, labels) pair")?;

    let images = with_array(images, &format!("{kind} images"), decode_images)?;
    let labels = with_array(labels, &format!("{kind} labels"), decode_labels)?;

    if images.len() != labels.len() {
        return Err(DecodeError::LengthMismatch {
            subset: kind,
            images: images.len(),
            labels: labels.len(),
        });
    }
    let labels = labels
        .into_iter()
        .enumerate()
        .map(|(index, value)| match u8::try_from(value) {
            Ok(digit) if digit <= 9 => Ok(digit),
            _ => Err(DecodeError::LabelOutOfRange {
                subset: kind,
                index,
                value,
            }),
        })
        .collect::<Result<Vec<u8>, _>>()?;

    debug!("{context}: {} images of width {}", images.len(), images.width());
    Ok(Subset { images, labels })
}

fn with_array<T>(
    value: &Value,
    context: &str,
    decode: fn(&NdArray, &str) -> Result<T, DecodeError>,
) -> Result<T, DecodeError> {
    match value {
        Value::Array(array) => decode(&array.borrow(), context),
        other => Err(DecodeError::schema(context, "a numpy array", other.describe())),
    }
}

fn decode_images(array: &NdArray, context: &str) -> Result<Images, DecodeError> {
    let (rows, width) = match array.shape() {
        &[rows, width] => (rows, width),
        shape => {
            return Err(DecodeError::schema(
                context,
                "a 2-D array",
                format!("shape {shape:?}"),
            ))
        }
    };
    let kind = array.dtype().map(|d| d.kind);
    let pixels = match kind {
        Some(ElementKind::F4) => PixelData::F32(array.to_f32()?),
        Some(ElementKind::F8) => PixelData::F64(array.to_f64()?),
        Some(ElementKind::U1) => PixelData::U8(array.to_u8()?),
        other => {
            return Err(DecodeError::schema(
                context,
                "float32, float64 or uint8 pixels",
                other.map_or_else(|| "no dtype".to_string(), |k| k.to_string()),
            ))
        }
    };
    let found = pixels.len();
    Images::new(pixels, rows, width).ok_or_else(|| {
        DecodeError::schema(context, "one pixel per shape element", format!("{found} pixels"))
    })
}

fn decode_labels(array: &NdArray, context: &str) -> Result<Vec<i64>, DecodeError> {
    if array.shape().len() != 1 {
        return Err(DecodeError::schema(
            context,
            "a 1-D array",
            format!("shape {:?}", array.shape()),
        ));
    }
    array.to_i64().map_err(|err| match err {
        DecodeError::Schema { expected, found, .. } => DecodeError::schema(context, expected, found),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::encode::encode_archive;
    use crate::data::pickle::{
        BINGET, BINPUT, BININT1, BINSTRING, BUILD, EMPTY_TUPLE, GLOBAL, MARK, NEWFALSE, PROTO, REDUCE,
        SHORT_BINSTRING, STOP, TUPLE, TUPLE1, TUPLE2, TUPLE3,
    };

    fn subset(pixels: Vec<f32>, width: usize, labels: Vec<u8>) -> Subset {
        let rows = labels.len();
        Subset {
            images: Images::new(PixelData::F32(pixels), rows, width).unwrap(),
            labels,
        }
    }

    fn sample() -> Archive {
        Archive {
            training: subset(vec![0.0, 0.5, 1.0, 0.25], 2, vec![5, 0]),
            validation: subset(vec![0.125, 0.0], 2, vec![3]),
            test: subset(vec![1.0, 1.0], 2, vec![9]),
        }
    }

    #[test]
    fn decodes_what_the_encoder_writes() {
        let archive = sample();
        assert_eq!(decode_archive(&encode_archive(&archive)).unwrap(), archive);
    }

    #[test]
    fn uint8_pixels_round_trip() {
        let mut archive = sample();
        archive.test.images = Images::new(PixelData::U8(vec![0, 255]), 1, 2).unwrap();
        let decoded = decode_archive(&encode_archive(&archive)).unwrap();
        assert_eq!(decoded.test.images.pixels(), &PixelData::U8(vec![0, 255]));
    }

    #[test]
    fn label_out_of_range_is_rejected() {
        let mut archive = sample();
        archive.validation.labels = vec![12];
        let err = decode_archive(&encode_archive(&archive)).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::LabelOutOfRange {
                subset: SubsetKind::Validation,
                index: 0,
                value: 12
            }
        ));
    }

    #[test]
    fn misaligned_subset_is_rejected() {
        let mut archive = sample();
        archive.training.labels = vec![5];
        let err = decode_archive(&encode_archive(&archive)).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::LengthMismatch {
                subset: SubsetKind::Training,
                images: 2,
                labels: 1
            }
        ));
    }

    #[test]
    fn width_must_match_training() {
        let mut archive = sample();
        archive.test = subset(vec![1.0, 1.0, 1.0], 3, vec![9]);
        let err = decode_archive(&encode_archive(&archive)).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::WidthMismatch {
                subset: SubsetKind::Test,
                expected: 2,
                found: 3
            }
        ));
    }

    #[test]
    fn wrong_arity_is_a_schema_error() {
        // ((), ())
        let p = [PROTO, 2, EMPTY_TUPLE, EMPTY_TUPLE, TUPLE2, STOP];
        let err = decode_archive(&p).unwrap_err();
        assert!(matches!(err, DecodeError::Schema { ref context, .. } if context == "archive"));
    }

    /// Build one 1-D array the way a Python 3 / NumPy 1.x pickle does,
    /// with the dtype pulled back out of the memo for the second use.
    #[test]
    fn memoized_dtype_keeps_its_byte_order() {
        let mut p = vec![PROTO, 2];
        let array = |p: &mut Vec<u8>, first: bool, data: &[u8]| {
            p.push(GLOBAL);
            p.extend_from_slice(b"numpy.core.multiarray\n_reconstruct\n");
            p.push(GLOBAL);
            p.extend_from_slice(b"numpy\nndarray\n");
            p.extend_from_slice(&[BININT1, 0, TUPLE1, SHORT_BINSTRING, 1, b'b', TUPLE3, REDUCE]);
            p.extend_from_slice(&[MARK, BININT1, 1, BININT1, (data.len() / 2) as u8, TUPLE1]);
            if first {
                p.push(GLOBAL);
                p.extend_from_slice(b"numpy\ndtype\n");
                p.extend_from_slice(&[SHORT_BINSTRING, 2, b'i', b'2', BININT1, 0, BININT1, 1]);
                p.extend_from_slice(&[TUPLE3, REDUCE, BINPUT, 7]);
                p.extend_from_slice(&[MARK, BININT1, 3, SHORT_BINSTRING, 1, b'>', TUPLE, BUILD]);
            } else {
                p.extend_from_slice(&[BINGET, 7]);
            }
            p.push(NEWFALSE);
            p.push(BINSTRING);
            p.extend_from_slice(&(data.len() as u32).to_le_bytes());
            p.extend_from_slice(data);
            p.extend_from_slice(&[TUPLE, BUILD]);
        };
        array(&mut p, true, &[0, 1]);
        array(&mut p, false, &[0, 2, 1, 0]);
        p.extend_from_slice(&[TUPLE2, STOP]);

        let root = pickle::from_slice(&p).unwrap();
        let Value::Tuple(items) = root else {
            panic!("expected tuple");
        };
        let Value::Array(second) = &items[1] else {
            panic!("expected array");
        };
        assert_eq!(second.borrow().to_i64().unwrap(), vec![2, 256]);
    }

    #[test]
    fn missing_file_is_reported_as_missing_input() {
        let err = load_archive(Path::new("definitely/not/here.pkl.gz")).unwrap_err();
        assert!(matches!(err, ExportError::MissingInput(_)));
        assert_eq!(
            err.to_string(),
            "Could not find input file definitely/not/here.pkl.gz"
        );
    }
}
