use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::data::model::SubsetKind;

// ---------------------------------------------------------------------------
// DecodeError – pickle stream and archive schema problems
// ---------------------------------------------------------------------------

/// Everything that can go wrong between raw pickle bytes and a typed
/// [`Archive`](crate::data::model::Archive).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("pickle stream ended unexpectedly at byte {0}")]
    Truncated(usize),

    #[error("unsupported pickle opcode 0x{opcode:02x} at byte {offset}")]
    UnsupportedOpcode { opcode: u8, offset: usize },

    #[error("pickle stack underflow at byte {0}")]
    StackUnderflow(usize),

    #[error("no MARK on the pickle stack at byte {0}")]
    MissingMark(usize),

    #[error("memo key {0} was read before it was stored")]
    MissingMemo(u32),

    #[error("unsupported global {module}.{name}")]
    UnsupportedGlobal { module: String, name: String },

    #[error("malformed pickle at byte {offset}: {message}")]
    Malformed { offset: usize, message: String },

    #[error("unsupported dtype '{0}'")]
    UnsupportedDtype(String),

    #[error("array of shape {shape:?} ({dtype}) needs {expected} data bytes, found {actual}")]
    ArrayDataLength {
        shape: Vec<usize>,
        dtype: String,
        expected: usize,
        actual: usize,
    },

    #[error("Fortran-ordered arrays with {0} dimensions are not supported")]
    FortranOrder(usize),

    #[error("{context}: expected {expected}, found {found}")]
    Schema {
        context: String,
        expected: &'static str,
        found: String,
    },

    #[error("{subset} set has {images} images but {labels} labels")]
    LengthMismatch {
        subset: SubsetKind,
        images: usize,
        labels: usize,
    },

    #[error("{subset} set: label {value} at index {index} is outside 0..=9")]
    LabelOutOfRange {
        subset: SubsetKind,
        index: usize,
        value: i64,
    },

    #[error("{subset} set images hold {found} pixels each, training images hold {expected}")]
    WidthMismatch {
        subset: SubsetKind,
        expected: usize,
        found: usize,
    },
}

impl DecodeError {
    pub(crate) fn malformed(offset: usize, message: impl Into<String>) -> Self {
        DecodeError::Malformed {
            offset,
            message: message.into(),
        }
    }

    pub(crate) fn schema(context: impl Into<String>, expected: &'static str, found: String) -> Self {
        DecodeError::Schema {
            context: context.into(),
            expected,
            found,
        }
    }
}

// ---------------------------------------------------------------------------
// ExportError – what an export operation reports to its caller
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Could not find input file {}", .0.display())]
    MissingInput(PathBuf),

    #[error("failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },

    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl ExportError {
    /// The one-line message shown to the user when an export fails.
    pub fn report_line(&self) -> String {
        match self {
            ExportError::MissingInput(_) => format!("Error: {self}"),
            other => format!("An error occurred: {other}"),
        }
    }
}
