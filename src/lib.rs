//! Export the MNIST pickle archive (`mnist.pkl.gz`) as plain-text files.

pub mod data;
pub mod error;
pub mod export;
pub mod summary;

pub use data::model::{Archive, DigitHistogram, Images, PixelData, Subset, SubsetKind};
pub use data::select::SubsetSelection;
pub use error::{DecodeError, ExportError};
pub use export::{export_images, export_images_of, export_images_with_labels, export_labels};
pub use summary::Summary;
