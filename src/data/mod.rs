//! Data layer: archive decoding, core types, and subset selection.
//!
//! Architecture:
//! ```text
//!  mnist.pkl.gz
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  loader   │  gunzip → pickle VM → typed Archive
//!   └──────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  Archive  │  training / validation / test Subsets
//!   └──────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  select   │  pick subsets, concatenate labels
//!   └──────────┘
//! ```
//!
//! `encode` goes the other way and writes an archive, for fixtures and the
//! sample generator.

pub mod encode;
pub mod loader;
pub mod model;
pub mod pickle;
pub mod select;
