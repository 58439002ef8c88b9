use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use super::model::{Archive, PixelData, Subset};
use super::pickle::*;

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Write `archive` as a gzip-compressed protocol 2 pickle, laid out the way
/// Python 2 NumPy pickles `((train_x, train_y), (valid_x, valid_y), (test_x, test_y))`.
pub fn write_archive(path: &Path, archive: &Archive) -> std::io::Result<()> {
    let file = BufWriter::new(File::create(path)?);
    let mut gz = GzEncoder::new(file, Compression::default());
    gz.write_all(&encode_archive(archive))?;
    gz.finish()?.flush()
}

/// The uncompressed pickle stream for `archive`.
pub fn encode_archive(archive: &Archive) -> Vec<u8> {
    let mut enc = Encoder::default();
    enc.out.extend_from_slice(&[PROTO, 2]);
    for (_, subset) in archive.subsets() {
        enc.subset(subset);
    }
    enc.out.extend_from_slice(&[TUPLE3, STOP]);
    enc.out
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Encoder {
    out: Vec<u8>,
    /// Memo keys of dtypes already written, by type code.
    dtypes: HashMap<&'static str, u32>,
    next_memo: u32,
}

impl Encoder {
    fn subset(&mut self, subset: &Subset) {
        let images = &subset.images;
        let (code, data): (&'static str, Vec<u8>) = match images.pixels() {
            PixelData::F32(v) => ("f4", v.iter().flat_map(|x| x.to_le_bytes()).collect()),
            PixelData::F64(v) => ("f8", v.iter().flat_map(|x| x.to_le_bytes()).collect()),
            PixelData::U8(v) => ("u1", v.clone()),
        };
        self.ndarray(&[images.len(), images.width()], code, &data);

        let labels: Vec<u8> = subset
            .labels
            .iter()
            .flat_map(|&l| i64::from(l).to_le_bytes())
            .collect();
        self.ndarray(&[subset.len()], "i8", &labels);

        self.out.push(TUPLE2);
    }

    fn ndarray(&mut self, shape: &[usize], code: &'static str, data: &[u8]) {
        self.global("numpy.core.multiarray", "_reconstruct");
        self.global("numpy", "ndarray");
        self.int(0);
        self.out.push(TUPLE1);
        self.short_binstring(b"b");
        self.out.extend_from_slice(&[TUPLE3, REDUCE]);
        self.put();

        // __setstate__((1, shape, dtype, False, data))
        self.out.push(MARK);
        self.int(1);
        self.out.push(MARK);
        for &dim in shape {
            self.int(dim as i64);
        }
        self.out.push(TUPLE);
        self.dtype(code);
        self.out.push(NEWFALSE);
        self.out.push(BINSTRING);
        self.out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.out.extend_from_slice(data);
        self.out.extend_from_slice(&[TUPLE, BUILD]);
    }

    fn dtype(&mut self, code: &'static str) {
        if let Some(&key) = self.dtypes.get(code) {
            self.get(key);
            return;
        }
        self.global("numpy", "dtype");
        self.short_binstring(code.as_bytes());
        self.int(0);
        self.int(1);
        self.out.extend_from_slice(&[TUPLE3, REDUCE]);
        let key = self.put();
        self.dtypes.insert(code, key);

        let order: &[u8] = if code.ends_with('1') { b"|" } else { b"<" };
        self.out.push(MARK);
        self.int(3);
        self.short_binstring(order);
        self.out.extend_from_slice(&[NONE, NONE, NONE]);
        self.int(-1);
        self.int(-1);
        self.int(0);
        self.out.extend_from_slice(&[TUPLE, BUILD]);
    }

    fn global(&mut self, module: &str, name: &str) {
        self.out.push(GLOBAL);
        for part in [module, name] {
            self.out.extend_from_slice(part.as_bytes());
            self.out.push(b'\n');
        }
    }

    fn int(&mut self, value: i64) {
        match value {
            0..=0xff => self.out.extend_from_slice(&[BININT1, value as u8]),
            0x100..=0xffff => {
                self.out.push(BININT2);
                self.out.extend_from_slice(&(value as u16).to_le_bytes());
            }
            v if i32::try_from(v).is_ok() => {
                self.out.push(BININT);
                self.out.extend_from_slice(&(v as i32).to_le_bytes());
            }
            v => {
                self.out.extend_from_slice(&[LONG1, 8]);
                self.out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }

    fn short_binstring(&mut self, bytes: &[u8]) {
        self.out.push(SHORT_BINSTRING);
        self.out.push(bytes.len() as u8);
        self.out.extend_from_slice(bytes);
    }

    fn put(&mut self) -> u32 {
        let key = self.next_memo;
        self.next_memo += 1;
        match u8::try_from(key) {
            Ok(short) => self.out.extend_from_slice(&[BINPUT, short]),
            Err(_) => {
                self.out.push(LONG_BINPUT);
                self.out.extend_from_slice(&key.to_le_bytes());
            }
        }
        key
    }

    fn get(&mut self, key: u32) {
        match u8::try_from(key) {
            Ok(short) => self.out.extend_from_slice(&[BINGET, short]),
            Err(_) => {
                self.out.push(LONG_BINGET);
                self.out.extend_from_slice(&key.to_le_bytes());
            }
        }
    }
}
