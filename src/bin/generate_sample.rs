//! Write a small synthetic `mnist.pkl.gz` for demos and smoke tests.

use std::path::PathBuf;

use anyhow::{Context, Result};
use log::info;

use mnist_export::data::encode::write_archive;
use mnist_export::{Archive, Images, PixelData, Subset};

const SIDE: usize = 28;

/// Seven-segment strokes as (row0, col0, row1, col1) on the 28×28 grid.
const SEGMENTS: [(usize, usize, usize, usize); 7] = [
    (4, 8, 4, 19),    // top
    (4, 19, 13, 19),  // upper right
    (14, 19, 23, 19), // lower right
    (23, 8, 23, 19),  // bottom
    (14, 8, 23, 8),   // lower left
    (4, 8, 13, 8),    // upper left
    (13, 8, 13, 19),  // middle
];

/// Which segments light up for each digit.
const DIGIT_SEGMENTS: [[bool; 7]; 10] = [
    [true, true, true, true, true, true, false],
    [false, true, true, false, false, false, false],
    [true, true, false, true, true, false, true],
    [true, true, true, true, false, false, true],
    [false, true, true, false, false, true, true],
    [true, false, true, true, false, true, true],
    [true, false, true, true, true, true, true],
    [true, true, true, false, false, false, false],
    [true, true, true, true, true, true, true],
    [true, true, true, true, false, true, true],
];

fn render_digit(digit: u8, rng: &mut SimpleRng) -> Vec<f32> {
    let mut image = vec![0.0f64; SIDE * SIDE];
    let shift_r = rng.next_below(3) as isize - 1;
    let shift_c = rng.next_below(3) as isize - 1;

    for (segment, &(r0, c0, r1, c1)) in SEGMENTS.iter().enumerate() {
        if !DIGIT_SEGMENTS[usize::from(digit)][segment] {
            continue;
        }
        for r in r0..=r1 {
            for c in c0..=c1 {
                let (r, c) = (r as isize + shift_r, c as isize + shift_c);
                if (0..SIDE as isize).contains(&r) && (0..SIDE as isize).contains(&c) {
                    let px = &mut image[r as usize * SIDE + c as usize];
                    *px = (*px + 0.9 + rng.gauss(0.0, 0.05)).min(1.0);
                }
            }
        }
    }

    // Quantise to 1/256 steps, as the real archive stores intensities.
    image
        .into_iter()
        .map(|v| ((v.clamp(0.0, 255.0 / 256.0) * 256.0).round() / 256.0) as f32)
        .collect()
}

fn generate_subset(count: usize, rng: &mut SimpleRng) -> Result<Subset> {
    let labels: Vec<u8> = (0..count).map(|_| rng.next_below(10) as u8).collect();
    let pixels: Vec<f32> = labels
        .iter()
        .flat_map(|&digit| render_digit(digit, rng))
        .collect();
    let images = Images::new(PixelData::F32(pixels), count, SIDE * SIDE)
        .context("rendered images do not fill the grid")?;
    Ok(Subset { images, labels })
}

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn next_below(&mut self, n: u64) -> u64 {
        self.next_u64() % n
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let output_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("sample_mnist.pkl.gz"));

    let mut rng = SimpleRng::new(42);
    let archive = Archive {
        training: generate_subset(50, &mut rng)?,
        validation: generate_subset(10, &mut rng)?,
        test: generate_subset(10, &mut rng)?,
    };
    info!("Generated {} labelled images", archive.label_count());

    write_archive(&output_path, &archive)
        .with_context(|| format!("writing {}", output_path.display()))?;

    println!(
        "Wrote {} images ({} pixels each) to {}",
        archive.label_count(),
        SIDE * SIDE,
        output_path.display()
    );
    Ok(())
}
