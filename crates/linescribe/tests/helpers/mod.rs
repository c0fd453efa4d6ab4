//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use image::GrayImage;
use linescribe::network::{FullyConnected, Input, Network, Nonlinearity, Series, WeightMatrix};
use linescribe::{Model, NetworkIO, Recoder, RecognizerConfig, Unicharset};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Single-threaded configuration with defaults otherwise.
pub fn test_config() -> RecognizerConfig {
    RecognizerConfig {
        threads: Some(1),
        ..RecognizerConfig::default()
    }
}

/// Softmax rows that put `0.9` on `label` at each peak and on `null` elsewhere.
pub fn peaked_outputs(width: usize, depth: usize, peaks: &[(usize, usize)], null: usize) -> NetworkIO {
    let rest = 0.1 / (depth - 1) as f32;
    let mut rows = vec![vec![rest; depth]; width];
    for row in rows.iter_mut() {
        row[null] = 0.9;
    }
    for &(t, label) in peaks {
        rows[t][null] = rest;
        rows[t][label] = 0.9;
    }
    NetworkIO::from_rows(&rows)
}

/// Random softmax rows.
pub fn random_outputs(width: usize, depth: usize, seed: u64) -> NetworkIO {
    let mut rng = StdRng::seed_from_u64(seed);
    let rows: Vec<Vec<f32>> = (0..width)
        .map(|_| {
            let raw: Vec<f32> = (0..depth).map(|_| rng.random_range(0.01f32..1.0)).collect();
            let sum: f32 = raw.iter().sum();
            raw.into_iter().map(|v| v / sum).collect()
        })
        .collect();
    NetworkIO::from_rows(&rows)
}

pub fn random_vector(len: usize, rng: &mut StdRng) -> Vec<f32> {
    (0..len).map(|_| rng.random_range(-1.0f32..1.0)).collect()
}

/// Randomly initialized model over `chars`.
pub fn spec_model(spec: &str, chars: &str, seed: u64) -> Model {
    Model::from_spec(spec, Unicharset::from_text(chars), seed).expect("valid test model")
}

/// One softmax layer whose null score grows with the summed (normalized) pixel values.
///
/// Light lines with a few dark marks decode confidently; their negatives do not.
pub fn polarity_model(height: usize) -> Model {
    let unicharset = Unicharset::from_text("ab");
    let recoder = Recoder::pass_through(unicharset.len());
    let mut weights = Array2::<f32>::zeros((recoder.num_labels(), height + 1));
    for y in 0..height {
        weights[[recoder.null_label(), y]] = 2.0;
    }
    let output = FullyConnected::with_weights(Nonlinearity::Softmax, WeightMatrix::from_array(weights));
    let network = Network::Series(Series::new(vec![
        Network::Input(Input::new(height)),
        Network::FullyConnected(output),
    ]));
    Model::new(network, unicharset, recoder).expect("valid polarity model")
}

/// White line with sparse black marks.
pub fn marked_line(width: u32, height: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        image::Luma([if x % 5 == 0 && y % 2 == 0 { 0 } else { 255 }])
    })
}

/// Line with vertical bars of alternating gray levels.
pub fn striped_line(width: u32, height: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        image::Luma([if (x / 3 + y) % 2 == 0 { 40 } else { 210 }])
    })
}
