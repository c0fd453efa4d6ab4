//! Structural guarantees of the network evaluator.

mod helpers;

use helpers::{random_vector, spec_model};
use linescribe::network::{FullyConnected, Input, Network, Nonlinearity, Series, StrideMap, WeightMatrix};
use linescribe::{LinescribeError, Model, NetworkIO, NetworkScratch, Recoder, Unicharset};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Random activations for every real timestep of `stride`; padding stays zero.
fn random_batch(stride: StrideMap, depth: usize, seed: u64) -> NetworkIO {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut io = NetworkIO::new_float(stride, depth);
    for t in 0..io.width() {
        if io.is_valid(t) {
            io.f_mut(t).copy_from_slice(&random_vector(depth, &mut rng));
        }
    }
    io
}

#[test]
fn test_depth_mismatch_fails_validation() {
    let wide = FullyConnected::with_weights(Nonlinearity::Tanh, WeightMatrix::zeros(3, 6));
    let network = Network::Series(Series::new(vec![Network::Input(Input::new(4)), Network::FullyConnected(wide)]));
    let err = network.validate().unwrap_err();
    assert!(matches!(err, LinescribeError::Validation { .. }), "{err}");
    assert!(err.to_string().contains("expects 6"));

    let unicharset = Unicharset::from_text("ab");
    let recoder = Recoder::pass_through(unicharset.len());
    let err = Model::new(network, unicharset, recoder).unwrap_err();
    assert!(matches!(err, LinescribeError::Model { .. }));
}

#[test]
fn test_bad_spec_is_rejected() {
    assert!(Network::from_spec("[I8 Lfx6 O1c5", 1).is_err());
    assert!(Network::from_spec("[Lfx6 O1c5]", 1).is_err());
    assert!(Network::from_spec("[I8 Q3 O1c5]", 1).is_err());
}

#[test]
fn test_padding_stays_zero_through_the_tree() {
    let network = Network::from_spec("[I6 Ct3,8 Lbx5 Fr7 O1c5]", 11).unwrap();
    let input = random_batch(StrideMap::new(vec![10, 4]), 6, 5);
    let output = network.forward(&input, &NetworkScratch::sequential());
    assert_eq!(output.width(), 20);
    assert_eq!(output.depth(), 5);
    for t in 0..output.width() {
        let row = output.f(t);
        if output.is_valid(t) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4, "timestep {t} sums to {sum}");
        } else {
            assert!(row.iter().all(|&v| v == 0.0), "padding timestep {t} is {row:?}");
        }
    }
}

#[test]
fn test_batched_line_matches_single_line() {
    let network = Network::from_spec("[I6 Lbx5 O1c5]", 4).unwrap();
    let batch = random_batch(StrideMap::new(vec![10, 4]), 6, 8);
    let scratch = NetworkScratch::sequential();
    let batched = network.forward(&batch, &scratch);

    let rows: Vec<Vec<f32>> = (10..14).map(|t| batch.f(t).to_vec()).collect();
    let alone = network.forward(&NetworkIO::from_rows(&rows), &scratch);
    for x in 0..4 {
        for (a, b) in batched.f(10 + x).iter().zip(alone.f(x)) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}

#[test]
fn test_thread_count_does_not_change_outputs() {
    let network = Network::from_spec("[I8 Ft32 Fr16 O1c9]", 21).unwrap();
    let input = random_batch(StrideMap::single(64), 8, 3);
    let single = network.forward(&input, &NetworkScratch::new(1).unwrap());
    let pooled = network.forward(&input, &NetworkScratch::new(4).unwrap());
    assert_eq!(single.float_data(), pooled.float_data());
}

#[test]
fn test_lstm_is_thread_independent() {
    let network = Network::from_spec("[I8 Lbx6 O1c5]", 2).unwrap();
    let input = random_batch(StrideMap::new(vec![40, 25]), 8, 12);
    let single = network.forward(&input, &NetworkScratch::new(1).unwrap());
    let pooled = network.forward(&input, &NetworkScratch::new(3).unwrap());
    assert_eq!(single.float_data(), pooled.float_data());
}

#[test]
fn test_model_bytes_reproduce_outputs() {
    let model = spec_model("[I8 Ct3,6 Lbx6 O1c6]", "abcd", 77);
    let restored = Model::from_bytes(&model.to_bytes().unwrap()).unwrap();
    assert_eq!(restored.network.spec(), model.network.spec());

    let input = random_batch(StrideMap::single(30), 8, 1);
    let scratch = NetworkScratch::sequential();
    let before = model.network.forward(&input, &scratch);
    let after = restored.network.forward(&input, &scratch);
    assert_eq!(before.float_data(), after.float_data());
}

#[test]
fn test_quantized_network_stays_close() {
    let mut network = Network::from_spec("[I8 Ft16 O1c5]", 6).unwrap();
    let input = random_batch(StrideMap::single(20), 8, 9);
    let scratch = NetworkScratch::sequential();
    let float = network.forward(&input, &scratch);
    network.convert_to_int();
    assert!(network.is_int_mode());
    let quantized = network.forward(&input, &scratch).to_float();
    let diff = float.max_abs_diff(&quantized);
    assert!(diff < 0.05, "quantized outputs drift by {diff}");
}

#[test]
fn test_int_input_matches_float_input() {
    let mut network = Network::from_spec("[I6 Ct3,8 Mp2 Lbx5 O1c5]", 13).unwrap();
    let input = random_batch(StrideMap::new(vec![16, 10]), 6, 21);
    let int_input = input.to_int();
    assert!(int_input.int_mode());
    let scratch = NetworkScratch::sequential();

    let float = network.forward(&input, &scratch);
    let from_int = network.forward(&int_input, &scratch).to_float();
    let diff = float.max_abs_diff(&from_int);
    assert!(diff < 0.05, "int input drifts by {diff}");

    network.convert_to_int();
    let quantized = network.forward(&int_input, &scratch).to_float();
    let diff = float.max_abs_diff(&quantized);
    assert!(diff < 0.1, "quantized network on int input drifts by {diff}");
}

#[test]
fn test_quantized_model_survives_serialization() {
    let mut model = spec_model("[I8 Lfx6 O1c5]", "abc", 31);
    model.network.convert_to_int();
    let restored = Model::from_bytes(&model.to_bytes().unwrap()).unwrap();
    assert!(restored.network.is_int_mode());

    let input = random_batch(StrideMap::single(12), 8, 4);
    let scratch = NetworkScratch::sequential();
    assert_eq!(
        model.network.forward(&input, &scratch).to_float().float_data(),
        restored.network.forward(&input, &scratch).to_float().float_data()
    );
}

#[test]
fn test_explicit_weights_compute_affine_softmax() {
    // Two inputs, two outputs; bias in the last column.
    let weights = Array2::from_shape_vec((2, 3), vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]).unwrap();
    let network = Network::Series(Series::new(vec![
        Network::Input(Input::new(2)),
        Network::FullyConnected(FullyConnected::with_weights(
            Nonlinearity::Softmax,
            WeightMatrix::from_array(weights),
        )),
    ]));
    network.validate().unwrap();
    let output = network.forward(&NetworkIO::from_rows(&[vec![2.0, 0.0]]), &NetworkScratch::sequential());
    let expected = 2f32.exp() / (2f32.exp() + 1.0);
    assert!((output.f(0)[0] - expected).abs() < 1e-6);
}
