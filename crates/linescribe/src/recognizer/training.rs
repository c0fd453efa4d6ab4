//! One supervised training step on a line image and its transcription.

use super::{LstmRecognizer, ctc, prepare_line};
use crate::beam;
use crate::network::{LossType, UpdateParams};
use crate::{LinescribeError, Result};
use image::GrayImage;

/// What a training step did.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutcome {
    /// Negative log likelihood (CTC) or cross entropy of the truth.
    pub loss: f64,
    /// Greedy reading of the network outputs before the update.
    pub decoded: String,
    /// The line was too short for its transcription; no update was made.
    pub skipped: bool,
    /// Weight updates applied so far.
    pub iterations: u64,
}

impl LstmRecognizer {
    /// Forward, compute errors, back-propagate and update once.
    #[tracing::instrument(skip_all, fields(truth = %truth))]
    pub fn train_line(&mut self, image: &GrayImage, truth: &str) -> Result<TrainingOutcome> {
        if self.model.network.is_int_mode() {
            return Err(LinescribeError::validation("cannot train a network with quantized weights"));
        }
        let ids = self.model.unicharset.encode(truth.trim())?;
        let labels = self.model.recoder.encode_ids(&ids)?;
        let line = prepare_line(
            image,
            self.network_height(),
            self.model.network.x_scale(),
            self.config.max_line_width,
            false,
        )?;

        let network = &mut self.model.network;
        network.set_enable_training(true);
        network.set_use_adam(self.model.training.use_adam);
        self.forward_calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let outputs = network.forward_training(&line.input, &self.scratch);
        self.model.training.sample_iteration += 1;

        let null = self.model.recoder.null_label();
        let decoded = {
            let path = beam::decode_greedy(&outputs, &self.model.recoder);
            self.model.unicharset.decode(&path.unichar_ids())
        };

        let (errors, loss) = match network.loss_type() {
            LossType::Ctc => match ctc::compute_errors(&outputs, &labels, null) {
                Some(result) => (result.errors, result.loss),
                None => {
                    tracing::debug!(
                        truth,
                        timesteps = outputs.width(),
                        labels = labels.len(),
                        "line too short for its transcription"
                    );
                    return Ok(TrainingOutcome {
                        loss: 0.0,
                        decoded,
                        skipped: true,
                        iterations: self.model.training.iterations,
                    });
                }
            },
            LossType::Softmax | LossType::Logistic => {
                let errors = ctc::fixed_target_errors(&outputs, &labels, null);
                let loss = cross_entropy(&outputs, &errors);
                (errors, loss)
            }
            LossType::None => {
                return Err(LinescribeError::model("network has no output layer to train"));
            }
        };

        network.backward(&errors, &self.scratch);
        let training = &mut self.model.training;
        training.iterations += 1;
        network.update(&UpdateParams {
            learning_rate: training.learning_rate,
            momentum: training.momentum,
            adam_beta: training.adam_beta,
            num_samples: u32::try_from(training.iterations).unwrap_or(u32::MAX),
        });
        tracing::trace!(iteration = training.iterations, loss, truth, decoded = %decoded, "training step");

        Ok(TrainingOutcome {
            loss,
            decoded,
            skipped: false,
            iterations: training.iterations,
        })
    }
}

/// Mean cross entropy recovered from `errors = target - output` with one-hot targets.
fn cross_entropy(outputs: &crate::network::NetworkIO, errors: &crate::network::NetworkIO) -> f64 {
    let width = outputs.width();
    if width == 0 {
        return 0.0;
    }
    let mut total = 0.0f64;
    for t in 0..width {
        for (&y, &e) in outputs.f(t).iter().zip(errors.f(t)) {
            if e + y > 0.5 {
                total -= f64::from(y.max(1e-12)).ln();
            }
        }
    }
    total / width as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecognizerConfig;
    use crate::recognizer::Model;
    use crate::recoder::Unicharset;

    fn recognizer(spec: &str) -> LstmRecognizer {
        let model = Model::from_spec(spec, Unicharset::from_text("ab"), 3).unwrap();
        let config = RecognizerConfig {
            threads: Some(1),
            ..RecognizerConfig::default()
        };
        LstmRecognizer::new(model, config).unwrap()
    }

    fn line() -> GrayImage {
        GrayImage::from_fn(24, 6, |x, y| image::Luma([if (x / 3 + y) % 2 == 0 { 30 } else { 220 }]))
    }

    #[test]
    fn test_ctc_training_reduces_loss() {
        let mut recognizer = recognizer("[I6 Lfx8 O1c4]");
        let image = line();
        let first = recognizer.train_line(&image, "ab a").unwrap();
        assert!(!first.skipped);
        let mut last = first.clone();
        for _ in 0..40 {
            last = recognizer.train_line(&image, "ab a").unwrap();
        }
        assert_eq!(last.iterations, 41);
        assert!(last.loss < first.loss, "loss {} -> {}", first.loss, last.loss);
        assert_eq!(recognizer.model().training.sample_iteration, 41);
    }

    #[test]
    fn test_short_line_is_skipped() {
        let mut recognizer = recognizer("[I6 Lfx8 O1c4]");
        let image = GrayImage::from_fn(3, 6, |x, _| image::Luma([if x == 1 { 0 } else { 255 }]));
        let outcome = recognizer.train_line(&image, "abab").unwrap();
        assert!(outcome.skipped);
        assert_eq!(outcome.iterations, 0);
    }

    #[test]
    fn test_unknown_character_rejected() {
        let mut recognizer = recognizer("[I6 Lfx8 O1c4]");
        assert!(recognizer.train_line(&line(), "xyz").is_err());
    }

    #[test]
    fn test_quantized_network_cannot_train() {
        let mut recognizer = recognizer("[I6 Lfx8 O1c4]");
        recognizer.convert_to_int();
        let err = recognizer.train_line(&line(), "ab").unwrap_err();
        assert!(matches!(err, LinescribeError::Validation { .. }));
    }

    #[test]
    fn test_softmax_training_runs() {
        let mut recognizer = recognizer("[I6 Ft16 O1s4]");
        let outcome = recognizer.train_line(&line(), "ab").unwrap();
        assert!(outcome.loss > 0.0);
        assert_eq!(outcome.iterations, 1);
    }
}
