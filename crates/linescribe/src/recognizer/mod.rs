//! Line recognition: image strip in, words out.
//!
//! [`LstmRecognizer`] owns a loaded [`Model`] and the evaluation context. A
//! call to [`LstmRecognizer::recognize_line`] scales the strip to the
//! network height, runs the forward pass, retries on the inverted image when
//! the network looks unsure, decodes the scores and maps the characters back
//! onto the original image.
//!
//! Failures on one line never propagate: a line that cannot be scaled, is
//! blank, or decodes to nothing yields a single placeholder word.

pub mod calibration;
pub mod ctc;
pub mod input;
pub mod model;
pub mod training;
mod words;

pub use calibration::{CertaintyCalibration, LinearCalibration};
pub use input::{PreparedLine, prepare_line};
pub use model::{Model, TrainingMetadata};
pub use training::TrainingOutcome;

use crate::beam::{self, BeamResult, DecodedPath, Dictionary, RecodeBeamSearch};
use crate::config::{ChoiceMode, RecognizerConfig};
use crate::dotproduct::DotProduct;
use crate::network::{LossType, NetworkIO, NetworkScratch};
use crate::types::{BoundingBox, WordResult};
use crate::{LinescribeError, Result};
use image::GrayImage;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use words::WordBuilder;

/// Summary of the best-label probability over a line's timesteps.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OutputStats {
    pub min: f32,
    pub mean: f32,
    pub std_dev: f32,
}

impl OutputStats {
    pub fn from_outputs(outputs: &NetworkIO) -> Self {
        let outputs = outputs.to_float();
        let width = outputs.stride_map().width(0);
        if width == 0 {
            return Self::default();
        }
        let best: Vec<f32> = (0..width).map(|t| outputs.best_label(t).1).collect();
        let min = best.iter().copied().fold(f32::INFINITY, f32::min);
        let mean = best.iter().sum::<f32>() / width as f32;
        let variance = best.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / width as f32;
        Self {
            min,
            mean,
            std_dev: variance.sqrt(),
        }
    }
}

/// Everything produced while recognizing one line.
#[derive(Debug, Clone)]
pub struct LineRecognition {
    pub words: Vec<WordResult>,
    pub path: DecodedPath,
    /// Network outputs the decode was computed from.
    pub outputs: NetworkIO,
    pub stats: OutputStats,
    /// The decode comes from the pixel-inverted image.
    pub inverted: bool,
    /// Scaled width over original width.
    pub scale: f32,
}

impl LineRecognition {
    fn placeholder(line_box: BoundingBox) -> Self {
        Self {
            words: vec![WordResult::fake(line_box)],
            path: DecodedPath::default(),
            outputs: NetworkIO::default(),
            stats: OutputStats::default(),
            inverted: false,
            scale: 1.0,
        }
    }

    /// Placeholder that still carries the evaluation it came from.
    fn unrecognized(line_box: BoundingBox, outputs: NetworkIO, stats: OutputStats, inverted: bool, scale: f32) -> Self {
        Self {
            outputs,
            stats,
            inverted,
            scale,
            ..Self::placeholder(line_box)
        }
    }

    /// Recognized text with words joined by single spaces.
    pub fn text(&self) -> String {
        self.words
            .iter()
            .filter(|w| !w.fake)
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

struct Evaluation {
    line: PreparedLine,
    outputs: NetworkIO,
    stats: OutputStats,
}

/// A loaded model ready to recognize (and train on) text lines.
///
/// Recognition takes `&self`, so one recognizer can serve many threads.
/// Training takes `&mut self`.
pub struct LstmRecognizer {
    model: Model,
    config: RecognizerConfig,
    scratch: NetworkScratch,
    calibration: Box<dyn CertaintyCalibration>,
    forward_calls: AtomicUsize,
}

impl std::fmt::Debug for LstmRecognizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LstmRecognizer")
            .field("spec", &self.model.network_spec)
            .field("characters", &self.model.unicharset.len())
            .field("config", &self.config)
            .field("scratch", &self.scratch)
            .finish()
    }
}

impl LstmRecognizer {
    pub fn new(model: Model, config: RecognizerConfig) -> Result<Self> {
        config.validate()?;
        model.validate()?;
        let backend = config.apply_dot_product();
        let scratch = NetworkScratch::from_thread_count(config.threads)?.with_dot_product(DotProduct::with_backend(backend));
        tracing::debug!(
            spec = %model.network_spec,
            backend = %backend,
            threads = scratch.num_threads(),
            "line recognizer ready"
        );
        Ok(Self {
            calibration: Box::new(LinearCalibration::new(config.rescale_certainty)),
            model,
            config,
            scratch,
            forward_calls: AtomicUsize::new(0),
        })
    }

    pub fn load(path: impl AsRef<Path>, config: RecognizerConfig) -> Result<Self> {
        Self::new(Model::load(path)?, config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.model.save(path)
    }

    pub fn with_calibration(mut self, calibration: Box<dyn CertaintyCalibration>) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Learning parameters and counters used by [`LstmRecognizer::train_line`].
    pub fn training_mut(&mut self) -> &mut TrainingMetadata {
        &mut self.model.training
    }

    pub fn into_model(self) -> Model {
        self.model
    }

    pub fn config(&self) -> &RecognizerConfig {
        &self.config
    }

    /// Image rows the network expects.
    pub fn network_height(&self) -> usize {
        self.model.network.num_inputs()
    }

    /// Forward passes run so far.
    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::Relaxed)
    }

    pub fn reset_forward_calls(&self) {
        self.forward_calls.store(0, Ordering::Relaxed);
    }

    /// Switch the network to 8-bit weights. Training is no longer possible.
    pub fn convert_to_int(&mut self) {
        self.model.network.convert_to_int();
    }

    /// Recognize one line; see [`LstmRecognizer::recognize_line_detailed`].
    pub fn recognize_line(
        &self,
        image: &GrayImage,
        line_box: BoundingBox,
        dictionary: Option<&dyn Dictionary>,
    ) -> Vec<WordResult> {
        self.recognize_line_detailed(image, line_box, dictionary).words
    }

    /// Recognize `image`, whose pixels occupy `line_box` in the page.
    #[tracing::instrument(skip_all, fields(width = image.width(), height = image.height()))]
    pub fn recognize_line_detailed(
        &self,
        image: &GrayImage,
        line_box: BoundingBox,
        dictionary: Option<&dyn Dictionary>,
    ) -> LineRecognition {
        let normal = match self.evaluate(image, false) {
            Ok(evaluation) => evaluation,
            Err(err) => {
                tracing::debug!(error = %err, "line skipped");
                return LineRecognition::placeholder(line_box);
            }
        };

        let (chosen, inverted) = self.choose_polarity(image, normal);
        let Evaluation { line, outputs, stats } = chosen;

        let result = self.decode(&outputs, dictionary);
        let path = result.best;
        if path.is_empty() {
            tracing::debug!(mean = stats.mean, "nothing recognized");
            return LineRecognition::unrecognized(line_box, outputs, stats, inverted, line.scale);
        }

        let (choices, timesteps) = match self.config.choice_mode {
            ChoiceMode::Off => (None, None),
            ChoiceMode::Characters => {
                let search = self.beam_search(dictionary);
                (Some(search.alternatives(&outputs, &path, self.config.choice_iterations)), None)
            }
            ChoiceMode::Timesteps => {
                let search = self.beam_search(dictionary);
                (None, Some(search.timestep_choices(&outputs, &path, self.config.top_n)))
            }
        };

        let builder = WordBuilder {
            unicharset: &self.model.unicharset,
            calibration: self.calibration.as_ref(),
            dictionary,
            line_box,
            x_scale: self.model.network.x_scale(),
            scale: line.scale,
            scaled_width: line.scaled_width,
        };
        let words = builder.build(&path, choices.as_deref(), timesteps.as_deref());
        if words.is_empty() {
            tracing::debug!(chars = path.chars.len(), "only spaces recognized");
            return LineRecognition::unrecognized(line_box, outputs, stats, inverted, line.scale);
        }
        if self.config.debug_level >= 2 {
            for word in &words {
                tracing::debug!(text = %word.text, confidence = word.confidence, bbox = ?word.bbox, "word");
            }
        }

        LineRecognition {
            words,
            path,
            outputs,
            stats,
            inverted,
            scale: line.scale,
        }
    }

    /// Decode network outputs with the configured decoder.
    ///
    /// CTC-trained models use the beam search; others take the best label at
    /// each timestep.
    pub fn decode(&self, outputs: &NetworkIO, dictionary: Option<&dyn Dictionary>) -> BeamResult {
        match self.model.network.loss_type() {
            LossType::Ctc => self.beam_search(dictionary).decode(outputs),
            _ => BeamResult {
                best: beam::decode_greedy(outputs, &self.model.recoder),
                ..BeamResult::default()
            },
        }
    }

    fn beam_search<'a>(&'a self, dictionary: Option<&'a dyn Dictionary>) -> RecodeBeamSearch<'a> {
        let search = RecodeBeamSearch::new(&self.model.recoder, &self.model.unicharset, self.config.beam_config());
        match dictionary {
            Some(dict) => search.with_dictionary(dict),
            None => search,
        }
    }

    fn evaluate(&self, image: &GrayImage, invert: bool) -> Result<Evaluation> {
        let line = prepare_line(
            image,
            self.network_height(),
            self.model.network.x_scale(),
            self.config.max_line_width,
            invert,
        )?;
        if line.blank {
            return Err(LinescribeError::recognition("line image is blank"));
        }
        self.forward_calls.fetch_add(1, Ordering::Relaxed);
        let outputs = self.model.network.forward(&line.input, &self.scratch);
        let stats = OutputStats::from_outputs(&outputs);
        if self.config.debug_level >= 1 {
            tracing::debug!(
                inverted = invert,
                width = outputs.width(),
                min = stats.min,
                mean = stats.mean,
                std_dev = stats.std_dev,
                "forward pass"
            );
        }
        Ok(Evaluation { line, outputs, stats })
    }

    /// Try the inverted image when the network is unsure of the original.
    fn choose_polarity(&self, image: &GrayImage, normal: Evaluation) -> (Evaluation, bool) {
        if normal.stats.mean >= self.config.invert_threshold {
            return (normal, false);
        }
        let inverted = match self.evaluate(image, true) {
            Ok(evaluation) => evaluation,
            Err(err) => {
                tracing::debug!(error = %err, "inverted evaluation failed");
                return (normal, false);
            }
        };
        if inverted.stats.mean > normal.stats.mean {
            tracing::debug!(
                normal = normal.stats.mean,
                inverted = inverted.stats.mean,
                "using inverted line"
            );
            return (inverted, true);
        }
        if self.config.re_invert {
            match self.evaluate(image, false) {
                Ok(evaluation) => return (evaluation, false),
                Err(err) => tracing::debug!(error = %err, "re-evaluation failed"),
            }
        }
        (normal, false)
    }
}
