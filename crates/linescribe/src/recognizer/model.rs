//! Model blob: network, character set, description string, training
//! metadata and recoder table.
//!
//! ```text
//! bytes 0..4   magic "LSCM"
//! bytes 4..8   format version, little endian u32
//! bytes 8..    MessagePack document (named fields)
//! ```

use crate::network::Network;
use crate::recoder::{Recoder, Unicharset};
use crate::{LinescribeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MODEL_MAGIC: &[u8; 4] = b"LSCM";
pub const MODEL_VERSION: u32 = 1;

/// Character sets up to this size get a pass-through recoder.
pub const PASS_THROUGH_LIMIT: usize = 256;

/// Counters and learning parameters carried between training sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetadata {
    /// Weight updates applied.
    pub iterations: u64,
    /// Lines presented, including ones skipped as too short.
    pub sample_iteration: u64,
    pub learning_rate: f32,
    pub momentum: f32,
    pub adam_beta: f32,
    pub use_adam: bool,
    /// Label emitted for "no character".
    pub null_char: usize,
}

impl TrainingMetadata {
    pub fn new(null_char: usize) -> Self {
        Self {
            iterations: 0,
            sample_iteration: 0,
            learning_rate: 1e-3,
            momentum: 0.5,
            adam_beta: 0.999,
            use_adam: false,
            null_char,
        }
    }
}

/// Everything needed to run (and keep training) a line recognizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub network: Network,
    pub unicharset: Unicharset,
    pub network_spec: String,
    pub training: TrainingMetadata,
    pub recoder: Recoder,
}

impl Model {
    /// Assemble and validate a model from its parts.
    pub fn new(network: Network, unicharset: Unicharset, recoder: Recoder) -> Result<Self> {
        let model = Self {
            network_spec: network.spec(),
            training: TrainingMetadata::new(recoder.null_label()),
            network,
            unicharset,
            recoder,
        };
        model.validate()?;
        Ok(model)
    }

    /// Randomly initialized model for `unicharset`.
    ///
    /// The output layer of `spec` must produce one score per recoder label
    /// (character codes plus the null label).
    pub fn from_spec(spec: &str, unicharset: Unicharset, seed: u64) -> Result<Self> {
        let recoder = Recoder::for_charset_size(unicharset.len(), PASS_THROUGH_LIMIT)?;
        let network = Network::from_spec(spec, seed)?;
        let mut model = Self::new(network, unicharset, recoder)?;
        model.network_spec = spec.trim().to_string();
        Ok(model)
    }

    /// Consistency checks run on every load.
    pub fn validate(&self) -> Result<()> {
        self.recoder.check_space()?;
        if self.recoder.size() != self.unicharset.len() {
            return Err(LinescribeError::model(format!(
                "recoder covers {} characters but the character set has {}",
                self.recoder.size(),
                self.unicharset.len()
            )));
        }
        self.network
            .validate()
            .map_err(|e| LinescribeError::model_with_source("network topology is inconsistent", e))?;
        if self.network.num_outputs() != self.recoder.num_labels() {
            return Err(LinescribeError::model(format!(
                "network produces {} scores but the recoder needs {}",
                self.network.num_outputs(),
                self.recoder.num_labels()
            )));
        }
        if self.training.null_char != self.recoder.null_label() {
            return Err(LinescribeError::model(format!(
                "null label {} does not match the recoder's {}",
                self.training.null_char,
                self.recoder.null_label()
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = rmp_serde::to_vec_named(self)?;
        let mut bytes = Vec::with_capacity(body.len() + 8);
        bytes.extend_from_slice(MODEL_MAGIC);
        bytes.extend_from_slice(&MODEL_VERSION.to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 || &bytes[..4] != MODEL_MAGIC {
            return Err(LinescribeError::model("not a linescribe model (bad magic bytes)"));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..8]);
        let version = u32::from_le_bytes(version);
        if version != MODEL_VERSION {
            return Err(LinescribeError::model(format!(
                "unsupported model format version {version} (expected {MODEL_VERSION})"
            )));
        }
        let model: Model = rmp_serde::from_slice(&bytes[8..])
            .map_err(|e| LinescribeError::model_with_source("failed to decode model", e))?;
        model.validate()?;
        Ok(model)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        std::fs::write(path, &bytes)?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "saved model");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let model = Self::from_bytes(&bytes)?;
        tracing::debug!(
            path = %path.display(),
            spec = %model.network_spec,
            characters = model.unicharset.len(),
            weights = model.network.num_weights(),
            "loaded model"
        );
        Ok(model)
    }
}
