//! Configuration loading and management.
//!
//! [`RecognizerConfig`] gathers every knob of the line recognizer. It can be
//! built programmatically, loaded from TOML, YAML or JSON files, or discovered
//! by walking up from the current directory to the nearest `linescribe.toml`.

use crate::beam::BeamConfig;
use crate::dotproduct;
use crate::{LinescribeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What alternative-choice information to attach to recognized words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceMode {
    /// Best path only.
    #[default]
    Off,
    /// Top labels at every timestep of each character.
    Timesteps,
    /// Ranked alternative characters per position, from repeated decodes.
    Characters,
}

/// Line recognizer configuration.
///
/// # Example
///
/// ```rust
/// use linescribe::config::RecognizerConfig;
///
/// let config = RecognizerConfig::default();
/// assert_eq!(config.beam_width, 16);
/// assert!(config.validate().is_ok());
///
/// // let config = RecognizerConfig::from_toml_file("linescribe.toml")?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizerConfig {
    /// Dot-product back end: auto, generic, native, sse, avx, avx2, fma
    #[serde(default = "default_dot_product")]
    pub dot_product: String,

    /// Live hypotheses kept per timestep
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,

    /// Labels considered per timestep
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Score factor for labels outside dictionary words
    #[serde(default = "default_dict_ratio")]
    pub dict_ratio: f32,

    /// Score offset for labels inside dictionary words
    #[serde(default = "default_cert_offset")]
    pub cert_offset: f32,

    #[serde(default)]
    pub choice_mode: ChoiceMode,

    /// Re-decodes used to collect alternative characters
    #[serde(default = "default_choice_iterations")]
    pub choice_iterations: usize,

    /// Mean best-label probability below which the inverted image is tried
    #[serde(default = "default_invert_threshold")]
    pub invert_threshold: f32,

    /// Re-run the original polarity when inversion lost
    #[serde(default = "default_true")]
    pub re_invert: bool,

    /// Stretch certainties onto the legacy confidence scale
    #[serde(default)]
    pub rescale_certainty: bool,

    /// Evaluator worker threads (None = num_cpus)
    #[serde(default)]
    pub threads: Option<usize>,

    /// Widest accepted line image in pixels after scaling (None = unlimited)
    #[serde(default)]
    pub max_line_width: Option<usize>,

    /// 0 = quiet; 1 logs per-line statistics; 2 also dumps decoded paths
    #[serde(default)]
    pub debug_level: u8,
}

fn default_dot_product() -> String {
    "auto".to_string()
}

fn default_beam_width() -> usize {
    16
}

fn default_top_n() -> usize {
    6
}

fn default_dict_ratio() -> f32 {
    2.25
}

fn default_cert_offset() -> f32 {
    -0.085
}

fn default_choice_iterations() -> usize {
    5
}

fn default_invert_threshold() -> f32 {
    0.7
}

fn default_true() -> bool {
    true
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            dot_product: default_dot_product(),
            beam_width: default_beam_width(),
            top_n: default_top_n(),
            dict_ratio: default_dict_ratio(),
            cert_offset: default_cert_offset(),
            choice_mode: ChoiceMode::default(),
            choice_iterations: default_choice_iterations(),
            invert_threshold: default_invert_threshold(),
            re_invert: true,
            rescale_certainty: false,
            threads: None,
            max_line_width: None,
            debug_level: 0,
        }
    }
}

impl RecognizerConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| LinescribeError::validation(format!("Invalid TOML in {}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        let config: Self = serde_yaml_ng::from_str(&content)
            .map_err(|e| LinescribeError::validation(format!("Invalid YAML in {}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| LinescribeError::validation(format!("Invalid JSON in {}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load by file extension (`.toml`, `.yaml`/`.yml`, `.json`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
            Some("toml") => Self::from_toml_file(path),
            Some("yaml") | Some("yml") => Self::from_yaml_file(path),
            Some("json") => Self::from_json_file(path),
            _ => Err(LinescribeError::validation(format!(
                "Unsupported config file extension: {}",
                path.display()
            ))),
        }
    }

    /// Discover configuration file in parent directories.
    ///
    /// Searches for `linescribe.toml` in the current directory and its parents.
    ///
    /// # Returns
    ///
    /// - `Some(config)` if found
    /// - `None` if no config file found
    pub fn discover() -> Result<Option<Self>> {
        let mut current = std::env::current_dir().map_err(LinescribeError::Io)?;

        loop {
            let candidate = current.join("linescribe.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "discovered configuration");
                return Ok(Some(Self::from_toml_file(candidate)?));
            }

            if let Some(parent) = current.parent() {
                current = parent.to_path_buf();
            } else {
                break;
            }
        }

        Ok(None)
    }

    /// Reject values the recognizer cannot run with.
    ///
    /// An unknown `dot_product` name is not an error here; it is reported as a
    /// warning when the back end is applied.
    pub fn validate(&self) -> Result<()> {
        if self.beam_width == 0 {
            return Err(LinescribeError::validation("beam_width must be at least 1"));
        }
        if self.top_n == 0 {
            return Err(LinescribeError::validation("top_n must be at least 1"));
        }
        if !self.dict_ratio.is_finite() || self.dict_ratio <= 0.0 {
            return Err(LinescribeError::validation(format!(
                "dict_ratio must be a positive finite number, got {}",
                self.dict_ratio
            )));
        }
        if !self.cert_offset.is_finite() {
            return Err(LinescribeError::validation("cert_offset must be finite"));
        }
        if !self.invert_threshold.is_finite() || !(0.0..=1.0).contains(&self.invert_threshold) {
            return Err(LinescribeError::validation(format!(
                "invert_threshold must be within [0, 1], got {}",
                self.invert_threshold
            )));
        }
        if self.threads == Some(0) {
            return Err(LinescribeError::validation("threads must be at least 1 when set"));
        }
        if self.max_line_width == Some(0) {
            return Err(LinescribeError::validation("max_line_width must be at least 1 when set"));
        }
        Ok(())
    }

    /// Decoder parameters derived from this configuration.
    pub fn beam_config(&self) -> BeamConfig {
        BeamConfig {
            beam_width: self.beam_width,
            top_n: self.top_n,
            dict_ratio: self.dict_ratio,
            cert_offset: self.cert_offset,
            ..BeamConfig::default()
        }
    }

    /// Publish the configured dot-product back end process-wide.
    pub fn apply_dot_product(&self) -> dotproduct::DotProductBackend {
        dotproduct::select(&self.dot_product)
    }
}

fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        LinescribeError::validation_with_source(format!("Failed to read config file {}", path.display()), e)
    })
}
