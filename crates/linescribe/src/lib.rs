//! linescribe - LSTM text-line recognition engine
//!
//! linescribe turns a prepared image of one text line into recognized words
//! with confidences, boxes and alternative readings. It bundles a small
//! neural-network runtime (fully-connected, LSTM, convolution and structural
//! layers, float and 8-bit weights, timestep-parallel evaluation), a recoder
//! that maps large character sets onto short label codes, and a CTC beam-search
//! decoder that can be steered by a word dictionary.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use linescribe::{BoundingBox, LstmRecognizer, RecognizerConfig};
//!
//! # fn main() -> linescribe::Result<()> {
//! let recognizer = LstmRecognizer::load("eng.lscm", RecognizerConfig::default())?;
//! let line = image::open("line.png")?.to_luma8();
//! let words = recognizer.recognize_line(&line, BoundingBox::from_size(line.width(), line.height()), None);
//! for word in words {
//!     println!("{} ({:.0})", word.text, word.confidence);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **Dot product** (`dotproduct`): portable and SIMD kernels, selected once per process
//! - **Network** (`network`): layer tree, activations, spec-string builder
//! - **Recoder** (`recoder`): character set and character ↔ label-code tables
//! - **Beam search** (`beam`): CTC decoding with optional dictionary guidance
//! - **Recognizer** (`recognizer`): model blobs, line preparation, inversion retry,
//!   word assembly and CTC training

#![deny(unsafe_code)]

pub mod beam;
pub mod config;
pub mod dotproduct;
pub mod error;
pub mod network;
pub mod recoder;
pub mod recognizer;
pub mod types;

pub use beam::{BeamConfig, DecodedPath, Dictionary, RecodeBeamSearch, WordListDictionary};
pub use config::{ChoiceMode, RecognizerConfig};
pub use error::{LinescribeError, Result};
pub use network::{Network, NetworkIO, NetworkScratch};
pub use recoder::{Recoder, Unicharset};
pub use recognizer::{LineRecognition, LstmRecognizer, Model};
pub use types::{BoundingBox, SymbolChoice, SymbolResult, WordResult};
