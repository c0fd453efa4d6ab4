//! linescribe command-line interface
//!
//! Recognize line images with a trained model, create fresh models from a
//! network description, run training steps and inspect model files.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use linescribe::dotproduct;
use linescribe::{BoundingBox, Dictionary, LstmRecognizer, Model, RecognizerConfig, Unicharset, WordListDictionary};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "linescribe")]
#[command(version, about = "LSTM text-line recognizer", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize a single text-line image
    Recognize {
        /// Model file
        #[arg(short, long)]
        model: PathBuf,

        /// Line image (any format the image crate reads)
        #[arg(short, long)]
        image: PathBuf,

        /// Word list guiding the decoder, one word per line
        #[arg(short, long)]
        words: Option<PathBuf>,

        /// Configuration file (TOML, YAML or JSON); defaults to the nearest linescribe.toml
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print words with boxes and confidences as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a randomly initialized model
    Init {
        /// Network description, e.g. "[I36 Lbx96 O1c111]"
        #[arg(short, long)]
        spec: String,

        /// Character-set file, one entry per line
        #[arg(short = 'u', long)]
        charset: PathBuf,

        /// Output model file
        #[arg(short, long)]
        out: PathBuf,

        /// Seed for the initial weights
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Train a model on one line image and its transcription
    Train {
        /// Model file, updated in place unless --out is given
        #[arg(short, long)]
        model: PathBuf,

        /// Line image
        #[arg(short, long)]
        image: PathBuf,

        /// Transcription of the line
        #[arg(short, long)]
        text: String,

        /// Training steps on this line
        #[arg(short = 'n', long, default_value = "1")]
        iterations: usize,

        /// Where to write the updated model
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Describe a model file
    Inspect {
        /// Model file
        #[arg(short, long)]
        model: PathBuf,
    },

    /// List the dot-product back ends usable on this machine
    Backends,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<RecognizerConfig> {
    match path {
        Some(path) => {
            RecognizerConfig::from_file(path).with_context(|| format!("loading config {}", path.display()))
        }
        None => Ok(RecognizerConfig::discover()?.unwrap_or_default()),
    }
}

fn open_line(path: &Path) -> Result<image::GrayImage> {
    let image = image::open(path).with_context(|| format!("opening image {}", path.display()))?;
    Ok(image.to_luma8())
}

fn recognize(model: &Path, image: &Path, words: Option<&Path>, config: Option<&Path>, json: bool) -> Result<()> {
    let config = load_config(config)?;
    let recognizer = LstmRecognizer::load(model, config).with_context(|| format!("loading model {}", model.display()))?;
    let dictionary = words.map(|path| WordListDictionary::load(path)).transpose()?;
    let line = open_line(image)?;
    let line_box = BoundingBox::from_size(line.width(), line.height());

    let dictionary = dictionary.as_ref().map(|d| d as &dyn Dictionary);
    let result = recognizer.recognize_line_detailed(&line, line_box, dictionary);
    if json {
        println!("{}", serde_json::to_string_pretty(&result.words)?);
    } else {
        println!("{}", result.text());
        for word in result.words.iter().filter(|w| !w.fake) {
            tracing::info!(
                text = %word.text,
                confidence = word.confidence,
                left = word.bbox.left,
                right = word.bbox.right,
                in_dictionary = word.in_dictionary,
                "word"
            );
        }
    }
    Ok(())
}

fn init(spec: &str, charset: &Path, out: &Path, seed: u64) -> Result<()> {
    let contents =
        std::fs::read_to_string(charset).with_context(|| format!("reading character set {}", charset.display()))?;
    let unicharset = Unicharset::parse(&contents);
    let model = Model::from_spec(spec, unicharset, seed)?;
    model.save(out)?;
    println!(
        "{}: {} characters, {} labels, {} weights",
        out.display(),
        model.unicharset.len(),
        model.recoder.num_labels(),
        model.network.num_weights()
    );
    Ok(())
}

fn train(model_path: &Path, image: &Path, text: &str, iterations: usize, out: Option<&Path>) -> Result<()> {
    if iterations == 0 {
        bail!("--iterations must be at least 1");
    }
    let mut recognizer = LstmRecognizer::load(model_path, load_config(None)?)?;
    let line = open_line(image)?;
    for _ in 0..iterations {
        let outcome = recognizer.train_line(&line, text)?;
        if outcome.skipped {
            bail!("line image is too short for {:?}", text);
        }
        println!(
            "iteration {:>6}  loss {:>10.4}  read {:?}",
            outcome.iterations, outcome.loss, outcome.decoded
        );
    }
    recognizer.save(out.unwrap_or(model_path))?;
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let model = Model::load(path)?;
    let training = &model.training;
    println!("network:      {}", model.network_spec);
    println!("inputs:       {}", model.network.num_inputs());
    println!("x scale:      {}", model.network.x_scale());
    println!("weights:      {}", model.network.num_weights());
    println!("quantized:    {}", model.network.is_int_mode());
    println!("loss:         {:?}", model.network.loss_type());
    println!("characters:   {}", model.unicharset.len());
    println!(
        "recoder:      {:?}, {} labels, codes up to {} long",
        model.recoder.mode(),
        model.recoder.num_labels(),
        model.recoder.max_code_len()
    );
    println!("null label:   {}", training.null_char);
    println!(
        "training:     {} updates over {} samples, learning rate {}, momentum {}{}",
        training.iterations,
        training.sample_iteration,
        training.learning_rate,
        training.momentum,
        if training.use_adam { ", adam" } else { "" }
    );
    Ok(())
}

fn backends() {
    let selected = dotproduct::init();
    for backend in dotproduct::available_backends() {
        let marker = if backend == selected { "*" } else { " " };
        println!("{marker} {backend}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Recognize {
            model,
            image,
            words,
            config,
            json,
        } => recognize(&model, &image, words.as_deref(), config.as_deref(), json),
        Commands::Init {
            spec,
            charset,
            out,
            seed,
        } => init(&spec, &charset, &out, seed),
        Commands::Train {
            model,
            image,
            text,
            iterations,
            out,
        } => train(&model, &image, &text, iterations, out.as_deref()),
        Commands::Inspect { model } => inspect(&model),
        Commands::Backends => {
            backends();
            Ok(())
        }
    }
}
