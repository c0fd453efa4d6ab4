//! End-to-end line recognition with hand-built models.

mod helpers;

use helpers::{marked_line, polarity_model, striped_line, test_config};
use image::GrayImage;
use linescribe::network::{FullyConnected, Input, Network, Nonlinearity, Series, WeightMatrix};
use linescribe::{
    BoundingBox, ChoiceMode, LstmRecognizer, Model, Recoder, RecognizerConfig, Unicharset, WordListDictionary,
};
use ndarray::Array2;

/// Reads every marked column of a 4-row [`marked_line`] as 'a'.
///
/// Marked columns normalize to `[-1, 1, -1, 1]`, plain ones to `[1, 1, 1, 1]`.
fn marks_model() -> Model {
    let unicharset = Unicharset::from_text("ab");
    let recoder = Recoder::pass_through(unicharset.len());
    let a = unicharset.id_of("a").expect("a is in the set");
    let mut weights = Array2::<f32>::zeros((recoder.num_labels(), 5));
    weights[[a, 0]] = -3.0;
    weights[[a, 2]] = -3.0;
    for y in 0..4 {
        weights[[recoder.null_label(), y]] = 1.0;
    }
    let output = FullyConnected::with_weights(Nonlinearity::Softmax, WeightMatrix::from_array(weights));
    let network = Network::Series(Series::new(vec![
        Network::Input(Input::new(4)),
        Network::FullyConnected(output),
    ]));
    Model::new(network, unicharset, recoder).expect("valid marks model")
}

fn inverted(mut image: GrayImage) -> GrayImage {
    image::imageops::invert(&mut image);
    image
}

#[test]
fn test_blank_line_yields_placeholder() {
    let recognizer = LstmRecognizer::new(marks_model(), test_config()).unwrap();
    let line_box = BoundingBox::new(10, 20, 50, 24);
    let blank = GrayImage::from_pixel(40, 4, image::Luma([255]));
    let words = recognizer.recognize_line(&blank, line_box, None);
    assert_eq!(words.len(), 1);
    assert!(words[0].fake);
    assert!(words[0].text.is_empty());
    assert_eq!(words[0].bbox, line_box);
}

#[test]
fn test_reads_marks_with_boxes() {
    let recognizer = LstmRecognizer::new(marks_model(), test_config()).unwrap();
    let image = marked_line(20, 4);
    let result = recognizer.recognize_line_detailed(&image, BoundingBox::from_size(20, 4), None);
    assert_eq!(result.text(), "aaaa");
    assert!(!result.inverted);
    assert_eq!(recognizer.forward_calls(), 1);

    let word = &result.words[0];
    assert_eq!(word.symbols.len(), 4);
    assert_eq!((word.bbox.left, word.bbox.right), (0, 16));
    assert_eq!((word.symbols[1].bbox.left, word.symbols[1].bbox.right), (5, 6));
    assert!(word.confidence > 90.0, "confidence {}", word.confidence);
    assert!(!word.in_dictionary);
}

#[test]
fn test_line_box_offsets_and_scaling() {
    let recognizer = LstmRecognizer::new(marks_model(), test_config()).unwrap();
    // Twice the network height: scaled by one half before recognition.
    let image = image::imageops::resize(&marked_line(20, 4), 40, 8, image::imageops::FilterType::Nearest);
    let line_box = BoundingBox::new(100, 50, 140, 58);
    let result = recognizer.recognize_line_detailed(&image, line_box, None);
    assert!((result.scale - 0.5).abs() < 1e-6);
    for word in result.words.iter().filter(|w| !w.fake) {
        assert!(word.bbox.left >= 100 && word.bbox.right <= 140);
        assert_eq!((word.bbox.top, word.bbox.bottom), (50, 58));
    }
}

#[test]
fn test_dictionary_marks_words() {
    let recognizer = LstmRecognizer::new(marks_model(), test_config()).unwrap();
    let dict = WordListDictionary::from_words(["aaaa"]);
    let words = recognizer.recognize_line(&marked_line(20, 4), BoundingBox::from_size(20, 4), Some(&dict));
    assert_eq!(words.len(), 1);
    assert!(words[0].in_dictionary);
    assert!(words[0].accepted);
}

#[test]
fn test_character_choices_attached() {
    let config = RecognizerConfig {
        choice_mode: ChoiceMode::Characters,
        ..test_config()
    };
    let recognizer = LstmRecognizer::new(marks_model(), config).unwrap();
    let words = recognizer.recognize_line(&marked_line(20, 4), BoundingBox::from_size(20, 4), None);
    for symbol in &words[0].symbols {
        assert!(!symbol.choices.is_empty());
        assert_eq!(symbol.choices[0].text, "a");
        assert!(symbol.timesteps.is_empty());
    }
}

#[test]
fn test_timestep_choices_attached() {
    let config = RecognizerConfig {
        choice_mode: ChoiceMode::Timesteps,
        ..test_config()
    };
    let recognizer = LstmRecognizer::new(marks_model(), config).unwrap();
    let words = recognizer.recognize_line(&marked_line(20, 4), BoundingBox::from_size(20, 4), None);
    for symbol in &words[0].symbols {
        assert_eq!(symbol.timesteps.len(), symbol.end_timestep - symbol.start_timestep);
        assert_eq!(symbol.timesteps[0].timestep, symbol.start_timestep);
        assert_eq!(symbol.timesteps[0].choices[0].0, "a");
        assert!(symbol.choices.is_empty());
    }
}

#[test]
fn test_both_polarities_tried_and_better_one_wins() {
    let config = RecognizerConfig {
        invert_threshold: 0.99,
        ..test_config()
    };
    let recognizer = LstmRecognizer::new(polarity_model(4), config).unwrap();
    let line_box = BoundingBox::from_size(20, 4);

    let dark = recognizer.recognize_line_detailed(&inverted(marked_line(20, 4)), line_box, None);
    assert_eq!(recognizer.forward_calls(), 2);
    assert!(dark.inverted);
    assert!(dark.stats.mean > 0.8);

    recognizer.reset_forward_calls();
    let light = recognizer.recognize_line_detailed(&marked_line(20, 4), line_box, None);
    assert!(!light.inverted);
    assert_eq!(light.stats, dark.stats);
}

#[test]
fn test_re_invert_controls_extra_pass() {
    let line_box = BoundingBox::from_size(20, 4);
    for (re_invert, calls) in [(true, 3), (false, 2)] {
        let config = RecognizerConfig {
            invert_threshold: 0.99,
            re_invert,
            ..test_config()
        };
        let recognizer = LstmRecognizer::new(polarity_model(4), config).unwrap();
        let result = recognizer.recognize_line_detailed(&marked_line(20, 4), line_box, None);
        assert_eq!(recognizer.forward_calls(), calls, "re_invert = {re_invert}");
        assert!(!result.inverted);
    }
}

#[test]
fn test_confident_line_skips_inversion() {
    let recognizer = LstmRecognizer::new(polarity_model(4), test_config()).unwrap();
    recognizer.recognize_line(&marked_line(20, 4), BoundingBox::from_size(20, 4), None);
    assert_eq!(recognizer.forward_calls(), 1);
}

#[test]
fn test_thread_count_does_not_change_result() {
    let image = marked_line(120, 4);
    let line_box = BoundingBox::from_size(120, 4);
    let single = LstmRecognizer::new(marks_model(), test_config()).unwrap();
    let pooled = LstmRecognizer::new(
        marks_model(),
        RecognizerConfig {
            threads: Some(4),
            ..test_config()
        },
    )
    .unwrap();
    let a = single.recognize_line_detailed(&image, line_box, None);
    let b = pooled.recognize_line_detailed(&image, line_box, None);
    assert_eq!(a.outputs.float_data(), b.outputs.float_data());
    assert_eq!(a.text(), b.text());
    assert_eq!(a.text().len(), 24);
}

#[test]
fn test_concurrent_recognition_shares_one_recognizer() {
    let recognizer = LstmRecognizer::new(
        marks_model(),
        RecognizerConfig {
            threads: Some(2),
            ..test_config()
        },
    )
    .unwrap();
    let image = marked_line(60, 4);
    let line_box = BoundingBox::from_size(60, 4);
    let expected = recognizer.recognize_line_detailed(&image, line_box, None).text();

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| recognizer.recognize_line_detailed(&image, line_box, None).text()))
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    });
    assert_eq!(recognizer.forward_calls(), 5);
}

#[test]
fn test_save_and_reload_recognizer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("marks.lscm");
    let recognizer = LstmRecognizer::new(marks_model(), test_config()).unwrap();
    recognizer.save(&path).unwrap();

    let reloaded = LstmRecognizer::load(&path, test_config()).unwrap();
    let image = striped_line(30, 4);
    let line_box = BoundingBox::from_size(30, 4);
    let before = recognizer.recognize_line_detailed(&image, line_box, None);
    let after = reloaded.recognize_line_detailed(&image, line_box, None);
    assert_eq!(before.outputs.float_data(), after.outputs.float_data());
    assert_eq!(before.text(), after.text());
}

#[test]
fn test_config_file_drives_recognizer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("linescribe.toml");
    std::fs::write(
        &path,
        r#"
dot_product = "generic"
beam_width = 4
choice_mode = "characters"
threads = 1
"#,
    )
    .unwrap();
    let config = RecognizerConfig::from_toml_file(&path).unwrap();
    assert_eq!(config.choice_mode, ChoiceMode::Characters);

    let recognizer = LstmRecognizer::new(marks_model(), config).unwrap();
    let words = recognizer.recognize_line(&marked_line(20, 4), BoundingBox::from_size(20, 4), None);
    assert_eq!(words[0].text, "aaaa");
    assert!(!words[0].symbols[0].choices.is_empty());
}

#[test]
fn test_invalid_config_rejected() {
    let config = RecognizerConfig {
        beam_width: 0,
        ..test_config()
    };
    assert!(LstmRecognizer::new(marks_model(), config).is_err());
}
