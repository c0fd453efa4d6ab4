mod helpers;

use helpers::{marked_line, polarity_model, spec_model, test_config};
use linescribe::{BoundingBox, LstmRecognizer, RecognizerConfig};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;

/// Records span names and event messages as they are emitted.
#[derive(Clone, Default)]
struct Collector {
    spans: Arc<Mutex<Vec<String>>>,
    messages: Arc<Mutex<Vec<String>>>,
}

struct MessageVisitor<'a>(&'a mut Option<String>);

impl Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            *self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber + for<'a> LookupSpan<'a>> Layer<S> for Collector {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        self.spans.lock().unwrap().push(attrs.metadata().name().to_string());
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut message = None;
        event.record(&mut MessageVisitor(&mut message));
        if let Some(message) = message {
            self.messages.lock().unwrap().push(message);
        }
    }
}

impl Collector {
    fn spans(&self) -> Vec<String> {
        self.spans.lock().unwrap().clone()
    }

    fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[test]
fn test_recognition_instrumentation() {
    let collector = Collector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let config = RecognizerConfig {
        debug_level: 1,
        ..test_config()
    };
    let recognizer = LstmRecognizer::new(polarity_model(4), config).unwrap();
    recognizer.recognize_line(&marked_line(20, 4), BoundingBox::from_size(20, 4), None);

    let spans = collector.spans();
    assert!(
        spans.contains(&"recognize_line_detailed".to_string()),
        "Expected 'recognize_line_detailed' span, got {spans:?}"
    );
    let messages = collector.messages();
    assert!(messages.contains(&"line recognizer ready".to_string()), "{messages:?}");
    assert!(messages.contains(&"forward pass".to_string()), "{messages:?}");
}

#[test]
fn test_forward_pass_silent_without_debug_level() {
    let collector = Collector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let recognizer = LstmRecognizer::new(polarity_model(4), test_config()).unwrap();
    recognizer.recognize_line(&marked_line(20, 4), BoundingBox::from_size(20, 4), None);

    assert!(!collector.messages().contains(&"forward pass".to_string()));
}

#[test]
fn test_skipped_line_is_logged() {
    let collector = Collector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let recognizer = LstmRecognizer::new(polarity_model(4), test_config()).unwrap();
    let blank = image::GrayImage::from_pixel(10, 4, image::Luma([0]));
    recognizer.recognize_line(&blank, BoundingBox::from_size(10, 4), None);

    assert!(collector.messages().contains(&"line skipped".to_string()));
}

#[test]
fn test_model_io_instrumentation() {
    let collector = Collector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.lscm");
    spec_model("[I6 Lfx8 O1c5]", "abc", 5).save(&path).unwrap();
    linescribe::Model::load(&path).unwrap();

    assert!(collector.spans().contains(&"load".to_string()));
    let messages = collector.messages();
    assert!(messages.contains(&"saved model".to_string()), "{messages:?}");
    assert!(messages.contains(&"loaded model".to_string()), "{messages:?}");
}

#[test]
fn test_training_instrumentation() {
    let collector = Collector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let mut recognizer = LstmRecognizer::new(spec_model("[I6 Lfx8 O1c5]", "abc", 5), test_config()).unwrap();
    let image = helpers::striped_line(24, 6);
    recognizer.train_line(&image, "ab").unwrap();

    assert!(collector.spans().contains(&"train_line".to_string()));
}
