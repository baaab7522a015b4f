// テスト用のスクリプト化された分類器。

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::classifier::{Classifier, Verdict};

pub(crate) struct ScriptedClassifier {
    verdicts: HashMap<String, Verdict>,
    fallback: Verdict,
    panic_on: Option<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedClassifier {
    pub(crate) fn new(fallback: Verdict) -> Self {
        Self {
            verdicts: HashMap::new(),
            fallback,
            panic_on: None,
            delay: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with(mut self, text: &str, verdict: Verdict) -> Self {
        self.verdicts.insert(text.to_string(), verdict);
        self
    }

    pub(crate) fn panicking_on(mut self, text: &str) -> Self {
        self.panic_on = Some(text.to_string());
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls_for(&self, text: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|call| call.as_str() == text)
            .count()
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, text: &str) -> Verdict {
        if self.panic_on.as_deref() == Some(text) {
            panic!("scripted classifier panic for {text:?}");
        }
        self.calls
            .lock()
            .expect("calls lock")
            .push(text.to_string());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.verdicts.get(text).copied().unwrap_or(self.fallback)
    }
}
