//! OCR engine double with scripted per-page behavior.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use ocrflow::document::PageSource;
use ocrflow::engine::{JobContext, OcrEngine};
use ocrflow::error::EngineError;
use ocrflow::model::{OcrOptions, Recognition};

/// What the engine does for one `(document, page)`.
#[derive(Debug, Clone)]
pub enum PageScript {
    /// Returns the text with the given confidence.
    Text(String, f64),
    /// Fails with the message.
    Fail(String),
    /// Sleeps, then returns the text.
    Slow(Duration, String),
}

/// Engine whose answer per page is scripted. Unscripted pages echo their
/// source bytes back as text.
#[derive(Default)]
pub struct ScriptedEngine {
    scripts: Mutex<HashMap<(String, u32), PageScript>>,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, document_id: &str, page: u32, script: PageScript) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert((document_id.to_string(), page), script);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supported_languages(&self) -> Vec<String> {
        vec!["zh".to_string(), "en".to_string()]
    }

    async fn recognize(
        &self,
        page: &PageSource,
        options: &OcrOptions,
        ctx: &JobContext,
    ) -> Result<Recognition, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&(page.document_id.clone(), page.page_number))
            .cloned();

        let (text, confidence) = match script {
            Some(PageScript::Text(text, confidence)) => (text, confidence),
            Some(PageScript::Fail(message)) => return Err(EngineError::Failed(message)),
            Some(PageScript::Slow(delay, text)) => {
                tokio::time::sleep(delay).await;
                ctx.check()?;
                (text, 90.0)
            }
            None => (String::from_utf8_lossy(&page.bytes).into_owned(), 99.0),
        };

        ctx.report_progress(80);
        Ok(Recognition {
            text,
            confidence,
            engine: self.name().to_string(),
            language: options.language.clone(),
            processing_ms: 1,
        })
    }
}
