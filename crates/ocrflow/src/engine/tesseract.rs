use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::postprocess::postprocess;
use super::{JobContext, OcrEngine};
use crate::document::{PageKind, PageSource};
use crate::error::EngineError;
use crate::model::{OcrOptions, Recognition};

/// Image recognition through libtesseract.
#[derive(Clone)]
pub struct TesseractEngine {
    inner: Arc<TesseractInner>,
}

struct TesseractInner {
    languages: Vec<String>,
}

impl TesseractEngine {
    pub fn new(languages: &[String]) -> Self {
        let languages = if languages.is_empty() {
            vec!["eng".to_string()]
        } else {
            languages.to_vec()
        };
        Self {
            inner: Arc::new(TesseractInner { languages }),
        }
    }

    /// Tesseract language argument for a request: the requested language when it
    /// maps to an installed model, else every configured model.
    fn language_arg(&self, requested: &str) -> String {
        match tesseract_code(requested) {
            Some(code) if self.inner.languages.iter().any(|l| l == code) => code.to_string(),
            _ => self.inner.languages.join("+"),
        }
    }
}

/// Maps a request language to a Tesseract model name.
fn tesseract_code(language: &str) -> Option<&'static str> {
    match language.to_ascii_lowercase().as_str() {
        "zh" | "zh-cn" | "zh-hans" | "chi_sim" => Some("chi_sim"),
        "zh-tw" | "zh-hant" | "chi_tra" => Some("chi_tra"),
        "en" | "eng" => Some("eng"),
        "de" | "deu" => Some("deu"),
        "fr" | "fra" => Some("fra"),
        "ja" | "jpn" => Some("jpn"),
        _ => None,
    }
}

fn run_tesseract(
    bytes: &[u8],
    languages: &str,
    preprocess: bool,
) -> Result<(String, f64), EngineError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| EngineError::Failed(format!("Failed to load image: {}", e)))?;
    let img = if preprocess { img.grayscale() } else { img };

    let mut png_data = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_data), image::ImageFormat::Png)
        .map_err(|e| EngineError::Failed(format!("Failed to convert image: {}", e)))?;

    let mut lt = leptess::LepTess::new(None, languages)
        .map_err(|e| EngineError::Failed(format!("Failed to initialize Tesseract: {}", e)))?;
    lt.set_image_from_mem(&png_data)
        .map_err(|e| EngineError::Failed(format!("Failed to set image for OCR: {}", e)))?;

    let text = lt
        .get_utf8_text()
        .map_err(|e| EngineError::Failed(format!("OCR failed: {}", e)))?;
    let confidence = lt.mean_text_conf().clamp(0, 100) as f64;
    Ok((text, confidence))
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn supported_languages(&self) -> Vec<String> {
        self.inner.languages.clone()
    }

    async fn recognize(
        &self,
        page: &PageSource,
        options: &OcrOptions,
        ctx: &JobContext,
    ) -> Result<Recognition, EngineError> {
        if page.kind() != PageKind::Image {
            return Err(EngineError::Unsupported(page.content_type.clone()));
        }
        ctx.check()?;
        ctx.report_progress(10);

        let started = Instant::now();
        let bytes = page.bytes.clone();
        let languages = self.language_arg(&options.language);
        let preprocess = options.preprocess;

        // libtesseract blocks; keep it off the worker's reactor. A timed-out
        // call finishes in the background and its output is dropped.
        let (text, confidence) = tokio::task::spawn_blocking(move || {
            let _span = tracing::info_span!("engine.tesseract").entered();
            run_tesseract(&bytes, &languages, preprocess)
        })
        .await
        .map_err(|e| EngineError::Failed(format!("OCR thread panicked: {}", e)))??;

        ctx.check()?;
        ctx.report_progress(90);

        Ok(Recognition {
            text: postprocess(&text),
            confidence,
            engine: self.name().to_string(),
            language: options.language.clone(),
            processing_ms: started.elapsed().as_millis() as u64,
        })
    }
}
