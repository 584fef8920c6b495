use std::sync::{Arc, LazyLock};
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html};

use super::postprocess::postprocess;
use super::{JobContext, OcrEngine};
use crate::document::{PageKind, PageSource};
use crate::error::EngineError;
use crate::model::{OcrOptions, Recognition};

/// Confidence reported for text pulled out of markup.
pub const MARKUP_CONFIDENCE: f64 = 95.2;
/// Confidence reported for pages that already are plain text.
pub const PLAIN_TEXT_CONFIDENCE: f64 = 99.0;

/// Elements whose content is never page text.
const SKIPPED_ELEMENTS: &[&str] = &["head", "script", "style", "noscript", "template"];

/// Elements that start and end a line of text.
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "blockquote", "dd", "div", "dl", "dt", "figcaption",
    "figure", "footer", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main",
    "nav", "ol", "p", "pre", "section", "table", "tr", "ul",
];

static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Text extraction for pages that carry their text already: HTML/XML markup
/// and plain text. Image pages go to an optional delegate engine.
pub struct MarkupEngine {
    images: Option<Arc<dyn OcrEngine>>,
}

impl MarkupEngine {
    pub fn new() -> Self {
        Self { images: None }
    }

    /// Routes image pages to `engine` instead of rejecting them.
    pub fn with_image_engine(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.images = Some(engine);
        self
    }
}

impl Default for MarkupEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrEngine for MarkupEngine {
    fn name(&self) -> &str {
        "markup"
    }

    fn supported_languages(&self) -> Vec<String> {
        // Extraction is language agnostic.
        vec!["*".to_string()]
    }

    async fn recognize(
        &self,
        page: &PageSource,
        options: &OcrOptions,
        ctx: &JobContext,
    ) -> Result<Recognition, EngineError> {
        ctx.check()?;
        let started = Instant::now();

        let (text, confidence) = match page.kind() {
            PageKind::Markup => {
                let raw = String::from_utf8_lossy(&page.bytes);
                ctx.report_progress(30);
                (extract_markup_text(&raw), MARKUP_CONFIDENCE)
            }
            PageKind::PlainText => {
                ctx.report_progress(30);
                (
                    String::from_utf8_lossy(&page.bytes).into_owned(),
                    PLAIN_TEXT_CONFIDENCE,
                )
            }
            PageKind::Image => {
                return match self.images {
                    Some(ref engine) => engine.recognize(page, options, ctx).await,
                    None => Err(EngineError::Unsupported(format!(
                        "image page ({}) requires an image OCR engine",
                        page.content_type
                    ))),
                };
            }
            PageKind::Other => {
                return Err(EngineError::Unsupported(page.content_type.clone()));
            }
        };

        ctx.check()?;
        let text = postprocess(&text);
        if text.is_empty() {
            return Err(EngineError::Failed(format!(
                "no text found on page {} of document '{}'",
                page.page_number, page.document_id
            )));
        }
        ctx.report_progress(90);

        Ok(Recognition {
            text,
            confidence,
            engine: self.name().to_string(),
            language: options.language.clone(),
            processing_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Strips markup down to readable text, one line per block element.
pub fn extract_markup_text(markup: &str) -> String {
    let document = Html::parse_document(markup);
    let mut raw = String::new();
    collect_text(document.root_element(), &mut raw);

    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(&RE_WHITESPACE.replace_all(text, " "));
            continue;
        }
        let Some(child) = ElementRef::wrap(child) else {
            continue;
        };

        let name = child.value().name();
        if SKIPPED_ELEMENTS.contains(&name) {
            continue;
        }
        if name == "br" {
            out.push('\n');
            continue;
        }

        let block = BLOCK_ELEMENTS.contains(&name);
        if block {
            out.push('\n');
        }
        collect_text(child, out);
        match name {
            _ if block => out.push('\n'),
            "td" | "th" => out.push(' '),
            _ => {}
        }
    }
}
