//! OCR engine contract and the engines shipped with the crate.
//!
//! An engine turns one [`PageSource`] into a [`Recognition`]. It runs on a
//! worker thread under a [`JobContext`] carrying the deadline and the
//! cancellation flag; the worker enforces both, engines only need to call
//! [`JobContext::check`] between expensive steps.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::OcrDefaults;
use crate::document::PageSource;
use crate::error::EngineError;
use crate::model::{OcrOptions, Recognition};

pub mod context;
pub mod markup;
pub mod postprocess;
#[cfg(feature = "tesseract")]
pub mod tesseract;

pub use context::{CancelFlag, JobContext, NoopProgress, ProgressReporter};
pub use markup::MarkupEngine;
#[cfg(feature = "tesseract")]
pub use tesseract::TesseractEngine;

#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Short identifier stored with every result.
    fn name(&self) -> &str;

    fn supported_languages(&self) -> Vec<String>;

    async fn recognize(
        &self,
        page: &PageSource,
        options: &OcrOptions,
        ctx: &JobContext,
    ) -> Result<Recognition, EngineError>;
}

/// Builds the engine used by the server.
///
/// Markup and plain text pages are always handled; image pages are handed
/// to Tesseract when the `tesseract` feature is enabled.
pub fn default_engine(defaults: &OcrDefaults) -> Arc<dyn OcrEngine> {
    #[cfg(feature = "tesseract")]
    {
        let images = Arc::new(TesseractEngine::new(&defaults.tesseract_languages));
        Arc::new(MarkupEngine::new().with_image_engine(images))
    }
    #[cfg(not(feature = "tesseract"))]
    {
        let _ = defaults;
        Arc::new(MarkupEngine::new())
    }
}
