//! Shared state handed to every handler.

use std::sync::Arc;

use ocrflow::identity::IdentityProvider;
use ocrflow::runtime::Pipeline;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { pipeline, identity }
    }
}
