//! Per-process session state.

use crate::model::RunRecord;
use crate::render::RenderedImage;

/// Holds the most recent rendered image. Each successful render replaces it.
#[derive(Debug, Default)]
pub struct Session {
    current: Option<RenderedImage>,
    last_record: Option<RunRecord>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_image(&self) -> Option<&RenderedImage> {
        self.current.as_ref()
    }

    pub fn set_image(&mut self, image: RenderedImage) {
        self.current = Some(image);
    }

    pub fn last_record(&self) -> Option<&RunRecord> {
        self.last_record.as_ref()
    }

    pub fn set_last_record(&mut self, record: RunRecord) {
        self.last_record = Some(record);
    }
}
