//! Session state shared by every query.

use crate::types::{ExtentType, ExtentTypeSet};

/// Default number of rows produced per page.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Long-lived per-session query settings.
///
/// The visible type set is ANDed into every extent and inode query and into
/// overview rendering; an empty set yields empty results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryContext {
    visible: ExtentTypeSet,
    page_size: usize,
}

impl Default for QueryContext {
    fn default() -> Self {
        Self {
            visible: ExtentTypeSet::all(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visible_types(&self) -> ExtentTypeSet {
        self.visible
    }

    pub fn set_visible_types(&mut self, visible: ExtentTypeSet) {
        self.visible = visible;
    }

    pub fn with_visible_types(mut self, visible: ExtentTypeSet) -> Self {
        self.visible = visible;
        self
    }

    pub fn show_type(&mut self, kind: ExtentType, visible: bool) {
        self.visible.set(kind.bit(), visible);
    }

    pub fn is_visible(&self, kind: ExtentType) -> bool {
        self.visible.has(kind)
    }

    /// True when some types are hidden.
    pub fn restricts_types(&self) -> bool {
        self.visible != ExtentTypeSet::all()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}
