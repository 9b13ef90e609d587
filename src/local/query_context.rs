use std::cell::Cell;

/// Counts the work a query execution performed, so the engine can judge
/// whether an index would have paid off.
#[derive(Debug, Default)]
pub struct QueryContext {
    documents_read: Cell<usize>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents_read(&self) -> usize {
        self.documents_read.get()
    }

    pub(crate) fn increment_documents_read(&self, count: usize) {
        self.documents_read.set(self.documents_read.get() + count);
    }
}
