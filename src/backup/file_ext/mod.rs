use std::sync::Arc;

/// Provides the file extension (without leading dot) a stream layer adds to the object name
pub trait FileExtProvider {
    fn file_ext(&self) -> Option<Arc<str>>;
}
