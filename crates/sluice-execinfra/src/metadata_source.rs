use sluice_core::{MetadataError, ProducerMetadata};

/// A component holding metadata that must be collected before its flow
/// finishes, such as a batch inbox or an operator that buffered errors.
#[async_trait::async_trait]
pub trait MetadataSource: Send {
    /// Returns all remaining metadata. Called once, after the component has
    /// produced its last batch or was told to stop.
    async fn drain_meta(&mut self) -> Vec<ProducerMetadata>;

    /// The stream this source's metadata was bound for failed with `error`.
    /// Called before the final `drain_meta`, whose metadata is then dropped.
    fn post_error(&mut self, _error: &MetadataError) {}
}
