//! In-memory translation history.

use async_trait::async_trait;
use parking_lot::RwLock;
use parley_core::Translation;

use crate::usecase::TranslationRepo;

/// Keeps the history in a vector behind a `RwLock`. Nothing survives a
/// restart.
#[derive(Debug, Default)]
pub struct MemoryTranslationRepo {
    history: RwLock<Vec<Translation>>,
}

impl MemoryTranslationRepo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranslationRepo for MemoryTranslationRepo {
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_history(&self) -> anyhow::Result<Vec<Translation>> {
        Ok(self.history.read().clone())
    }

    async fn store(&self, translation: &Translation) -> anyhow::Result<()> {
        self.history.write().push(translation.clone());
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
