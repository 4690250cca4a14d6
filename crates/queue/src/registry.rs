//! Factories that rebuild persisted jobs.

use std::sync::Arc;

use courier_common::{AppError, AppResult};

use crate::job::Job;
use crate::storage::JobRecord;

/// Rebuilds a job of one type from its persisted payload.
///
/// Factories capture the collaborators their jobs need, so a resumed job is
/// indistinguishable from a freshly constructed one.
pub trait JobFactory: Send + Sync {
    fn factory_key(&self) -> &'static str;

    fn create(&self, payload: &[u8]) -> AppResult<Arc<dyn Job>>;
}

/// Known job types, in the order pending jobs are resumed.
#[derive(Default, Clone)]
pub struct JobRegistry {
    factories: Vec<Arc<dyn JobFactory>>,
}

impl JobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A later registration for the same key replaces
    /// the earlier one but keeps its position.
    #[must_use]
    pub fn with<F: JobFactory + 'static>(mut self, factory: F) -> Self {
        self.register(Arc::new(factory));
        self
    }

    pub fn register(&mut self, factory: Arc<dyn JobFactory>) {
        match self
            .factories
            .iter_mut()
            .find(|f| f.factory_key() == factory.factory_key())
        {
            Some(slot) => *slot = factory,
            None => self.factories.push(factory),
        }
    }

    /// Registered factory keys in registration order.
    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.iter().map(|f| f.factory_key())
    }

    #[must_use]
    pub fn contains(&self, factory_key: &str) -> bool {
        self.factories.iter().any(|f| f.factory_key() == factory_key)
    }

    /// Rebuild the job stored in `record`.
    pub fn decode(&self, record: &JobRecord) -> AppResult<Arc<dyn Job>> {
        let factory = self
            .factories
            .iter()
            .find(|f| f.factory_key() == record.factory_key)
            .ok_or_else(|| AppError::UnknownJobType(record.factory_key.clone()))?;
        factory.create(&record.payload)
    }
}
