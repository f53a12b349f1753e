use std::sync::Arc;

use async_trait::async_trait;
use pmr_core::{ReferencePrices, ReferenceQuery};
use pmr_storage::PropertyStore;

use crate::AdapterError;

/// Supplies locality average unit prices for market-gap detection.
#[async_trait]
pub trait ReferencePriceSource: Send + Sync {
    async fn reference_prices(&self, query: &ReferenceQuery)
        -> Result<ReferencePrices, AdapterError>;
}

/// Reference prices computed from the active listings already in the store.
#[derive(Clone)]
pub struct StoreReferencePrices {
    store: Arc<dyn PropertyStore>,
}

impl StoreReferencePrices {
    pub fn new(store: Arc<dyn PropertyStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ReferencePriceSource for StoreReferencePrices {
    async fn reference_prices(
        &self,
        query: &ReferenceQuery,
    ) -> Result<ReferencePrices, AdapterError> {
        Ok(self.store.locality_reference(query).await?)
    }
}
