//! Canonical property store + rate-limited HTTP utilities for PMR.

mod fetch;
mod memory;
mod postgres;
mod store;

pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition, TokenBucketConfig,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{PropertyStore, StoreError, StoreResult};

pub const CRATE_NAME: &str = "pmr-storage";
