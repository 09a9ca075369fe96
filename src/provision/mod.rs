//! Server executable provisioning.

pub mod fetcher;

pub use fetcher::{ExecutableFetcher, FetchError, HttpFetcher};
