//! dvu-dataverse: Dataverse backend for dvuploader
//!
//! Provides the reqwest-based transport client and the `RepositoryAdapter`
//! implementation for the Dataverse native API.

pub mod adapter;
pub mod api;
pub mod client;

pub use adapter::DataverseAdapter;
pub use client::HttpClient;
