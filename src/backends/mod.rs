//! Object Store Backends
//!
//! Adapters of the `ObjectStore` port. MinIO is the only server the
//! operator deploys, so it is the only backend.

pub mod minio;

pub use minio::{MinioClient, MinioConnector};
