use std::error::Error as StdError;

/// Type-erased error returned by [ObjectStore](crate::s3::ObjectStore) implementations.
pub type BoxError = Box<dyn StdError + Send + Sync>;
