use thiserror::Error;

/// Expected outcomes of cache operations. Callers branch on these rather
/// than treating them as failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CacheError {
    #[error("key missed")]
    KeyMissed,

    #[error("key expired")]
    KeyExpired,

    #[error("cache full")]
    Full,
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no upstream returned a positive answer")]
    UpstreamUnreachable,

    #[error("failed to encode query: {0}")]
    Encode(#[from] hickory_proto::error::ProtoError),
}
