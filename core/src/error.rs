//! Error taxonomy surfaced by the loader, the validator and the decoders.

use thiserror::Error;

/// Failure of the network load backing an image request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("transport failure for {uri}: {reason}")]
    Transport { uri: String, reason: String },
    #[error("server responded with HTTP {status} for {uri}")]
    HttpStatus { uri: String, status: u16 },
    #[error("load of {uri} blocked by content policy")]
    Blocked { uri: String },
    #[error("load aborted")]
    Aborted,
    #[error("unsupported content type {content_type:?}")]
    UnsupportedType { content_type: Option<String> },
}

/// Failure while decoding image data that was successfully loaded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("image data is corrupt or truncated: {0}")]
    Corrupt(String),
    #[error("no decoder available for this image format")]
    UnsupportedFormat,
    #[error("could not read image metadata: {0}")]
    Metadata(String),
    #[error("failed to scale decoded image: {0}")]
    Resize(String),
    #[error("image has no source data")]
    EmptySource,
}

/// Why a cached entry could not be reused for a new load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("referrer policy differs from the cached request")]
    ReferrerPolicyMismatch,
    #[error("CORS mode differs from the cached request")]
    CorsMismatch,
    #[error("triggering principal differs from the cached request")]
    PrincipalMismatch,
    #[error("application cache association differs from the cached request")]
    AppCacheMismatch,
    #[error("content policy rejected the cached final location {uri}")]
    ContentPolicy { uri: String },
    #[error("cache bypass requested")]
    BypassCache,
    #[error("conditional load failed: {0}")]
    ConditionalLoad(#[from] LoadError),
}

/// Non-fatal refusal to cache a request; the load continues uncached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheInsertError {
    #[error("entry of {size} bytes exceeds the cache budget of {max} bytes")]
    TooLarge { size: u64, max: u64 },
}

/// Error state of an image as reported to observers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("unknown image proxy")]
    UnknownProxy,
}

impl ImageError {
    pub fn is_decode_error(&self) -> bool {
        matches!(self, ImageError::Decode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_and_decode_errors_stay_distinct() {
        let load: ImageError = LoadError::HttpStatus { uri: "http://a/".into(), status: 404 }.into();
        let decode: ImageError = DecodeError::Corrupt("bad huffman table".into()).into();
        assert!(!load.is_decode_error());
        assert!(decode.is_decode_error());
        assert!(load.to_string().contains("404"));
    }

    #[test]
    fn conditional_load_failure_wraps_transport_error() {
        let err: ValidationError = LoadError::Aborted.into();
        assert_eq!(err, ValidationError::ConditionalLoad(LoadError::Aborted));
    }
}
