use std::fmt::Debug;
use std::str::FromStr;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Characters left as-is in a copy source key: RFC 3986 unreserved characters
/// and the `/` separating key segments.
const COPY_SOURCE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// The capabilities the copier needs from an object identifier.
///
/// Implementors only have to name the bucket and key. The copy source
/// locator defaults to `{bucket}/{key}` and the size defaults to unknown,
/// in which case the copier asks the store for it.
pub trait ObjectRef: Debug + Send + Sync {
    /// The bucket the object lives in.
    fn bucket(&self) -> &str;

    /// The key of the object within its bucket.
    fn key(&self) -> &str;

    /// The locator passed as the copy source of server-side copy calls,
    /// `{bucket}/{key}` with the key URL-encoded as S3 requires.
    fn copy_source(&self) -> String {
        format!(
            "{}/{}",
            self.bucket(),
            utf8_percent_encode(self.key(), COPY_SOURCE_ENCODE_SET)
        )
    }

    /// The size of the object in bytes, if it is already known.
    fn known_size(&self) -> Option<i64> {
        None
    }

    /// An owned bucket/key pair for this object.
    fn location(&self) -> S3Object {
        S3Object::new(self.bucket(), self.key())
    }
}

/// Errors raised while converting an URL into a [S3Object].
#[derive(Debug, Error)]
pub enum ObjectUrlError {
    #[error(transparent)]
    Parse(#[from] url::ParseError),
    #[error("S3 URL must have a scheme of s3, found {0}")]
    Scheme(String),
    #[error("S3 URL must have host")]
    MissingBucket,
    #[error("S3 URL must have a path")]
    MissingKey,
}

/// A bucket key pair for a S3Object, with conversion from S3 urls.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct S3Object {
    /// The bucket the object is in.
    pub bucket: String,
    /// The key the in the bucket for the object.
    pub key: String,
}

impl S3Object {
    /// Create a new [S3Object] using anything which can be
    /// treated as [&str].  Any leading `/` will be trimmed from
    /// the key.  No validation is done against the bucket or key
    /// to ensure they meet the AWS requirements.
    pub fn new(bucket: impl AsRef<str>, key: impl AsRef<str>) -> Self {
        S3Object {
            bucket: bucket.as_ref().to_owned(),
            key: key.as_ref().trim_start_matches('/').to_owned(),
        }
    }

    /// Attach an already known size to this object, which saves the
    /// copier a `HeadObject` call.
    pub fn with_size(self, size: i64) -> SizedS3Object {
        SizedS3Object { object: self, size }
    }
}

impl ObjectRef for S3Object {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn location(&self) -> S3Object {
        self.clone()
    }
}

/// A [S3Object] whose size in bytes is known up front.
///
/// Sizes of zero or less are treated as unknown.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct SizedS3Object {
    /// The object location.
    pub object: S3Object,
    /// The size of the object in bytes.
    pub size: i64,
}

impl ObjectRef for SizedS3Object {
    fn bucket(&self) -> &str {
        &self.object.bucket
    }

    fn key(&self) -> &str {
        &self.object.key
    }

    fn known_size(&self) -> Option<i64> {
        (self.size > 0).then_some(self.size)
    }

    fn location(&self) -> S3Object {
        self.object.clone()
    }
}

/// Convert from an [Url] into a [S3Object]. The scheme
/// must be `s3` and the `path` must not be empty.
impl TryFrom<Url> for S3Object {
    type Error = ObjectUrlError;

    fn try_from(value: Url) -> Result<Self, Self::Error> {
        if value.scheme() != "s3" {
            return Err(ObjectUrlError::Scheme(value.scheme().to_owned()));
        }
        let bucket = value.host_str().ok_or(ObjectUrlError::MissingBucket)?;
        let key = value.path().trim_start_matches('/');
        if key.is_empty() {
            return Err(ObjectUrlError::MissingKey);
        }
        Ok(S3Object::new(bucket, key))
    }
}

impl FromStr for S3Object {
    type Err = ObjectUrlError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value.parse::<Url>()?.try_into()
    }
}

/// Converts a [S3Object] into an `s3://` [Url].
impl TryFrom<&S3Object> for Url {
    type Error = url::ParseError;
    fn try_from(obj: &S3Object) -> Result<Self, Self::Error> {
        Url::parse(&format!("s3://{}/{}", obj.bucket, obj.key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_s3_tryfrom() {
        let obj: S3Object = "s3://test-bucket/some/nested/key"
            .parse()
            .expect("Expected successful URL conversion");
        assert_eq!(obj.bucket, "test-bucket");
        assert_eq!(obj.key, "some/nested/key");
    }

    #[test]
    fn test_s3_tryfrom_no_path() {
        assert_matches!(
            "s3://test-bucket".parse::<S3Object>(),
            Err(ObjectUrlError::MissingKey)
        );
        assert_matches!(
            "s3://test-bucket/".parse::<S3Object>(),
            Err(ObjectUrlError::MissingKey)
        );
    }

    #[test]
    fn test_s3_tryfrom_file_url() {
        assert_matches!(
            "file://path/to/file".parse::<S3Object>(),
            Err(ObjectUrlError::Scheme(s)) if s == "file"
        );
    }

    #[test]
    fn test_url_round_trip() {
        let obj = S3Object::new("bucket", "/dir/key.bin");
        let url = Url::try_from(&obj).expect("Expected a valid URL");
        assert_eq!(url.as_str(), "s3://bucket/dir/key.bin");
        assert_eq!(S3Object::try_from(url).expect("Expected an object"), obj);
    }

    #[test]
    fn test_object_ref_defaults() {
        let obj = S3Object::new("src-bucket", "a/b.bin");
        assert_eq!(obj.copy_source(), "src-bucket/a/b.bin");
        assert_eq!(obj.known_size(), None);

        let sized = obj.clone().with_size(42);
        assert_eq!(sized.copy_source(), "src-bucket/a/b.bin");
        assert_eq!(sized.known_size(), Some(42));
        assert_eq!(sized.location(), obj);
    }

    #[test]
    fn test_copy_source_encodes_key() {
        let obj = S3Object::new("src-bucket", "reports/Q1 2024+final?.csv");
        assert_eq!(
            obj.copy_source(),
            "src-bucket/reports/Q1%202024%2Bfinal%3F.csv"
        );

        let obj = S3Object::new("src-bucket", "données/naïve~v1.txt");
        assert_eq!(
            obj.copy_source(),
            "src-bucket/donn%C3%A9es/na%C3%AFve~v1.txt"
        );
    }

    #[test]
    fn test_non_positive_size_is_unknown() {
        let sized = S3Object::new("b", "k").with_size(0);
        assert_eq!(sized.known_size(), None);
        let sized = S3Object::new("b", "k").with_size(-1);
        assert_eq!(sized.known_size(), None);
    }
}
