//! Wire constants and capability negotiation for the tus 1.0.0 protocol.

use crate::checksum::ChecksumAlgorithm;
use crate::config::{ExpirationConfig, ProtocolConfig};
use std::fmt;

/// Protocol version spoken by this server.
pub const TUS_VERSION: &str = "1.0.0";

/// Content type required on chunk bodies.
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

pub const HEADER_TUS_RESUMABLE: &str = "tus-resumable";
pub const HEADER_TUS_VERSION: &str = "tus-version";
pub const HEADER_TUS_EXTENSION: &str = "tus-extension";
pub const HEADER_TUS_MAX_SIZE: &str = "tus-max-size";
pub const HEADER_TUS_CHECKSUM_ALGORITHM: &str = "tus-checksum-algorithm";
pub const HEADER_UPLOAD_OFFSET: &str = "upload-offset";
pub const HEADER_UPLOAD_LENGTH: &str = "upload-length";
pub const HEADER_UPLOAD_DEFER_LENGTH: &str = "upload-defer-length";
pub const HEADER_UPLOAD_METADATA: &str = "upload-metadata";
pub const HEADER_UPLOAD_CHECKSUM: &str = "upload-checksum";
pub const HEADER_UPLOAD_EXPIRES: &str = "upload-expires";
pub const HEADER_METHOD_OVERRIDE: &str = "x-http-method-override";

/// Optional protocol extensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Extension {
    Creation,
    CreationWithUpload,
    CreationDeferLength,
    Termination,
    Checksum,
    Expiration,
}

impl Extension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creation => "creation",
            Self::CreationWithUpload => "creation-with-upload",
            Self::CreationDeferLength => "creation-defer-length",
            Self::Termination => "termination",
            Self::Checksum => "checksum",
            Self::Expiration => "expiration",
        }
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a deployment offers to clients.
#[derive(Clone, Debug)]
pub struct Capabilities {
    extensions: Vec<Extension>,
    checksum_algorithms: Vec<ChecksumAlgorithm>,
    max_size: Option<u64>,
}

impl Capabilities {
    /// Derive the advertised capabilities from configuration.
    pub fn from_config(protocol: &ProtocolConfig, expiration: &ExpirationConfig) -> Self {
        let checksum_algorithms: Vec<ChecksumAlgorithm> = protocol
            .checksum_algorithms
            .iter()
            .filter_map(|name| ChecksumAlgorithm::parse(name).ok())
            .collect();

        let mut extensions = vec![Extension::Creation];
        if protocol.enable_creation_with_upload {
            extensions.push(Extension::CreationWithUpload);
        }
        if protocol.allow_defer_length {
            extensions.push(Extension::CreationDeferLength);
        }
        if protocol.enable_termination {
            extensions.push(Extension::Termination);
        }
        if !checksum_algorithms.is_empty() {
            extensions.push(Extension::Checksum);
        }
        if expiration.enabled {
            extensions.push(Extension::Expiration);
        }

        Self {
            extensions,
            checksum_algorithms,
            max_size: protocol.max_size,
        }
    }

    pub fn supports(&self, extension: Extension) -> bool {
        self.extensions.contains(&extension)
    }

    pub fn supports_checksum(&self, algorithm: ChecksumAlgorithm) -> bool {
        self.checksum_algorithms.contains(&algorithm)
    }

    pub fn max_size(&self) -> Option<u64> {
        self.max_size
    }

    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    /// Value for `Tus-Extension`.
    pub fn extension_header(&self) -> String {
        self.extensions
            .iter()
            .map(Extension::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Value for `Tus-Checksum-Algorithm`, or `None` when checksums are off.
    pub fn checksum_header(&self) -> Option<String> {
        if self.checksum_algorithms.is_empty() {
            return None;
        }
        Some(
            self.checksum_algorithms
                .iter()
                .map(ChecksumAlgorithm::as_str)
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::from_config(&ProtocolConfig::default(), &ExpirationConfig::default())
    }
}
