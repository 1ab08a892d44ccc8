// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of pipeman

use nix::libc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipemanError {
    #[error("An error occurred. {0}")]
    Error(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("kernel rejected {what}")]
    ResourceError {
        what: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    BpfLoadError(#[from] aya::EbpfError),
    #[error(transparent)]
    BpfProgramError(#[from] aya::programs::ProgramError),
    #[error("failed to parse pipeline object")]
    ObjectParseError(#[from] object::read::Error),
    #[error("failed to pin program {name}")]
    UnableToPinProgram {
        name: String,
        #[source]
        source: aya::pin::PinError,
    },
    #[error("failed to pin map {name}")]
    UnableToPinMap {
        name: String,
        #[source]
        source: aya::pin::PinError,
    },
    #[error("failed to pin link {0}")]
    UnableToPinLink(#[source] aya::pin::PinError),
    #[error("failed to run initializer {name}")]
    InitError {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Translates an OS error into the error taxonomy at its origin. `what`
/// names the object or operation the failure applies to.
pub(crate) fn map_io_error(what: &str, err: std::io::Error) -> PipemanError {
    match err.raw_os_error() {
        Some(libc::ENOENT) => PipemanError::NotFound(what.to_string()),
        Some(libc::EPERM) | Some(libc::EACCES) => {
            PipemanError::PermissionDenied(what.to_string())
        }
        Some(libc::EOPNOTSUPP) => PipemanError::NotSupported(what.to_string()),
        Some(libc::EINVAL) => PipemanError::InvalidInput(what.to_string()),
        Some(libc::E2BIG) | Some(libc::ENOSPC) | Some(libc::ENOMEM) => {
            PipemanError::ResourceError {
                what: what.to_string(),
                source: err,
            }
        }
        _ => PipemanError::IoError(err),
    }
}

/// Walks an error's source chain looking for an `EOPNOTSUPP` at any level.
/// Used to decide whether a failed driver-mode XDP attach may fall back to
/// the generic mode.
pub(crate) fn not_supported(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
            if io_err.raw_os_error() == Some(libc::EOPNOTSUPP) {
                return true;
            }
        }
        current = e.source();
    }
    false
}
