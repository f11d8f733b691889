// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

/// Errors surfaced by the Rust API surface of the engine: bad arguments,
/// registration conflicts, transport I/O failures, manifest conflicts.
///
/// This is distinct from [`OpResult`], which is the `u8` status code
/// carried on the wire inside a response header.
#[derive(Debug)]
pub enum Error {
    /// An argument failed validation (bad cport, null handler, malformed frame).
    Invalid,

    /// The requested registration already exists (driver, cport mapping,
    /// manifest descriptor identity).
    Exists,

    /// The cport or engine is shut down.
    NetDown,

    /// A manifest-specific conflict or structural violation.
    Manifest(ManifestError),

    /// Errors returned by I/O failures in a transport backend.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid argument"),
            Self::Exists => write!(f, "already registered"),
            Self::NetDown => write!(f, "cport is shut down"),
            Self::Manifest(e) => write!(f, "manifest error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ManifestError> for Error {
    fn from(e: ManifestError) -> Self {
        Self::Manifest(e)
    }
}

#[derive(Debug)]
pub enum ManifestError {
    /// A second Interface descriptor was added.
    DuplicateInterface,

    /// A String/Bundle/CPort descriptor with this id already exists.
    DuplicateId,

    /// CPort ids did not form a contiguous range from their minimum.
    CportsNotContiguous,

    /// A string exceeded the 255-byte wire limit.
    StringTooLong,

    /// mnfb bytes did not parse: truncated, bad size field, or unknown
    /// descriptor type.
    Decode,
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::DuplicateInterface => "manifest already has an interface descriptor",
                Self::DuplicateId => "descriptor id already in use",
                Self::CportsNotContiguous => "cport ids are not a contiguous range",
                Self::StringTooLong => "string descriptor exceeds 255 bytes",
                Self::Decode => "malformed mnfb bytes",
            }
        )
    }
}

/// Status code carried in a response header's `result` byte (wire vocabulary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpResult {
    Success = 0x00,
    Interrupted = 0x01,
    Timeout = 0x02,
    NoMemory = 0x03,
    ProtocolBad = 0x04,
    Invalid = 0x05,
    Overflow = 0x06,
    Nonexistent = 0x07,
    Retry = 0x08,
    Internal = 0x09,
    UnknownError = 0xff,
}

impl OpResult {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x00 => Self::Success,
            0x01 => Self::Interrupted,
            0x02 => Self::Timeout,
            0x03 => Self::NoMemory,
            0x04 => Self::ProtocolBad,
            0x05 => Self::Invalid,
            0x06 => Self::Overflow,
            0x07 => Self::Nonexistent,
            0x08 => Self::Retry,
            0x09 => Self::Internal,
            _ => Self::UnknownError,
        }
    }
}

/// Maps a host errno (positive or negative form, matching the source's
/// `gb_errno_to_op_result`) onto the wire result vocabulary.
pub fn errno_to_op_result(errno: i32) -> OpResult {
    match errno.abs() {
        0 => OpResult::Success,
        libc::EINTR => OpResult::Interrupted,
        libc::ETIMEDOUT => OpResult::Timeout,
        libc::ENOMEM => OpResult::NoMemory,
        libc::EPROTO | libc::ENOSYS => OpResult::ProtocolBad,
        libc::EINVAL => OpResult::Invalid,
        libc::EOVERFLOW => OpResult::Overflow,
        libc::ENODEV | libc::ENXIO => OpResult::Nonexistent,
        libc::EBUSY | libc::EAGAIN => OpResult::Retry,
        _ => OpResult::UnknownError,
    }
}

impl From<&Error> for OpResult {
    fn from(e: &Error) -> Self {
        match e {
            Error::Invalid => OpResult::Invalid,
            Error::Exists => OpResult::Invalid,
            Error::NetDown => OpResult::Internal,
            Error::Manifest(_) => OpResult::Invalid,
            Error::Io(e) => e.raw_os_error().map(errno_to_op_result).unwrap_or(OpResult::Internal),
        }
    }
}
