use std::{fmt, panic::Location};

use crate::value::Device;

/// A non-success status returned by the accelerator driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub code: i32,
    pub name: String,
    pub description: String,
    pub location: &'static Location<'static>,
}

impl DriverError {
    /// Build an error for `code`, recording the caller as the failing call site.
    #[track_caller]
    pub fn new(code: i32, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
            description: description.into(),
            location: Location::caller(),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}, at {}:{}",
            self.name,
            self.description,
            self.location.file(),
            self.location.line()
        )
    }
}

impl std::error::Error for DriverError {}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("metadata `{name}` was not resolved")]
    MissingMetadata { name: String },
    #[error("invalid binding: {0}")]
    InvalidBinding(String),
    #[error("unknown kernel `{0}`")]
    UnknownKernel(String),
    #[error("invalid kernel manifest: {0}")]
    Manifest(String),
    #[error("no stream is registered for {0:?}")]
    UnregisteredDevice(Device),
    #[error("could not lock {0}")]
    LockPoisoned(String),
    #[error("no runtime has been installed for this process")]
    RuntimeUninitialized,
    #[error("a runtime is already installed for this process")]
    RuntimeAlreadyInstalled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn missing(name: impl Into<String>) -> Self {
        Self::MissingMetadata { name: name.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
