use std::{
    fmt::Display,
    ops::{BitOr, BitOrAssign},
};

use itertools::Itertools;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Composable failure categories. Numeric values are stable and can cross a C boundary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(u32);

impl Status {
    pub const SUCCESS: Self = Self(0);
    pub const IO: Self = Self(1 << 0);
    pub const INIT: Self = Self(1 << 1);
    pub const EVAL: Self = Self(1 << 2);
    pub const INVALID_PARAMETERS: Self = Self(1 << 3);
    pub const BACKEND: Self = Self(1 << 4);
    pub const MODEL: Self = Self(1 << 5);
    pub const TOKENIZER: Self = Self(1 << 6);
    pub const SAMPLER: Self = Self(1 << 7);
    pub const RUNTIME: Self = Self(1 << 8);
    pub const UNSUPPORTED: Self = Self(1 << 9);

    const NAMES: [(Self, &'static str); 10] = [
        (Self::IO, "IO"),
        (Self::INIT, "INIT"),
        (Self::EVAL, "EVAL"),
        (Self::INVALID_PARAMETERS, "INVALID_PARAMETERS"),
        (Self::BACKEND, "BACKEND"),
        (Self::MODEL, "MODEL"),
        (Self::TOKENIZER, "TOKENIZER"),
        (Self::SAMPLER, "SAMPLER"),
        (Self::RUNTIME, "RUNTIME"),
        (Self::UNSUPPORTED, "UNSUPPORTED"),
    ];
    const ALL: u32 = (1 << 10) - 1;

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Unknown bits are dropped.
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }

    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Whether every category in `other` is also set in `self`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The code a boundary layer reports for the outcome of an operation.
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::SUCCESS,
            Err(err) => err.status(),
        }
    }
}

impl BitOr for Status {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Status {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<Status> for u32 {
    fn from(value: Status) -> Self {
        value.0
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_success() {
            return write!(f, "SUCCESS");
        }
        let names = Self::NAMES
            .iter()
            .filter(|(status, _)| self.contains(*status))
            .map(|(_, name)| name)
            .join(" | ");
        write!(f, "{names}")
    }
}

#[derive(Debug, Clone, Error)]
#[error("[{status}] {message}")]
pub struct Error {
    status: Status,
    message: String,
}

impl Error {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        let message = message.into();
        Self { status, message }
    }

    /// A required component has not been set up on the runtime.
    pub(crate) fn not_ready(component: &str) -> Self {
        Self::new(
            Status::RUNTIME | Status::INVALID_PARAMETERS,
            format!("{component} not initialized"),
        )
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<Error> for Status {
    fn from(value: Error) -> Self {
        value.status
    }
}

pub trait StatusExt<T> {
    /// Converts a foreign error into an [`Error`] of the given category.
    fn status(self, status: Status) -> Result<T>;
}

impl<T, E: Display> StatusExt<T> for std::result::Result<T, E> {
    fn status(self, status: Status) -> Result<T> {
        self.map_err(|err| Error::new(status, format!("{err:#}")))
    }
}
