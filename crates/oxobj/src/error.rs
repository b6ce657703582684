//! Error types for the `OxObj` runtime.
//!
//! Recoverable failures are reported through [`Error`]. Broken runtime
//! invariants (cyclic superclass chains, conflicting selector signatures,
//! over-release, unrecognized selectors and the like) are not recoverable:
//! they go through the crate-internal `fatal!` macro, which logs at error
//! level and panics with a diagnostic naming the class and selector
//! involved. Hosts that need hard termination build with `panic = "abort"`.

use std::fmt;

/// Errors that can occur in the `OxObj` runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Type encoding string is malformed.
    InvalidEncoding {
        /// The offending encoding.
        encoding: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Operation requires a class created through the runtime API.
    NotUserCreated {
        /// The class name.
        name: String,
    },

    /// Class still has subclasses and cannot be disposed.
    ClassHasSubclasses {
        /// The class name.
        name: String,
    },

    /// Instance variable cannot be added.
    InvalidIvar {
        /// The ivar name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Category name already attached to this class.
    CategoryAlreadyExists {
        /// Target class name.
        class: String,
        /// The duplicate category name.
        category: String,
    },

    /// Protocol name already exists.
    ProtocolAlreadyExists {
        /// The duplicate name.
        name: String,
    },

    /// Protocol is not registered.
    UnknownProtocol {
        /// The requested name.
        name: String,
    },

    /// Protocol already adopted by class.
    ProtocolAlreadyAdopted {
        /// The class name.
        class: String,
        /// The protocol name.
        protocol: String,
    },

    /// Class lacks a method required by a protocol it claims.
    MissingProtocolMethod {
        /// The class name.
        class: String,
        /// The missing selector name.
        selector: String,
    },

    /// Tagged-class index is out of range or already taken.
    InvalidTaggedIndex {
        /// The requested index.
        index: u8,
    },

    /// Configuration value could not be parsed.
    InvalidConfig {
        /// The configuration key (environment variable name).
        key: String,
        /// The rejected value.
        value: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidEncoding { encoding, reason } => {
                write!(f, "Invalid type encoding '{encoding}': {reason}")
            }
            Error::NotUserCreated { name } => {
                write!(f, "Class '{name}' was not created through the runtime API")
            }
            Error::ClassHasSubclasses { name } => {
                write!(f, "Class '{name}' still has subclasses")
            }
            Error::InvalidIvar { name, reason } => {
                write!(f, "Cannot add ivar '{name}': {reason}")
            }
            Error::CategoryAlreadyExists { class, category } => {
                write!(f, "Category '{category}' already attached to '{class}'")
            }
            Error::ProtocolAlreadyExists { name } => {
                write!(f, "Protocol '{name}' already exists")
            }
            Error::UnknownProtocol { name } => {
                write!(f, "Protocol '{name}' is not registered")
            }
            Error::ProtocolAlreadyAdopted { class, protocol } => {
                write!(f, "Protocol '{protocol}' already adopted by '{class}'")
            }
            Error::MissingProtocolMethod { class, selector } => {
                write!(f, "Class '{class}' is missing required protocol method '{selector}'")
            }
            Error::InvalidTaggedIndex { index } => {
                write!(f, "Tagged class index {index} is out of range or taken")
            }
            Error::InvalidConfig { key, value } => {
                write!(f, "Invalid value '{value}' for {key}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type for `OxObj` runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Logs an unrecoverable runtime fault and panics with the same message.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        oxobj_log::error!("fatal: {}", message);
        panic!("{}", message)
    }};
}

pub(crate) use fatal;
