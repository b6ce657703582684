//! Method type encodings.
//!
//! A signature string lists one type code for the return value followed by
//! one per argument. Every method receives the receiver (`@`) and the
//! selector (`:`) first, so `"v@:"` is a method with no explicit arguments
//! returning nothing and `"d@:i"` returns a double from one int argument.
//!
//! | code | type | code | type |
//! |------|------|------|------|
//! | `v` | void | `@` | object |
//! | `:` | selector | `#` | class |
//! | `c` / `C` | i8 / u8 | `s` / `S` | i16 / u16 |
//! | `i` / `I` | i32 / u32 | `l` / `L` | long / unsigned long |
//! | `q` / `Q` | i64 / u64 | `B` | bool |
//! | `f` | f32 | `d` | f64 |
//! | `*` | C string | `^` | pointer |
//! | `?` | unknown / block | | |
//!
//! Signatures are validated when a selector is interned with a type string.
//! [`return_kind`] classifies the return type so a message to nil can tell
//! an integer-like zero result from a floating-point one.

#![allow(clippy::match_same_arms)]

use crate::error::{Error, Result};

/// A single type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    Void,
    Object,
    Selector,
    Class,
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
    Bool,
    Float,
    Double,
    CString,
    Pointer,
    Unknown,
}

impl TypeCode {
    /// Parses one encoding character.
    #[must_use]
    pub const fn from_char(ch: char) -> Option<Self> {
        Some(match ch {
            'v' => TypeCode::Void,
            '@' => TypeCode::Object,
            ':' => TypeCode::Selector,
            '#' => TypeCode::Class,
            'c' => TypeCode::Char,
            'C' => TypeCode::UChar,
            's' => TypeCode::Short,
            'S' => TypeCode::UShort,
            'i' => TypeCode::Int,
            'I' => TypeCode::UInt,
            'l' => TypeCode::Long,
            'L' => TypeCode::ULong,
            'q' => TypeCode::LongLong,
            'Q' => TypeCode::ULongLong,
            'B' => TypeCode::Bool,
            'f' => TypeCode::Float,
            'd' => TypeCode::Double,
            '*' => TypeCode::CString,
            '^' => TypeCode::Pointer,
            '?' => TypeCode::Unknown,
            _ => return None,
        })
    }

    /// Size in bytes of a value of this type (0 for void).
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            TypeCode::Void => 0,
            TypeCode::Char | TypeCode::UChar | TypeCode::Bool => 1,
            TypeCode::Short | TypeCode::UShort => 2,
            TypeCode::Int | TypeCode::UInt | TypeCode::Float => 4,
            TypeCode::LongLong | TypeCode::ULongLong | TypeCode::Double => 8,
            TypeCode::Long
            | TypeCode::ULong
            | TypeCode::Object
            | TypeCode::Selector
            | TypeCode::Class
            | TypeCode::CString
            | TypeCode::Pointer
            | TypeCode::Unknown => size_of::<usize>(),
        }
    }
}

/// Return-value category, used by the nil-receiver path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    /// Nothing is returned.
    Void,
    /// Integer, boolean, pointer or object: nil yields zero.
    Word,
    /// `f` or `d`: there is no word-sized zero to hand back.
    Float,
}

/// A parsed signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Return type.
    pub ret: TypeCode,
    /// Argument types, starting with the receiver and the selector.
    pub args: Vec<TypeCode>,
}

impl Signature {
    /// Number of explicit arguments (excluding receiver and selector).
    #[must_use]
    pub fn explicit_args(&self) -> usize {
        self.args.len() - 2
    }

    /// Category of the return type.
    #[must_use]
    pub fn return_kind(&self) -> ReturnKind {
        match self.ret {
            TypeCode::Void => ReturnKind::Void,
            TypeCode::Float | TypeCode::Double => ReturnKind::Float,
            _ => ReturnKind::Word,
        }
    }
}

fn invalid(encoding: &str, reason: impl Into<String>) -> Error {
    Error::InvalidEncoding {
        encoding: encoding.to_string(),
        reason: reason.into(),
    }
}

/// Parses a signature string.
///
/// # Errors
///
/// Returns [`Error::InvalidEncoding`] if the string is empty, contains an
/// unknown type code, uses `v` for an argument, or does not start its
/// arguments with `@:`.
///
/// # Example
///
/// ```
/// use oxobj::runtime::encoding::{ReturnKind, TypeCode, parse_signature};
///
/// let sig = parse_signature("d@:i").unwrap();
/// assert_eq!(sig.ret, TypeCode::Double);
/// assert_eq!(sig.explicit_args(), 1);
/// assert_eq!(sig.return_kind(), ReturnKind::Float);
/// ```
pub fn parse_signature(encoding: &str) -> Result<Signature> {
    let mut codes = Vec::with_capacity(encoding.len());
    for (i, ch) in encoding.chars().enumerate() {
        let code = TypeCode::from_char(ch)
            .ok_or_else(|| invalid(encoding, format!("unknown type code '{ch}' at {i}")))?;
        codes.push(code);
    }

    let Some((&ret, args)) = codes.split_first() else {
        return Err(invalid(encoding, "empty signature"));
    };
    if args.len() < 2 || args[0] != TypeCode::Object || args[1] != TypeCode::Selector {
        return Err(invalid(encoding, "arguments must start with '@:'"));
    }
    if args.contains(&TypeCode::Void) {
        return Err(invalid(encoding, "void is not an argument type"));
    }

    Ok(Signature {
        ret,
        args: args.to_vec(),
    })
}

/// Checks that `encoding` is a well-formed signature.
///
/// # Errors
///
/// See [`parse_signature`].
pub fn validate_signature(encoding: &str) -> Result<()> {
    parse_signature(encoding).map(|_| ())
}

/// Classifies the return type of a signature, without full validation.
///
/// Unknown or empty signatures count as [`ReturnKind::Word`].
#[must_use]
pub fn return_kind(encoding: &str) -> ReturnKind {
    match encoding.chars().next().and_then(TypeCode::from_char) {
        Some(TypeCode::Void) => ReturnKind::Void,
        Some(TypeCode::Float | TypeCode::Double) => ReturnKind::Float,
        _ => ReturnKind::Word,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_signatures() {
        for sig in ["v@:", "i@:i", "@@:@", "q@:dq", "B@:#", "v@:^*?"] {
            assert!(validate_signature(sig).is_ok(), "{sig}");
        }
    }

    #[test]
    fn test_invalid_signatures() {
        assert!(validate_signature("").is_err());
        assert!(validate_signature("xyz").is_err());
        assert!(validate_signature("v@:x").is_err());
        assert!(validate_signature("@").is_err());
        assert!(validate_signature("v:@").is_err());
        assert!(validate_signature("v@:v").is_err());
    }

    #[test]
    fn test_error_names_problem() {
        let err = validate_signature("v@:x").unwrap_err();
        assert_eq!(
            err,
            Error::InvalidEncoding {
                encoding: "v@:x".into(),
                reason: "unknown type code 'x' at 3".into()
            }
        );
    }

    #[test]
    fn test_sizes() {
        assert_eq!(TypeCode::Int.size(), 4);
        assert_eq!(TypeCode::Double.size(), 8);
        assert_eq!(TypeCode::Void.size(), 0);
        assert_eq!(TypeCode::Bool.size(), 1);
        assert_eq!(TypeCode::Object.size(), size_of::<usize>());
    }

    #[test]
    fn test_return_kind() {
        assert_eq!(return_kind("v@:"), ReturnKind::Void);
        assert_eq!(return_kind("f@:"), ReturnKind::Float);
        assert_eq!(return_kind("d@:i"), ReturnKind::Float);
        assert_eq!(return_kind("@@:"), ReturnKind::Word);
        assert_eq!(return_kind(""), ReturnKind::Word);
        assert_eq!(parse_signature("q@:").unwrap().return_kind(), ReturnKind::Word);
    }
}
