//! Error types for the library.
//!
//! One [`Error`] enum covers everything the public surface can report:
//! row-count violations, cursor misuse, parameter problems, model
//! registration conflicts, and driver failures. Messages are written to be
//! read by a developer mid-debug, so they spell out what was expected.

use thiserror::Error;

/// The accepted spellings for the `back_as` argument, sorted.
pub const VALID_BACK_AS: &[&str] = &["dict", "mapping", "namedtuple", "record", "row", "tuple"];

#[derive(Error, Debug)]
pub enum Error {
    /// Fewer rows than expected. A `count` of -1 means the statement
    /// produced no result set at all.
    #[error("Got {count} rows; expecting {}", bounds_phrase(.lo, .hi))]
    TooFew { count: i64, lo: i64, hi: i64 },

    /// More rows than expected.
    #[error("Got {count} rows; expecting {}", bounds_phrase(.lo, .hi))]
    TooMany { count: i64, lo: i64, hi: i64 },

    /// An unrecognized `back_as` spelling.
    #[error(
        "{value:?} is not a valid value for the back_as argument. The available values are: {}.",
        VALID_BACK_AS.join(", ")
    )]
    BadBackAs { value: String },

    /// The cursor was committed or closed and can run nothing further.
    #[error("the cursor is closed")]
    ClosedCursor,

    /// The value passed for registration does not describe a model.
    #[error("{class_name} is not a model")]
    NotAModel { class_name: String },

    /// Neither the model nor the call site named a composite type.
    #[error("model {class_name} has no type name, and none was given")]
    NoTypeSpecified { class_name: String },

    /// The named composite type does not exist in the database.
    #[error("no type found named {type_name}")]
    NoSuchType { type_name: String },

    /// The composite type is already bound to a model.
    #[error("the type {type_name} is already registered to {class_name}")]
    AlreadyRegistered {
        class_name: String,
        type_name: String,
    },

    /// The model is not registered for any composite type.
    #[error("{class_name} is not registered")]
    NotRegistered { class_name: String },

    /// `set_attributes` was handed names the model does not have.
    #[error("The following attribute(s) are unknown to us: {}", .names.join(", "))]
    UnknownAttributes { names: Vec<String> },

    /// Database-backed model fields cannot be assigned directly.
    #[error("{name} is a read-only attribute")]
    ReadOnlyAttribute { name: String },

    /// A statement mixed positional and named parameters.
    #[error("cannot mix positional and named parameters")]
    MixedParameters,

    /// A named placeholder had no value supplied for it.
    #[error("no value supplied for parameter :{name}")]
    MissingParameter { name: String },

    /// Invalid configuration or connection URL.
    #[error("configuration error: {0}")]
    Config(String),

    /// A value could not be decoded into the expected shape.
    #[error("decode failed: {0}")]
    Decode(String),

    /// An error from the underlying driver.
    #[error(transparent)]
    Driver(#[from] sqlx::Error),
}

impl Error {
    pub fn too_few(count: i64, lo: i64, hi: i64) -> Self {
        Error::TooFew { count, lo, hi }
    }

    pub fn too_many(count: i64, lo: i64, hi: i64) -> Self {
        Error::TooMany { count, lo, hi }
    }

    pub fn bad_back_as(value: impl Into<String>) -> Self {
        Error::BadBackAs {
            value: value.into(),
        }
    }

    pub fn read_only(name: impl Into<String>) -> Self {
        Error::ReadOnlyAttribute { name: name.into() }
    }

    /// True for the row-count enforcement errors.
    pub fn is_row_count(&self) -> bool {
        matches!(self, Error::TooFew { .. } | Error::TooMany { .. })
    }
}

/// Describe an expected row-count range precisely.
fn bounds_phrase(&lo: &i64, &hi: &i64) -> String {
    if lo == hi {
        format!("exactly {lo}.")
    } else if hi - lo == 1 {
        format!("{lo} or {hi}.")
    } else {
        format!("between {lo} and {hi} (inclusive).")
    }
}

/// Convenient alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_few_exact_bounds_message() {
        let err = Error::too_few(0, 1, 1);
        assert_eq!(err.to_string(), "Got 0 rows; expecting exactly 1.");
    }

    #[test]
    fn test_too_many_adjacent_bounds_message() {
        let err = Error::too_many(3, 0, 1);
        assert_eq!(err.to_string(), "Got 3 rows; expecting 0 or 1.");
    }

    #[test]
    fn test_range_bounds_message() {
        let err = Error::too_few(1, 2, 5);
        assert_eq!(
            err.to_string(),
            "Got 1 rows; expecting between 2 and 5 (inclusive)."
        );
    }

    #[test]
    fn test_no_result_set_count() {
        let err = Error::too_few(-1, 0, 1);
        assert_eq!(err.to_string(), "Got -1 rows; expecting 0 or 1.");
    }

    #[test]
    fn test_bad_back_as_lists_sorted_values() {
        let err = Error::bad_back_as("rows");
        assert_eq!(
            err.to_string(),
            "\"rows\" is not a valid value for the back_as argument. \
             The available values are: dict, mapping, namedtuple, record, row, tuple."
        );
    }

    #[test]
    fn test_unknown_attributes_joins_names() {
        let err = Error::UnknownAttributes {
            names: vec!["foo".to_string(), "bar".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "The following attribute(s) are unknown to us: foo, bar"
        );
    }

    #[test]
    fn test_is_row_count() {
        assert!(Error::too_few(0, 1, 1).is_row_count());
        assert!(Error::too_many(2, 0, 1).is_row_count());
        assert!(!Error::ClosedCursor.is_row_count());
    }

    #[test]
    fn test_already_registered_names_holder() {
        let err = Error::AlreadyRegistered {
            class_name: "Participant".to_string(),
            type_name: "participants".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "the type participants is already registered to Participant"
        );
    }
}
