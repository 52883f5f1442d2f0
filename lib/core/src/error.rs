//! Error handling foundation for flowforge.
//!
//! This module provides only the `Result` type alias using rootcause.
//! Each crate defines its own domain-specific error enums in its own
//! error module; reports carry those enums as their context so callers
//! can still match on them after propagation.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom")
        }
    }

    impl std::error::Error for Boom {}

    fn raise() -> std::result::Result<(), Boom> {
        Err(Boom)
    }

    fn fails() -> Result<(), Boom> {
        raise()?;
        Ok(())
    }

    #[test]
    fn result_type_works() {
        let ok: Result<i32> = Ok(42);
        assert_eq!(ok.expect("should be ok"), 42);
    }

    #[test]
    fn typed_context_survives_question_mark() {
        let err = fails().unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
