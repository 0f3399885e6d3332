//! Validation helpers for numeric configuration values.

use crate::errors::ConfigurationError;

/// Ensures a ratio lies in `[0, 1]`.
pub fn ensure_ratio(field: &str, value: f64) -> Result<(), ConfigurationError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigurationError::invalid(
            field,
            format!("must be between 0.0 and 1.0, got {value}"),
        ))
    }
}

/// Ensures an integer setting is at least one.
pub fn ensure_positive(field: &str, value: usize) -> Result<(), ConfigurationError> {
    if value == 0 {
        Err(ConfigurationError::invalid(field, "must be greater than zero"))
    } else {
        Ok(())
    }
}

/// Ensures a growth multiplier is finite and not shrinking.
pub fn ensure_multiplier(field: &str, value: f64) -> Result<(), ConfigurationError> {
    if value.is_finite() && value >= 1.0 {
        Ok(())
    } else {
        Err(ConfigurationError::invalid(
            field,
            format!("must be a finite value of at least 1.0, got {value}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_ratio() {
        assert!(ensure_ratio("rate", 0.0).is_ok());
        assert!(ensure_ratio("rate", 1.0).is_ok());
        assert!(ensure_ratio("rate", 1.01).is_err());
        assert!(ensure_ratio("rate", -0.1).is_err());
        assert!(ensure_ratio("rate", f64::NAN).is_err());
    }

    #[test]
    fn test_ensure_positive() {
        assert!(ensure_positive("threshold", 1).is_ok());
        let err = ensure_positive("threshold", 0).unwrap_err();
        assert!(err.to_string().contains("threshold"));
    }

    #[test]
    fn test_ensure_multiplier() {
        assert!(ensure_multiplier("multiplier", 2.0).is_ok());
        assert!(ensure_multiplier("multiplier", 0.5).is_err());
        assert!(ensure_multiplier("multiplier", f64::INFINITY).is_err());
    }
}
