//! Driver error types

use thiserror::Error;

use super::{CellHandle, ElementIndex};

/// Errors reported by a physics driver
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Unknown cell {0}")]
    UnknownCell(CellHandle),

    #[error("Local element {element} out of range ({count} local elements)")]
    UnknownElement { element: ElementIndex, count: usize },

    #[error("{operation} called before {prerequisite}")]
    OutOfOrder {
        operation: &'static str,
        prerequisite: &'static str,
    },

    #[error("Invalid {quantity}: {value}")]
    InvalidValue { quantity: &'static str, value: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_message() {
        let err = DriverError::OutOfOrder {
            operation: "heat_source",
            prerequisite: "solve_step",
        };
        assert_eq!(err.to_string(), "heat_source called before solve_step");
    }

    #[test]
    fn test_unknown_element_message() {
        let err = DriverError::UnknownElement { element: 8, count: 4 };
        assert!(err.to_string().contains("8"));
        assert!(err.to_string().contains("4 local"));
    }
}
