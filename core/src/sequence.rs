//! Master waybill sequence generation.
//!
//! Airline stock is numbered with a check digit folded into the serial, which
//! makes consecutive waybills step by 11, except that a serial ending in 6 is
//! followed by one 4 higher (the check digit wraps from 6 back to 0).
//!
//! [`generate`] is pure: the persisting batch creation and the read-only
//! [`preview`] call the same function, so a preview always matches what a
//! subsequent batch will insert.
//!
//! # Example
//!
//! ```
//! use waybill_flow_core::sequence::generate;
//!
//! assert_eq!(generate(16, 3).unwrap(), vec![16, 20, 31]);
//! ```

use thiserror::Error;

/// Regular step between consecutive serials.
pub const STEP: u64 = 11;

/// Step applied after a serial whose last digit is [`WRAP_DIGIT`].
pub const WRAP_STEP: u64 = 4;

/// Last digit that triggers [`WRAP_STEP`].
pub const WRAP_DIGIT: u64 = 6;

/// Errors produced by sequence generation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceError {
    /// The first serial must be positive.
    #[error("initial sequence must be positive")]
    NonPositiveInitial,

    /// The batch would run past `u64::MAX`.
    #[error("sequence overflow after {last}")]
    Overflow {
        /// Last serial that could be produced.
        last: u64,
    },
}

/// The serial following `previous`.
///
/// # Errors
///
/// Returns [`SequenceError::Overflow`] if the next serial does not fit in `u64`.
pub const fn next(previous: u64) -> Result<u64, SequenceError> {
    let step = if previous % 10 == WRAP_DIGIT {
        WRAP_STEP
    } else {
        STEP
    };
    match previous.checked_add(step) {
        Some(value) => Ok(value),
        None => Err(SequenceError::Overflow { last: previous }),
    }
}

/// Generate `count` serials starting at `initial`.
///
/// # Errors
///
/// - [`SequenceError::NonPositiveInitial`] when `initial == 0`
/// - [`SequenceError::Overflow`] when the batch runs past `u64::MAX`
pub fn generate(initial: u64, count: usize) -> Result<Vec<u64>, SequenceError> {
    if initial == 0 {
        return Err(SequenceError::NonPositiveInitial);
    }

    let mut serials = Vec::with_capacity(count);
    let mut current = initial;
    for index in 0..count {
        if index > 0 {
            current = next(current)?;
        }
        serials.push(current);
    }
    Ok(serials)
}

/// Read-only preview of a batch; identical to [`generate`].
///
/// # Errors
///
/// Same as [`generate`].
pub fn preview(initial: u64, count: usize) -> Result<Vec<u64>, SequenceError> {
    generate(initial, count)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn steps_by_eleven() {
        assert_eq!(generate(10, 4).unwrap(), vec![10, 21, 32, 43]);
    }

    #[test]
    fn wraps_after_six() {
        assert_eq!(generate(16, 3).unwrap(), vec![16, 20, 31]);
        assert_eq!(generate(5, 3).unwrap(), vec![5, 16, 20]);
    }

    #[test]
    fn empty_batch() {
        assert_eq!(generate(7, 0).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn rejects_zero_initial() {
        assert_eq!(generate(0, 3), Err(SequenceError::NonPositiveInitial));
        assert_eq!(preview(0, 3), Err(SequenceError::NonPositiveInitial));
    }

    #[test]
    fn reports_overflow() {
        let start = u64::MAX - 5;
        assert_eq!(generate(start, 1).unwrap(), vec![start]);
        assert!(matches!(generate(start, 2), Err(SequenceError::Overflow { .. })));
    }

    proptest! {
        #[test]
        fn generated_batches_follow_the_step_rule(initial in 1u64..10_000_000, count in 0usize..200) {
            let serials = generate(initial, count).unwrap();
            prop_assert_eq!(serials.len(), count);
            if let Some(first) = serials.first() {
                prop_assert_eq!(*first, initial);
            }
            for pair in serials.windows(2) {
                let expected = if pair[0] % 10 == 6 { pair[0] + 4 } else { pair[0] + 11 };
                prop_assert_eq!(pair[1], expected);
            }
        }

        #[test]
        fn preview_matches_generate(initial in 1u64..10_000_000, count in 0usize..200) {
            prop_assert_eq!(preview(initial, count), generate(initial, count));
        }
    }
}
