//! Structural self-checks for the layout types shared between ranks.
//!
//! `validate_invariants` is always available. The assertion variants only run
//! in debug builds or with `check-invariants`/`strict-invariants`, and panic
//! with the rank that built the value when it is known.

use crate::vec_error::VecError;

pub trait DebugInvariants {
    /// Type name used in invariant panics.
    const LABEL: &'static str;

    /// Validate invariants and return the first error encountered.
    fn validate_invariants(&self) -> Result<(), VecError>;

    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), Self::LABEL);
    }

    /// As [`debug_assert_invariants`](Self::debug_assert_invariants), naming
    /// the rank that built `self` in the panic message.
    fn debug_assert_invariants_on(&self, _rank: usize) {
        crate::debug_invariants!(self.validate_invariants(), Self::LABEL, _rank);
    }
}

/// Panic on a failed invariant check when invariant checking is enabled.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $label:expr) => {
        #[cfg(any(debug_assertions, feature = "strict-invariants", feature = "check-invariants"))]
        if let Err(e) = $expr {
            panic!("[ghost-vec invariants] {}: {}", $label, e);
        }
    };
    ($expr:expr, $label:expr, $rank:expr) => {
        #[cfg(any(debug_assertions, feature = "strict-invariants", feature = "check-invariants"))]
        if let Err(e) = $expr {
            panic!("[ghost-vec invariants] rank {}: {}: {}", $rank, $label, e);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::extents::OwnershipExtents;

    struct AlwaysBroken;

    impl DebugInvariants for AlwaysBroken {
        const LABEL: &'static str = "AlwaysBroken";

        fn validate_invariants(&self) -> Result<(), VecError> {
            Err(VecError::InvalidExtents("broken".into()))
        }
    }

    #[test]
    fn valid_extents_pass_silently() {
        let e = OwnershipExtents::from_local_sizes(&[1, 0, 2]).unwrap();
        e.debug_assert_invariants();
        e.debug_assert_invariants_on(2);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "rank 3: AlwaysBroken: invalid ownership extents: broken")]
    fn panic_names_the_rank() {
        AlwaysBroken.debug_assert_invariants_on(3);
    }
}
