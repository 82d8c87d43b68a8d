//! I/O interest masks.
//!
//! An [`Interest`] is the set of readiness conditions a caller subscribes to
//! for a given endpoint: readable, writable, error, plus an edge-triggered
//! delivery modifier.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Set of I/O readiness conditions.
///
/// `READ`, `WRITE` and `ERROR` are interest types; `EDGE_TRIGGERED` is a
/// delivery modifier that restricts reports to not-ready → ready transitions.
/// [`Interest::ALL`] covers every interest type (it does not imply
/// edge-triggered delivery).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    /// The empty mask.
    pub const NONE: Interest = Interest(0);
    /// Endpoint is readable (incoming data or a pending connection).
    pub const READ: Interest = Interest(0b0001);
    /// Endpoint is writable (send would make progress).
    pub const WRITE: Interest = Interest(0b0010);
    /// Endpoint is in an error state.
    pub const ERROR: Interest = Interest(0b0100);
    /// Report readiness only on not-ready → ready transitions.
    pub const EDGE_TRIGGERED: Interest = Interest(0b1000);
    /// Every interest type; the "subscribe to everything" sentinel.
    pub const ALL: Interest = Interest(0b0111);

    /// Returns true if every flag in `other` is present in `self`.
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if `self` and `other` share at least one flag.
    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    /// The flags present in both masks.
    pub const fn intersection(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }

    /// The flags of `self` that are not in `other`.
    pub const fn without(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    /// The union of both masks.
    pub const fn union(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// True if no flag is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if the edge-triggered delivery modifier is set.
    pub const fn is_edge_triggered(self) -> bool {
        self.contains(Interest::EDGE_TRIGGERED)
    }

    /// The interest types in this mask, with the delivery modifier stripped.
    pub const fn types(self) -> Interest {
        self.without(Interest::EDGE_TRIGGERED)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.union(rhs)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        *self = self.union(rhs);
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let mut first = true;
        for (flag, name) in [
            (Interest::READ, "READ"),
            (Interest::WRITE, "WRITE"),
            (Interest::ERROR, "ERROR"),
            (Interest::EDGE_TRIGGERED, "ET"),
        ] {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_contains_and_union() {
        let mask = Interest::READ | Interest::ERROR;
        assert!(mask.contains(Interest::READ));
        assert!(mask.contains(Interest::ERROR));
        assert!(!mask.contains(Interest::WRITE));
        assert!(mask.contains(Interest::READ | Interest::ERROR));
    }

    #[test]
    fn test_all_covers_types_not_modifier() {
        assert!(Interest::ALL.contains(Interest::READ));
        assert!(Interest::ALL.contains(Interest::WRITE));
        assert!(Interest::ALL.contains(Interest::ERROR));
        assert!(!Interest::ALL.is_edge_triggered());
    }

    #[test]
    fn test_without_strips_flags() {
        let mask = Interest::READ | Interest::WRITE | Interest::EDGE_TRIGGERED;
        assert_eq!(mask.types(), Interest::READ | Interest::WRITE);
        assert_eq!(mask.without(Interest::READ), Interest::WRITE | Interest::EDGE_TRIGGERED);
    }

    #[test]
    fn test_debug_names_flags() {
        assert_eq!(format!("{:?}", Interest::NONE), "NONE");
        assert_eq!(format!("{:?}", Interest::READ | Interest::ERROR), "READ|ERROR");
    }

    fn arb_interest() -> impl Strategy<Value = Interest> {
        (0u8..16).prop_map(|bits| {
            let mut mask = Interest::NONE;
            if bits & 1 != 0 {
                mask |= Interest::READ;
            }
            if bits & 2 != 0 {
                mask |= Interest::WRITE;
            }
            if bits & 4 != 0 {
                mask |= Interest::ERROR;
            }
            if bits & 8 != 0 {
                mask |= Interest::EDGE_TRIGGERED;
            }
            mask
        })
    }

    proptest! {
        #[test]
        fn prop_union_contains_both(a in arb_interest(), b in arb_interest()) {
            let u = a | b;
            prop_assert!(u.contains(a));
            prop_assert!(u.contains(b));
        }

        #[test]
        fn prop_without_then_disjoint(a in arb_interest(), b in arb_interest()) {
            prop_assert!(!a.without(b).intersects(b));
        }

        #[test]
        fn prop_intersection_symmetric(a in arb_interest(), b in arb_interest()) {
            prop_assert_eq!(a.intersection(b), b.intersection(a));
        }
    }
}
