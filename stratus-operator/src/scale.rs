//! Scale strategies - pick the next node count of a fleet.

/// Strategy translating a desired replica count into the next step.
pub trait ScaleStrategy: Send + Sync {
    /// Node count to apply this pass.
    fn get_node_count(&self, current: i64, desired: i64) -> i64;
}

/// Moves one node per reconcile pass toward the desired count.
///
/// Every added or removed instance gets a full reconcile cycle before the
/// next change is applied. Negative counts are not handled.
#[derive(Debug, Clone, Copy, Default)]
pub struct Incremental;

impl ScaleStrategy for Incremental {
    fn get_node_count(&self, current: i64, desired: i64) -> i64 {
        if current < desired {
            current + 1
        } else if current > desired {
            current - 1
        } else {
            current
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_up_by_one() {
        assert_eq!(Incremental.get_node_count(3, 5), 4);
        assert_eq!(Incremental.get_node_count(0, 1), 1);
    }

    #[test]
    fn test_scale_down_by_one() {
        assert_eq!(Incremental.get_node_count(5, 3), 4);
        assert_eq!(Incremental.get_node_count(1, 0), 0);
    }

    #[test]
    fn test_equal_is_noop() {
        assert_eq!(Incremental.get_node_count(4, 4), 4);
        assert_eq!(Incremental.get_node_count(0, 0), 0);
    }

    #[test]
    fn test_converges_in_distance_steps() {
        let mut current = 2;
        let mut steps = 0;
        while current != 9 {
            current = Incremental.get_node_count(current, 9);
            steps += 1;
        }
        assert_eq!(steps, 7);
    }
}
