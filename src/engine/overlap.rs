use std::str::FromStr;

use crate::model::Span;

/// How a candidate stay is tested against an existing one.
///
/// Both policies treat range boundaries as inclusive: a stay starting on the
/// day another one ends is a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapPolicy {
    /// Conflict iff the candidate's start or end lands inside
    /// `[existing.start, existing.end]`. A candidate that strictly engulfs
    /// the existing stay slips through.
    ///
    /// The check is one-directional. The mirrored test, the existing stay's
    /// endpoints inside the candidate, would instead miss a candidate
    /// strictly inside an existing stay. `Closed` misses neither case.
    Endpoints,
    /// Closed-interval intersection. Same boundary behavior as `Endpoints`,
    /// and also catches containment.
    #[default]
    Closed,
}

impl FromStr for OverlapPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "endpoints" => Ok(OverlapPolicy::Endpoints),
            "closed" => Ok(OverlapPolicy::Closed),
            other => Err(format!("unknown overlap policy: {other} (expected closed|endpoints)")),
        }
    }
}

/// Does `candidate` conflict with `existing` under `policy`?
pub fn conflicts(existing: &Span, candidate: &Span, policy: OverlapPolicy) -> bool {
    match policy {
        OverlapPolicy::Endpoints => {
            existing.contains_inclusive(candidate.start) || existing.contains_inclusive(candidate.end)
        }
        OverlapPolicy::Closed => candidate.start <= existing.end && existing.start <= candidate.end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: i64 = 86_400_000;

    fn days(a: i64, b: i64) -> Span {
        Span::new(a * D, b * D)
    }

    #[test]
    fn identical_ranges_conflict() {
        for policy in [OverlapPolicy::Endpoints, OverlapPolicy::Closed] {
            assert!(conflicts(&days(1, 4), &days(1, 4), policy));
        }
    }

    #[test]
    fn start_inside_existing_conflicts() {
        for policy in [OverlapPolicy::Endpoints, OverlapPolicy::Closed] {
            assert!(conflicts(&days(1, 4), &days(3, 6), policy));
        }
    }

    #[test]
    fn end_inside_existing_conflicts() {
        for policy in [OverlapPolicy::Endpoints, OverlapPolicy::Closed] {
            assert!(conflicts(&days(3, 6), &days(1, 4), policy));
        }
    }

    #[test]
    fn candidate_inside_existing_conflicts() {
        for policy in [OverlapPolicy::Endpoints, OverlapPolicy::Closed] {
            assert!(conflicts(&days(1, 10), &days(3, 5), policy));
        }
    }

    #[test]
    fn touching_boundaries_conflict() {
        for policy in [OverlapPolicy::Endpoints, OverlapPolicy::Closed] {
            // Check-in on the existing check-out day.
            assert!(conflicts(&days(1, 4), &days(4, 6), policy));
            // Check-out on the existing check-in day.
            assert!(conflicts(&days(4, 6), &days(1, 4), policy));
        }
    }

    #[test]
    fn disjoint_ranges_do_not_conflict() {
        for policy in [OverlapPolicy::Endpoints, OverlapPolicy::Closed] {
            assert!(!conflicts(&days(1, 4), &days(5, 7), policy));
            assert!(!conflicts(&days(5, 7), &days(1, 4), policy));
        }
    }

    #[test]
    fn one_ms_gap_does_not_conflict() {
        let existing = Span::new(0, 1000);
        let candidate = Span::new(1001, 2000);
        for policy in [OverlapPolicy::Endpoints, OverlapPolicy::Closed] {
            assert!(!conflicts(&existing, &candidate, policy));
        }
    }

    #[test]
    fn engulfing_candidate_missed_by_endpoints() {
        assert!(!conflicts(&days(3, 5), &days(1, 10), OverlapPolicy::Endpoints));
    }

    #[test]
    fn engulfing_candidate_caught_by_closed() {
        assert!(conflicts(&days(3, 5), &days(1, 10), OverlapPolicy::Closed));
    }

    #[test]
    fn default_policy_is_closed() {
        assert_eq!(OverlapPolicy::default(), OverlapPolicy::Closed);
    }

    #[test]
    fn parse_policy() {
        assert_eq!("closed".parse(), Ok(OverlapPolicy::Closed));
        assert_eq!("ENDPOINTS".parse(), Ok(OverlapPolicy::Endpoints));
        assert!("half-open".parse::<OverlapPolicy>().is_err());
    }
}
