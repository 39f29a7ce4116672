use serde::{Deserialize, Serialize};

use crate::Coordinate;

/// Categorical safety judgment for a point or a whole route.
///
/// Declaration order is the enumeration order used in payloads and
/// tie-breaks. It is not a severity scale; route aggregation uses
/// [`Rating::aggregate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Rating {
    Unclear,
    Unsafe,
    Safe,
    ExtremelySafe,
}

impl Rating {
    /// Parse the classifier's `safety` label. Unknown labels are `Unclear`.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "Unsafe" => Self::Unsafe,
            "Safe" => Self::Safe,
            "Extremely Safe" => Self::ExtremelySafe,
            _ => Self::Unclear,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Unclear => "Unclear",
            Self::Unsafe => "Unsafe",
            Self::Safe => "Safe",
            Self::ExtremelySafe => "Extremely Safe",
        }
    }

    /// Aggregation precedence: `Unsafe` > `ExtremelySafe` > `Safe` > `Unclear`.
    const fn precedence(self) -> u8 {
        match self {
            Self::Unsafe => 3,
            Self::ExtremelySafe => 2,
            Self::Safe => 1,
            Self::Unclear => 0,
        }
    }

    /// Route-level rating from per-point ratings.
    ///
    /// Any `Unsafe` point makes the route `Unsafe`. Otherwise any
    /// `ExtremelySafe` point wins over `Safe`. No ratings, or only
    /// `Unclear` ones, yields `Unclear`.
    #[must_use]
    pub fn aggregate<I>(ratings: I) -> Self
    where
        I: IntoIterator<Item = Rating>,
    {
        ratings
            .into_iter()
            .max_by_key(|rating| rating.precedence())
            .unwrap_or(Self::Unclear)
    }
}

/// Result of scoring one route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyAssessment {
    /// Sampled route vertices, in route order.
    pub sampled_points: Vec<Coordinate>,
    /// Route index of each sampled vertex.
    pub sampled_indices: Vec<usize>,
    /// One rating per sampled vertex, same order.
    pub per_point_rating: Vec<Rating>,
    pub aggregate_rating: Rating,
}

impl SafetyAssessment {
    #[must_use]
    pub fn new(
        sampled_indices: Vec<usize>,
        sampled_points: Vec<Coordinate>,
        per_point_rating: Vec<Rating>,
    ) -> Self {
        let aggregate_rating = Rating::aggregate(per_point_rating.iter().copied());
        Self {
            sampled_points,
            sampled_indices,
            per_point_rating,
            aggregate_rating,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Rating::{self, ExtremelySafe, Safe, Unclear, Unsafe};

    #[test]
    fn unsafe_dominates_everything() {
        assert_eq!(Rating::aggregate([Safe, Unsafe, ExtremelySafe]), Unsafe);
    }

    #[test]
    fn extremely_safe_beats_safe() {
        assert_eq!(Rating::aggregate([Safe, ExtremelySafe]), ExtremelySafe);
    }

    #[test]
    fn safe_only() {
        assert_eq!(Rating::aggregate([Safe, Safe]), Safe);
    }

    #[test]
    fn empty_and_unclear_are_unclear() {
        assert_eq!(Rating::aggregate(Vec::<Rating>::new()), Unclear);
        assert_eq!(Rating::aggregate([Unclear, Unclear]), Unclear);
        assert_eq!(Rating::aggregate([Unclear, Safe]), Safe);
    }

    #[test]
    fn labels_round_trip_through_classifier_names() {
        for rating in [Unsafe, Safe, ExtremelySafe] {
            assert_eq!(Rating::from_label(rating.label()), rating);
        }
        assert_eq!(Rating::from_label("Somewhat Safe"), Unclear);
    }

    #[test]
    fn enumeration_order_is_not_severity() {
        assert!(Unclear < Unsafe);
        assert!(Unsafe < Safe);
        assert!(Safe < ExtremelySafe);
    }
}
