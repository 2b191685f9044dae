//! Approach generation.
//!
//! Turns a gap into a small set of mutually exclusive candidate approaches,
//! one per complexity class, ranked by benefit-to-risk ratio. The top-ranked
//! approach is surfaced as the recommendation; it is never auto-selected.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::analysis::{Effort, Gap};
use crate::core::{ApproachConfig, EngineError, Result};

/// Fewest approaches a decision may weigh.
pub const MIN_APPROACHES: usize = 3;

/// Most approaches a decision may weigh.
pub const MAX_APPROACHES: usize = 5;

/// Complexity class of an approach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityClass {
    Simple,
    Comprehensive,
    Hybrid,
    Experimental,
    Conservative,
}

impl ComplexityClass {
    /// Every class, in canonical order.
    pub const ALL: [Self; 5] =
        [Self::Simple, Self::Comprehensive, Self::Hybrid, Self::Experimental, Self::Conservative];

    fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Comprehensive => "comprehensive",
            Self::Hybrid => "hybrid",
            Self::Experimental => "experimental",
            Self::Conservative => "conservative",
        }
    }

    /// Implementation quality a class tends to reach.
    fn quality(self) -> f64 {
        match self {
            Self::Simple => 0.6,
            Self::Conservative => 0.65,
            Self::Hybrid => 0.8,
            Self::Comprehensive => 0.95,
            Self::Experimental => 0.9,
        }
    }

    /// Inherent risk before effort is taken into account.
    fn base_risk(self) -> f64 {
        match self {
            Self::Simple => 0.15,
            Self::Conservative => 0.10,
            Self::Hybrid => 0.25,
            Self::Comprehensive => 0.45,
            Self::Experimental => 0.70,
        }
    }

    /// How many of `missing` capabilities an approach of this class addresses.
    fn covered(self, missing: usize) -> usize {
        match self {
            Self::Simple => 1,
            Self::Conservative => missing.div_ceil(2),
            Self::Hybrid => missing - missing / 4,
            Self::Comprehensive | Self::Experimental => missing,
        }
        .min(missing)
    }

    fn tradeoffs(self) -> Tradeoffs {
        match self {
            Self::Simple => Tradeoffs {
                pros: &["Fastest to deliver", "Small change surface"],
                cons: &["Addresses only the most pressing capability"],
                risks: &["Follow-up work likely"],
            },
            Self::Comprehensive => Tradeoffs {
                pros: &["Closes the whole gap", "Highest long-term quality"],
                cons: &["Largest effort", "Longest time to first result"],
                risks: &["Scope creep", "Integration breadth"],
            },
            Self::Hybrid => Tradeoffs {
                pros: &["Balances delivery speed and coverage", "Reuses existing assets where possible"],
                cons: &["Leaves a tail of minor capabilities"],
                risks: &["Boundary between reused and new code"],
            },
            Self::Experimental => Tradeoffs {
                pros: &["Potentially large payoff", "Explores new techniques"],
                cons: &["Unproven in this codebase"],
                risks: &["Unknown failure modes", "May need to be discarded"],
            },
            Self::Conservative => Tradeoffs {
                pros: &["Lowest risk", "Extends what already works"],
                cons: &["Partial coverage", "May carry existing limitations forward"],
                risks: &["Inherited technical debt"],
            },
        }
    }
}

struct Tradeoffs {
    pros: &'static [&'static str],
    cons: &'static [&'static str],
    risks: &'static [&'static str],
}

impl fmt::Display for ComplexityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate way to close a gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approach {
    /// Identifier, unique within its gap
    pub id: String,

    /// Gap this approach addresses
    pub gap_id: String,

    /// Complexity class
    pub class: ComplexityClass,

    /// One-line summary
    pub summary: String,

    /// Missing capabilities this approach addresses
    pub covers: Vec<String>,

    /// Projected benefit (0.0 - 1.0)
    pub benefit: f64,

    /// Projected risk (0.0 - 1.0)
    pub risk: f64,

    /// Advantages
    pub pros: Vec<String>,

    /// Disadvantages
    pub cons: Vec<String>,

    /// Known risk factors
    pub risk_factors: Vec<String>,
}

impl Approach {
    /// Benefit-to-risk ratio used for ranking.
    pub fn ratio(&self) -> f64 {
        self.benefit / self.risk.max(f64::EPSILON)
    }
}

/// The ranked alternatives for one gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApproachSet {
    /// Gap the approaches address
    pub gap_id: String,

    /// Approaches, best ratio first
    pub approaches: Vec<Approach>,
}

impl ApproachSet {
    /// The top-ranked approach.
    pub fn recommended(&self) -> Option<&Approach> {
        self.approaches.first()
    }

    /// Find an approach by id.
    pub fn get(&self, id: &str) -> Option<&Approach> {
        self.approaches.iter().find(|a| a.id == id)
    }

    /// Number of approaches.
    pub fn len(&self) -> usize {
        self.approaches.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.approaches.is_empty()
    }
}

/// Produces candidate approaches for gaps.
#[derive(Debug, Clone, Default)]
pub struct ApproachGenerator {
    config: ApproachConfig,
}

impl ApproachGenerator {
    /// Create a generator.
    pub fn new(config: ApproachConfig) -> Self {
        Self { config }
    }

    /// Generate between three and five ranked approaches for `gap`.
    pub fn generate(&self, gap: &Gap) -> Result<ApproachSet> {
        let limit = self.config.max_approaches.clamp(MIN_APPROACHES, MAX_APPROACHES);

        let mut approaches: Vec<Approach> = ComplexityClass::ALL
            .into_iter()
            .filter(|class| self.applicable(*class, gap))
            .map(|class| build(class, gap))
            .collect();

        // Stable sort: equal ratios keep canonical class order.
        approaches.sort_by(|a, b| b.ratio().total_cmp(&a.ratio()));
        approaches.truncate(limit);

        let classes: BTreeSet<ComplexityClass> = approaches.iter().map(|a| a.class).collect();
        if classes.len() != approaches.len() || approaches.len() < MIN_APPROACHES {
            return Err(EngineError::ApproachGeneration {
                gap: gap.objective_id.clone(),
                reason: format!("produced {} approaches", approaches.len()),
            });
        }

        tracing::debug!(
            gap = %gap.objective_id,
            count = approaches.len(),
            recommended = %approaches[0].id,
            "Approaches ranked"
        );

        Ok(ApproachSet { gap_id: gap.objective_id.clone(), approaches })
    }

    fn applicable(&self, class: ComplexityClass, gap: &Gap) -> bool {
        match class {
            ComplexityClass::Experimental => {
                gap.risk_tolerance > self.config.experimental_min_risk_tolerance
            }
            // With a single missing capability there is nothing beyond what
            // the hybrid approach already covers.
            ComplexityClass::Comprehensive => gap.missing.len() > 1,
            _ => true,
        }
    }
}

fn build(class: ComplexityClass, gap: &Gap) -> Approach {
    let missing = gap.missing.len().max(1);
    let covered = class.covered(missing);
    let covers: Vec<String> = gap.missing.iter().take(covered).cloned().collect();
    let fraction = covered as f64 / missing as f64;

    let effort_factor = match gap.effort {
        Effort::Low => 0.8,
        Effort::Medium => 1.0,
        Effort::High => 1.3,
    };

    let benefit = (class.quality() * (0.4 + 0.6 * fraction)).clamp(0.0, 1.0);
    let risk = (class.base_risk() * effort_factor).clamp(0.01, 1.0);

    let tradeoffs = class.tradeoffs();
    let to_strings = |items: &[&str]| items.iter().map(|s| (*s).to_string()).collect::<Vec<_>>();

    Approach {
        id: format!("{}-{}", slugify(&gap.objective_id), class),
        gap_id: gap.objective_id.clone(),
        class,
        summary: format!("{} approach covering {}", capitalize(class.as_str()), covers.join(", ")),
        covers,
        benefit,
        risk,
        pros: to_strings(tradeoffs.pros),
        cons: to_strings(tradeoffs.cons),
        risk_factors: to_strings(tradeoffs.risks),
    }
}

fn slugify(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{GapAnalyzer, Objective};

    fn gap(objective: Objective) -> Gap {
        GapAnalyzer::new().analyze(&[], &[objective]).unwrap().remove(0)
    }

    fn assert_valid(set: &ApproachSet) {
        assert!((MIN_APPROACHES..=MAX_APPROACHES).contains(&set.len()));
        let classes: BTreeSet<_> = set.approaches.iter().map(|a| a.class).collect();
        assert_eq!(classes.len(), set.len(), "duplicate complexity classes");
    }

    #[test]
    fn test_single_capability_gap() {
        let set = ApproachGenerator::default().generate(&gap(Objective::new("auth", 0.8))).unwrap();
        assert_valid(&set);
        assert_eq!(set.len(), 4);
        assert!(set.approaches.iter().all(|a| a.class != ComplexityClass::Comprehensive));
        assert_eq!(set.recommended().unwrap().id, "auth-conservative");
        assert_eq!(set.approaches[1].id, "auth-simple");
    }

    #[test]
    fn test_wide_gap_uses_all_classes() {
        let objective =
            Objective::new("platform", 0.9).requiring(["auth", "billing", "search", "audit", "mfa"]);
        let set = ApproachGenerator::default().generate(&gap(objective)).unwrap();
        assert_valid(&set);
        assert_eq!(set.len(), 5);

        let comprehensive =
            set.approaches.iter().find(|a| a.class == ComplexityClass::Comprehensive).unwrap();
        assert_eq!(comprehensive.covers.len(), 5);
        let simple = set.approaches.iter().find(|a| a.class == ComplexityClass::Simple).unwrap();
        assert_eq!(simple.covers.len(), 1);
        assert!(comprehensive.benefit > simple.benefit);
        assert!(comprehensive.risk > simple.risk);
    }

    #[test]
    fn test_zero_risk_tolerance_skips_experimental() {
        let objective = Objective::new("auth", 0.8).with_risk_tolerance(0.0);
        let set = ApproachGenerator::default().generate(&gap(objective)).unwrap();
        assert_valid(&set);
        assert_eq!(set.len(), 3);
        assert!(set.approaches.iter().all(|a| a.class != ComplexityClass::Experimental));
    }

    #[test]
    fn test_ranked_by_ratio() {
        let objective = Objective::new("search", 0.6).requiring(["index", "query", "ranking"]);
        let set = ApproachGenerator::default().generate(&gap(objective)).unwrap();
        for pair in set.approaches.windows(2) {
            assert!(pair[0].ratio() >= pair[1].ratio());
        }
    }

    #[test]
    fn test_max_approaches_truncates() {
        let generator =
            ApproachGenerator::new(ApproachConfig { max_approaches: 3, ..ApproachConfig::default() });
        let objective =
            Objective::new("platform", 0.9).requiring(["auth", "billing", "search", "audit"]);
        let set = generator.generate(&gap(objective)).unwrap();
        assert_valid(&set);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_approach_ids_are_slugged() {
        let set =
            ApproachGenerator::default().generate(&gap(Objective::new("Rate Limiting", 0.4))).unwrap();
        assert!(set.approaches.iter().all(|a| a.id.starts_with("rate-limiting-")));
        assert!(set.get("rate-limiting-simple").is_some());
    }
}
