//! Derived fields and cross-field plausibility checks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::FieldValue;

/// A field computed from two extracted ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DerivedField {
    /// `numerator / denominator`, both annualized first.
    Ratio {
        name: String,
        numerator: String,
        denominator: String,
    },
}

impl DerivedField {
    pub fn ratio(name: impl Into<String>, numerator: impl Into<String>, denominator: impl Into<String>) -> Self {
        DerivedField::Ratio {
            name: name.into(),
            numerator: numerator.into(),
            denominator: denominator.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DerivedField::Ratio { name, .. } => name,
        }
    }

    pub fn compute(&self, fields: &BTreeMap<String, FieldValue>) -> Option<FieldValue> {
        match self {
            DerivedField::Ratio {
                numerator,
                denominator,
                ..
            } => {
                let top = fields.get(numerator)?.annualized()?;
                let bottom = fields.get(denominator)?.annualized()?;
                (bottom.abs() > f64::EPSILON).then(|| FieldValue::Number(top / bottom))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipCheck {
    Passed,
    Failed,
    /// A field the relationship needs is missing.
    NotApplicable,
}

/// A constraint between fields of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Relationship {
    /// `min <= numerator / denominator <= max` on annualized values.
    RatioWithin {
        numerator: String,
        denominator: String,
        min: f64,
        max: f64,
    },
    /// `field <= bound * factor` on annualized values.
    AtMost { field: String, bound: String, factor: f64 },
    /// `min <= field <= max`, typically on a derived field.
    Within { field: String, min: f64, max: f64 },
}

impl Relationship {
    pub fn ratio_within(numerator: impl Into<String>, denominator: impl Into<String>, min: f64, max: f64) -> Self {
        Relationship::RatioWithin {
            numerator: numerator.into(),
            denominator: denominator.into(),
            min,
            max,
        }
    }

    pub fn at_most(field: impl Into<String>, bound: impl Into<String>, factor: f64) -> Self {
        Relationship::AtMost {
            field: field.into(),
            bound: bound.into(),
            factor,
        }
    }

    pub fn within(field: impl Into<String>, min: f64, max: f64) -> Self {
        Relationship::Within {
            field: field.into(),
            min,
            max,
        }
    }

    pub fn check(&self, fields: &BTreeMap<String, FieldValue>) -> RelationshipCheck {
        let value = |name: &str| fields.get(name).and_then(FieldValue::annualized);
        let verdict = |ok: bool| {
            if ok {
                RelationshipCheck::Passed
            } else {
                RelationshipCheck::Failed
            }
        };
        match self {
            Relationship::RatioWithin {
                numerator,
                denominator,
                min,
                max,
            } => match (value(numerator), value(denominator)) {
                (Some(_), Some(bottom)) if bottom.abs() <= f64::EPSILON => RelationshipCheck::Failed,
                (Some(top), Some(bottom)) => verdict((*min..=*max).contains(&(top / bottom))),
                _ => RelationshipCheck::NotApplicable,
            },
            Relationship::AtMost { field, bound, factor } => match (value(field), value(bound)) {
                (Some(field), Some(bound)) => verdict(field <= bound * factor),
                _ => RelationshipCheck::NotApplicable,
            },
            Relationship::Within { field, min, max } => match value(field) {
                Some(field) => verdict((*min..=*max).contains(&field)),
                None => RelationshipCheck::NotApplicable,
            },
        }
    }
}
