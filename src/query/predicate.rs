use crate::doc::context::Document;
use crate::doc::value::DataValue;
use crate::error::QuillError;
use futures::future::LocalBoxFuture;
use std::cmp::Ordering;

/// A pure function from a document to zero or more values: dot-separated
/// path navigation with trailing-array expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    path: String,
}

impl PathExpr {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The indexed-path name this expression corresponds to.
    pub fn get_index_key(&self) -> &str {
        &self.path
    }
}

/// Predicate over a single value, as produced by a path expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ValuePredicate {
    Eq(DataValue),
    Range {
        /// Lower bound and whether it is inclusive.
        min: Option<(DataValue, bool)>,
        /// Upper bound and whether it is inclusive.
        max: Option<(DataValue, bool)>,
    },
}

impl ValuePredicate {
    pub fn gt(value: DataValue) -> Self {
        ValuePredicate::Range {
            min: Some((value, false)),
            max: None,
        }
    }

    pub fn gte(value: DataValue) -> Self {
        ValuePredicate::Range {
            min: Some((value, true)),
            max: None,
        }
    }

    pub fn lt(value: DataValue) -> Self {
        ValuePredicate::Range {
            min: None,
            max: Some((value, false)),
        }
    }

    pub fn lte(value: DataValue) -> Self {
        ValuePredicate::Range {
            min: None,
            max: Some((value, true)),
        }
    }

    pub fn between(min: DataValue, max: DataValue) -> Self {
        ValuePredicate::Range {
            min: Some((min, true)),
            max: Some((max, true)),
        }
    }

    pub fn matches(&self, value: &DataValue) -> bool {
        match self {
            ValuePredicate::Eq(expected) => value.cmp_order(expected) == Ordering::Equal,
            ValuePredicate::Range { min, max } => {
                if let Some((bound, inclusive)) = min {
                    let ord = value.cmp_order(bound);
                    if ord == Ordering::Less || (ord == Ordering::Equal && !inclusive) {
                        return false;
                    }
                }
                if let Some((bound, inclusive)) = max {
                    let ord = value.cmp_order(bound);
                    if ord == Ordering::Greater || (ord == Ordering::Equal && !inclusive) {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Tightest inclusive value range implied by this predicate.
    pub fn value_range(&self) -> (Option<DataValue>, Option<DataValue>) {
        match self {
            ValuePredicate::Eq(value) => (Some(value.clone()), Some(value.clone())),
            ValuePredicate::Range { min, max } => (
                min.as_ref().map(|(v, _)| v.clone()),
                max.as_ref().map(|(v, _)| v.clone()),
            ),
        }
    }

    /// True when the range alone is exact and no residual evaluation is
    /// needed after a range scan.
    pub fn range_is_tight(&self) -> bool {
        match self {
            ValuePredicate::Eq(_) => true,
            ValuePredicate::Range { min, max } => {
                min.as_ref().map(|(_, inclusive)| *inclusive).unwrap_or(true)
                    && max.as_ref().map(|(_, inclusive)| *inclusive).unwrap_or(true)
            }
        }
    }
}

/// Predicate tree over documents.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All,
    None,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    /// Some value produced by `path` satisfies `pred`.
    Any { path: PathExpr, pred: ValuePredicate },
}

impl Predicate {
    pub fn any(path: &str, pred: ValuePredicate) -> Self {
        Predicate::Any {
            path: PathExpr::new(path),
            pred,
        }
    }

    pub fn eq(path: &str, value: DataValue) -> Self {
        Predicate::any(path, ValuePredicate::Eq(value))
    }

    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Flattens nested conjunctions and disjunctions and eliminates
    /// constant terms.
    pub fn simplify(self) -> Predicate {
        match self {
            Predicate::And(terms) => {
                let mut flat = Vec::new();
                for term in terms {
                    match term.simplify() {
                        Predicate::All => {}
                        Predicate::None => return Predicate::None,
                        Predicate::And(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                match flat.len() {
                    0 => Predicate::All,
                    1 => flat.pop().expect("len checked"),
                    _ => Predicate::And(flat),
                }
            }
            Predicate::Or(terms) => {
                let mut flat = Vec::new();
                for term in terms {
                    match term.simplify() {
                        Predicate::None => {}
                        Predicate::All => return Predicate::All,
                        Predicate::Or(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                match flat.len() {
                    0 => Predicate::None,
                    1 => flat.pop().expect("len checked"),
                    _ => Predicate::Or(flat),
                }
            }
            Predicate::Not(inner) => match inner.simplify() {
                Predicate::All => Predicate::None,
                Predicate::None => Predicate::All,
                Predicate::Not(inner) => *inner,
                other => Predicate::Not(Box::new(other)),
            },
            other => other,
        }
    }

    /// Evaluates this predicate against a document. Evaluation reads fields
    /// through the document's transaction, so it is asynchronous.
    pub fn matches<'a>(&'a self, doc: &'a Document) -> LocalBoxFuture<'a, Result<bool, QuillError>> {
        Box::pin(async move {
            match self {
                Predicate::All => Ok(true),
                Predicate::None => Ok(false),
                Predicate::And(terms) => {
                    for term in terms {
                        if !term.matches(doc).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Predicate::Or(terms) => {
                    for term in terms {
                        if term.matches(doc).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Predicate::Not(inner) => Ok(!inner.matches(doc).await?),
                Predicate::Any { path, pred } => {
                    let values = doc.get_path_values(path.path()).await?;
                    Ok(values.iter().any(|value| pred.matches(value)))
                }
            }
        })
    }

    pub fn describe(&self) -> String {
        match self {
            Predicate::All => "all".to_string(),
            Predicate::None => "none".to_string(),
            Predicate::And(terms) => format!(
                "and({})",
                terms.iter().map(Predicate::describe).collect::<Vec<_>>().join(", ")
            ),
            Predicate::Or(terms) => format!(
                "or({})",
                terms.iter().map(Predicate::describe).collect::<Vec<_>>().join(", ")
            ),
            Predicate::Not(inner) => format!("not({})", inner.describe()),
            Predicate::Any { path, pred } => format!("any({}, {pred:?})", path.path()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simplify_flattens_and_eliminates_constants() {
        let pred = Predicate::And(vec![
            Predicate::All,
            Predicate::And(vec![
                Predicate::eq("a", DataValue::Int(1)),
                Predicate::eq("b", DataValue::Int(2)),
            ]),
        ]);
        match pred.simplify() {
            Predicate::And(terms) => assert_eq!(terms.len(), 2),
            other => panic!("expected flattened and, got {other:?}"),
        }

        assert_eq!(
            Predicate::Or(vec![Predicate::None, Predicate::None]).simplify(),
            Predicate::None
        );
        assert_eq!(
            Predicate::And(vec![Predicate::eq("a", DataValue::Int(1)), Predicate::None]).simplify(),
            Predicate::None
        );
        assert_eq!(
            Predicate::Not(Box::new(Predicate::All)).simplify(),
            Predicate::None
        );
    }

    #[test]
    fn eq_range_is_tight_exclusive_bounds_are_not() {
        assert!(ValuePredicate::Eq(DataValue::Int(5)).range_is_tight());
        assert!(ValuePredicate::between(DataValue::Int(1), DataValue::Int(5)).range_is_tight());
        assert!(!ValuePredicate::gt(DataValue::Int(1)).range_is_tight());
        assert!(!ValuePredicate::lt(DataValue::Int(5)).range_is_tight());
    }

    #[test]
    fn range_matches_respect_inclusivity() {
        let gt = ValuePredicate::gt(DataValue::Int(3));
        assert!(!gt.matches(&DataValue::Int(3)));
        assert!(gt.matches(&DataValue::Int(4)));
        let lte = ValuePredicate::lte(DataValue::Int(3));
        assert!(lte.matches(&DataValue::Int(3)));
        assert!(!lte.matches(&DataValue::Int(4)));
    }
}
