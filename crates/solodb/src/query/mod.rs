//! Query expression trees and their evaluation against documents.
//!
//! Queries arrive here already parsed (building them from text is a
//! front-end concern). A [`Query`] describes a predicate over document
//! fields; the optimizer turns it into an index plan and the executor
//! drives that plan as a lazy pipeline.

pub mod cursor;
pub mod optimizer;

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use solodb_common::{Document, Value};

pub use crate::index::Order;
pub use cursor::FindCursor;
pub use optimizer::{optimize, IndexOp, PlanSource, QueryPlan};

/// Predicate function used by [`Query::filter`] terms.
pub type FieldPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A parsed query predicate over one collection.
#[derive(Clone)]
pub enum Query {
    /// Every document.
    All,
    Eq {
        field: String,
        value: Value,
    },
    Gt {
        field: String,
        value: Value,
        include: bool,
    },
    Lt {
        field: String,
        value: Value,
        include: bool,
    },
    Between {
        field: String,
        start: Value,
        end: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    StartsWith {
        field: String,
        prefix: String,
    },
    Contains {
        field: String,
        fragment: String,
    },
    NotEq {
        field: String,
        value: Value,
    },
    /// Arbitrary predicate over one field's value.
    Where {
        field: String,
        predicate: FieldPredicate,
    },
    And(Box<Query>, Box<Query>),
    Or(Box<Query>, Box<Query>),
}

impl Query {
    pub fn all() -> Query {
        Query::All
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Query {
        Query::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Query {
        Query::Gt {
            field: field.into(),
            value: value.into(),
            include: false,
        }
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Query {
        Query::Gt {
            field: field.into(),
            value: value.into(),
            include: true,
        }
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Query {
        Query::Lt {
            field: field.into(),
            value: value.into(),
            include: false,
        }
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Query {
        Query::Lt {
            field: field.into(),
            value: value.into(),
            include: true,
        }
    }

    /// Inclusive range `start <= field <= end`.
    pub fn between(
        field: impl Into<String>,
        start: impl Into<Value>,
        end: impl Into<Value>,
    ) -> Query {
        Query::Between {
            field: field.into(),
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Query {
        Query::In {
            field: field.into(),
            values,
        }
    }

    pub fn starts_with(field: impl Into<String>, prefix: impl Into<String>) -> Query {
        Query::StartsWith {
            field: field.into(),
            prefix: prefix.into(),
        }
    }

    pub fn contains(field: impl Into<String>, fragment: impl Into<String>) -> Query {
        Query::Contains {
            field: field.into(),
            fragment: fragment.into(),
        }
    }

    pub fn not_eq(field: impl Into<String>, value: impl Into<Value>) -> Query {
        Query::NotEq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn filter(
        field: impl Into<String>,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Query {
        Query::Where {
            field: field.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn and(left: Query, right: Query) -> Query {
        Query::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Query, right: Query) -> Query {
        Query::Or(Box::new(left), Box::new(right))
    }

    /// Evaluate the predicate against a document (residual filtering).
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Query::All => true,
            Query::Eq { field, value } => {
                doc.get_path(field).compare(value) == CmpOrdering::Equal
            }
            Query::Gt {
                field,
                value,
                include,
            } => match doc.get_path(field).compare(value) {
                CmpOrdering::Greater => true,
                CmpOrdering::Equal => *include,
                CmpOrdering::Less => false,
            },
            Query::Lt {
                field,
                value,
                include,
            } => match doc.get_path(field).compare(value) {
                CmpOrdering::Less => true,
                CmpOrdering::Equal => *include,
                CmpOrdering::Greater => false,
            },
            Query::Between { field, start, end } => {
                let v = doc.get_path(field);
                v.compare(start) != CmpOrdering::Less && v.compare(end) != CmpOrdering::Greater
            }
            Query::In { field, values } => {
                let v = doc.get_path(field);
                values.iter().any(|x| v.compare(x) == CmpOrdering::Equal)
            }
            Query::StartsWith { field, prefix } => doc
                .get_path(field)
                .as_str()
                .is_some_and(|s| s.starts_with(prefix.as_str())),
            Query::Contains { field, fragment } => doc
                .get_path(field)
                .as_str()
                .is_some_and(|s| s.contains(fragment.as_str())),
            Query::NotEq { field, value } => {
                doc.get_path(field).compare(value) != CmpOrdering::Equal
            }
            Query::Where { field, predicate } => predicate(doc.get_path(field)),
            Query::And(left, right) => left.matches(doc) && right.matches(doc),
            Query::Or(left, right) => left.matches(doc) || right.matches(doc),
        }
    }

    /// The single field this term constrains, if it is an indexable leaf.
    pub(crate) fn leaf_field(&self) -> Option<&str> {
        match self {
            Query::Eq { field, .. }
            | Query::Gt { field, .. }
            | Query::Lt { field, .. }
            | Query::Between { field, .. }
            | Query::In { field, .. }
            | Query::StartsWith { field, .. }
            | Query::Contains { field, .. }
            | Query::NotEq { field, .. }
            | Query::Where { field, .. } => Some(field),
            Query::All | Query::And(..) | Query::Or(..) => None,
        }
    }

    /// Short predicate text for explain output.
    pub(crate) fn describe(&self) -> String {
        match self {
            Query::All => "all".into(),
            Query::Eq { field, value } => format!("{field} = {value}"),
            Query::Gt {
                field,
                value,
                include,
            } => format!("{field} >{} {value}", if *include { "=" } else { "" }),
            Query::Lt {
                field,
                value,
                include,
            } => format!("{field} <{} {value}", if *include { "=" } else { "" }),
            Query::Between { field, start, end } => {
                format!("{field} BETWEEN {start} AND {end}")
            }
            Query::In { field, values } => format!("{field} IN {} values", values.len()),
            Query::StartsWith { field, prefix } => {
                format!("{field} STARTSWITH \"{prefix}\"")
            }
            Query::Contains { field, fragment } => {
                format!("{field} CONTAINS \"{fragment}\"")
            }
            Query::NotEq { field, value } => format!("{field} != {value}"),
            Query::Where { field, .. } => format!("{field} WHERE <predicate>"),
            Query::And(left, right) => format!("{} AND {}", left.describe(), right.describe()),
            Query::Or(left, right) => format!("{} OR {}", left.describe(), right.describe()),
        }
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query({})", self.describe())
    }
}

/// Options applied after the predicate: ordering, paging and projection.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Sort the results by this field. Satisfied by the chosen index when
    /// possible, otherwise by an explicit sort stage.
    pub order_by: Option<(String, Order)>,
    /// Skip this many matching documents.
    pub skip: usize,
    /// Stop after this many documents.
    pub limit: Option<usize>,
    /// Keep only these fields in returned documents.
    pub projection: Option<Vec<String>>,
}

impl FindOptions {
    pub fn order_by(field: impl Into<String>, order: Order) -> Self {
        Self {
            order_by: Some((field.into(), order)),
            ..Self::default()
        }
    }
}
