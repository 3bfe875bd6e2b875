//! Query optimizer: pick the cheapest index term, leave the rest to a
//! residual filter.
//!
//! The predicate is split into AND-terms. Each term whose field has an
//! index gets a cost (unique equality wins, full scans lose); the cheapest
//! term becomes the index operation and every other term is re-checked
//! against the loaded documents. Without any usable term the plan falls
//! back to a full scan, preferring an index that matches the requested
//! order (skipping the sort stage) over the primary key.

use std::cmp::Ordering as CmpOrdering;

use solodb_common::{Result, SoloError, Value};

use super::{FieldPredicate, Order, Query};
use crate::storage::{CollectionIndex, CollectionPage};

/// The index-stage operation of a plan.
#[derive(Clone)]
pub enum IndexOp {
    /// Seek one key (plus its duplicates on a non-unique index).
    Equals(Value),
    /// Ordered range walk; bounds carry their inclusivity.
    Range {
        start: Option<(Value, bool)>,
        end: Option<(Value, bool)>,
    },
    /// One deduplicated seek per value.
    In(Vec<Value>),
    /// Prefix seek plus prefix re-check.
    Like(String),
    /// Ordered full scan.
    All,
    /// Full scan filtered by a key predicate (the second field is the
    /// explain text).
    Scan(FieldPredicate, String),
}

/// Where a plan's index stage runs.
pub enum PlanSource {
    Index {
        index: CollectionIndex,
        op: IndexOp,
    },
    /// Or-query: union of sub-plans, deduplicated by document.
    Union(Vec<QueryPlan>),
}

/// An executable query plan.
pub struct QueryPlan {
    pub source: PlanSource,
    /// Terms re-checked against each loaded document.
    pub residual: Vec<Query>,
    /// Explicit sort stage, when the index order does not cover it.
    pub sort: Option<(String, Order)>,
    /// Index scan direction.
    pub order: Order,
}

impl QueryPlan {
    /// Human-readable plan description (diagnostic only).
    pub fn explain(&self) -> String {
        let mut text = match &self.source {
            PlanSource::Index { index, op } => match op {
                IndexOp::Equals(value) => {
                    let unique = if index.unique { " UNIQUE" } else { "" };
                    format!(
                        "INDEX SEEK \"{}\" ({} = {}){}",
                        index.name, index.field, value, unique
                    )
                }
                IndexOp::Range { start, end } => {
                    let mut bounds = Vec::new();
                    if let Some((v, incl)) = start {
                        bounds.push(format!("{} >{} {}", index.field, incl_eq(*incl), v));
                    }
                    if let Some((v, incl)) = end {
                        bounds.push(format!("{} <{} {}", index.field, incl_eq(*incl), v));
                    }
                    format!("INDEX RANGE \"{}\" ({})", index.name, bounds.join(" AND "))
                }
                IndexOp::In(values) => format!(
                    "INDEX IN \"{}\" ({} IN {} values)",
                    index.name,
                    index.field,
                    values.len()
                ),
                IndexOp::Like(prefix) => format!(
                    "INDEX LIKE \"{}\" ({} STARTSWITH \"{}\")",
                    index.name, index.field, prefix
                ),
                IndexOp::All => {
                    let dir = match self.order {
                        Order::Ascending => "",
                        Order::Descending => " DESC",
                    };
                    format!("INDEX FULL SCAN \"{}\"{}", index.name, dir)
                }
                IndexOp::Scan(_, descr) => {
                    format!("INDEX SCAN \"{}\" ({})", index.name, descr)
                }
            },
            PlanSource::Union(plans) => {
                let parts: Vec<String> = plans.iter().map(|p| p.explain()).collect();
                format!("UNION({})", parts.join("; "))
            }
        };

        if !self.residual.is_empty() {
            let parts: Vec<String> = self.residual.iter().map(|q| q.describe()).collect();
            text.push_str(&format!(" + FILTER ({})", parts.join(" AND ")));
        }
        if let Some((field, order)) = &self.sort {
            let dir = match order {
                Order::Ascending => "ASC",
                Order::Descending => "DESC",
            };
            text.push_str(&format!(" + SORT ({field} {dir})"));
        }
        text
    }
}

fn incl_eq(include: bool) -> &'static str {
    if include {
        "="
    } else {
        ""
    }
}

/// Relative cost of serving a term through an index; lower wins.
fn term_cost(term: &Query, index: &CollectionIndex) -> u32 {
    match term {
        Query::Eq { .. } => {
            if index.unique {
                1
            } else {
                10
            }
        }
        Query::In { .. } => 20,
        Query::StartsWith { .. } => 40,
        Query::Gt { .. } | Query::Lt { .. } | Query::Between { .. } => 50,
        Query::NotEq { .. } => 80,
        _ => 100,
    }
}

/// Compile a term into the index operation it drives.
fn term_op(term: &Query) -> IndexOp {
    match term {
        Query::Eq { value, .. } => IndexOp::Equals(value.clone()),
        Query::Gt { value, include, .. } => IndexOp::Range {
            start: Some((value.clone(), *include)),
            end: None,
        },
        Query::Lt { value, include, .. } => IndexOp::Range {
            start: None,
            end: Some((value.clone(), *include)),
        },
        Query::Between { start, end, .. } => IndexOp::Range {
            start: Some((start.clone(), true)),
            end: Some((end.clone(), true)),
        },
        Query::In { values, .. } => {
            // Deduplicate and sort so seeks run in key order
            let mut values = values.clone();
            values.sort_by(|a, b| a.compare(b));
            values.dedup_by(|a, b| a.compare(b) == CmpOrdering::Equal);
            IndexOp::In(values)
        }
        Query::StartsWith { prefix, .. } => IndexOp::Like(prefix.clone()),
        Query::NotEq { value, .. } => {
            let value = value.clone();
            let descr = format!("key != {value}");
            IndexOp::Scan(
                std::sync::Arc::new(move |v: &Value| v.compare(&value) != CmpOrdering::Equal),
                descr,
            )
        }
        Query::Contains { fragment, .. } => {
            let fragment = fragment.clone();
            let descr = format!("key CONTAINS \"{fragment}\"");
            IndexOp::Scan(
                std::sync::Arc::new(move |v: &Value| {
                    v.as_str().is_some_and(|s| s.contains(fragment.as_str()))
                }),
                descr,
            )
        }
        Query::Where { predicate, .. } => {
            IndexOp::Scan(predicate.clone(), "key <predicate>".into())
        }
        // Non-leaf terms never reach here
        Query::All | Query::And(..) | Query::Or(..) => IndexOp::All,
    }
}

/// Does scanning this operation already deliver index order?
fn op_preserves_order(op: &IndexOp) -> bool {
    matches!(
        op,
        IndexOp::Equals(_) | IndexOp::Range { .. } | IndexOp::All | IndexOp::Scan(..)
    )
}

/// Split a predicate into AND-terms. `Or` stays a single (non-indexable)
/// unit handled by a union plan at the top level only.
fn split_and(query: &Query, terms: &mut Vec<Query>) {
    match query {
        Query::And(left, right) => {
            split_and(left, terms);
            split_and(right, terms);
        }
        Query::All => {}
        other => terms.push(other.clone()),
    }
}

/// Build the execution plan for a query against one collection.
pub fn optimize(
    col: &CollectionPage,
    query: &Query,
    order_by: Option<(&str, Order)>,
) -> Result<QueryPlan> {
    // Top-level Or becomes a union of independent plans; the union's output
    // has no usable order, so any requested sort stays explicit.
    if let Query::Or(left, right) = query {
        let plans = vec![optimize(col, left, None)?, optimize(col, right, None)?];
        return Ok(QueryPlan {
            source: PlanSource::Union(plans),
            residual: Vec::new(),
            sort: order_by.map(|(f, o)| (f.to_string(), o)),
            order: Order::Ascending,
        });
    }

    let mut terms = Vec::new();
    split_and(query, &mut terms);

    // Cheapest term with an index on its field wins
    let mut best: Option<(usize, u32, CollectionIndex)> = None;
    for (i, term) in terms.iter().enumerate() {
        let Some(field) = term.leaf_field() else {
            continue;
        };
        let Some(index) = col.index_by_field(field) else {
            continue;
        };
        let cost = term_cost(term, index);
        if best.as_ref().map_or(true, |(_, c, _)| cost < *c) {
            best = Some((i, cost, index.clone()));
        }
    }

    let requested_order = order_by.map(|(_, o)| o).unwrap_or(Order::Ascending);

    if let Some((chosen, _, index)) = best {
        let op = term_op(&terms[chosen]);
        let residual: Vec<Query> = terms
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != chosen)
            .map(|(_, t)| t.clone())
            .collect();

        // The index covers the sort when it is on the sort field and the
        // operation walks in key order
        let sort = match order_by {
            Some((field, order)) => {
                if field == index.field && op_preserves_order(&op) {
                    None
                } else {
                    Some((field.to_string(), order))
                }
            }
            None => None,
        };
        let order = if sort.is_none() {
            requested_order
        } else {
            Order::Ascending
        };

        return Ok(QueryPlan {
            source: PlanSource::Index { index, op },
            residual,
            sort,
            order,
        });
    }

    // No indexable term: prefer a full scan over an index that matches the
    // requested order, else the primary key
    if let Some((field, order)) = order_by {
        if let Some(index) = col.index_by_field(field) {
            return Ok(QueryPlan {
                source: PlanSource::Index {
                    index: index.clone(),
                    op: IndexOp::All,
                },
                residual: terms,
                sort: None,
                order,
            });
        }
    }

    let pk = col.pk_index().map_err(|_| {
        SoloError::Corrupted(format!(
            "collection \"{}\" has no primary-key index",
            col.name
        ))
    })?;

    Ok(QueryPlan {
        source: PlanSource::Index {
            index: pk.clone(),
            op: IndexOp::All,
        },
        residual: terms,
        sort: order_by.map(|(f, o)| (f.to_string(), o)),
        order: Order::Ascending,
    })
}
