//! Pipelined query execution.
//!
//! A plan runs as a chain of lazy stages: the index stage emits nodes in
//! key order, the lookup stage loads each node's document, the residual
//! filter re-checks the remaining terms, an optional sort stage (the only
//! one that materializes) reorders, and skip/limit/projection trim the
//! stream. The whole query is a single forward iterator; long scans
//! checkpoint the page cache periodically so they cannot grow it without
//! bound.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use solodb_common::{Document, Result, Value};

use super::optimizer::{IndexOp, PlanSource, QueryPlan};
use super::{Order, Query};
use crate::data::DataService;
use crate::index::IndexService;
use crate::storage::{CollectionIndex, IndexNode, PageAddress, PagerService, TransactionService};

/// How many emitted nodes between cache checkpoints during a scan.
const CHECKPOINT_INTERVAL: usize = 128;

// Index stage

enum CursorState {
    Init,
    At(IndexNode),
    Done,
}

/// Lazy node stream for one index operation.
pub(crate) struct IndexCursor {
    index: CollectionIndex,
    op: IndexOp,
    order: Order,
    state: CursorState,
    /// Current value for `IndexOp::In`.
    value_idx: usize,
}

impl IndexCursor {
    pub(crate) fn new(index: CollectionIndex, op: IndexOp, order: Order) -> Self {
        Self {
            index,
            op,
            order,
            state: CursorState::Init,
            value_idx: 0,
        }
    }

    /// Emit the next node in scan order, or None when exhausted.
    pub(crate) fn next(&mut self, svc: &IndexService) -> Result<Option<IndexNode>> {
        loop {
            let candidate = match std::mem::replace(&mut self.state, CursorState::Done) {
                CursorState::Done => return Ok(None),
                CursorState::Init => self.seek(svc)?,
                CursorState::At(node) => self.advance(svc, &node)?,
            };

            match candidate {
                Step::Emit(node) => {
                    self.state = CursorState::At(node.clone());
                    return Ok(Some(node));
                }
                Step::Skip(node) => {
                    self.state = CursorState::At(node);
                }
                Step::NextValue => {
                    self.value_idx += 1;
                    self.state = CursorState::Init;
                }
                Step::Stop => return Ok(None),
            }
        }
    }

    /// Position on the first candidate node.
    fn seek(&mut self, svc: &IndexService) -> Result<Step> {
        let step = match &self.op {
            IndexOp::Equals(value) => match svc.find(&self.index, value, false, Order::Ascending)? {
                Some(node) => Step::Emit(node),
                None => Step::Stop,
            },
            IndexOp::In(values) => match values.get(self.value_idx) {
                None => Step::Stop,
                Some(value) => match svc.find(&self.index, value, false, Order::Ascending)? {
                    Some(node) => Step::Emit(node),
                    None => Step::NextValue,
                },
            },
            IndexOp::Range { start, end } => {
                let (lead, lead_order) = match self.order {
                    Order::Ascending => (start, Order::Ascending),
                    Order::Descending => (end, Order::Descending),
                };
                let first = match lead {
                    None => svc.first(&self.index, lead_order)?,
                    Some((value, include)) => {
                        let mut node = svc.find(&self.index, value, true, lead_order)?;
                        if !include {
                            // Exclusive bound: step over the equal run
                            while let Some(n) = node.take() {
                                if n.key.compare(value) == CmpOrdering::Equal {
                                    node = svc.sibling(&n, lead_order)?;
                                } else {
                                    node = Some(n);
                                    break;
                                }
                            }
                        }
                        node
                    }
                };
                match first {
                    Some(node) if self.range_contains(&node.key) => Step::Emit(node),
                    _ => Step::Stop,
                }
            }
            IndexOp::Like(prefix) => {
                let probe = Value::String(prefix.clone());
                match svc.find(&self.index, &probe, true, Order::Ascending)? {
                    Some(node) => Self::like_step(prefix, node),
                    None => Step::Stop,
                }
            }
            IndexOp::All => match svc.first(&self.index, self.order)? {
                Some(node) => Step::Emit(node),
                None => Step::Stop,
            },
            IndexOp::Scan(predicate, _) => match svc.first(&self.index, self.order)? {
                Some(node) => {
                    if predicate(&node.key) {
                        Step::Emit(node)
                    } else {
                        Step::Skip(node)
                    }
                }
                None => Step::Stop,
            },
        };
        Ok(step)
    }

    /// Move one node onward from the current position.
    fn advance(&mut self, svc: &IndexService, current: &IndexNode) -> Result<Step> {
        let step = match &self.op {
            IndexOp::Equals(value) => match svc.sibling(current, Order::Ascending)? {
                Some(node) if node.key.compare(value) == CmpOrdering::Equal => Step::Emit(node),
                _ => Step::Stop,
            },
            IndexOp::In(values) => {
                let value = &values[self.value_idx];
                match svc.sibling(current, Order::Ascending)? {
                    Some(node) if node.key.compare(value) == CmpOrdering::Equal => Step::Emit(node),
                    _ => Step::NextValue,
                }
            }
            IndexOp::Range { .. } => match svc.sibling(current, self.order)? {
                Some(node) if self.range_contains(&node.key) => Step::Emit(node),
                _ => Step::Stop,
            },
            IndexOp::Like(prefix) => match svc.sibling(current, Order::Ascending)? {
                Some(node) => Self::like_step(prefix, node),
                None => Step::Stop,
            },
            IndexOp::All => match svc.sibling(current, self.order)? {
                Some(node) => Step::Emit(node),
                None => Step::Stop,
            },
            IndexOp::Scan(predicate, _) => match svc.sibling(current, self.order)? {
                Some(node) => {
                    if predicate(&node.key) {
                        Step::Emit(node)
                    } else {
                        Step::Skip(node)
                    }
                }
                None => Step::Stop,
            },
        };
        Ok(step)
    }

    /// Is a key inside the range's far bound (scan-direction aware)?
    fn range_contains(&self, key: &Value) -> bool {
        let IndexOp::Range { start, end } = &self.op else {
            return true;
        };
        let bound = match self.order {
            Order::Ascending => end,
            Order::Descending => start,
        };
        match bound {
            None => !key.is_sentinel(),
            Some((value, include)) => match (key.compare(value), self.order) {
                (CmpOrdering::Equal, _) => *include,
                (CmpOrdering::Less, Order::Ascending) => true,
                (CmpOrdering::Greater, Order::Descending) => true,
                _ => false,
            },
        }
    }

    /// Keys are sorted, so the prefix region is contiguous: emit matches,
    /// stop at the first string past the prefix or at any later-ranked type.
    fn like_step(prefix: &str, node: IndexNode) -> Step {
        match node.key.as_str() {
            Some(s) if s.starts_with(prefix) => Step::Emit(node),
            Some(s) if s > prefix => Step::Stop,
            Some(_) => Step::Skip(node),
            None => Step::Stop,
        }
    }
}

enum Step {
    Emit(IndexNode),
    Skip(IndexNode),
    NextValue,
    Stop,
}

// Document stages

/// One index branch with its residual terms (plans have several under a
/// union source).
struct Branch {
    cursor: IndexCursor,
    residual: Vec<Query>,
}

/// Drives a plan's branches, loads documents and applies residual filters.
pub(crate) struct PlanExecutor {
    branches: Vec<Branch>,
    current: usize,
    /// Dedup by first data block across union branches.
    seen: Option<HashSet<PageAddress>>,
}

impl PlanExecutor {
    pub(crate) fn new(plan: QueryPlan) -> Self {
        let mut branches = Vec::new();
        Self::flatten(plan, &mut branches);
        let seen = (branches.len() > 1).then(HashSet::new);
        Self {
            branches,
            current: 0,
            seen,
        }
    }

    fn flatten(plan: QueryPlan, out: &mut Vec<Branch>) {
        match plan.source {
            PlanSource::Index { index, op } => out.push(Branch {
                cursor: IndexCursor::new(index, op, plan.order),
                residual: plan.residual,
            }),
            PlanSource::Union(subplans) => {
                for sub in subplans {
                    Self::flatten(sub, out);
                }
            }
        }
    }

    /// Whether counting can skip document loads entirely.
    pub(crate) fn key_only(&self) -> bool {
        self.branches.iter().all(|b| b.residual.is_empty())
    }

    /// Next index node passing the union dedup, document not yet loaded.
    pub(crate) fn next_node(&mut self, svc: &IndexService) -> Result<Option<IndexNode>> {
        loop {
            let Some(branch) = self.branches.get_mut(self.current) else {
                return Ok(None);
            };
            match branch.cursor.next(svc)? {
                None => self.current += 1,
                Some(node) => {
                    if let Some(seen) = &mut self.seen {
                        if !seen.insert(node.data_block) {
                            continue;
                        }
                    }
                    return Ok(Some(node));
                }
            }
        }
    }

    /// Next document passing the current branch's residual filter.
    pub(crate) fn next_doc(
        &mut self,
        svc: &IndexService,
        data: &DataService,
    ) -> Result<Option<Document>> {
        loop {
            let Some(node) = self.next_node(svc)? else {
                return Ok(None);
            };

            let bytes = data.read(node.data_block)?;
            let doc = Document::from_bytes(&bytes)?;

            // next_node leaves `current` on the branch that emitted
            let residual = &self.branches[self.current].residual;
            if residual.iter().all(|q| q.matches(&doc)) {
                return Ok(Some(doc));
            }
        }
    }
}

// Public cursor

enum CursorSource {
    /// Lazy stream straight off the pipeline.
    Stream(PlanExecutor),
    /// Materialized by the sort stage.
    Sorted(std::vec::IntoIter<Document>),
    /// Collection does not exist.
    Empty,
}

/// Lazily yields the documents matching a query. Holds the shared lock
/// until dropped.
pub struct FindCursor<'a> {
    trans: &'a TransactionService,
    owns_lock: bool,
    pager: &'a PagerService,
    rng: &'a Mutex<StdRng>,
    source: CursorSource,
    skip: usize,
    limit: Option<usize>,
    projection: Option<Vec<String>>,
    scanned: usize,
    done: bool,
}

impl<'a> FindCursor<'a> {
    pub(crate) fn new(
        trans: &'a TransactionService,
        owns_lock: bool,
        pager: &'a PagerService,
        rng: &'a Mutex<StdRng>,
        plan: Option<QueryPlan>,
        skip: usize,
        limit: Option<usize>,
        projection: Option<Vec<String>>,
    ) -> Result<Self> {
        let source = match plan {
            None => CursorSource::Empty,
            Some(plan) => {
                let sort = plan.sort.clone();
                let mut exec = PlanExecutor::new(plan);
                match sort {
                    None => CursorSource::Stream(exec),
                    Some((field, order)) => {
                        // The one materializing stage: drain, then reorder
                        let svc = IndexService::new(pager, rng);
                        let data = DataService::new(pager);
                        let mut docs = Vec::new();
                        let mut scanned = 0usize;
                        while let Some(doc) = exec.next_doc(&svc, &data)? {
                            docs.push(doc);
                            scanned += 1;
                            if scanned % CHECKPOINT_INTERVAL == 0 {
                                trans.read_checkpoint();
                            }
                        }
                        docs.sort_by(|a, b| {
                            let ord = a.get_path(&field).compare(b.get_path(&field));
                            match order {
                                Order::Ascending => ord,
                                Order::Descending => ord.reverse(),
                            }
                        });
                        CursorSource::Sorted(docs.into_iter())
                    }
                }
            }
        };

        Ok(Self {
            trans,
            owns_lock,
            pager,
            rng,
            source,
            skip,
            limit,
            projection,
            scanned: 0,
            done: false,
        })
    }

    fn next_unpaged(&mut self) -> Result<Option<Document>> {
        match &mut self.source {
            CursorSource::Empty => Ok(None),
            CursorSource::Sorted(iter) => Ok(iter.next()),
            CursorSource::Stream(exec) => {
                let svc = IndexService::new(self.pager, self.rng);
                let data = DataService::new(self.pager);
                exec.next_doc(&svc, &data)
            }
        }
    }

    fn project(&self, mut doc: Document) -> Document {
        match &self.projection {
            None => doc,
            Some(fields) => {
                let mut out = Document::new();
                for field in fields {
                    if let Some(value) = doc.remove(field) {
                        out.set(field.clone(), value);
                    }
                }
                out
            }
        }
    }
}

impl Iterator for FindCursor<'_> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            let doc = match self.next_unpaged() {
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Ok(Some(doc)) => doc,
            };

            self.scanned += 1;
            if self.scanned % CHECKPOINT_INTERVAL == 0 {
                self.trans.read_checkpoint();
            }

            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            if let Some(limit) = &mut self.limit {
                if *limit == 0 {
                    self.done = true;
                    return None;
                }
                *limit -= 1;
            }

            return Some(Ok(self.project(doc)));
        }
    }
}

impl Drop for FindCursor<'_> {
    fn drop(&mut self) {
        self.trans.exit_read(self.owns_lock);
    }
}
