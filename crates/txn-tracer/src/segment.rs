// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The call tree of one transaction.
//!
//! While the transaction runs, segments live in an arena ([`SegmentTree`])
//! and follow a stack discipline: a new segment is a child of the innermost
//! open one. [`SegmentTree::finalize`] turns the arena into an owned,
//! immutable [`Segment`] tree whose children are ordered by start time.

use crate::attributes::{AttributeMap, TypedScalar};
use crate::errors::TracerError;
use std::time::Duration;
use tracing::{debug, warn};

/// Identifies an open segment within its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentHandle(usize);

impl SegmentHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DatastoreSegment {
    pub product: String,
    pub collection: Option<String>,
    pub operation: String,
    pub query: Option<String>,
    pub host: Option<String>,
    pub port_path_or_id: Option<String>,
    pub database_name: Option<String>,
}

impl DatastoreSegment {
    pub fn statement_metric(&self) -> Option<String> {
        self.collection.as_ref().map(|collection| {
            format!(
                "Datastore/statement/{}/{}/{}",
                self.product, collection, self.operation
            )
        })
    }

    pub fn operation_metric(&self) -> String {
        format!("Datastore/operation/{}/{}", self.product, self.operation)
    }

    /// The most specific metric name, which is also the segment name.
    pub fn metric_name(&self) -> String {
        self.statement_metric()
            .unwrap_or_else(|| self.operation_metric())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExternalSegment {
    pub host: String,
    pub method: Option<String>,
    pub uri: String,
}

impl ExternalSegment {
    pub fn metric_name(&self) -> String {
        format!("External/{}/all", self.host)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SegmentKind {
    #[default]
    Generic,
    Datastore(DatastoreSegment),
    External(ExternalSegment),
}

#[derive(Debug)]
struct Node {
    name: String,
    kind: SegmentKind,
    start: Duration,
    stop: Option<Duration>,
    attributes: AttributeMap,
    children: Vec<usize>,
}

/// Mutable segment arena for a running transaction.
#[derive(Debug)]
pub struct SegmentTree {
    nodes: Vec<Node>,
    stack: Vec<usize>,
    finalized: bool,
    soft_errors: u64,
}

const ROOT: usize = 0;

impl SegmentTree {
    pub fn new(root_name: &str) -> Self {
        Self {
            nodes: vec![Node {
                name: root_name.to_owned(),
                kind: SegmentKind::Generic,
                start: Duration::ZERO,
                stop: None,
                attributes: AttributeMap::new(),
                children: Vec::new(),
            }],
            stack: vec![ROOT],
            finalized: false,
            soft_errors: 0,
        }
    }

    pub fn root(&self) -> SegmentHandle {
        SegmentHandle(ROOT)
    }

    /// The innermost open segment.
    pub fn current(&self) -> SegmentHandle {
        SegmentHandle(self.stack.last().copied().unwrap_or(ROOT))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn soft_errors(&self) -> u64 {
        self.soft_errors
    }

    /// Opens a child of the innermost open segment at offset `now`.
    pub fn start_segment(
        &mut self,
        name: &str,
        kind: SegmentKind,
        now: Duration,
    ) -> Result<SegmentHandle, TracerError> {
        if self.finalized {
            self.soft_errors += 1;
            return Err(TracerError::TreeFinalized);
        }
        let parent = self.current().0;
        let start = now.max(self.nodes[parent].start);
        let index = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_owned(),
            kind,
            start,
            stop: None,
            attributes: AttributeMap::new(),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(index);
        self.stack.push(index);
        Ok(SegmentHandle(index))
    }

    /// Stops a segment at offset `now` and merges `attributes` into it.
    ///
    /// Segments opened after `handle` that are still running are closed at
    /// the same instant, so a child never outlives its parent.
    pub fn stop_segment(
        &mut self,
        handle: SegmentHandle,
        attributes: AttributeMap,
        now: Duration,
    ) -> Result<(), TracerError> {
        let result = self.try_stop(handle, attributes, now);
        if let Err(err) = &result {
            self.soft_errors += 1;
            debug!("ignoring stop of segment {}: {err}", handle.0);
        }
        result
    }

    fn try_stop(
        &mut self,
        handle: SegmentHandle,
        attributes: AttributeMap,
        now: Duration,
    ) -> Result<(), TracerError> {
        if self.finalized {
            return Err(TracerError::TreeFinalized);
        }
        let index = handle.0;
        if index == ROOT {
            return Err(TracerError::RootSegment);
        }
        let node = self
            .nodes
            .get(index)
            .ok_or(TracerError::UnknownSegment(index))?;
        if node.stop.is_some() {
            return Err(TracerError::AlreadyStopped(index));
        }
        let position = self
            .stack
            .iter()
            .rposition(|&open| open == index)
            .ok_or(TracerError::UnknownSegment(index))?;

        while self.stack.len() > position + 1 {
            if let Some(orphan) = self.stack.pop() {
                warn!(
                    "segment '{}' was still open when its parent '{}' stopped, closing it",
                    self.nodes[orphan].name, self.nodes[index].name
                );
                self.soft_errors += 1;
                self.close(orphan, now);
            }
        }
        self.stack.pop();
        self.close(index, now);
        self.nodes[index].attributes.extend(attributes);
        Ok(())
    }

    fn close(&mut self, index: usize, now: Duration) {
        let node = &mut self.nodes[index];
        node.stop = Some(now.max(node.start));
    }

    /// Sets one attribute on an open or stopped segment.
    pub fn set_attribute(
        &mut self,
        handle: SegmentHandle,
        key: &str,
        value: TypedScalar,
    ) -> Result<(), TracerError> {
        if self.finalized {
            return Err(TracerError::TreeFinalized);
        }
        let node = self
            .nodes
            .get_mut(handle.0)
            .ok_or(TracerError::UnknownSegment(handle.0))?;
        node.attributes.insert(key.to_owned(), value);
        Ok(())
    }

    /// Copies of every stopped segment whose parent is still open, each with
    /// its subtree. Empty once the tree is finalized.
    pub fn stopped_subtrees(&self) -> Vec<Segment> {
        let mut out = Vec::new();
        if !self.finalized {
            self.collect_stopped(ROOT, &mut out);
        }
        out
    }

    fn collect_stopped(&self, index: usize, out: &mut Vec<Segment>) {
        for &child in &self.nodes[index].children {
            if self.nodes[child].stop.is_some() {
                out.push(self.snapshot(child));
            } else {
                self.collect_stopped(child, out);
            }
        }
    }

    fn snapshot(&self, index: usize) -> Segment {
        let node = &self.nodes[index];
        let mut children: Vec<Segment> = node
            .children
            .iter()
            .map(|&child| self.snapshot(child))
            .collect();
        children.sort_by_key(|child| child.start);
        Segment {
            start: node.start,
            stop: node.stop.unwrap_or(node.start),
            name: node.name.clone(),
            kind: node.kind.clone(),
            attributes: node.attributes.clone(),
            children,
        }
    }

    pub fn rename_root(&mut self, name: &str) {
        self.nodes[ROOT].name = name.to_owned();
    }

    /// Closes everything still open at `now`, freezes the arena and returns
    /// the ordered tree.
    pub fn finalize(&mut self, now: Duration) -> Result<Segment, TracerError> {
        if self.finalized {
            self.soft_errors += 1;
            return Err(TracerError::TreeFinalized);
        }

        while let Some(open) = self.stack.pop() {
            if open != ROOT {
                debug!(
                    "segment '{}' never stopped, closing it at transaction end",
                    self.nodes[open].name
                );
            }
            self.close(open, now);
        }
        self.finalized = true;

        // Children always have a larger index than their parent, so building
        // from the back sees every child before its parent.
        let mut built: Vec<Option<Segment>> = Vec::with_capacity(self.nodes.len());
        built.resize_with(self.nodes.len(), || None);
        for index in (0..self.nodes.len()).rev() {
            let node = &mut self.nodes[index];
            let mut children: Vec<Segment> = node
                .children
                .iter()
                .filter_map(|&child| built[child].take())
                .collect();
            // Stable: equal start times keep insertion order.
            children.sort_by_key(|child| child.start);
            let start = node.start;
            built[index] = Some(Segment {
                start,
                stop: node.stop.unwrap_or(start),
                name: std::mem::take(&mut node.name),
                kind: std::mem::take(&mut node.kind),
                attributes: std::mem::take(&mut node.attributes),
                children,
            });
        }

        built
            .get_mut(ROOT)
            .and_then(Option::take)
            .ok_or(TracerError::UnknownSegment(ROOT))
    }
}

/// A finalized, immutable segment and its subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub start: Duration,
    pub stop: Duration,
    pub name: String,
    pub kind: SegmentKind,
    pub attributes: AttributeMap,
    pub children: Vec<Segment>,
}

impl Segment {
    pub fn new(name: &str, start: Duration, stop: Duration) -> Self {
        Self {
            start,
            stop: stop.max(start),
            name: name.to_owned(),
            kind: SegmentKind::Generic,
            attributes: AttributeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<Segment>) -> Self {
        self.children = children;
        self
    }

    pub fn duration(&self) -> Duration {
        self.stop.saturating_sub(self.start)
    }

    /// Duration not covered by any child.
    pub fn exclusive(&self) -> Duration {
        let mut covered = Duration::ZERO;
        let mut cursor = self.start;
        // Children are ordered by start, so one sweep merges overlaps.
        for child in &self.children {
            let start = child.start.max(cursor);
            let stop = child.stop.min(self.stop);
            if stop > start {
                covered += stop - start;
                cursor = stop;
            }
        }
        self.duration().saturating_sub(covered)
    }

    pub fn iter(&self) -> PreOrder<'_, Segment> {
        pre_order(self)
    }

    /// Number of segments in this subtree, including this one.
    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

/// Anything with an ordered list of children of its own type.
pub trait TreeNode: Sized {
    fn children(&self) -> &[Self];
}

impl TreeNode for Segment {
    fn children(&self) -> &[Self] {
        &self.children
    }
}

/// Depth-first, parent-before-children traversal.
#[derive(Debug)]
pub struct PreOrder<'a, T> {
    stack: Vec<&'a T>,
}

pub fn pre_order<T: TreeNode>(root: &T) -> PreOrder<'_, T> {
    PreOrder { stack: vec![root] }
}

impl<'a, T: TreeNode> Iterator for PreOrder<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children().iter().rev());
        Some(node)
    }
}

/// Drops childless, attribute-less segments shorter than `min_duration`.
/// The root is always kept.
pub fn prune(mut root: Segment, min_duration: Duration) -> Segment {
    if min_duration.is_zero() {
        return root;
    }
    root.children = prune_children(root.children, min_duration);
    root
}

fn prune_children(children: Vec<Segment>, min_duration: Duration) -> Vec<Segment> {
    children
        .into_iter()
        .map(|mut child| {
            child.children = prune_children(child.children, min_duration);
            child
        })
        .filter(|child| {
            !(child.children.is_empty()
                && child.attributes.is_empty()
                && child.duration() < min_duration)
        })
        .collect()
}
