//! Phase tree reconstruction.
//!
//! The server sends phases as a flat list linked by `parent_id`, with
//! `PhaseId::ROOT` marking top-level phases. The tree is rebuilt from
//! scratch on every update and never patched in place.

use std::collections::HashMap;

use shared::domain::{Phase, PhaseId};
use tracing::debug;

/// Clone, comparison, counting and drop all walk the tree with an explicit
/// stack, so a long parent chain from the server cannot exhaust the thread
/// stack.
#[derive(Debug)]
pub struct PhaseNode {
    pub phase: Phase,
    /// Ascending `order`; ties keep input order.
    pub children: Vec<PhaseNode>,
}

impl PhaseNode {
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            count += 1;
            pending.extend(node.children.iter());
        }
        count
    }
}

impl Clone for PhaseNode {
    fn clone(&self) -> Self {
        struct Frame<'a> {
            source: &'a PhaseNode,
            next: usize,
            built: Vec<PhaseNode>,
        }
        fn frame(source: &PhaseNode) -> Frame<'_> {
            Frame {
                source,
                next: 0,
                built: Vec::with_capacity(source.children.len()),
            }
        }

        let mut stack = vec![frame(self)];
        while let Some(top) = stack.last_mut() {
            let source = top.source;
            if let Some(child) = source.children.get(top.next) {
                top.next += 1;
                stack.push(frame(child));
                continue;
            }
            let Some(done) = stack.pop() else { break };
            let node = PhaseNode {
                phase: done.source.phase.clone(),
                children: done.built,
            };
            match stack.last_mut() {
                Some(parent) => parent.built.push(node),
                None => return node,
            }
        }
        PhaseNode {
            phase: self.phase.clone(),
            children: Vec::new(),
        }
    }
}

impl PartialEq for PhaseNode {
    fn eq(&self, other: &Self) -> bool {
        let mut pending = vec![(self, other)];
        while let Some((left, right)) = pending.pop() {
            if left.phase != right.phase || left.children.len() != right.children.len() {
                return false;
            }
            pending.extend(left.children.iter().zip(&right.children));
        }
        true
    }
}

impl Drop for PhaseNode {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.children);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PhaseForest {
    /// Root phases in input order.
    pub roots: Vec<PhaseNode>,
    /// Input records that did not make it into the tree: orphans (parent id
    /// not present), their descendants, members of parent cycles, and
    /// repeated ids after the first occurrence.
    pub detached: Vec<PhaseId>,
}

impl PhaseForest {
    pub fn node_count(&self) -> usize {
        self.roots.iter().map(PhaseNode::node_count).sum()
    }
}

pub fn build_hierarchy(phases: &[Phase]) -> Vec<PhaseNode> {
    build_forest(phases).roots
}

pub fn build_forest(phases: &[Phase]) -> PhaseForest {
    let mut index: HashMap<PhaseId, usize> = HashMap::with_capacity(phases.len());
    for (pos, phase) in phases.iter().enumerate() {
        index.entry(phase.id).or_insert(pos);
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); phases.len()];
    let mut roots = Vec::new();
    for (pos, phase) in phases.iter().enumerate() {
        if index.get(&phase.id) != Some(&pos) {
            debug!(phase_id = phase.id.0, "hierarchy: duplicate phase id ignored");
            continue;
        }
        if phase.parent_id.is_root() {
            roots.push(pos);
            continue;
        }
        match index.get(&phase.parent_id) {
            Some(&parent) => children[parent].push(pos),
            None => debug!(
                phase_id = phase.id.0,
                parent_id = phase.parent_id.0,
                "hierarchy: orphan phase dropped"
            ),
        }
    }
    for siblings in &mut children {
        siblings.sort_by_key(|&pos| phases[pos].order);
    }

    let mut placed = vec![false; phases.len()];
    let roots = roots
        .into_iter()
        .filter_map(|pos| assemble(pos, phases, &children, &mut placed))
        .collect();
    let detached = phases
        .iter()
        .zip(&placed)
        .filter(|(_, placed)| !**placed)
        .map(|(phase, _)| phase.id)
        .collect();

    PhaseForest { roots, detached }
}

/// Post-order assembly of the subtree under `root` with an explicit stack.
/// A position already placed (cycle or shared child) is skipped.
fn assemble(
    root: usize,
    phases: &[Phase],
    children: &[Vec<usize>],
    placed: &mut [bool],
) -> Option<PhaseNode> {
    struct Frame {
        pos: usize,
        next: usize,
        built: Vec<PhaseNode>,
    }

    if placed[root] {
        return None;
    }
    placed[root] = true;
    let mut stack = vec![Frame {
        pos: root,
        next: 0,
        built: Vec::new(),
    }];

    while let Some(top) = stack.last_mut() {
        if let Some(&child) = children[top.pos].get(top.next) {
            top.next += 1;
            if !placed[child] {
                placed[child] = true;
                stack.push(Frame {
                    pos: child,
                    next: 0,
                    built: Vec::new(),
                });
            }
            continue;
        }
        let Some(done) = stack.pop() else { break };
        let node = PhaseNode {
            phase: phases[done.pos].clone(),
            children: done.built,
        };
        match stack.last_mut() {
            Some(parent) => parent.built.push(node),
            None => return Some(node),
        }
    }
    None
}

/// One level of context around the current phase, for display.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseContext {
    pub parent: Option<Phase>,
    pub current: Phase,
    /// Direct children in flat-list order, independent of the built tree.
    pub children: Vec<Phase>,
}

pub fn phase_context(phases: &[Phase], current: &Phase) -> PhaseContext {
    let parent = if current.parent_id.is_root() {
        None
    } else {
        phases
            .iter()
            .find(|phase| phase.id == current.parent_id)
            .cloned()
    };
    let children = phases
        .iter()
        .filter(|phase| phase.parent_id == current.id)
        .cloned()
        .collect();
    PhaseContext {
        parent,
        current: current.clone(),
        children,
    }
}

#[cfg(test)]
#[path = "tests/hierarchy_tests.rs"]
mod tests;
