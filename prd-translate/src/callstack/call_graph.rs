//! Per-process call graph of completed call stacks

use std::collections::HashMap;

use crate::domain::{CoreId, Pid, Tid};
use crate::symbolization::Site;

/// The sample at the tip of a call stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Leaf {
    pub tid: Tid,
    pub core: CoreId,
    pub event: u64,
    pub site: Site,
}

/// A fully built (or force-completed) call stack
///
/// `frames` are callers, innermost first: kernel frames, then user frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedChain {
    pub pid: Pid,
    pub tid: Tid,
    pub frames: Vec<Site>,
    /// `None` for a user stack that no sample attached to
    pub leaf: Option<Leaf>,
    /// The user portion was missing or could not be resolved
    pub partial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeafKey {
    pub tid: Tid,
    pub event: u64,
    pub site: Site,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackNode {
    pub leaves: HashMap<LeafKey, u64>,
    /// Chains folded into this stack
    pub observations: u64,
    pub partial: bool,
}

/// Distinct call stacks of one process and the samples observed on them
#[derive(Debug, Default)]
pub struct CallGraph {
    stacks: HashMap<Vec<Site>, StackNode>,
}

impl CallGraph {
    pub fn add_chain(&mut self, chain: CompletedChain) {
        let node = self.stacks.entry(chain.frames).or_default();
        node.observations += 1;
        node.partial |= chain.partial;
        if let Some(leaf) = chain.leaf {
            let key = LeafKey { tid: leaf.tid, event: leaf.event, site: leaf.site };
            *node.leaves.entry(key).or_insert(0) += 1;
        }
    }

    pub fn stacks(&self) -> impl Iterator<Item = (&[Site], &StackNode)> {
        self.stacks.iter().map(|(frames, node)| (frames.as_slice(), node))
    }

    #[must_use]
    pub fn get(&self, frames: &[Site]) -> Option<&StackNode> {
        self.stacks.get(frames)
    }

    /// Number of distinct stacks
    #[must_use]
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Samples attached to all stacks
    #[must_use]
    pub fn leaf_count(&self) -> u64 {
        self.stacks.values().flat_map(|node| node.leaves.values()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(frames: &[u64], with_leaf: bool) -> CompletedChain {
        CompletedChain {
            pid: Pid(1),
            tid: Tid(2),
            frames: frames.iter().map(|&f| Site::unknown(f)).collect(),
            leaf: with_leaf.then(|| Leaf {
                tid: Tid(2),
                core: CoreId(0),
                event: 7,
                site: Site::unknown(0x10),
            }),
            partial: false,
        }
    }

    #[test]
    fn test_identical_chains_fold_together() {
        let mut graph = CallGraph::default();
        graph.add_chain(chain(&[1, 2, 3], true));
        graph.add_chain(chain(&[1, 2, 3], true));
        graph.add_chain(chain(&[1, 2], true));
        graph.add_chain(chain(&[9], false));

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.leaf_count(), 3);
        let frames: Vec<Site> = [1, 2, 3].iter().map(|&f| Site::unknown(f)).collect();
        assert_eq!(graph.get(&frames).unwrap().observations, 2);
    }
}
