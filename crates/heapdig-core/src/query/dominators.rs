//! Dominator tree over the object graph.
//!
//! All roots hang off one virtual super-root (node `0`); object `i` is node
//! `i + 1`. Immediate dominators use the iterative algorithm of Cooper,
//! Harvey and Kennedy, "A Simple, Fast Dominance Algorithm".

const UNDEFINED: usize = usize::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Dominators
{
    /// Immediate dominator per node, `UNDEFINED` when unreachable
    idom: Vec<usize>,
    /// Bytes kept alive by each node, including itself
    retained: Vec<u64>,
}

impl Dominators
{
    /// Compute dominators for `successors`, where `sizes[i]` is node `i`'s size
    ///
    /// Node `0` is the entry.
    pub fn compute(successors: &[Vec<usize>], sizes: &[u64]) -> Self
    {
        let count = successors.len();
        let order = reverse_postorder(successors);
        let mut rank = vec![UNDEFINED; count];
        for (index, &node) in order.iter().enumerate() {
            rank[node] = index;
        }

        let mut predecessors = vec![Vec::new(); count];
        for (node, targets) in successors.iter().enumerate() {
            if rank[node] == UNDEFINED {
                continue;
            }
            for &target in targets {
                predecessors[target].push(node);
            }
        }

        let mut idom = vec![UNDEFINED; count];
        if count > 0 {
            idom[0] = 0;
        }
        let mut changed = true;
        while changed {
            changed = false;
            for &node in order.iter().skip(1) {
                let mut candidate = UNDEFINED;
                for &pred in &predecessors[node] {
                    if idom[pred] == UNDEFINED {
                        continue;
                    }
                    candidate = if candidate == UNDEFINED {
                        pred
                    } else {
                        intersect(&idom, &rank, pred, candidate)
                    };
                }
                if candidate != UNDEFINED && idom[node] != candidate {
                    idom[node] = candidate;
                    changed = true;
                }
            }
        }

        let mut retained = sizes.to_vec();
        retained.resize(count, 0);
        // Children come after their dominator in reverse postorder.
        for &node in order.iter().skip(1).rev() {
            let parent = idom[node];
            retained[parent] = retained[parent].saturating_add(retained[node]);
        }

        Self { idom, retained }
    }

    pub fn immediate_dominator(&self, node: usize) -> Option<usize>
    {
        match self.idom.get(node) {
            Some(&idom) if idom != UNDEFINED && node != 0 => Some(idom),
            _ => None,
        }
    }

    pub fn retained(&self, node: usize) -> u64
    {
        self.retained.get(node).copied().unwrap_or_default()
    }
}

fn intersect(idom: &[usize], rank: &[usize], mut a: usize, mut b: usize) -> usize
{
    while a != b {
        while rank[a] > rank[b] {
            a = idom[a];
        }
        while rank[b] > rank[a] {
            b = idom[b];
        }
    }
    a
}

/// Nodes reachable from `0` in reverse postorder, without recursion
fn reverse_postorder(successors: &[Vec<usize>]) -> Vec<usize>
{
    if successors.is_empty() {
        return Vec::new();
    }
    let mut visited = vec![false; successors.len()];
    let mut postorder = Vec::with_capacity(successors.len());
    let mut stack = vec![(0usize, 0usize)];
    visited[0] = true;

    while let Some((node, next)) = stack.last_mut() {
        let node = *node;
        if let Some(&target) = successors[node].get(*next) {
            *next += 1;
            if !visited[target] {
                visited[target] = true;
                stack.push((target, 0));
            }
        } else {
            postorder.push(node);
            stack.pop();
        }
    }
    postorder.reverse();
    postorder
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_diamond()
    {
        // 0 -> 1 -> {2, 3} -> 4
        let successors = vec![vec![1], vec![2, 3], vec![4], vec![4], vec![]];
        let sizes = vec![0, 10, 20, 30, 40];
        let dom = Dominators::compute(&successors, &sizes);

        assert_eq!(dom.immediate_dominator(4), Some(1));
        assert_eq!(dom.immediate_dominator(2), Some(1));
        assert_eq!(dom.retained(1), 100);
        assert_eq!(dom.retained(2), 20);
        assert_eq!(dom.retained(0), 100);
    }

    #[test]
    fn test_cycle_and_unreachable()
    {
        // 0 -> 1 <-> 2, node 3 is unreachable.
        let successors = vec![vec![1], vec![2], vec![1], vec![1]];
        let sizes = vec![0, 8, 16, 32];
        let dom = Dominators::compute(&successors, &sizes);

        assert_eq!(dom.immediate_dominator(2), Some(1));
        assert_eq!(dom.retained(1), 24);
        assert_eq!(dom.immediate_dominator(3), None);
        assert_eq!(dom.retained(3), 32);
    }
}
