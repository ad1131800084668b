//! Graph analysis utilities over prerequisite lists.
//!
//! `prereqs[i]` lists the nodes that must be evaluated before node `i`.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::NodeIndex;

/// Topological sort (Kahn's algorithm), prerequisites first.
///
/// Ties are broken by the lowest index so the order is deterministic. Returns `Err` with the
/// nodes left unsorted if there is a cycle.
pub fn topological_sort(prereqs: &[Vec<NodeIndex>]) -> Result<Vec<NodeIndex>, Vec<NodeIndex>> {
    let n = prereqs.len();
    let mut in_degree = vec![0usize; n];
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (node, deps) in prereqs.iter().enumerate() {
        let unique: HashSet<NodeIndex> = deps.iter().copied().collect();
        in_degree[node] = unique.len();
        for dep in unique {
            consumers[dep.as_usize()].push(node);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted = Vec::with_capacity(n);

    while let Some(node) = ready.pop_first() {
        sorted.push(NodeIndex::new(node));
        for &consumer in &consumers[node] {
            in_degree[consumer] -= 1;
            if in_degree[consumer] == 0 {
                ready.insert(consumer);
            }
        }
    }

    if sorted.len() != n {
        let placed: HashSet<NodeIndex> = sorted.into_iter().collect();
        return Err((0..n)
            .map(NodeIndex::new)
            .filter(|i| !placed.contains(i))
            .collect());
    }
    Ok(sorted)
}

/// Finds one cycle, returned as a path whose first and last entries are equal.
pub fn find_cycle(prereqs: &[Vec<NodeIndex>]) -> Option<Vec<NodeIndex>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        OnStack,
        Done,
    }

    let n = prereqs.len();
    let mut marks = vec![Mark::New; n];

    for root in 0..n {
        if marks[root] != Mark::New {
            continue;
        }
        // Iterative DFS: (node, next prerequisite position).
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        marks[root] = Mark::OnStack;
        while let Some(top) = stack.last_mut() {
            let (node, pos) = *top;
            if let Some(&next) = prereqs[node].get(pos) {
                top.1 += 1;
                let next = next.as_usize();
                match marks[next] {
                    Mark::New => {
                        marks[next] = Mark::OnStack;
                        stack.push((next, 0));
                    }
                    Mark::OnStack => {
                        let start = stack.iter().position(|&(s, _)| s == next).unwrap_or(0);
                        let mut path: Vec<NodeIndex> =
                            stack[start..].iter().map(|&(s, _)| NodeIndex::new(s)).collect();
                        path.push(NodeIndex::new(next));
                        return Some(path);
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
                stack.pop();
            }
        }
    }
    None
}

/// Transitive prerequisite closure of `roots`, roots included.
pub fn closure(prereqs: &[Vec<NodeIndex>], roots: &[NodeIndex]) -> HashSet<NodeIndex> {
    let mut visited = HashSet::new();
    let mut stack: Vec<NodeIndex> = roots.to_vec();
    while let Some(node) = stack.pop() {
        if !visited.insert(node) {
            continue;
        }
        stack.extend(prereqs[node.as_usize()].iter().copied());
    }
    visited
}

/// Groups `order` into dependency levels: every node's prerequisites lie in earlier levels.
///
/// Only nodes in `subset` are placed; prerequisites outside it are ignored.
pub fn levels(
    prereqs: &[Vec<NodeIndex>],
    order: &[NodeIndex],
    subset: &HashSet<NodeIndex>,
) -> Vec<Vec<NodeIndex>> {
    let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
    let mut levels: Vec<Vec<NodeIndex>> = Vec::new();
    for &node in order.iter().filter(|n| subset.contains(*n)) {
        let level = prereqs[node.as_usize()]
            .iter()
            .filter_map(|p| depth.get(p))
            .map(|d| d + 1)
            .max()
            .unwrap_or(0);
        depth.insert(node, level);
        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        levels[level].push(node);
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(values: &[usize]) -> Vec<NodeIndex> {
        values.iter().copied().map(NodeIndex::new).collect()
    }

    #[test]
    fn test_topological_sort_respects_prerequisites() {
        // 0 <- 1 <- 3, 0 <- 2 <- 3
        let prereqs = vec![idx(&[]), idx(&[0]), idx(&[0]), idx(&[1, 2])];
        let sorted = topological_sort(&prereqs).unwrap();
        assert_eq!(sorted, idx(&[0, 1, 2, 3]));
    }

    #[test]
    fn test_topological_sort_reports_cycle_members() {
        let prereqs = vec![idx(&[]), idx(&[2]), idx(&[1])];
        let unsorted = topological_sort(&prereqs).unwrap_err();
        assert_eq!(unsorted, idx(&[1, 2]));
        let cycle = find_cycle(&prereqs).unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&NodeIndex::new(1)) && cycle.contains(&NodeIndex::new(2)));
    }

    #[test]
    fn test_closure_and_levels() {
        let prereqs = vec![idx(&[]), idx(&[0]), idx(&[]), idx(&[1, 2]), idx(&[2])];
        let c = closure(&prereqs, &idx(&[3]));
        assert_eq!(c.len(), 4);
        assert!(!c.contains(&NodeIndex::new(4)));

        let order = topological_sort(&prereqs).unwrap();
        let lv = levels(&prereqs, &order, &c);
        assert_eq!(lv, vec![idx(&[0, 2]), idx(&[1]), idx(&[3])]);
    }

    #[test]
    fn test_no_cycle_in_dag() {
        let prereqs = vec![idx(&[]), idx(&[0]), idx(&[0, 1])];
        assert!(find_cycle(&prereqs).is_none());
    }
}
