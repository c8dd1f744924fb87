//! Arena-backed attribute dependency graph.
//!
//! Nodes are attribute value ids stored in a `Vec`; edges are index lists in
//! both directions. An edge `u → d` means "d depends on u": u must be
//! recomputed before d.

use std::collections::{BTreeSet, HashMap};

use crate::domain::{AttributeValue, AttributeValueId};
use crate::error::{GraphError, GraphResult};

#[derive(Debug, Clone, Default)]
pub struct AttributeGraph {
    ids: Vec<AttributeValueId>,
    index: HashMap<AttributeValueId, usize>,
    /// `node → nodes it depends on`
    upstream: Vec<Vec<usize>>,
    /// `node → nodes that depend on it`
    downstream: Vec<Vec<usize>>,
}

impl AttributeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from attribute values. Dependencies on ids not in `values` are
    /// dropped: they point at values outside the visible scope.
    pub fn build(values: &[AttributeValue]) -> Self {
        let mut graph = Self::new();
        for av in values {
            graph.add_node(av.id);
        }
        for av in values {
            let node = graph.index[&av.id];
            for dep in &av.depends_on {
                if let Some(&up) = graph.index.get(dep) {
                    graph.link(up, node);
                }
            }
        }
        graph
    }

    /// Register a node. Idempotent.
    pub fn add_node(&mut self, id: AttributeValueId) -> usize {
        if let Some(&idx) = self.index.get(&id) {
            return idx;
        }
        let idx = self.ids.len();
        self.ids.push(id);
        self.index.insert(id, idx);
        self.upstream.push(Vec::new());
        self.downstream.push(Vec::new());
        idx
    }

    fn link(&mut self, up: usize, down: usize) {
        if !self.downstream[up].contains(&down) {
            self.downstream[up].push(down);
            self.upstream[down].push(up);
        }
    }

    /// Make `dependent` depend on `dependency`, refusing edges that would
    /// close a cycle.
    pub fn add_dependency(
        &mut self,
        dependency: AttributeValueId,
        dependent: AttributeValueId,
    ) -> GraphResult<()> {
        let up = self.add_node(dependency);
        let down = self.add_node(dependent);
        if up == down || self.reachable_from(&[down]).contains(&up) {
            let mut node_ids = vec![dependency, dependent];
            node_ids.sort();
            node_ids.dedup();
            return Err(GraphError::DependencyCycle { node_ids });
        }
        self.link(up, down);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn index_of(&self, id: AttributeValueId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn id(&self, idx: usize) -> AttributeValueId {
        self.ids[idx]
    }

    pub fn upstream(&self, idx: usize) -> &[usize] {
        &self.upstream[idx]
    }

    pub fn downstream(&self, idx: usize) -> &[usize] {
        &self.downstream[idx]
    }

    /// `seeds` plus every node transitively downstream of them.
    pub fn reachable_from(&self, seeds: &[usize]) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<usize> = seeds.to_vec();
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                stack.extend(self.downstream[node].iter().copied());
            }
        }
        seen
    }

    /// Kahn's algorithm over the subgraph induced by `subset`, grouped into
    /// levels. Every node appears after all of its in-subset dependencies;
    /// nodes within a level are independent. Levels are sorted by index so
    /// the order is deterministic.
    pub fn levels(&self, subset: &BTreeSet<usize>) -> GraphResult<Vec<Vec<usize>>> {
        let mut in_degree: HashMap<usize, usize> = subset
            .iter()
            .map(|&n| {
                let deg = self.upstream[n].iter().filter(|u| subset.contains(u)).count();
                (n, deg)
            })
            .collect();

        let mut current: Vec<usize> = subset
            .iter()
            .copied()
            .filter(|n| in_degree[n] == 0)
            .collect();
        let mut levels = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            let mut next = Vec::new();
            for &node in &current {
                for &down in &self.downstream[node] {
                    if let Some(deg) = in_degree.get_mut(&down) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.push(down);
                        }
                    }
                }
            }
            placed += current.len();
            next.sort_unstable();
            levels.push(std::mem::replace(&mut current, next));
        }

        if placed < subset.len() {
            let mut node_ids: Vec<AttributeValueId> = in_degree
                .into_iter()
                .filter(|&(_, deg)| deg > 0)
                .map(|(n, _)| self.ids[n])
                .collect();
            node_ids.sort();
            return Err(GraphError::DependencyCycle { node_ids });
        }
        Ok(levels)
    }

    /// Flattened [`levels`](Self::levels).
    pub fn topological_order(&self, subset: &BTreeSet<usize>) -> GraphResult<Vec<usize>> {
        Ok(self.levels(subset)?.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ComponentId, Derivation};
    use serde_json::Value;

    fn av(deps: &[AttributeValueId]) -> AttributeValue {
        AttributeValue::new(ComponentId::generate(), "/root/x", Derivation::Copy, Value::Null)
            .with_dependencies(deps.to_vec())
    }

    #[test]
    fn test_diamond_levels() {
        //   a
        //  / \
        // b   c
        //  \ /
        //   d
        let a = av(&[]);
        let b = av(&[a.id]);
        let c = av(&[a.id]);
        let d = av(&[b.id, c.id]);
        let g = AttributeGraph::build(&[a.clone(), b.clone(), c.clone(), d.clone()]);

        let all = g.reachable_from(&[g.index_of(a.id).unwrap()]);
        assert_eq!(all.len(), 4);
        let levels = g.levels(&all).unwrap();
        let ids: Vec<Vec<AttributeValueId>> = levels
            .iter()
            .map(|l| l.iter().map(|&i| g.id(i)).collect())
            .collect();
        assert_eq!(ids, vec![vec![a.id], vec![b.id, c.id], vec![d.id]]);
    }

    #[test]
    fn test_subset_ignores_outside_dependencies() {
        let a = av(&[]);
        let b = av(&[a.id]);
        let g = AttributeGraph::build(&[a.clone(), b.clone()]);
        let only_b: BTreeSet<usize> = [g.index_of(b.id).unwrap()].into_iter().collect();
        assert_eq!(g.topological_order(&only_b).unwrap().len(), 1);
    }

    #[test]
    fn test_cycle_fails_fast_with_members() {
        let mut a = av(&[]);
        let b = av(&[a.id]);
        let c = av(&[]);
        a.depends_on = vec![b.id];
        let g = AttributeGraph::build(&[a.clone(), b.clone(), c.clone()]);
        let all: BTreeSet<usize> = (0..g.len()).collect();
        match g.levels(&all) {
            Err(GraphError::DependencyCycle { node_ids }) => {
                let mut expected = vec![a.id, b.id];
                expected.sort();
                assert_eq!(node_ids, expected);
            }
            other => panic!("expected DependencyCycle, got {other:?}"),
        }
    }

    #[test]
    fn test_add_dependency_rejects_cycle() {
        let a = av(&[]);
        let b = av(&[a.id]);
        let mut g = AttributeGraph::build(&[a.clone(), b.clone()]);
        assert!(matches!(
            g.add_dependency(b.id, a.id),
            Err(GraphError::DependencyCycle { .. })
        ));
        assert!(matches!(
            g.add_dependency(a.id, a.id),
            Err(GraphError::DependencyCycle { .. })
        ));
        let c = AttributeValueId::generate();
        g.add_dependency(b.id, c).unwrap();
        assert_eq!(g.downstream(g.index_of(b.id).unwrap()).len(), 1);
    }
}
