//! The call graph over function descriptors.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;

use crate::calls::CallTarget;

/// A node of the call graph. Imports and unresolved targets are distinguished sinks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallGraphNode {
    Function(u64),
    Import(u64),
    Unresolved,
}

impl From<CallTarget> for CallGraphNode {
    fn from(t: CallTarget) -> Self {
        match t {
            CallTarget::Unresolved => CallGraphNode::Unresolved,
            CallTarget::Function(a) => CallGraphNode::Function(a),
            CallTarget::Import(a) => CallGraphNode::Import(a),
        }
    }
}

/// A call site as seen by the call graph builder
#[derive(Clone, Copy, Debug)]
pub struct CallEdge {
    pub caller: u64,
    pub site: u64,
    pub target: CallTarget,
}

/// Directed graph whose edges carry the call sites that induce them.
#[derive(Debug, Default)]
pub struct CallGraph {
    graph: DiGraphMap<CallGraphNode, Vec<u64>>,
    names: BTreeMap<CallGraphNode, String>,
}

impl CallGraph {
    /// Build the graph. `functions` are `(entry, name)` pairs; `import_names` label import sinks.
    pub fn build(
        functions: &[(u64, String)],
        calls: &[CallEdge],
        import_names: &BTreeMap<u64, String>,
    ) -> Self {
        let mut functions: Vec<&(u64, String)> = functions.iter().collect();
        functions.sort_by_key(|(a, _)| *a);

        let mut r = Self::default();
        for (addr, name) in functions {
            let n = CallGraphNode::Function(*addr);
            r.graph.add_node(n);
            r.names.insert(n, name.clone());
        }
        let mut calls: Vec<&CallEdge> = calls.iter().collect();
        calls.sort_by_key(|c| (c.caller, c.site));
        for c in calls {
            let from = CallGraphNode::Function(c.caller);
            if !r.graph.contains_node(from) {
                continue;
            }
            let to = CallGraphNode::from(c.target);
            match to {
                CallGraphNode::Function(_) if !r.graph.contains_node(to) => continue,
                CallGraphNode::Import(a) => {
                    r.names.entry(to).or_insert_with(|| {
                        import_names
                            .get(&a)
                            .cloned()
                            .unwrap_or_else(|| format!("import_{:x}", a))
                    });
                }
                CallGraphNode::Unresolved => {
                    r.names.insert(to, "<unresolved>".into());
                }
                _ => {}
            }
            if let Some(sites) = r.graph.edge_weight_mut(from, to) {
                sites.push(c.site);
            } else {
                r.graph.add_edge(from, to, vec![c.site]);
            }
        }
        r
    }

    pub fn contains(&self, n: CallGraphNode) -> bool {
        self.graph.contains_node(n)
    }

    pub fn has_edge(&self, from: CallGraphNode, to: CallGraphNode) -> bool {
        self.graph.contains_edge(from, to)
    }

    /// Call sites in `from` that call `to`
    pub fn call_sites(&self, from: CallGraphNode, to: CallGraphNode) -> Vec<u64> {
        self.graph.edge_weight(from, to).cloned().unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn edges(&self) -> Vec<(CallGraphNode, CallGraphNode)> {
        self.graph.all_edges().map(|(a, b, _)| (a, b)).collect()
    }

    pub fn callees(&self, function: u64) -> Vec<CallGraphNode> {
        let mut v: Vec<_> = self
            .graph
            .neighbors_directed(CallGraphNode::Function(function), Direction::Outgoing)
            .collect();
        v.sort();
        v
    }

    pub fn callers(&self, n: CallGraphNode) -> Vec<u64> {
        let mut v: Vec<u64> = self
            .graph
            .neighbors_directed(n, Direction::Incoming)
            .filter_map(|c| match c {
                CallGraphNode::Function(a) => Some(a),
                _ => None,
            })
            .collect();
        v.sort_unstable();
        v.dedup();
        v
    }

    /// Number of call sites in `function`, external ones included
    pub fn fan_out(&self, function: u64) -> usize {
        self.graph
            .edges(CallGraphNode::Function(function))
            .map(|(_, _, sites)| sites.len())
            .sum()
    }

    /// Functions grouped by strongly connected component, callees before callers. Members of a
    /// component are listed in address order.
    pub fn bottom_up_components(&self) -> Vec<Vec<u64>> {
        petgraph::algo::tarjan_scc(&self.graph)
            .into_iter()
            .filter_map(|scc| {
                let mut fs: Vec<u64> = scc
                    .into_iter()
                    .filter_map(|n| match n {
                        CallGraphNode::Function(a) => Some(a),
                        _ => None,
                    })
                    .collect();
                fs.sort_unstable();
                (!fs.is_empty()).then(|| fs)
            })
            .collect()
    }

    /// All functions in bottom-up order
    pub fn bottom_up_order(&self) -> Vec<u64> {
        self.bottom_up_components().into_iter().flatten().collect()
    }

    /// Functions reachable from `function` through calls, `function` included
    pub fn reachable_functions(&self, function: u64) -> BTreeSet<u64> {
        let mut seen = BTreeSet::new();
        let start = CallGraphNode::Function(function);
        if !self.graph.contains_node(start) {
            return seen;
        }
        let mut dfs = petgraph::visit::Dfs::new(&self.graph, start);
        while let Some(n) = dfs.next(&self.graph) {
            if let CallGraphNode::Function(a) = n {
                seen.insert(a);
            }
        }
        seen
    }

    /// Functions that reach `function` through calls, `function` included
    pub fn ancestors(&self, function: u64) -> BTreeSet<u64> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![function];
        while let Some(f) = stack.pop() {
            if seen.insert(f) {
                stack.extend(self.callers(CallGraphNode::Function(f)));
            }
        }
        seen
    }

    pub fn can_reach(&self, from: u64, to: u64) -> bool {
        self.reachable_functions(from).contains(&to)
    }

    /// Render as graphviz
    pub fn to_dot(&self) -> String {
        type Edge = (CallGraphNode, CallGraphNode, usize);
        struct G<'a>(&'a CallGraph);

        fn node_id(n: &CallGraphNode) -> String {
            match n {
                CallGraphNode::Function(a) => format!("f_{:x}", a),
                CallGraphNode::Import(a) => format!("i_{:x}", a),
                CallGraphNode::Unresolved => "unresolved".into(),
            }
        }

        impl<'a> dot::Labeller<'a, CallGraphNode, Edge> for G<'a> {
            fn graph_id(&'a self) -> dot::Id<'a> {
                dot::Id::new("CallGraph").unwrap()
            }
            fn node_id(&'a self, n: &CallGraphNode) -> dot::Id<'a> {
                dot::Id::new(node_id(n)).unwrap()
            }
            fn node_label<'b>(&'b self, n: &CallGraphNode) -> dot::LabelText<'b> {
                let name = self.0.names.get(n).cloned().unwrap_or_default();
                dot::LabelText::label(match n {
                    CallGraphNode::Function(a) => format!("{} @ {:#x}", name, a),
                    _ => name,
                })
            }
            fn node_shape(&'a self, n: &CallGraphNode) -> Option<dot::LabelText<'a>> {
                match n {
                    CallGraphNode::Function(_) => None,
                    _ => Some(dot::LabelText::label("box")),
                }
            }
            fn edge_label<'b>(&'b self, e: &Edge) -> dot::LabelText<'b> {
                dot::LabelText::label(format!("{}", e.2))
            }
        }

        impl<'a> dot::GraphWalk<'a, CallGraphNode, Edge> for G<'a> {
            fn nodes(&self) -> dot::Nodes<'a, CallGraphNode> {
                let mut v: Vec<CallGraphNode> = self.0.graph.nodes().collect();
                v.sort();
                v.into()
            }
            fn edges(&'a self) -> dot::Edges<'a, Edge> {
                let mut v: Vec<Edge> = self
                    .0
                    .graph
                    .all_edges()
                    .map(|(a, b, sites)| (a, b, sites.len()))
                    .collect();
                v.sort();
                v.into()
            }
            fn source(&self, e: &Edge) -> CallGraphNode {
                e.0
            }
            fn target(&self, e: &Edge) -> CallGraphNode {
                e.1
            }
        }

        let mut s: Vec<u8> = vec![];
        // Writing into a `Vec` cannot fail
        let _ = dot::render(&G(self), &mut s);
        String::from_utf8_lossy(&s).into_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn edge(caller: u64, site: u64, target: CallTarget) -> CallEdge {
        CallEdge {
            caller,
            site,
            target,
        }
    }

    #[test]
    fn cycles_are_grouped_in_address_order() {
        let fs: Vec<(u64, String)> = [0x10, 0x20, 0x30, 0x40]
            .iter()
            .map(|a| (*a, format!("f{:x}", a)))
            .collect();
        // 0x10 -> 0x30 <-> 0x20 -> 0x40
        let calls = vec![
            edge(0x10, 0x11, CallTarget::Function(0x30)),
            edge(0x30, 0x31, CallTarget::Function(0x20)),
            edge(0x20, 0x21, CallTarget::Function(0x30)),
            edge(0x20, 0x22, CallTarget::Function(0x40)),
            edge(0x40, 0x41, CallTarget::Import(0x3000)),
        ];
        let g = CallGraph::build(&fs, &calls, &BTreeMap::new());
        assert_eq!(
            g.bottom_up_components(),
            vec![vec![0x40], vec![0x20, 0x30], vec![0x10]]
        );
        assert!(g.has_edge(
            CallGraphNode::Function(0x40),
            CallGraphNode::Import(0x3000)
        ));
        assert!(g.can_reach(0x10, 0x40));
        assert!(!g.can_reach(0x40, 0x10));
        assert_eq!(
            g.ancestors(0x20).into_iter().collect::<Vec<_>>(),
            vec![0x10, 0x20, 0x30]
        );
        assert_eq!(g.ancestors(0x10).len(), 1);
        assert_eq!(g.fan_out(0x20), 2);
        assert!(g.to_dot().contains("f_10 -> f_30"));
    }
}
