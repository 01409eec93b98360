/// Petgraph-based structural validation of definition trees
///
/// Definitions arrive as a flat arena with child id lists, so nothing stops a
/// stored definition from sharing a child between two parents or looping back
/// on itself. This module builds a directed parent→child graph and rejects
/// anything that is not a single tree rooted at `root`.

use crate::process::types::{ActivityKind, Deadline, NodeId, ProcessDefinition, MAX_DEADLINE_SECONDS};
use anyhow::Result;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::HashMap;

/// Internal representation of a definition as a petgraph tree
#[derive(Debug)]
pub struct DefinitionGraph {
    pub graph: DiGraph<NodeId, ()>,
    pub node_id_to_index: HashMap<NodeId, NodeIndex>,
}

/// Build the parent→child graph of a definition
///
/// Fails on duplicate node ids and on references to unknown nodes.
pub fn build_definition_graph(definition: &ProcessDefinition) -> Result<DefinitionGraph> {
    tracing::debug!("🏗️ Building definition graph for '{}'", definition.id);

    let mut graph = DiGraph::new();
    let mut node_id_to_index = HashMap::new();

    for node in &definition.nodes {
        let index = graph.add_node(node.id);
        if node_id_to_index.insert(node.id, index).is_some() {
            return Err(anyhow::anyhow!("Duplicate activity id: {}", node.id));
        }
    }

    for node in &definition.nodes {
        let from = node_id_to_index[&node.id];
        for child in node.kind.children() {
            let to = node_id_to_index.get(&child).ok_or_else(|| {
                anyhow::anyhow!("Activity {} references unknown activity {}", node.id, child)
            })?;
            graph.add_edge(from, *to, ());
            tracing::debug!("  🔗 {} → {}", node.id, child);
        }
    }

    Ok(DefinitionGraph { graph, node_id_to_index })
}

/// Validate that a definition forms one tree rooted at `root`
pub fn validate_definition(definition: &ProcessDefinition) -> Result<()> {
    let tree = build_definition_graph(definition)?;

    let root = *tree
        .node_id_to_index
        .get(&definition.root)
        .ok_or_else(|| anyhow::anyhow!("Root activity not found: {}", definition.root))?;

    if toposort(&tree.graph, None).is_err() {
        tracing::error!("❌ Process '{}' contains a cycle", definition.id);
        return Err(anyhow::anyhow!("Process definition contains cycles - must be a tree"));
    }

    for index in tree.graph.node_indices() {
        let parents = tree.graph.neighbors_directed(index, Direction::Incoming).count();
        let id = tree.graph[index];
        if index == root && parents > 0 {
            return Err(anyhow::anyhow!("Root activity {} must not have a parent", id));
        }
        if parents > 1 {
            return Err(anyhow::anyhow!("Activity {} is shared by {} parents", id, parents));
        }
    }

    let mut reachable = 0usize;
    let mut dfs = Dfs::new(&tree.graph, root);
    while dfs.next(&tree.graph).is_some() {
        reachable += 1;
    }
    if reachable != tree.graph.node_count() {
        return Err(anyhow::anyhow!(
            "{} activities are unreachable from root {}",
            tree.graph.node_count() - reachable,
            definition.root
        ));
    }

    for node in &definition.nodes {
        let deadline = match &node.kind {
            ActivityKind::Wait { deadline } => Some(deadline),
            ActivityKind::Pick { on_alarm, .. } => on_alarm.as_ref().map(|alarm| &alarm.deadline),
            _ => None,
        };
        if let Some(Deadline { for_seconds: Some(secs), .. }) = deadline {
            if *secs > MAX_DEADLINE_SECONDS {
                return Err(anyhow::anyhow!(
                    "Activity {} waits {}s, more than the {}s limit",
                    node.id,
                    secs,
                    MAX_DEADLINE_SECONDS
                ));
            }
        }
    }

    tracing::debug!("✅ Definition '{}' is a well-formed tree of {} activities", definition.id, reachable);
    Ok(())
}
