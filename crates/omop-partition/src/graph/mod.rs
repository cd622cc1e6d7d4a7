//! Foreign-key dependency graph over the source schema.
//!
//! An edge `A -> B` means "A has a foreign key referencing B". Cycles
//! (self-references, mutual references) are allowed and never fatal.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{CatalogSource, TableRef};
use crate::error::{PartitionError, Result};

/// Adjacency map from each table to the tables it references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    edges: BTreeMap<TableRef, BTreeSet<TableRef>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; a no-op if it already exists.
    pub fn add_table(&mut self, table: TableRef) {
        self.edges.entry(table).or_default();
    }

    /// Add `from -> to`, creating missing nodes.
    pub fn add_edge(&mut self, from: TableRef, to: TableRef) {
        self.add_table(to.clone());
        self.edges.entry(from).or_default().insert(to);
    }

    pub fn contains(&self, table: &TableRef) -> bool {
        self.edges.contains_key(table)
    }

    /// All tables in lexicographic order.
    pub fn tables(&self) -> impl Iterator<Item = &TableRef> {
        self.edges.keys()
    }

    /// Tables directly referenced by `table`.
    pub fn references(&self, table: &TableRef) -> impl Iterator<Item = &TableRef> {
        self.edges.get(table).into_iter().flatten()
    }

    pub fn node_count(&self) -> usize {
        self.edges.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    /// Every table reachable from `table` by following one or more edges.
    pub fn reachable_from(&self, table: &TableRef) -> BTreeSet<TableRef> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&TableRef> = self.references(table).collect();

        while let Some(current) = queue.pop_front() {
            if seen.insert(current.clone()) {
                queue.extend(self.references(current));
            }
        }
        seen
    }

    /// True when `from` has a path of at least one edge to `to`.
    pub fn has_path(&self, from: &TableRef, to: &TableRef) -> bool {
        self.reachable_from(from).contains(to)
    }

    /// `anchor` plus every table with a path to it, referenced tables first.
    ///
    /// When that subgraph contains a cycle the same set is returned in
    /// lexicographic order instead.
    pub fn related_tables(&self, anchor: &TableRef) -> Vec<TableRef> {
        if !self.contains(anchor) {
            return Vec::new();
        }

        let mut reverse: BTreeMap<&TableRef, Vec<&TableRef>> = BTreeMap::new();
        for (from, targets) in &self.edges {
            for to in targets {
                reverse.entry(to).or_default().push(from);
            }
        }

        let mut nodes = BTreeSet::new();
        nodes.insert(anchor.clone());
        let mut queue: VecDeque<&TableRef> = VecDeque::from([anchor]);
        while let Some(current) = queue.pop_front() {
            for &referrer in reverse.get(current).into_iter().flatten() {
                if nodes.insert(referrer.clone()) {
                    queue.push_back(referrer);
                }
            }
        }

        let (waves, leftover) = self.layered(&nodes, false);
        if !leftover.is_empty() {
            debug!(
                "Cycle among tables related to {}; falling back to lexicographic order",
                anchor
            );
            return nodes.into_iter().collect();
        }
        waves.into_iter().flatten().collect()
    }

    /// The graph restricted to `tables`. Edges leaving the set are dropped.
    pub fn subgraph<'a, I>(&self, tables: I) -> DependencyGraph
    where
        I: IntoIterator<Item = &'a TableRef>,
    {
        let keep: BTreeSet<&TableRef> = tables.into_iter().filter(|t| self.contains(t)).collect();
        let edges = keep
            .iter()
            .map(|&table| {
                let targets = self
                    .references(table)
                    .filter(|to| keep.contains(to))
                    .cloned()
                    .collect();
                (table.clone(), targets)
            })
            .collect();
        DependencyGraph { edges }
    }

    /// Group all tables into load waves: every table's referenced tables sit
    /// in an earlier wave. Self-references are ignored; the members of a
    /// foreign-key cycle share one wave placed after everything they
    /// reference, and their dependents follow in later waves.
    pub fn load_waves(&self) -> Vec<Vec<TableRef>> {
        let nodes: BTreeSet<TableRef> = self.edges.keys().cloned().collect();
        let (waves, _) = self.layered(&nodes, true);
        waves
    }

    /// Kahn's algorithm in levels over the subgraph induced by `nodes`.
    ///
    /// With `break_cycles` a stalled pass releases the cycles that depend on
    /// nothing else still pending, and self-references are ignored. Without
    /// it the pass stops and the unplaced nodes are returned.
    fn layered(
        &self,
        nodes: &BTreeSet<TableRef>,
        break_cycles: bool,
    ) -> (Vec<Vec<TableRef>>, Vec<TableRef>) {
        let keep = |from: &TableRef, to: &TableRef| {
            nodes.contains(to) && !(break_cycles && from == to)
        };

        let mut pending: BTreeMap<&TableRef, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&TableRef, Vec<&TableRef>> = BTreeMap::new();
        for node in nodes {
            let mut degree = 0;
            for referenced in self.references(node).filter(|r| keep(node, r)) {
                dependents.entry(referenced).or_default().push(node);
                degree += 1;
            }
            pending.insert(node, degree);
        }

        let mut waves = Vec::new();
        while !pending.is_empty() {
            let mut ready: BTreeSet<&TableRef> = pending
                .iter()
                .filter(|(_, &degree)| degree == 0)
                .map(|(&node, _)| node)
                .collect();

            if ready.is_empty() {
                if !break_cycles {
                    break;
                }
                ready = self.sink_cycles(&pending, &keep);
                warn!(
                    "Foreign-key cycle among {}; loading these tables together",
                    ready
                        .iter()
                        .map(|t| t.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }

            for node in &ready {
                pending.remove(*node);
            }
            for node in &ready {
                for &dependent in dependents.get(*node).into_iter().flatten() {
                    if let Some(degree) = pending.get_mut(dependent) {
                        *degree -= 1;
                    }
                }
            }
            waves.push(ready.into_iter().cloned().collect());
        }

        let leftover = pending.into_keys().cloned().collect();
        (waves, leftover)
    }

    /// Pending nodes whose every pending descendant can reach them back,
    /// i.e. the members of cycles with no pending dependency outside the cycle.
    fn sink_cycles<'a>(
        &self,
        pending: &BTreeMap<&'a TableRef, usize>,
        keep: &impl Fn(&TableRef, &TableRef) -> bool,
    ) -> BTreeSet<&'a TableRef> {
        let reach = |start: &TableRef| {
            let mut seen: BTreeSet<TableRef> = BTreeSet::new();
            let mut queue: VecDeque<&TableRef> = VecDeque::from([start]);
            while let Some(current) = queue.pop_front() {
                for next in self.references(current) {
                    if keep(current, next)
                        && pending.contains_key(next)
                        && seen.insert(next.clone())
                    {
                        queue.push_back(next);
                    }
                }
            }
            seen
        };

        let reachable: BTreeMap<&TableRef, BTreeSet<TableRef>> =
            pending.keys().map(|&node| (node, reach(node))).collect();

        pending
            .keys()
            .copied()
            .filter(|&node| {
                reachable[node]
                    .iter()
                    .all(|other| reachable.get(other).is_some_and(|back| back.contains(node)))
            })
            .collect()
    }

    /// Graphviz DOT rendering, with optional per-table labels.
    pub fn to_dot(&self, labels: &BTreeMap<TableRef, String>) -> String {
        let mut out = String::from("digraph omop {\n  rankdir=LR;\n  node [shape=box];\n");
        for table in self.edges.keys() {
            let id = dot_escape(&table.to_string());
            match labels.get(table) {
                Some(label) => {
                    let _ = writeln!(
                        out,
                        "  \"{}\" [label=\"{}\\n{}\"];",
                        id,
                        id,
                        dot_escape(label)
                    );
                }
                None => {
                    let _ = writeln!(out, "  \"{}\";", id);
                }
            }
        }
        for (from, targets) in &self.edges {
            for to in targets {
                let _ = writeln!(
                    out,
                    "  \"{}\" -> \"{}\";",
                    dot_escape(&from.to_string()),
                    dot_escape(&to.to_string())
                );
            }
        }
        out.push_str("}\n");
        out
    }
}

fn dot_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Build the dependency graph of `schema` from the source catalog.
///
/// Fails as a whole when either catalog query fails.
pub async fn build_graph<S>(source: &S, schema: &str) -> Result<DependencyGraph>
where
    S: CatalogSource + ?Sized,
{
    let tables = source
        .list_tables(schema)
        .await
        .map_err(|e| PartitionError::SchemaIntrospection(format!("listing tables: {}", e)))?;
    let foreign_keys = source.foreign_keys(schema).await.map_err(|e| {
        PartitionError::SchemaIntrospection(format!("reading foreign keys: {}", e))
    })?;

    let mut graph = DependencyGraph::new();
    for table in tables {
        graph.add_table(table);
    }
    for fk in foreign_keys {
        debug!("FK {}: {} -> {}", fk.constraint_name, fk.from, fk.to);
        graph.add_edge(fk.from, fk.to);
    }

    info!(
        "Dependency graph for schema {}: {} tables, {} references",
        schema,
        graph.node_count(),
        graph.edge_count()
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDatabase;

    fn t(name: &str) -> TableRef {
        TableRef::new("cdm", name)
    }

    fn omop_graph() -> DependencyGraph {
        let mut g = DependencyGraph::new();
        g.add_edge(t("visit_occurrence"), t("person"));
        g.add_edge(t("condition_occurrence"), t("person"));
        g.add_edge(t("condition_occurrence"), t("visit_occurrence"));
        g.add_edge(t("visit_occurrence"), t("concept"));
        g.add_edge(t("person"), t("location"));
        g.add_table(t("cdm_source"));
        g
    }

    #[test]
    fn test_isolated_tables_are_nodes() {
        let g = omop_graph();
        assert!(g.contains(&t("cdm_source")));
        assert_eq!(g.node_count(), 6);
        assert_eq!(g.edge_count(), 5);
    }

    #[test]
    fn test_reachable_from() {
        let g = omop_graph();
        let reach = g.reachable_from(&t("condition_occurrence"));
        let expected: BTreeSet<TableRef> =
            [t("person"), t("visit_occurrence"), t("concept"), t("location")]
                .into_iter()
                .collect();
        assert_eq!(reach, expected);
        assert!(g.reachable_from(&t("cdm_source")).is_empty());
        assert!(g.has_path(&t("condition_occurrence"), &t("person")));
        assert!(!g.has_path(&t("person"), &t("visit_occurrence")));
    }

    #[test]
    fn test_related_tables_parents_first() {
        let g = omop_graph();
        let related = g.related_tables(&t("person"));
        assert_eq!(
            related,
            vec![t("person"), t("visit_occurrence"), t("condition_occurrence")]
        );
    }

    #[test]
    fn test_related_tables_anchor_without_referrers() {
        let g = omop_graph();
        assert_eq!(g.related_tables(&t("cdm_source")), vec![t("cdm_source")]);
        assert!(g.related_tables(&t("missing")).is_empty());
    }

    #[test]
    fn test_related_tables_cycle_is_lexicographic() {
        let mut g = DependencyGraph::new();
        g.add_edge(t("b"), t("a"));
        g.add_edge(t("a"), t("b"));
        g.add_edge(t("c"), t("a"));
        assert_eq!(g.related_tables(&t("a")), vec![t("a"), t("b"), t("c")]);
    }

    #[test]
    fn test_subgraph_of_related_tables() {
        let g = omop_graph();
        let related = g.related_tables(&t("visit_occurrence"));
        let sub = g.subgraph(&related);
        assert_eq!(sub.node_count(), 2);
        assert_eq!(sub.edge_count(), 1);
        assert!(sub.has_path(&t("condition_occurrence"), &t("visit_occurrence")));
        assert!(!sub.contains(&t("person")));
    }

    #[test]
    fn test_load_waves() {
        let g = omop_graph();
        let waves = g.load_waves();
        assert_eq!(
            waves,
            vec![
                vec![t("cdm_source"), t("concept"), t("location")],
                vec![t("person")],
                vec![t("visit_occurrence")],
                vec![t("condition_occurrence")],
            ]
        );
    }

    #[test]
    fn test_load_waves_with_cycle_and_self_reference() {
        let mut g = DependencyGraph::new();
        g.add_edge(t("a"), t("b"));
        g.add_edge(t("b"), t("a"));
        g.add_edge(t("d"), t("a"));
        g.add_edge(t("tree"), t("tree"));
        g.add_table(t("z"));

        let waves = g.load_waves();
        assert_eq!(
            waves,
            vec![vec![t("tree"), t("z")], vec![t("a"), t("b")], vec![t("d")]]
        );
        let placed: usize = waves.iter().map(Vec::len).sum();
        assert_eq!(placed, g.node_count());
    }

    #[test]
    fn test_to_dot() {
        let g = omop_graph();
        let mut labels = BTreeMap::new();
        labels.insert(t("person"), "ordinal_range(person_id)".to_string());
        let dot = g.to_dot(&labels);
        assert!(dot.starts_with("digraph omop {"));
        assert!(dot.contains("\"cdm.visit_occurrence\" -> \"cdm.person\";"));
        assert!(dot.contains("\"cdm.person\" [label=\"cdm.person\\nordinal_range(person_id)\"];"));
        assert!(dot.contains("  \"cdm.cdm_source\";"));
    }

    #[test]
    fn test_serde_roundtrip_keeps_structure() {
        let g = omop_graph();
        let json = serde_json::to_string(&g).unwrap();
        let back: DependencyGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, g);
    }

    #[tokio::test]
    async fn test_build_graph_from_catalog() {
        let db = MemoryDatabase::new("cdm")
            .table("person", &["person_id"], &["person_id"])
            .table(
                "visit_occurrence",
                &["visit_occurrence_id", "person_id"],
                &["visit_occurrence_id"],
            )
            .table("concept", &["concept_id"], &["concept_id"])
            .foreign_key("visit_occurrence", "person")
            .foreign_key("visit_occurrence", "concept");

        let g = build_graph(&db, "cdm").await.unwrap();
        assert_eq!(g.node_count(), 3);
        assert!(g.has_path(&t("visit_occurrence"), &t("person")));
    }

    #[tokio::test]
    async fn test_build_graph_catalog_failure_is_fatal() {
        let db = MemoryDatabase::new("cdm")
            .table("person", &["person_id"], &["person_id"])
            .fail_catalog();
        let err = build_graph(&db, "cdm").await.unwrap_err();
        assert!(matches!(err, PartitionError::SchemaIntrospection(_)));
    }
}
