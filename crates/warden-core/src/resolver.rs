//! The fixed-point resolver (spec §2 C4, §4.3).
//!
//! The resolver never mutates component or capability state itself (spec
//! §3 "Lifecycle: ... never by the resolver"); it only answers "which
//! transitions are enabled right now" and leaves applying them to the
//! supervisor.

use crate::capability::CapabilityRegistry;
use crate::component::{ComponentIdx, ComponentTable, SupervisionState};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverRequest {
    /// INACTIVE with all requires satisfied -> promote to STARTING.
    Promote(ComponentIdx),
    /// A live component lost a required capability -> demote to INACTIVE.
    Demote(ComponentIdx),
}

/// A single fixed-point pass. Returns the requests a caller should apply;
/// the count of requests is what the outer `resolve` loop uses to detect
/// convergence (spec §4.3 "Single pass ... Return the number of state
/// changes requested").
pub fn single_pass(components: &ComponentTable, capabilities: &CapabilityRegistry) -> Vec<ResolverRequest> {
    let mut requests = Vec::new();
    for (idx, component) in components.iter() {
        match component.state {
            SupervisionState::Inactive => {
                if component
                    .requires
                    .iter()
                    .all(|cap| capabilities.is_active(*cap))
                {
                    requests.push(ResolverRequest::Promote(idx));
                }
            }
            state if state.is_live() => {
                if component
                    .requires
                    .iter()
                    .any(|cap| !capabilities.is_active(*cap))
                {
                    requests.push(ResolverRequest::Demote(idx));
                }
            }
            _ => {}
        }
    }
    requests
}

/// Upper bound on resolver passes before declaring non-convergence a
/// design-time bug rather than a runtime condition (spec §4.3). Exposed so
/// `runtime::System::resolve_to_fixed_point` (which owns the mutable
/// tables and so drives the actual apply-then-repeat loop itself) can share
/// the same guard.
pub fn pass_guard(components: &ComponentTable) -> usize {
    components.len().max(1)
}

/// One entry per strongly-connected (or self-referential) cycle participant,
/// naming the capability edges along the cycle for the detailed report.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub components: Vec<ComponentIdx>,
    pub edges: Vec<(ComponentIdx, String, ComponentIdx)>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Builds the component -> requires -> provider-of-capability -> component
/// static graph used by cycle detection, topological layering, and impact
/// analysis.
fn build_adjacency(
    components: &ComponentTable,
    capabilities: &CapabilityRegistry,
) -> HashMap<ComponentIdx, Vec<(ComponentIdx, String)>> {
    let mut adjacency: HashMap<ComponentIdx, Vec<(ComponentIdx, String)>> = HashMap::new();
    for (idx, component) in components.iter() {
        let mut edges = Vec::new();
        for cap in &component.requires {
            if let Some(provider) = capabilities.provider(*cap) {
                edges.push((provider, capabilities.name(*cap).to_owned()));
            }
        }
        adjacency.insert(idx, edges);
    }
    adjacency
}

/// Offline, three-color depth-first cycle detection over the static graph
/// (spec §4.3 "Cycle detection"). Marks every component participating in a
/// cycle of length >= 2, plus any component requiring a capability it
/// itself provides.
pub fn detect_cycles(components: &ComponentTable, capabilities: &CapabilityRegistry) -> Vec<CycleReport> {
    let adjacency = build_adjacency(components, capabilities);
    let all_ids: Vec<ComponentIdx> = components.iter().map(|(i, _)| i).collect();

    let mut color: HashMap<ComponentIdx, Color> = all_ids.iter().map(|i| (*i, Color::White)).collect();
    let mut stack: Vec<ComponentIdx> = Vec::new();
    let mut cycle_members: HashSet<ComponentIdx> = HashSet::new();
    let mut reports: Vec<CycleReport> = Vec::new();

    fn visit(
        node: ComponentIdx,
        adjacency: &HashMap<ComponentIdx, Vec<(ComponentIdx, String)>>,
        color: &mut HashMap<ComponentIdx, Color>,
        stack: &mut Vec<ComponentIdx>,
        cycle_members: &mut HashSet<ComponentIdx>,
        reports: &mut Vec<CycleReport>,
    ) {
        color.insert(node, Color::Gray);
        stack.push(node);

        if let Some(edges) = adjacency.get(&node) {
            for (neighbor, cap_name) in edges {
                match color.get(neighbor).copied().unwrap_or(Color::White) {
                    Color::White => visit(*neighbor, adjacency, color, stack, cycle_members, reports),
                    Color::Gray => {
                        // Found a back edge: everything on the stack from
                        // `neighbor` onward participates in this cycle.
                        if let Some(pos) = stack.iter().position(|n| n == neighbor) {
                            let mut members: Vec<ComponentIdx> = stack[pos..].to_vec();
                            members.dedup();
                            let mut edges_report = Vec::new();
                            for w in stack[pos..].windows(2) {
                                if let Some(edge_list) = adjacency.get(&w[0]) {
                                    if let Some((_, name)) = edge_list.iter().find(|(n, _)| n == &w[1]) {
                                        edges_report.push((w[0], name.clone(), w[1]));
                                    }
                                }
                            }
                            edges_report.push((node, cap_name.clone(), *neighbor));
                            for m in &members {
                                cycle_members.insert(*m);
                            }
                            reports.push(CycleReport { components: members, edges: edges_report });
                        }
                    }
                    Color::Black => {}
                }
            }
        }

        stack.pop();
        color.insert(node, Color::Black);
    }

    for id in &all_ids {
        if color[id] == Color::White {
            visit(*id, &adjacency, &mut color, &mut stack, &mut cycle_members, &mut reports);
        }
    }

    reports
}

/// Returns the Kahn's-algorithm topological layering of the static graph:
/// each layer is the set of nodes with all dependencies in earlier layers.
/// Undefined (returns `None`) when the graph is cyclic (spec §4.3).
pub fn topological_layers(
    components: &ComponentTable,
    capabilities: &CapabilityRegistry,
) -> Option<Vec<Vec<ComponentIdx>>> {
    let adjacency = build_adjacency(components, capabilities);
    // in-degree here is "number of unresolved requirements"
    let mut indegree: HashMap<ComponentIdx, usize> =
        components.iter().map(|(i, _)| (i, adjacency.get(&i).map_or(0, Vec::len))).collect();

    // reverse_adjacency[provider] = components that require it
    let mut reverse: HashMap<ComponentIdx, Vec<ComponentIdx>> = HashMap::new();
    for (idx, edges) in &adjacency {
        for (provider, _) in edges {
            reverse.entry(*provider).or_default().push(*idx);
        }
    }

    let mut layers = Vec::new();
    let mut remaining: HashSet<ComponentIdx> = components.iter().map(|(i, _)| i).collect();
    let total = remaining.len();
    let mut processed = 0usize;

    loop {
        let frontier: Vec<ComponentIdx> = remaining
            .iter()
            .copied()
            .filter(|id| indegree.get(id).copied().unwrap_or(0) == 0)
            .collect();
        if frontier.is_empty() {
            break;
        }
        for id in &frontier {
            remaining.remove(id);
            processed += 1;
            if let Some(dependents) = reverse.get(id) {
                for dep in dependents {
                    if let Some(d) = indegree.get_mut(dep) {
                        *d = d.saturating_sub(1);
                    }
                }
            }
        }
        layers.push(frontier);
    }

    if processed != total {
        return None; // cycle present
    }
    Some(layers)
}

/// Components that directly require `capability_name` (spec §4.9
/// `reverse-dependencies`).
pub fn reverse_dependencies(
    components: &ComponentTable,
    capabilities: &CapabilityRegistry,
    capability_name: &str,
) -> Vec<ComponentIdx> {
    let Some(cap_idx) = capabilities.find(capability_name) else {
        return Vec::new();
    };
    components
        .iter()
        .filter(|(_, c)| c.requires_capability(cap_idx))
        .map(|(i, _)| i)
        .collect()
}

/// Transitive closure of components that would lose a live requirement if
/// `withdrawn` were removed (spec §4.3 "impact analysis" / §4.9
/// `simulate-remove`).
pub fn impact_of_removal(
    components: &ComponentTable,
    capabilities: &CapabilityRegistry,
    withdrawn: ComponentIdx,
) -> Vec<ComponentIdx> {
    let mut affected: HashSet<ComponentIdx> = HashSet::new();
    let mut frontier = vec![withdrawn];

    while let Some(current) = frontier.pop() {
        let provided_caps: Vec<_> = components.get(current).provides.clone();
        for (idx, component) in components.iter() {
            if idx == current || affected.contains(&idx) {
                continue;
            }
            if provided_caps.iter().any(|c| component.requires_capability(*c)) {
                affected.insert(idx);
                frontier.push(idx);
            }
        }
    }

    let _ = capabilities; // kept for symmetry with the other graph queries / future degraded-aware logic
    let mut result: Vec<ComponentIdx> = affected.into_iter().collect();
    result.sort_by_key(|i| i.0);
    result
}

/// A renderable graph export (spec §4.9 `export-graph`): nodes are
/// components, edges are (requirer, capability, provider).
#[derive(Debug, Clone)]
pub struct GraphExport {
    pub nodes: Vec<(ComponentIdx, String)>,
    pub edges: Vec<(ComponentIdx, String, ComponentIdx)>,
}

pub fn export_graph(components: &ComponentTable, capabilities: &CapabilityRegistry) -> GraphExport {
    let nodes = components.iter().map(|(i, c)| (i, c.name.clone())).collect();
    let mut edges = Vec::new();
    for (idx, edge_list) in build_adjacency(components, capabilities) {
        for (provider, cap_name) in edge_list {
            edges.push((idx, cap_name, provider));
        }
    }
    GraphExport { nodes, edges }
}

/// Renders a [`GraphExport`] in a DOT-like layout suitable for a visual
/// renderer (spec §4.9 `export-graph`).
pub fn render_dot(graph: &GraphExport, components: &ComponentTable) -> String {
    let mut out = String::from("digraph components {\n");
    for (idx, name) in &graph.nodes {
        let shape = if components.get(*idx).state == SupervisionState::Cycle { "doubleoctagon" } else { "box" };
        out.push_str(&format!("  \"{name}\" [shape={shape}];\n"));
    }
    for (requirer, cap, provider) in &graph.edges {
        let requirer_name = &components.get(*requirer).name;
        let provider_name = &components.get(*provider).name;
        out.push_str(&format!("  \"{requirer_name}\" -> \"{provider_name}\" [label=\"{cap}\"];\n"));
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Commandline, Component, Kind, RestartAccounting};
    use std::path::PathBuf;
    use std::time::Duration;

    fn make_component(name: &str, kind: Kind) -> Component {
        Component {
            name: name.to_owned(),
            kind,
            command: Commandline { program: PathBuf::from("/bin/true"), arguments: vec![] },
            env: Default::default(),
            requires_names: vec![],
            provides_names: vec![],
            requires: vec![],
            provides: vec![],
            state: SupervisionState::Inactive,
            pid: None,
            restart: RestartAccounting::new(Duration::from_secs(60), 5),
            readiness: Default::default(),
            health: None,
            isolation: Default::default(),
            upgrade_strategy: crate::component::UpgradeStrategy::Restart,
            restart_count: 0,
            started_at: None,
            health_fail_streak: 0,
        }
    }

    #[test]
    fn linear_chain_resolves_in_dependency_order() {
        let mut components = ComponentTable::new();
        let mut capabilities = CapabilityRegistry::new();

        let cap_a = capabilities.get_or_create("cap-a");
        let cap_b = capabilities.get_or_create("cap-b");

        let mut a = make_component("a", Kind::Service);
        a.provides = vec![cap_a];
        let a_idx = components.insert(a);

        let mut b = make_component("b", Kind::Service);
        b.requires = vec![cap_a];
        b.provides = vec![cap_b];
        components.insert(b);

        let mut c = make_component("c", Kind::Service);
        c.requires = vec![cap_a, cap_b];
        components.insert(c);

        // Nothing active yet: only A is eligible.
        let requests = single_pass(&components, &capabilities);
        assert_eq!(requests, vec![ResolverRequest::Promote(a_idx)]);

        // Activate A's capability; B becomes eligible, C is not yet.
        capabilities.activate(cap_a, a_idx);
        let requests = single_pass(&components, &capabilities);
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn missing_prerequisite_leaves_dependents_inactive() {
        let mut components = ComponentTable::new();
        let mut capabilities = CapabilityRegistry::new();
        // cap-a is mentioned (created) but nobody ever activates it.
        let cap_a = capabilities.get_or_create("cap-a");
        let mut b = make_component("b", Kind::Service);
        b.requires = vec![cap_a];
        components.insert(b);
        let requests = single_pass(&components, &capabilities);
        assert!(requests.is_empty());
    }

    #[test]
    fn cycle_detection_flags_both_participants_and_nothing_else() {
        let mut components = ComponentTable::new();
        let mut capabilities = CapabilityRegistry::new();

        let cap_x = capabilities.get_or_create("cap-x");
        let cap_y = capabilities.get_or_create("cap-y");

        let mut a = make_component("a", Kind::Service);
        a.provides = vec![cap_x];
        a.requires = vec![cap_y];
        let a_idx = components.insert(a);

        let mut b = make_component("b", Kind::Service);
        b.provides = vec![cap_y];
        b.requires = vec![cap_x];
        let b_idx = components.insert(b);

        let unrelated = make_component("u", Kind::Service);
        components.insert(unrelated);

        capabilities.activate(cap_x, a_idx);
        capabilities.activate(cap_y, b_idx);

        let reports = detect_cycles(&components, &capabilities);
        let all_members: HashSet<ComponentIdx> =
            reports.iter().flat_map(|r| r.components.iter().copied()).collect();
        assert!(all_members.contains(&a_idx));
        assert!(all_members.contains(&b_idx));
        assert_eq!(all_members.len(), 2);
    }

    #[test]
    fn topological_layers_none_when_cyclic() {
        let mut components = ComponentTable::new();
        let mut capabilities = CapabilityRegistry::new();
        let cap_x = capabilities.get_or_create("cap-x");
        let cap_y = capabilities.get_or_create("cap-y");

        let mut a = make_component("a", Kind::Service);
        a.provides = vec![cap_x];
        a.requires = vec![cap_y];
        let a_idx = components.insert(a);
        let mut b = make_component("b", Kind::Service);
        b.provides = vec![cap_y];
        b.requires = vec![cap_x];
        let b_idx = components.insert(b);

        capabilities.activate(cap_x, a_idx);
        capabilities.activate(cap_y, b_idx);

        assert!(topological_layers(&components, &capabilities).is_none());
    }

    #[test]
    fn topological_layers_valid_linear_extension_when_acyclic() {
        let mut components = ComponentTable::new();
        let mut capabilities = CapabilityRegistry::new();
        let cap_a = capabilities.get_or_create("cap-a");

        let a = make_component("a", Kind::Service);
        let a_idx = components.insert(a);

        let mut b = make_component("b", Kind::Service);
        b.requires = vec![cap_a];
        components.insert(b);

        capabilities.activate(cap_a, a_idx);

        let layers = topological_layers(&components, &capabilities).unwrap();
        // a has no requirements so it's in the first layer; b requires a's
        // capability so it comes later.
        assert_eq!(layers[0], vec![a_idx]);
        assert_eq!(layers.len(), 2);
    }

    #[test]
    fn impact_analysis_finds_transitive_dependents() {
        let mut components = ComponentTable::new();
        let mut capabilities = CapabilityRegistry::new();
        let cap_a = capabilities.get_or_create("cap-a");
        let cap_b = capabilities.get_or_create("cap-b");

        let mut a = make_component("a", Kind::Service);
        a.provides = vec![cap_a];
        let a_idx = components.insert(a);

        let mut b = make_component("b", Kind::Service);
        b.requires = vec![cap_a];
        b.provides = vec![cap_b];
        let b_idx = components.insert(b);

        let mut c = make_component("c", Kind::Service);
        c.requires = vec![cap_b];
        let c_idx = components.insert(c);

        let impacted = impact_of_removal(&components, &capabilities, a_idx);
        assert_eq!(impacted, vec![b_idx, c_idx]);
    }

    #[test]
    fn single_pass_reports_every_eligible_promotion_at_once() {
        let mut components = ComponentTable::new();
        let capabilities = CapabilityRegistry::new();
        components.insert(make_component("a", Kind::Service));
        components.insert(make_component("b", Kind::Service));

        let requests = single_pass(&components, &capabilities);
        assert_eq!(requests.len(), 2);
    }
}
