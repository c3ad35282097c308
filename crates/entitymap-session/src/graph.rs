//! Write commands and their dependency graph.
//!
//! Commands are nodes; an edge `a -> b` means "a must commit before b".
//! Edges created by foreign keys carry the [`KeyLink`] that caused them,
//! which is what lets a cycle be broken: a deferrable link is dropped from
//! the graph, the holder is written with a null key, and a [`CommandKind::Patch`]
//! writes the key once the provider exists.

use entitymap_core::{ConsistencyErrorKind, EntityRef, Error, Result, TableRef, Value};
use std::collections::{BTreeMap, BTreeSet};

/// What a command does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Insert,
    Update,
    Delete,
    /// Deferred foreign-key update closing a broken cycle.
    Patch,
    /// Pivot row insert.
    Link,
    /// Pivot row delete.
    Unlink,
}

/// A foreign key that must be copied from `provider` to `holder` before
/// the holder is written.
#[derive(Debug, Clone)]
pub struct KeyLink {
    pub holder: EntityRef,
    pub holder_fields: Vec<String>,
    pub provider: EntityRef,
    pub provider_fields: Vec<String>,
    /// `role.relation`, for errors and logs.
    pub relation: String,
    pub deferrable: bool,
    /// Set when the link was cut to break a cycle.
    pub deferred: bool,
}

/// Pivot row between two entities, keyed once both are written.
#[derive(Debug, Clone)]
pub struct PivotLink {
    pub source: EntityRef,
    pub source_fields: Vec<String>,
    pub inner_columns: Vec<String>,
    pub target: EntityRef,
    pub target_fields: Vec<String>,
    pub outer_columns: Vec<String>,
}

/// One write.
#[derive(Debug, Clone)]
pub struct Command {
    pub kind: CommandKind,
    pub role: String,
    pub table: TableRef,
    /// Entity written by insert/update/delete/patch; `None` for raw row writes.
    pub entity: Option<EntityRef>,
    /// Column values for raw updates.
    pub values: BTreeMap<String, Value>,
    /// Row filter for raw updates, deletes and unlinks.
    pub identity: BTreeMap<String, Value>,
    /// Link a patch writes.
    pub link: Option<usize>,
    pub pivot: Option<PivotLink>,
}

impl Command {
    /// Insert, update or delete of a tracked entity.
    pub fn entity(kind: CommandKind, role: &str, table: TableRef, entity: &EntityRef) -> Self {
        Self {
            kind,
            role: role.to_string(),
            table,
            entity: Some(entity.clone()),
            values: BTreeMap::new(),
            identity: BTreeMap::new(),
            link: None,
            pivot: None,
        }
    }

    /// Update or delete of a row addressed only by its key.
    pub fn raw(
        kind: CommandKind,
        role: &str,
        table: TableRef,
        values: BTreeMap<String, Value>,
        identity: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            kind,
            role: role.to_string(),
            table,
            entity: None,
            values,
            identity,
            link: None,
            pivot: None,
        }
    }

    pub fn link(role: &str, table: TableRef, pivot: PivotLink) -> Self {
        Self {
            kind: CommandKind::Link,
            role: role.to_string(),
            table,
            entity: None,
            values: BTreeMap::new(),
            identity: BTreeMap::new(),
            link: None,
            pivot: Some(pivot),
        }
    }
}

#[derive(Debug, Clone)]
struct Edge {
    from: usize,
    to: usize,
    link: Option<usize>,
    active: bool,
}

/// Commands plus "must commit before" edges.
#[derive(Debug, Default)]
pub struct CommandGraph {
    commands: Vec<Command>,
    edges: Vec<Edge>,
    links: Vec<KeyLink>,
}

impl CommandGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command; its index is its discovery order.
    pub fn add(&mut self, command: Command) -> usize {
        self.commands.push(command);
        self.commands.len() - 1
    }

    pub fn add_link(&mut self, link: KeyLink) -> usize {
        self.links.push(link);
        self.links.len() - 1
    }

    /// `before` must commit before `after`.
    pub fn depend(&mut self, before: usize, after: usize, link: Option<usize>) {
        self.edges.push(Edge {
            from: before,
            to: after,
            link,
            active: true,
        });
    }

    pub fn command(&self, index: usize) -> &Command {
        &self.commands[index]
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn links(&self) -> &[KeyLink] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Deterministic execution order.
    ///
    /// Kahn's algorithm with ties broken by discovery order. When no command
    /// is ready, strongly connected components of what is left are computed
    /// and the first deferrable link inside the earliest cycle is cut, adding
    /// a patch command. A cycle without a deferrable link is an error.
    #[tracing::instrument(level = "debug", skip(self), fields(commands = self.commands.len()))]
    pub fn order(&mut self) -> Result<Vec<usize>> {
        loop {
            let (order, remaining) = self.kahn();
            if remaining.is_empty() {
                tracing::debug!(steps = order.len(), "Computed write order");
                return Ok(order);
            }
            let cycles = self.cycles(&remaining);
            let Some(cycle) = cycles.first() else {
                return Err(Error::Custom("write graph has no ready command".into()));
            };
            self.break_cycle(cycle)?;
        }
    }

    fn kahn(&self) -> (Vec<usize>, BTreeSet<usize>) {
        let n = self.commands.len();
        let mut indegree = vec![0usize; n];
        let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); n];
        for edge in self.edges.iter().filter(|e| e.active) {
            indegree[edge.to] += 1;
            outgoing[edge.from].push(edge.to);
        }
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &to in &outgoing[next] {
                indegree[to] -= 1;
                if indegree[to] == 0 {
                    ready.insert(to);
                }
            }
        }
        let done: BTreeSet<usize> = order.iter().copied().collect();
        let remaining = (0..n).filter(|i| !done.contains(i)).collect();
        (order, remaining)
    }

    /// Cyclic strongly connected components among `nodes` (Tarjan), ordered
    /// by their smallest command index.
    fn cycles(&self, nodes: &BTreeSet<usize>) -> Vec<Vec<usize>> {
        let mut adjacency: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut self_loops = BTreeSet::new();
        for edge in self.edges.iter().filter(|e| e.active) {
            if nodes.contains(&edge.from) && nodes.contains(&edge.to) {
                adjacency.entry(edge.from).or_default().push(edge.to);
                if edge.from == edge.to {
                    self_loops.insert(edge.from);
                }
            }
        }

        let mut tarjan = Tarjan::default();
        for &node in nodes {
            if !tarjan.index.contains_key(&node) {
                tarjan.visit(node, &adjacency);
            }
        }

        let mut cycles: Vec<Vec<usize>> = tarjan
            .components
            .into_iter()
            .filter(|c| c.len() > 1 || c.first().is_some_and(|n| self_loops.contains(n)))
            .map(|mut c| {
                c.sort_unstable();
                c
            })
            .collect();
        cycles.sort_by_key(|c| c.first().copied());
        cycles
    }

    fn break_cycle(&mut self, cycle: &[usize]) -> Result<()> {
        let members: BTreeSet<usize> = cycle.iter().copied().collect();
        let candidate = self.edges.iter().position(|e| {
            e.active
                && members.contains(&e.from)
                && members.contains(&e.to)
                && e.link
                    .is_some_and(|l| self.links[l].deferrable && !self.links[l].deferred)
        });

        let Some(edge_index) = candidate else {
            let roles: Vec<&str> = cycle
                .iter()
                .map(|&i| self.commands[i].role.as_str())
                .collect();
            return Err(Error::consistency(
                ConsistencyErrorKind::UnresolvableCycle,
                roles.first().copied().unwrap_or_default(),
                None,
                format!(
                    "dependency cycle without a deferrable relation: {}",
                    roles.join(" -> ")
                ),
            ));
        };

        let Edge { from, to, link, .. } = self.edges[edge_index].clone();
        let Some(link) = link else {
            return Ok(());
        };
        self.links[link].deferred = true;
        for edge in &mut self.edges {
            if edge.link == Some(link) {
                edge.active = false;
            }
        }

        let holder_cmd = &self.commands[to];
        let mut patch = Command::entity(
            CommandKind::Patch,
            &holder_cmd.role,
            holder_cmd.table.clone(),
            &self.links[link].holder,
        );
        patch.link = Some(link);
        let patch_index = self.add(patch);
        self.depend(from, patch_index, None);
        if from != to {
            self.depend(to, patch_index, None);
        }
        tracing::debug!(
            relation = %self.links[link].relation,
            holder = to,
            provider = from,
            "Deferred foreign key to break cycle"
        );
        Ok(())
    }
}

#[derive(Default)]
struct Tarjan {
    counter: usize,
    index: BTreeMap<usize, usize>,
    lowlink: BTreeMap<usize, usize>,
    stack: Vec<usize>,
    on_stack: BTreeSet<usize>,
    components: Vec<Vec<usize>>,
}

impl Tarjan {
    /// Visit everything reachable from `root`. The walk keeps its own frame
    /// stack of (node, next successor position).
    fn visit(&mut self, root: usize, adjacency: &BTreeMap<usize, Vec<usize>>) {
        let successors = |node: usize| adjacency.get(&node).map(Vec::as_slice).unwrap_or_default();
        let mut frames: Vec<(usize, usize)> = vec![(root, 0)];
        self.open(root);

        while let Some(frame) = frames.last_mut() {
            let (node, position) = *frame;
            if let Some(&next) = successors(node).get(position) {
                frame.1 += 1;
                if !self.index.contains_key(&next) {
                    self.open(next);
                    frames.push((next, 0));
                } else if self.on_stack.contains(&next) {
                    let low = self.lowlink[&node].min(self.index[&next]);
                    self.lowlink.insert(node, low);
                }
                continue;
            }

            frames.pop();
            if let Some(&(parent, _)) = frames.last() {
                let low = self.lowlink[&parent].min(self.lowlink[&node]);
                self.lowlink.insert(parent, low);
            }
            if self.lowlink[&node] == self.index[&node] {
                let mut component = Vec::new();
                while let Some(top) = self.stack.pop() {
                    self.on_stack.remove(&top);
                    component.push(top);
                    if top == node {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }

    fn open(&mut self, node: usize) {
        self.index.insert(node, self.counter);
        self.lowlink.insert(node, self.counter);
        self.counter += 1;
        self.stack.push(node);
        self.on_stack.insert(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitymap_core::Entity;

    fn entity(role: &str) -> EntityRef {
        EntityRef::new(Entity::new(role))
    }

    fn insert(graph: &mut CommandGraph, e: &EntityRef) -> usize {
        graph.add(Command::entity(
            CommandKind::Insert,
            &e.role(),
            TableRef::new("default", e.role()),
            e,
        ))
    }

    fn link(graph: &mut CommandGraph, holder: &EntityRef, provider: &EntityRef, deferrable: bool) -> usize {
        graph.add_link(KeyLink {
            holder: holder.clone(),
            holder_fields: vec!["ref_id".into()],
            provider: provider.clone(),
            provider_fields: vec!["id".into()],
            relation: format!("{}.ref", holder.role()),
            deferrable,
            deferred: false,
        })
    }

    #[test]
    fn acyclic_order_prefers_earliest_ready_command() {
        let mut graph = CommandGraph::new();
        let post = entity("post");
        let user = entity("user");
        let tag = entity("tag");
        let p = insert(&mut graph, &post);
        let u = insert(&mut graph, &user);
        let t = insert(&mut graph, &tag);
        let l = link(&mut graph, &post, &user, false);
        graph.depend(u, p, Some(l));
        assert_eq!(graph.order().unwrap(), vec![u, p, t]);
    }

    #[test]
    fn mutual_cycle_is_broken_with_one_patch() {
        let mut graph = CommandGraph::new();
        let a = entity("a");
        let b = entity("b");
        let ia = insert(&mut graph, &a);
        let ib = insert(&mut graph, &b);
        let la = link(&mut graph, &a, &b, true);
        let lb = link(&mut graph, &b, &a, true);
        graph.depend(ib, ia, Some(la));
        graph.depend(ia, ib, Some(lb));

        let order = graph.order().unwrap();
        assert_eq!(order.len(), 3);
        assert_eq!(order, vec![ia, ib, 2]);
        assert_eq!(graph.command(2).kind, CommandKind::Patch);
        assert!(graph.links()[la].deferred);
        assert!(!graph.links()[lb].deferred);
    }

    #[test]
    fn self_reference_is_patched() {
        let mut graph = CommandGraph::new();
        let node = entity("node");
        let i = insert(&mut graph, &node);
        let l = link(&mut graph, &node, &node, true);
        graph.depend(i, i, Some(l));
        let order = graph.order().unwrap();
        assert_eq!(order, vec![i, 1]);
        assert_eq!(graph.command(1).link, Some(l));
    }

    #[test]
    fn cycle_without_deferrable_link_fails() {
        let mut graph = CommandGraph::new();
        let a = entity("a");
        let b = entity("b");
        let ia = insert(&mut graph, &a);
        let ib = insert(&mut graph, &b);
        let la = link(&mut graph, &a, &b, false);
        let lb = link(&mut graph, &b, &a, false);
        graph.depend(ib, ia, Some(la));
        graph.depend(ia, ib, Some(lb));
        let err = graph.order().unwrap_err();
        assert_eq!(
            err.consistency_kind(),
            Some(ConsistencyErrorKind::UnresolvableCycle)
        );
    }

    #[test]
    fn long_ring_is_broken_without_deep_recursion() {
        const LEN: usize = 50_000;
        let mut graph = CommandGraph::new();
        let nodes: Vec<EntityRef> = (0..LEN).map(|_| entity("node")).collect();
        let commands: Vec<usize> = nodes.iter().map(|n| insert(&mut graph, n)).collect();
        for i in 1..LEN {
            let l = link(&mut graph, &nodes[i], &nodes[i - 1], false);
            graph.depend(commands[i - 1], commands[i], Some(l));
        }
        let closing = link(&mut graph, &nodes[0], &nodes[LEN - 1], true);
        graph.depend(commands[LEN - 1], commands[0], Some(closing));

        let order = graph.order().unwrap();
        assert_eq!(order.len(), LEN + 1);
        assert_eq!(&order[..LEN], commands.as_slice());
        assert_eq!(graph.command(order[LEN]).link, Some(closing));
    }

    #[test]
    fn separate_cycles_are_reported_by_smallest_member() {
        let mut graph = CommandGraph::new();
        let es: Vec<EntityRef> = (0..5).map(|_| entity("node")).collect();
        let c: Vec<usize> = es.iter().map(|e| insert(&mut graph, e)).collect();
        graph.depend(c[3], c[4], None);
        graph.depend(c[4], c[3], None);
        graph.depend(c[0], c[1], None);
        graph.depend(c[1], c[2], None);
        graph.depend(c[2], c[0], None);

        let all: BTreeSet<usize> = c.iter().copied().collect();
        let cycles = graph.cycles(&all);
        assert_eq!(cycles, vec![vec![c[0], c[1], c[2]], vec![c[3], c[4]]]);
    }
}
