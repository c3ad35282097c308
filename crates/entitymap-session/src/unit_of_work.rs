//! Unit of work: collects persist/delete requests, turns them into a
//! command graph and hands the ordered plan to the flush executor.
//!
//! # State machine
//!
//! ```text
//! Collecting --plan--> GraphBuilt --execute--> Executing --+--> Committed
//!      |                                                   |
//!      +--------------- planning error ------------------> +--> Failed
//! ```
//!
//! Requests are only accepted while collecting. Planning mutates entities
//! (foreign keys copied between related entities, orphans detached); every
//! such mutation is journaled so a failed run leaves entities as they were.

use crate::flush::{self, FlushResult};
use crate::graph::{Command, CommandGraph, CommandKind};
use crate::heap::{RelationState, Status};
use crate::loader::Loader;
use crate::relation::{RelationRef, RelationStrategy};
use entitymap_core::{
    ConsistencyErrorKind, EntityRef, Error, Related, Result, SchemaErrorKind, StateError, Value,
    WriteExecutor,
};
use entitymap_schema::SchemaEntry;
use std::collections::HashMap;

/// Where a unit of work is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UowState {
    #[default]
    Collecting,
    GraphBuilt,
    Executing,
    Committed,
    Failed,
}

/// Pending persist and delete requests of a session.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    state: UowState,
    persist: Vec<EntityRef>,
    delete: Vec<EntityRef>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> UowState {
        self.state
    }

    pub fn is_empty(&self) -> bool {
        self.persist.is_empty() && self.delete.is_empty()
    }

    /// Number of queued persist and delete requests.
    pub fn pending(&self) -> (usize, usize) {
        (self.persist.len(), self.delete.len())
    }

    fn ensure_collecting(&self) -> Result<()> {
        if self.state == UowState::Collecting {
            Ok(())
        } else {
            Err(Error::State(StateError {
                message: format!("unit of work is {:?}; requests are no longer accepted", self.state),
            }))
        }
    }

    /// Queue `entity` (and, through cascading relations, its graph) for writing.
    pub fn persist(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_collecting()?;
        self.delete.retain(|e| !e.ptr_eq(entity));
        if !self.persist.iter().any(|e| e.ptr_eq(entity)) {
            self.persist.push(entity.clone());
        }
        Ok(())
    }

    /// Queue `entity` for deletion.
    pub fn delete(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_collecting()?;
        self.persist.retain(|e| !e.ptr_eq(entity));
        if !self.delete.iter().any(|e| e.ptr_eq(entity)) {
            self.delete.push(entity.clone());
        }
        Ok(())
    }

    /// Plan and execute all queued requests.
    ///
    /// Deletes are discovered before persists, so with no dependency between
    /// them deletes run first.
    #[tracing::instrument(level = "info", skip_all, fields(persist = self.persist.len(), delete = self.delete.len()))]
    pub fn run(
        &mut self,
        loader: Loader<'_>,
        writer: &dyn WriteExecutor,
        transactional: bool,
    ) -> Result<FlushResult> {
        self.ensure_collecting()?;
        let mut planner = Planner::new(loader);
        let planned = self.collect(&mut planner).and_then(|()| planner.graph.order());
        let order = match planned {
            Ok(order) => order,
            Err(e) => {
                tracing::warn!(error = %e, "Planning failed");
                planner.abort();
                self.state = UowState::Failed;
                return Err(e);
            }
        };
        self.state = UowState::GraphBuilt;
        tracing::debug!(commands = planner.graph.len(), "Command graph built");

        self.state = UowState::Executing;
        let outcome = flush::execute(planner, &order, writer, transactional);
        self.state = if outcome.is_ok() {
            UowState::Committed
        } else {
            UowState::Failed
        };
        outcome
    }

    fn collect(&self, planner: &mut Planner<'_>) -> Result<()> {
        for entity in &self.delete {
            planner.visit_delete(entity)?;
        }
        for entity in &self.persist {
            planner.visit_persist(entity)?;
        }
        planner.settle()
    }
}

/// One journaled mutation.
#[derive(Debug)]
enum Revert {
    Field(EntityRef, String, Value),
    Relation(EntityRef, String, Option<Related>),
    Status(EntityRef, Status),
}

/// Undo log for in-memory mutations made while planning and executing.
#[derive(Debug, Default)]
pub(crate) struct Journal {
    entries: Vec<Revert>,
}

impl Journal {
    /// Set a field, remembering the previous value.
    pub(crate) fn assign(&mut self, entity: &EntityRef, field: &str, value: Value) {
        let previous = entity.get(field);
        if previous == value {
            return;
        }
        self.entries
            .push(Revert::Field(entity.clone(), field.to_string(), previous));
        entity.set(field, value);
    }

    /// Replace a relation, remembering the previous one.
    pub(crate) fn relate(&mut self, entity: &EntityRef, name: &str, related: Related) {
        let previous = entity.related(name);
        self.entries
            .push(Revert::Relation(entity.clone(), name.to_string(), previous));
        entity.set_related(name, related);
    }

    /// Remember the status an entity had before this run touched it.
    pub(crate) fn status(&mut self, entity: &EntityRef, status: Status) {
        self.entries.push(Revert::Status(entity.clone(), status));
    }

    /// Undo everything, newest first.
    pub(crate) fn revert(self, heap: &mut crate::heap::Heap) {
        let count = self.entries.len();
        for entry in self.entries.into_iter().rev() {
            match entry {
                Revert::Field(entity, field, value) => entity.set(field, value),
                Revert::Relation(entity, name, Some(related)) => entity.set_related(name, related),
                Revert::Relation(entity, name, None) => {
                    entity.write().clear_relation(&name);
                }
                Revert::Status(entity, status) => heap.set_status(&entity, status),
            }
        }
        tracing::debug!(count, "Reverted in-memory changes");
    }
}

/// Builds the command graph for one run.
pub(crate) struct Planner<'s> {
    pub(crate) loader: Loader<'s>,
    pub(crate) graph: CommandGraph,
    pub(crate) journal: Journal,
    persisted: HashMap<usize, usize>,
    deleted: HashMap<usize, Option<usize>>,
    pub(crate) baselines: Vec<(EntityRef, String, Vec<EntityRef>)>,
    /// Related entities a non-cascading relation needs written by now.
    required: Vec<Requirement>,
    /// Key edges between entities that are only ordered when both end up
    /// with a command of their own.
    late_edges: Vec<LateEdge>,
}

struct Requirement {
    owner: String,
    relation: String,
    qualified: String,
    entity: EntityRef,
}

struct LateEdge {
    provider: EntityRef,
    after: Successor,
    link: Option<usize>,
}

enum Successor {
    Entity(EntityRef),
    Command(usize),
}

impl<'s> Planner<'s> {
    pub(crate) fn new(loader: Loader<'s>) -> Self {
        Self {
            loader,
            graph: CommandGraph::new(),
            journal: Journal::default(),
            persisted: HashMap::new(),
            deleted: HashMap::new(),
            baselines: Vec::new(),
            required: Vec::new(),
            late_edges: Vec::new(),
        }
    }

    fn entry_of(&self, entity: &EntityRef) -> Result<&'s SchemaEntry> {
        let registry = self.loader.registry;
        let entry = registry.entry(&entity.role())?;
        if entry.embeddable {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                Some(&entry.role),
                format!("'{}' is embeddable and cannot be written on its own", entry.role),
            ));
        }
        Ok(entry)
    }

    /// Track `entity` if the heap does not know it yet.
    pub(crate) fn track(&mut self, entity: &EntityRef, entry: &SchemaEntry) {
        if self.loader.heap.has(entity) {
            return;
        }
        self.loader.heap.register(entity, &entry.role, None, Status::New);
    }

    fn schedule(&mut self, entity: &EntityRef, status: Status) {
        if let Some(node) = self.loader.heap.get(entity) {
            let previous = node.status();
            self.journal.status(entity, previous);
        }
        self.loader.heap.set_status(entity, status);
    }

    /// Queue an insert or update for `entity` and walk its relations.
    /// Returns the entity's command index.
    pub(crate) fn visit_persist(&mut self, entity: &EntityRef) -> Result<usize> {
        if let Some(&index) = self.persisted.get(&entity.addr()) {
            return Ok(index);
        }
        if let Some(&Some(index)) = self.deleted.get(&entity.addr()) {
            tracing::debug!(role = %entity.role(), "Entity is scheduled for deletion; not persisting");
            return Ok(index);
        }

        let entry = self.entry_of(entity)?;
        self.track(entity, entry);
        let persisted = self.loader.heap.is_persisted(entity);
        let (kind, status) = if persisted {
            (CommandKind::Update, Status::ScheduledUpdate)
        } else {
            (CommandKind::Insert, Status::ScheduledInsert)
        };
        let index = self
            .graph
            .add(Command::entity(kind, &entry.role, entry.table_ref(), entity));
        self.persisted.insert(entity.addr(), index);
        self.schedule(entity, status);
        tracing::trace!(role = %entry.role, ?kind, index, "Queued command");

        let registry = self.loader.registry;
        for (name, def) in &entry.relations {
            let rel = RelationRef {
                owner: entry,
                name,
                def,
                target: registry.entry(&def.target)?,
            };
            RelationStrategy::for_kind(def.kind).queue(self, &rel, entity, index)?;
        }
        Ok(index)
    }

    /// Queue the insert of a new through-entity as a pivot link. Its keys
    /// come from the link's key links; its relations are not walked.
    pub(crate) fn queue_link(&mut self, entity: &EntityRef, entry: &SchemaEntry) -> usize {
        if let Some(&index) = self.persisted.get(&entity.addr()) {
            return index;
        }
        self.track(entity, entry);
        let index = self.graph.add(Command::entity(
            CommandKind::Link,
            &entry.role,
            entry.table_ref(),
            entity,
        ));
        self.persisted.insert(entity.addr(), index);
        self.schedule(entity, Status::ScheduledInsert);
        tracing::trace!(role = %entry.role, index, "Queued through-entity link");
        index
    }

    /// Queue a delete of `entity`, cascading through owned relations.
    /// Entities that were never written are only detached.
    pub(crate) fn visit_delete(&mut self, entity: &EntityRef) -> Result<Option<usize>> {
        if let Some(&index) = self.deleted.get(&entity.addr()) {
            return Ok(index);
        }
        let entry = self.entry_of(entity)?;
        if !self.loader.heap.is_persisted(entity) {
            tracing::debug!(role = %entry.role, "Deleting unpersisted entity; detaching");
            self.deleted.insert(entity.addr(), None);
            self.loader.heap.detach(entity);
            return Ok(None);
        }

        let index = self.graph.add(Command::entity(
            CommandKind::Delete,
            &entry.role,
            entry.table_ref(),
            entity,
        ));
        self.deleted.insert(entity.addr(), Some(index));
        self.schedule(entity, Status::ScheduledDelete);

        let registry = self.loader.registry;
        for (name, def) in &entry.relations {
            let rel = RelationRef {
                owner: entry,
                name,
                def,
                target: registry.entry(&def.target)?,
            };
            RelationStrategy::for_kind(def.kind).queue_delete(self, &rel, entity, index)?;
        }
        Ok(Some(index))
    }

    /// Command already queued for `entity` in this run.
    pub(crate) fn command_of(&self, entity: &EntityRef) -> Option<usize> {
        self.persisted.get(&entity.addr()).copied()
    }

    pub(crate) fn is_insert(&self, command: usize) -> bool {
        self.graph.command(command).kind == CommandKind::Insert
    }

    /// Whether a row for `entity` exists in storage already.
    pub(crate) fn is_persisted(&self, entity: &EntityRef) -> bool {
        self.loader.heap.is_persisted(entity)
    }

    pub(crate) fn relation_state(&self, entity: &EntityRef, name: &str) -> Option<RelationState> {
        self.loader
            .heap
            .get(entity)
            .and_then(|node| node.relation_state(name).cloned())
    }

    /// A non-cascading relation may only point at entities that are
    /// persisted or written by this run. Checked once every request has
    /// been visited, so the order of `persist` calls does not matter.
    pub(crate) fn require_persisted(&mut self, rel: &RelationRef<'_>, entity: &EntityRef) {
        if self.is_persisted(entity) || self.command_of(entity).is_some() {
            return;
        }
        self.required.push(Requirement {
            owner: rel.owner.role.clone(),
            relation: rel.name.to_string(),
            qualified: rel.qualified(),
            entity: entity.clone(),
        });
    }

    /// Order `holder` after an inserted `provider` if both are written by
    /// this run, whatever order they are visited in.
    pub(crate) fn depend_late(&mut self, provider: &EntityRef, holder: &EntityRef, link: usize) {
        self.late_edges.push(LateEdge {
            provider: provider.clone(),
            after: Successor::Entity(holder.clone()),
            link: Some(link),
        });
    }

    /// Order `command` after `provider` if the provider is inserted by
    /// this run.
    pub(crate) fn depend_late_command(&mut self, provider: &EntityRef, command: usize) {
        self.late_edges.push(LateEdge {
            provider: provider.clone(),
            after: Successor::Command(command),
            link: None,
        });
    }

    /// Resolve deferred requirements and edges once collection is done.
    pub(crate) fn settle(&mut self) -> Result<()> {
        for req in &self.required {
            if self.is_persisted(&req.entity) || self.command_of(&req.entity).is_some() {
                continue;
            }
            return Err(Error::consistency(
                ConsistencyErrorKind::NotPersisted,
                &req.owner,
                Some(&req.relation),
                format!(
                    "'{}' does not cascade and the related {} is not persisted",
                    req.qualified,
                    req.entity.role()
                ),
            ));
        }
        for edge in std::mem::take(&mut self.late_edges) {
            let after = match &edge.after {
                Successor::Entity(holder) => self.command_of(holder),
                Successor::Command(index) => Some(*index),
            };
            let (Some(provider), Some(after)) = (self.command_of(&edge.provider), after) else {
                continue;
            };
            if self.is_insert(provider) {
                self.graph.depend(provider, after, edge.link);
            }
        }
        Ok(())
    }

    /// Baseline to record for a relation once the run commits.
    pub(crate) fn record_baseline(&mut self, entity: &EntityRef, name: &str, members: Vec<EntityRef>) {
        self.baselines.push((entity.clone(), name.to_string(), members));
    }

    /// Undo planning side effects after a failure.
    pub(crate) fn abort(self) {
        let Planner { loader, journal, .. } = self;
        journal.revert(loader.heap);
    }
}
