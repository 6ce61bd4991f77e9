//! Session and unit of work for relmodel.
//!
//! `relmodel-session` is the **unit-of-work layer**. It coordinates record
//! identity, change tracking and transactional persistence over a resolved
//! schema:
//!
//! - **Identity map**: at most one live record instance per primary key per
//!   session, weakly held (`records_loaded`).
//! - **Changed set**: strongly held, insertion-ordered working set of new,
//!   modified and deleting records (`records_changed`).
//! - **Save pipeline**: before-save hook fixpoint, batched validation,
//!   dependency-ordered submission, all-or-nothing commit, classified
//!   conflicts.
//!
//! # Design
//!
//! - A session is a single-threaded unit of work bound to one logical
//!   operation. A read-only session may be shared for concurrent reads; all
//!   shared state sits behind locks.
//! - Mutation is routed through session methods (`set_value`, `set_ref`,
//!   `delete_entity`), which keeps status transitions and changed-set
//!   enlistment in one place. Records carry the owning session's id, not a
//!   back-pointer.
//! - All round-trips go through the injected [`CommandRunner`]; the session
//!   never produces SQL.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(schema, runner);
//!
//! let order = session.new_entity("Order")?;
//! session.set_value(&order, "Total", Value::Decimal("9.99".into()))?;
//! session.set_ref(&order, "Customer", Some(&customer))?;
//!
//! session.save_changes(&cx).await?;
//! ```

pub mod identity_map;
pub mod record;
mod save;

pub use identity_map::RecordMap;
pub use record::{EntityRecord, RecordRef, RecordStatus};

use asupersync::{Cx, Outcome};
use relmodel_core::{
    Clock, CommandRunner, ConflictParser, DeleteAction, Error, KeyLookup, ReferenceProbe, Result,
    StandardConflictParser, SystemClock, Value,
};
use relmodel_schema::{EntityId, EntityKey, MemberKind, Schema};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Options
// ============================================================================

/// What a session is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKind {
    /// Full unit of work.
    #[default]
    ReadWrite,
    /// Loads only; mutation and save are rejected. A read-only session may
    /// be shared across threads for concurrent reads.
    ReadOnly,
}

/// Configuration for session behavior.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Session kind.
    pub kind: SessionKind,
    /// Run save-time validation (on by default).
    pub validate_on_save: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            kind: SessionKind::ReadWrite,
            validate_on_save: true,
        }
    }
}

/// How `get_entity` behaves on an identity-map miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Identity map only; no placeholder, no round-trip.
    Peek,
    /// Return a stub placeholder without a round-trip.
    Stub,
    /// Perform a lookup-by-primary-key round-trip.
    Load,
}

/// Handle to one entity's set of rows: the anchor point an external query
/// translator compiles filters against.
#[derive(Debug, Clone)]
pub struct EntitySet {
    /// The entity id.
    pub entity: EntityId,
    /// The entity name.
    pub name: String,
}

// ============================================================================
// Hooks
// ============================================================================

/// Context passed to before-save hooks.
///
/// Hooks may spawn additional records (audit rows, link rows); spawned
/// records are attached after the current sweep and processed in later
/// rounds of the save fixpoint.
pub struct HookContext<'a> {
    now_micros: i64,
    schema: &'a Schema,
    spawned: Vec<EntityRecord>,
}

impl<'a> HookContext<'a> {
    pub(crate) fn new(schema: &'a Schema, now_micros: i64) -> Self {
        Self {
            now_micros,
            schema,
            spawned: Vec::new(),
        }
    }

    /// The session clock's time for this save.
    #[must_use]
    pub const fn now_micros(&self) -> i64 {
        self.now_micros
    }

    /// The schema, for constructing spawned records.
    #[must_use]
    pub const fn schema(&self) -> &'a Schema {
        self.schema
    }

    /// Queue a record to be attached to the session after this sweep.
    pub fn spawn(&mut self, record: EntityRecord) {
        self.spawned.push(record);
    }

    pub(crate) fn take_spawned(&mut self) -> Vec<EntityRecord> {
        std::mem::take(&mut self.spawned)
    }
}

/// Hook invoked on a single record.
pub type RecordHook = Arc<dyn Fn(&mut EntityRecord) -> Result<()> + Send + Sync>;

/// Before-save hook; may spawn further records through the context.
pub type SavingHook = Arc<dyn Fn(&mut EntityRecord, &mut HookContext<'_>) -> Result<()> + Send + Sync>;

#[derive(Default, Clone)]
struct EntityHooks {
    created: Option<RecordHook>,
    deleting: Option<RecordHook>,
    saving: Option<SavingHook>,
    saved: Option<RecordHook>,
    aborted: Option<RecordHook>,
}

/// Per-entity lifecycle hooks, registered up front and handed to the
/// session.
#[derive(Default)]
pub struct HookRegistry {
    entries: HashMap<String, EntityHooks>,
}

impl HookRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, entity: &str) -> &mut EntityHooks {
        self.entries.entry(entity.to_string()).or_default()
    }

    /// Fired when `new_entity` creates a record.
    #[must_use]
    pub fn on_created(
        mut self,
        entity: &str,
        hook: impl Fn(&mut EntityRecord) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.entry(entity).created = Some(Arc::new(hook));
        self
    }

    /// Fired when `delete_entity` marks a record.
    #[must_use]
    pub fn on_deleting(
        mut self,
        entity: &str,
        hook: impl Fn(&mut EntityRecord) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.entry(entity).deleting = Some(Arc::new(hook));
        self
    }

    /// Fired for every changed record during the save fixpoint.
    #[must_use]
    pub fn on_saving(
        mut self,
        entity: &str,
        hook: impl Fn(&mut EntityRecord, &mut HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.entry(entity).saving = Some(Arc::new(hook));
        self
    }

    /// Fired for every changed record after a successful submit, before
    /// commit.
    #[must_use]
    pub fn on_saved(
        mut self,
        entity: &str,
        hook: impl Fn(&mut EntityRecord) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.entry(entity).saved = Some(Arc::new(hook));
        self
    }

    /// Fired in reverse changed-set order when a save aborts.
    #[must_use]
    pub fn on_save_aborted(
        mut self,
        entity: &str,
        hook: impl Fn(&mut EntityRecord) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.entry(entity).aborted = Some(Arc::new(hook));
        self
    }

    fn hooks(&self, entity: &str) -> Option<&EntityHooks> {
        self.entries.get(entity)
    }

    pub(crate) fn created(&self, entity: &str) -> Option<RecordHook> {
        self.hooks(entity).and_then(|h| h.created.clone())
    }

    pub(crate) fn deleting(&self, entity: &str) -> Option<RecordHook> {
        self.hooks(entity).and_then(|h| h.deleting.clone())
    }

    pub(crate) fn saving(&self, entity: &str) -> Option<SavingHook> {
        self.hooks(entity).and_then(|h| h.saving.clone())
    }

    pub(crate) fn saved(&self, entity: &str) -> Option<RecordHook> {
        self.hooks(entity).and_then(|h| h.saved.clone())
    }

    pub(crate) fn aborted(&self, entity: &str) -> Option<RecordHook> {
        self.hooks(entity).and_then(|h| h.aborted.clone())
    }
}

// ============================================================================
// Session
// ============================================================================

/// The unit of work: identity map, changed set, save pipeline.
pub struct Session<R: CommandRunner> {
    pub(crate) id: u64,
    pub(crate) schema: Arc<Schema>,
    pub(crate) runner: R,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) parser: Arc<dyn ConflictParser>,
    pub(crate) options: SessionOptions,
    pub(crate) hooks: HookRegistry,
    pub(crate) records_loaded: RwLock<RecordMap>,
    pub(crate) records_changed: Mutex<Vec<RecordRef>>,
}

impl<R: CommandRunner> Session<R> {
    /// Create a read-write session over a schema and runner, with the system
    /// clock and the standard conflict parser.
    pub fn new(schema: Arc<Schema>, runner: R) -> Self {
        Self {
            id: SESSION_COUNTER.fetch_add(1, Ordering::Relaxed),
            schema,
            runner,
            clock: Arc::new(SystemClock),
            parser: Arc::new(StandardConflictParser),
            options: SessionOptions::default(),
            hooks: HookRegistry::new(),
            records_loaded: RwLock::new(RecordMap::new()),
            records_changed: Mutex::new(Vec::new()),
        }
    }

    /// Replace the clock (audit auto-values).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the conflict parser.
    #[must_use]
    pub fn with_conflict_parser(mut self, parser: Arc<dyn ConflictParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Replace the options.
    #[must_use]
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Install lifecycle hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// The schema this session works over.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The session's unique id; records carry it while attached.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Check whether the session has uncommitted changes.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.changed_records().is_empty()
    }

    /// Handle to one entity's row set, for external query translation.
    pub fn entity_set(&self, entity: &str) -> Result<EntitySet> {
        let id = self.entity_id(entity)?;
        Ok(EntitySet {
            entity: id,
            name: entity.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Creation, deletion
    // ------------------------------------------------------------------

    /// Create a `New` record and attach it. Fails on views and read-only
    /// sessions.
    pub fn new_entity(&self, entity: &str) -> Result<RecordRef> {
        self.ensure_writable()?;
        let eid = self.entity_id(entity)?;
        let info = self.schema.entity(eid);
        if info.kind == relmodel_schema::EntityKind::View {
            return Err(Error::Custom(format!(
                "'{entity}' is a view; view records cannot be created"
            )));
        }

        let record = EntityRecord::new(&self.schema, eid);
        let arc = self.attach(record)?;
        if let Some(hook) = self.hooks.created(entity) {
            hook(&mut arc.write().expect("record lock poisoned"))?;
        }
        Ok(arc)
    }

    /// Mark a record for deletion. A never-saved `New` record is simply
    /// dropped.
    pub fn delete_entity(&self, rec: &RecordRef) -> Result<()> {
        self.ensure_writable()?;
        self.ensure_owned(rec)?;

        let (status, entity_name) = {
            let guard = rec.read().expect("record lock poisoned");
            (
                guard.status(),
                self.schema.entity(guard.entity()).name.clone(),
            )
        };

        match status {
            RecordStatus::New => {
                rec.write()
                    .expect("record lock poisoned")
                    .set_status(RecordStatus::Fantom);
                self.changed_mut().retain(|r| !Arc::ptr_eq(r, rec));
            }
            RecordStatus::Loaded | RecordStatus::Stub => {
                rec.write()
                    .expect("record lock poisoned")
                    .set_status(RecordStatus::Deleting);
                self.enlist(rec);
            }
            RecordStatus::Modified => {
                rec.write()
                    .expect("record lock poisoned")
                    .set_status(RecordStatus::Deleting);
            }
            RecordStatus::Deleting => return Ok(()),
            RecordStatus::Loading | RecordStatus::Fantom => {
                return Err(Error::Custom(format!(
                    "cannot delete a {status} record"
                )));
            }
        }

        if let Some(hook) = self.hooks.deleting(&entity_name) {
            hook(&mut rec.write().expect("record lock poisoned"))?;
        }
        Ok(())
    }

    /// Probe every incoming non-cascading reference and return the names of
    /// entities that still reference this row. Empty means deletable.
    pub async fn can_delete_entity(
        &self,
        cx: &Cx,
        rec: &RecordRef,
    ) -> Outcome<Vec<String>, Error> {
        let probes = {
            let guard = rec.read().expect("record lock poisoned");
            let info = self.schema.entity(guard.entity());
            let mut probes = Vec::new();
            for (re, rm) in &info.referenced_by {
                let r_info = self.schema.entity(*re);
                let Some(r) = r_info.members[*rm].as_reference() else {
                    continue;
                };
                if r.on_delete == DeleteAction::Cascade {
                    continue;
                }
                let (tke, tki) = r.to_key;
                let target_info = self.schema.entity(tke);
                let key_values: Vec<Value> = target_info.keys[tki]
                    .expanded_members()
                    .iter()
                    .map(|em| {
                        let c = target_info.members[em.member]
                            .as_column()
                            .expect("expanded key members are columns");
                        guard.get(c.value_index).clone()
                    })
                    .collect();
                if key_values.iter().any(Value::is_null) {
                    continue;
                }
                let fk_columns: Vec<String> = r_info.keys[r.from_key]
                    .expanded_members()
                    .iter()
                    .map(|em| r_info.members[em.member].name.clone())
                    .collect();
                probes.push((
                    r_info.name.clone(),
                    ReferenceProbe {
                        entity: r_info.name.clone(),
                        table: r_info.table_name.clone(),
                        fk_columns,
                        key_values,
                    },
                ));
            }
            probes
        };

        let mut blocking: Vec<String> = Vec::new();
        for (name, probe) in probes {
            match self.runner.reference_exists(cx, &probe).await {
                Outcome::Ok(true) => {
                    if !blocking.contains(&name) {
                        blocking.push(name);
                    }
                }
                Outcome::Ok(false) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(blocking)
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Get a record by primary key.
    ///
    /// An identity-map hit always returns the resident instance. On a miss,
    /// [`LoadMode::Peek`] returns `None`, [`LoadMode::Stub`] returns a
    /// placeholder without a round-trip, and [`LoadMode::Load`] fetches the
    /// row (returning `None` when it does not exist).
    pub async fn get_entity(
        &self,
        cx: &Cx,
        entity: &str,
        pk: &[Value],
        mode: LoadMode,
    ) -> Outcome<Option<RecordRef>, Error> {
        let eid = match self.entity_id(entity) {
            Ok(id) => id,
            Err(e) => return Outcome::Err(e),
        };
        let info = self.schema.entity(eid);
        let Some(pk_key) = info.primary_key() else {
            return Outcome::Err(Error::Custom(format!(
                "'{entity}' has no primary key; it cannot be fetched by key"
            )));
        };
        let pk_len = pk_key.expanded_members().len();
        if pk.is_empty() || pk.len() != pk_len || pk.iter().any(Value::is_null) {
            return Outcome::Err(Error::Custom(format!(
                "a complete primary key is required to get '{entity}'"
            )));
        }

        let key = EntityKey::new(eid, pk.to_vec());
        let resident = self
            .records_loaded
            .read()
            .expect("identity map lock poisoned")
            .get(&key, &self.schema);
        if let Some(existing) = resident {
            return Outcome::Ok(Some(existing));
        }

        match mode {
            LoadMode::Peek => Outcome::Ok(None),
            LoadMode::Stub => {
                let mut record =
                    EntityRecord::with_status(&self.schema, eid, RecordStatus::Stub);
                Self::write_key_values(&mut record, info, pk_key, &key.values);
                match self.attach(record) {
                    Ok(arc) => Outcome::Ok(Some(arc)),
                    Err(e) => Outcome::Err(e),
                }
            }
            LoadMode::Load => {
                let lookup = self.key_lookup(eid, &key);
                match self.runner.fetch_by_key(cx, &lookup).await {
                    Outcome::Ok(Some(values)) => {
                        let mut record =
                            EntityRecord::with_status(&self.schema, eid, RecordStatus::Loaded);
                        record.load_values(values);
                        match self.attach(record) {
                            Ok(arc) => Outcome::Ok(Some(arc)),
                            Err(e) => Outcome::Err(e),
                        }
                    }
                    Outcome::Ok(None) => Outcome::Ok(None),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
        }
    }

    /// Hydrate a stub record. No-op when the record is already loaded; an
    /// error when the row no longer exists.
    pub async fn load_stub(&self, cx: &Cx, rec: &RecordRef) -> Outcome<(), Error> {
        let (eid, key) = {
            let guard = rec.read().expect("record lock poisoned");
            if guard.status() != RecordStatus::Stub {
                return Outcome::Ok(());
            }
            (guard.entity(), guard.primary_key(&self.schema))
        };
        let Some(key) = key else {
            return Outcome::Err(Error::Custom("stub has no primary key".to_string()));
        };

        rec.write()
            .expect("record lock poisoned")
            .set_status(RecordStatus::Loading);

        let lookup = self.key_lookup(eid, &key);
        match self.runner.fetch_by_key(cx, &lookup).await {
            Outcome::Ok(Some(values)) => {
                let mut guard = rec.write().expect("record lock poisoned");
                guard.load_values(values);
                guard.set_status(RecordStatus::Loaded);
                Outcome::Ok(())
            }
            Outcome::Ok(None) => {
                rec.write()
                    .expect("record lock poisoned")
                    .set_status(RecordStatus::Stub);
                Outcome::Err(Error::Custom(format!(
                    "'{}' row ({}) no longer exists",
                    self.schema.entity(eid).name,
                    key
                )))
            }
            Outcome::Err(e) => {
                rec.write()
                    .expect("record lock poisoned")
                    .set_status(RecordStatus::Stub);
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Attach an externally materialized record (e.g. a query result).
    ///
    /// The single authority for identity-map correctness: if a record with
    /// the same primary key is already resident, the resident instance is
    /// refreshed from the incoming one and returned — callers must continue
    /// with the returned instance.
    pub fn attach(&self, mut record: EntityRecord) -> Result<RecordRef> {
        record.session = Some(self.id);
        let status = record.status();
        match status {
            RecordStatus::Fantom => {
                Err(Error::Custom("cannot attach a fantom record".to_string()))
            }
            // New records have no usable key yet; they live in the changed
            // set only and enter the identity map at commit.
            RecordStatus::New => {
                let arc = Arc::new(RwLock::new(record));
                self.changed_mut().push(Arc::clone(&arc));
                Ok(arc)
            }
            _ => {
                let key = record.primary_key(&self.schema).ok_or_else(|| {
                    Error::Custom("cannot attach a record without a primary key".to_string())
                })?;
                if key.is_empty() {
                    return Err(Error::Custom(
                        "cannot attach a record with an unassigned primary key".to_string(),
                    ));
                }

                let existing = self
                    .records_loaded
                    .read()
                    .expect("identity map lock poisoned")
                    .get(&key, &self.schema);
                if let Some(existing) = existing {
                    self.refresh_resident(&existing, &record);
                    return Ok(existing);
                }

                let enlist = status.is_changed();
                let arc = Arc::new(RwLock::new(record));
                self.records_loaded
                    .write()
                    .expect("identity map lock poisoned")
                    .insert(&key, &arc);
                if enlist {
                    self.changed_mut().push(Arc::clone(&arc));
                }
                Ok(arc)
            }
        }
    }

    /// Refresh the resident instance from an incoming load. Stubs carry no
    /// values and refresh nothing; a locally modified record keeps its edits
    /// and only updates the concurrency base.
    fn refresh_resident(&self, existing: &RecordRef, incoming: &EntityRecord) {
        if incoming.status() == RecordStatus::Stub {
            return;
        }
        let mut guard = existing.write().expect("record lock poisoned");
        match guard.status() {
            RecordStatus::Stub | RecordStatus::Loading | RecordStatus::Loaded => {
                guard.refresh_from(incoming, false);
                guard.set_status(RecordStatus::Loaded);
            }
            RecordStatus::Modified => {
                guard.refresh_from(incoming, true);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Reading and writing values
    // ------------------------------------------------------------------

    /// Read a column value. Stub records expose only their key columns;
    /// hydrate with [`Session::load_stub`] first for the rest.
    pub fn value(&self, rec: &RecordRef, member: &str) -> Result<Value> {
        let guard = rec.read().expect("record lock poisoned");
        let info = self.schema.entity(guard.entity());
        if guard.status() == RecordStatus::Stub {
            let is_key_column = info
                .member(member)
                .and_then(|(_, m)| m.as_column())
                .is_some_and(|c| c.primary_key);
            if !is_key_column {
                return Err(Error::Custom(format!(
                    "'{member}' is not loaded; the record is a stub"
                )));
            }
        }
        guard.value(info, member)
    }

    /// Write a column value, transitioning `Loaded → Modified` on the first
    /// mutation.
    pub fn set_value(&self, rec: &RecordRef, member: &str, value: Value) -> Result<()> {
        self.ensure_writable()?;
        self.ensure_owned(rec)?;

        let mut guard = rec.write().expect("record lock poisoned");
        let info = self.schema.entity(guard.entity());
        match guard.status() {
            RecordStatus::Stub => {
                return Err(Error::Custom(
                    "record is a stub; hydrate it before writing".to_string(),
                ));
            }
            RecordStatus::Deleting | RecordStatus::Fantom | RecordStatus::Loading => {
                return Err(Error::Custom(format!(
                    "cannot write to a {} record",
                    guard.status()
                )));
            }
            _ => {}
        }
        guard.set_value(info, member, value)?;
        self.mark_modified(rec, &mut guard);
        Ok(())
    }

    /// Point a reference member at a target record (or clear it with
    /// `None`). A target whose key is still unassigned (pending identity) is
    /// linked and resolved at submit time.
    pub fn set_ref(&self, rec: &RecordRef, member: &str, target: Option<&RecordRef>) -> Result<()> {
        self.ensure_writable()?;
        self.ensure_owned(rec)?;

        // Resolve the member against the schema with only a short-lived read
        // lock; the target is then read before the record is locked for
        // writing, so aliasing (a record referencing itself) stays safe.
        let eid = rec.read().expect("record lock poisoned").entity();
        let info = self.schema.entity(eid);
        let (member_index, m) = info
            .member(member)
            .ok_or_else(|| Error::Custom(format!("'{}' has no member '{member}'", info.name)))?;
        let MemberKind::EntityRef(r) = &m.kind else {
            return Err(Error::Custom(format!(
                "member '{member}' of '{}' is not a reference",
                info.name
            )));
        };

        let fk_slots: Vec<usize> = info.keys[r.from_key]
            .expanded_members()
            .iter()
            .map(|em| {
                info.members[em.member]
                    .as_column()
                    .expect("expanded key members are columns")
                    .value_index
            })
            .collect();

        let target_values = match target {
            None => Some(vec![Value::Null; fk_slots.len()]),
            Some(t) => {
                self.ensure_owned(t)?;
                let t_guard = t.read().expect("record lock poisoned");
                if t_guard.entity() != r.target {
                    return Err(Error::Custom(format!(
                        "'{member}' expects '{}', got '{}'",
                        self.schema.entity(r.target).name,
                        self.schema.entity(t_guard.entity()).name
                    )));
                }
                let (tke, tki) = r.to_key;
                let t_info = self.schema.entity(tke);
                let values: Vec<Value> = t_info.keys[tki]
                    .expanded_members()
                    .iter()
                    .map(|em| {
                        let c = t_info.members[em.member]
                            .as_column()
                            .expect("expanded key members are columns");
                        t_guard.get(c.value_index).clone()
                    })
                    .collect();
                if values.iter().any(Value::is_null) {
                    None // key unassigned; link at submit time
                } else {
                    Some(values)
                }
            }
        };

        let mut guard = rec.write().expect("record lock poisoned");
        match guard.status() {
            RecordStatus::Stub | RecordStatus::Deleting | RecordStatus::Fantom
            | RecordStatus::Loading => {
                return Err(Error::Custom(format!(
                    "cannot write to a {} record",
                    guard.status()
                )));
            }
            _ => {}
        }

        guard.pending_refs.retain(|(mi, _)| *mi != member_index);
        match target_values {
            Some(values) => {
                for (slot, value) in fk_slots.iter().zip(values) {
                    guard.set(*slot, value);
                }
            }
            None => {
                let t = target.expect("pending link implies a target");
                guard.pending_refs.push((member_index, Arc::clone(t)));
            }
        }
        self.mark_modified(rec, &mut guard);
        Ok(())
    }

    /// The key a reference member currently points at, or `None` when the
    /// reference is unset.
    pub fn ref_key(&self, rec: &RecordRef, member: &str) -> Result<Option<EntityKey>> {
        let guard = rec.read().expect("record lock poisoned");
        let info = self.schema.entity(guard.entity());
        let (_, m) = info
            .member(member)
            .ok_or_else(|| Error::Custom(format!("'{}' has no member '{member}'", info.name)))?;
        let MemberKind::EntityRef(r) = &m.kind else {
            return Err(Error::Custom(format!(
                "member '{member}' of '{}' is not a reference",
                info.name
            )));
        };

        let values: Vec<Value> = info.keys[r.from_key]
            .expanded_members()
            .iter()
            .map(|em| {
                let c = info.members[em.member]
                    .as_column()
                    .expect("expanded key members are columns");
                guard.get(c.value_index).clone()
            })
            .collect();
        if values.iter().any(Value::is_null) {
            Ok(None)
        } else {
            Ok(Some(EntityKey::new(r.target, values)))
        }
    }

    /// Discard all uncommitted changes: new records are dropped, modified
    /// and deleting records revert to their loaded state.
    pub fn cancel_changes(&mut self) {
        let records: Vec<RecordRef> = self.changed_mut().drain(..).collect();
        for rec in records {
            let mut guard = rec.write().expect("record lock poisoned");
            match guard.status() {
                RecordStatus::New => guard.set_status(RecordStatus::Fantom),
                RecordStatus::Modified | RecordStatus::Deleting => {
                    guard.revert();
                    guard.set_status(RecordStatus::Loaded);
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals shared with the save pipeline
    // ------------------------------------------------------------------

    pub(crate) fn entity_id(&self, entity: &str) -> Result<EntityId> {
        self.schema
            .entity_id(entity)
            .ok_or_else(|| Error::Custom(format!("unknown entity '{entity}'")))
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.options.kind == SessionKind::ReadOnly {
            return Err(Error::Custom("session is read-only".to_string()));
        }
        Ok(())
    }

    fn ensure_owned(&self, rec: &RecordRef) -> Result<()> {
        let owner = rec.read().expect("record lock poisoned").session;
        if owner != Some(self.id) {
            return Err(Error::Custom(
                "record is not attached to this session".to_string(),
            ));
        }
        Ok(())
    }

    fn mark_modified(&self, rec: &RecordRef, guard: &mut EntityRecord) {
        if guard.status() == RecordStatus::Loaded {
            guard.set_status(RecordStatus::Modified);
            self.changed_mut().push(Arc::clone(rec));
        }
    }

    fn enlist(&self, rec: &RecordRef) {
        let mut changed = self.changed_mut();
        if !changed.iter().any(|r| Arc::ptr_eq(r, rec)) {
            changed.push(Arc::clone(rec));
        }
    }

    /// Snapshot of the changed working set, in enlistment order.
    #[must_use]
    pub fn changed_records(&self) -> Vec<RecordRef> {
        self.records_changed
            .lock()
            .expect("changed set lock poisoned")
            .clone()
    }

    fn changed_mut(&self) -> std::sync::MutexGuard<'_, Vec<RecordRef>> {
        self.records_changed
            .lock()
            .expect("changed set lock poisoned")
    }

    pub(crate) fn key_lookup(&self, eid: EntityId, key: &EntityKey) -> KeyLookup {
        let info = self.schema.entity(eid);
        let pk = info
            .primary_key()
            .expect("key lookups require a primary key");
        KeyLookup {
            entity: info.name.clone(),
            table: info.table_name.clone(),
            key_columns: pk
                .expanded_members()
                .iter()
                .map(|em| info.members[em.member].name.clone())
                .collect(),
            key_values: key.values.clone(),
            select_columns: info.columns().map(|(_, m, _)| m.name.clone()).collect(),
        }
    }

    fn write_key_values(
        record: &mut EntityRecord,
        info: &relmodel_schema::EntityInfo,
        key: &relmodel_schema::KeyInfo,
        values: &[Value],
    ) {
        for (em, v) in key.expanded_members().iter().zip(values) {
            let c = info.members[em.member]
                .as_column()
                .expect("expanded key members are columns");
            record.set(c.value_index, v.clone());
        }
    }
}
