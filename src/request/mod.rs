// ============================================================================
// Request Scope
// ============================================================================
//
// Mutable state of one request: the transaction handle, the object arena,
// the permission executor, the dirty/new/deleted registries, the three
// lifecycle trigger queues and the temporary-id map for objects created
// mid-request. A scope is used by exactly one logical request and is never
// shared between threads.
//
// ============================================================================

pub mod driver;

pub use driver::run_request;

use crate::audit::{AuditLogger, LogAuditLogger, LogMessage};
use crate::config::EngineConfig;
use crate::core::{EngineError, Result};
use crate::dictionary::EntityDictionary;
use crate::lifecycle::dispatcher::{self, FiringKey};
use crate::lifecycle::{LifecycleTrigger, Operation, TransactionPhase};
use crate::resource::{ChangeSpec, ObjectArena, ObjectId, PersistentResource, ResourceLineage};
use crate::security::{PermissionExecutor, PermissionKind, SecurityEnv, User};
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{Level, event, info_span};
use uuid::Uuid;

pub struct RequestScope {
    request_id: Uuid,
    started_at: DateTime<Utc>,
    transaction: Box<dyn Transaction>,
    dictionary: Arc<EntityDictionary>,
    user: User,
    config: EngineConfig,
    arena: ObjectArena,
    permissions: PermissionExecutor,

    /// Objects pending save, in first-marked order
    dirty: Vec<ObjectId>,
    new_objects: HashSet<ObjectId>,
    new_order: Vec<ObjectId>,
    created: HashSet<ObjectId>,
    deleted: HashSet<ObjectId>,

    queues: [Vec<LifecycleTrigger>; 3],
    fired: [Vec<FiringKey>; 3],

    /// (type alias, temporary id) -> object
    uuids: HashMap<(String, String), ObjectId>,
    object_uuids: HashMap<ObjectId, String>,

    audit_logger: Arc<dyn AuditLogger>,
    pending_audit: Vec<LogMessage>,
}

impl RequestScope {
    pub fn new(
        transaction: Box<dyn Transaction>,
        dictionary: Arc<EntityDictionary>,
        user: User,
        config: EngineConfig,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            started_at: Utc::now(),
            transaction,
            dictionary,
            user,
            permissions: PermissionExecutor::from_config(&config),
            config,
            arena: ObjectArena::new(),
            dirty: Vec::new(),
            new_objects: HashSet::new(),
            new_order: Vec::new(),
            created: HashSet::new(),
            deleted: HashSet::new(),
            queues: Default::default(),
            fired: Default::default(),
            uuids: HashMap::new(),
            object_uuids: HashMap::new(),
            audit_logger: Arc::new(LogAuditLogger),
            pending_audit: Vec::new(),
        }
    }

    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit_logger = logger;
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn dictionary(&self) -> &Arc<EntityDictionary> {
        &self.dictionary
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn arena(&self) -> &ObjectArena {
        &self.arena
    }

    pub fn permission_executor(&self) -> &PermissionExecutor {
        &self.permissions
    }

    pub(crate) fn permission_executor_mut(&mut self) -> &mut PermissionExecutor {
        &mut self.permissions
    }

    pub(crate) fn arena_mut(&mut self) -> &mut ObjectArena {
        &mut self.arena
    }

    /// Transaction and arena borrowed together.
    pub(crate) fn storage(&mut self) -> (&mut dyn Transaction, &mut ObjectArena) {
        (self.transaction.as_mut(), &mut self.arena)
    }

    pub fn dirty_objects(&self) -> &[ObjectId] {
        &self.dirty
    }

    pub fn is_new(&self, object: ObjectId) -> bool {
        self.new_objects.contains(&object)
    }

    pub fn is_deleted(&self, object: ObjectId) -> bool {
        self.deleted.contains(&object)
    }

    pub fn new_objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.new_order.iter().copied()
    }

    pub fn pending_audit_messages(&self) -> &[LogMessage] {
        &self.pending_audit
    }

    pub fn queued_triggers(&self, phase: TransactionPhase) -> &[LifecycleTrigger] {
        &self.queues[phase.index()]
    }

    /// Wraps an arena object with an empty lineage.
    pub fn resource_for(&self, object: ObjectId) -> Result<PersistentResource> {
        self.wrap(object, ResourceLineage::new())
    }

    pub(crate) fn wrap(&self, object: ObjectId, lineage: ResourceLineage) -> Result<PersistentResource> {
        let record = self.arena.record(object)?;
        Ok(PersistentResource::from_parts(
            record.type_name.clone(),
            object,
            record.id.clone(),
            self.object_uuids.get(&object).cloned(),
            lineage,
        ))
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn get_uuid_for(&self, object: ObjectId) -> Option<&str> {
        self.object_uuids.get(&object).map(String::as_str)
    }

    /// Registers a temporary id under the type and all its superclasses.
    pub fn set_uuid_for_object(&mut self, type_name: &str, uuid: &str, object: ObjectId) {
        for alias in self.dictionary.type_aliases(type_name) {
            self.uuids
                .insert((alias.to_string(), uuid.to_string()), object);
        }
        self.object_uuids.insert(object, uuid.to_string());
    }

    pub fn get_object_by_uuid(&self, type_name: &str, uuid: &str) -> Option<ObjectId> {
        self.uuids
            .get(&(type_name.to_string(), uuid.to_string()))
            .copied()
    }

    pub(crate) fn register_new(&mut self, object: ObjectId) {
        if self.new_objects.insert(object) {
            self.new_order.push(object);
        }
    }

    pub(crate) fn register_deleted(&mut self, object: ObjectId) {
        self.deleted.insert(object);
    }

    /// CREATE for objects created in this request, UPDATE otherwise.
    pub(crate) fn mutation_operation(&self, object: ObjectId) -> Operation {
        if self.is_new(object) {
            Operation::Create
        } else {
            Operation::Update
        }
    }

    // ------------------------------------------------------------------
    // Permissions
    // ------------------------------------------------------------------

    pub fn check_permission(&mut self, kind: PermissionKind, resource: &PersistentResource) -> Result<()> {
        self.check_object(kind, resource.object())
    }

    pub fn check_field_permission(
        &mut self,
        kind: PermissionKind,
        resource: &PersistentResource,
        field: &str,
        change: Option<&ChangeSpec>,
    ) -> Result<()> {
        self.check_object_field(kind, resource.object(), field, change)
    }

    pub(crate) fn check_object(&mut self, kind: PermissionKind, object: ObjectId) -> Result<()> {
        let env = SecurityEnv {
            dictionary: self.dictionary.as_ref(),
            arena: &self.arena,
            user: &self.user,
            new_objects: &self.new_objects,
        };
        self.permissions.check_permission(&env, kind, object)
    }

    pub(crate) fn check_object_field(
        &mut self,
        kind: PermissionKind,
        object: ObjectId,
        field: &str,
        change: Option<&ChangeSpec>,
    ) -> Result<()> {
        let env = SecurityEnv {
            dictionary: self.dictionary.as_ref(),
            arena: &self.arena,
            user: &self.user,
            new_objects: &self.new_objects,
        };
        self.permissions
            .check_specific_field_permissions(&env, object, change, kind, field)
    }

    /// Evaluates every deferred check collected during the request.
    pub fn execute_commit_checks(&mut self) -> Result<()> {
        let env = SecurityEnv {
            dictionary: self.dictionary.as_ref(),
            arena: &self.arena,
            user: &self.user,
            new_objects: &self.new_objects,
        };
        self.permissions.execute_commit_checks(&env)
    }

    // ------------------------------------------------------------------
    // Lifecycle triggers
    // ------------------------------------------------------------------

    pub fn queue_trigger(&mut self, phase: TransactionPhase, trigger: LifecycleTrigger) {
        self.queues[phase.index()].push(trigger);
    }

    /// Queues a class-level trigger in every phase.
    pub(crate) fn queue_class_triggers(&mut self, resource: &PersistentResource, operation: Operation) {
        for phase in TransactionPhase::ALL {
            self.queue_trigger(phase, LifecycleTrigger::class(operation, resource.clone()));
        }
    }

    /// Queues a class-level and a field-level trigger in every phase.
    pub(crate) fn queue_field_triggers(
        &mut self,
        resource: &PersistentResource,
        operation: Operation,
        field: &str,
        change: Option<ChangeSpec>,
    ) {
        for phase in TransactionPhase::ALL {
            self.queue_trigger(phase, LifecycleTrigger::class(operation, resource.clone()));
            self.queue_trigger(
                phase,
                LifecycleTrigger::field(operation, resource.clone(), field, change.clone()),
            );
        }
    }

    pub fn run_queued_pre_security_triggers(&mut self) -> Result<()> {
        self.run_queued_triggers(TransactionPhase::PreSecurity)
    }

    pub fn run_queued_pre_commit_triggers(&mut self) -> Result<()> {
        self.run_queued_triggers(TransactionPhase::PreCommit)
    }

    pub fn run_queued_post_commit_triggers(&mut self) -> Result<()> {
        self.run_queued_triggers(TransactionPhase::PostCommit)
    }

    /// Drains one phase queue to completion, including triggers queued by
    /// the hooks it runs. A failing hook leaves its batch queued and
    /// propagates the error; only hooks that returned `Ok` count as fired,
    /// so a later drain retries the failed one.
    fn run_queued_triggers(&mut self, phase: TransactionPhase) -> Result<()> {
        let span = info_span!("drain_triggers", %phase, request_id = %self.request_id);
        let _enter = span.enter();

        let slot = phase.index();
        let mut rounds = 0;
        let mut fired = 0;

        loop {
            let batch = std::mem::take(&mut self.queues[slot]);
            if batch.is_empty() {
                break;
            }

            rounds += 1;
            if rounds > self.config.max_trigger_drain_rounds {
                self.queues[slot] = batch;
                let err = EngineError::Configuration(format!(
                    "{} triggers still queued after {} drain rounds",
                    phase, self.config.max_trigger_drain_rounds
                ));
                event!(Level::ERROR, error = %err, "trigger drain did not converge");
                return Err(err);
            }

            let firings = dispatcher::plan(&self.dictionary, phase, &batch, &self.fired[slot])?;
            for firing in firings {
                if let Err(err) = firing.hook.execute(&firing.invocation, &firing.resource, self) {
                    event!(Level::ERROR, error = %err, operation = %firing.invocation.operation, "lifecycle hook failed");
                    let queued_by_hooks = std::mem::take(&mut self.queues[slot]);
                    self.queues[slot] = batch;
                    self.queues[slot].extend(queued_by_hooks);
                    return Err(err);
                }
                self.fired[slot].push(firing.key);
                fired += 1;
            }
        }

        event!(Level::DEBUG, rounds, fired, "trigger queue drained");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn mark_dirty(&mut self, object: ObjectId) {
        if !self.dirty.contains(&object) {
            self.dirty.push(object);
        }
    }

    /// Creates new objects and saves dirty ones, each at most once.
    /// Deleted objects are skipped.
    pub fn save_or_create_objects(&mut self) -> Result<()> {
        let span = info_span!("save_or_create", request_id = %self.request_id);
        let _enter = span.enter();

        let mut created = 0;
        for object in self.new_order.clone() {
            if self.deleted.contains(&object) || self.created.contains(&object) {
                continue;
            }
            self.transaction.create_object(&mut self.arena, object)?;
            self.created.insert(object);
            created += 1;
        }

        let mut saved = 0;
        for object in std::mem::take(&mut self.dirty) {
            if self.new_objects.contains(&object) || self.deleted.contains(&object) {
                continue;
            }
            self.transaction.save(&self.arena, object)?;
            saved += 1;
        }

        event!(Level::DEBUG, created, saved, "dirty objects handed to transaction");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    /// Renders the UPDATE audits bound to `field` without buffering them.
    pub(crate) fn render_field_audit(
        &self,
        resource: &PersistentResource,
        field: &str,
    ) -> Result<Vec<LogMessage>> {
        self.render_audit(resource, Operation::Update, Some(field))
    }

    pub(crate) fn audit_class(&mut self, resource: &PersistentResource, action: Operation) -> Result<()> {
        let messages = self.render_audit(resource, action, None)?;
        self.buffer_audit(messages);
        Ok(())
    }

    pub(crate) fn buffer_audit(&mut self, messages: Vec<LogMessage>) {
        self.pending_audit.extend(messages);
    }

    fn render_audit(
        &self,
        resource: &PersistentResource,
        action: Operation,
        field: Option<&str>,
    ) -> Result<Vec<LogMessage>> {
        if !self.config.audit_enabled {
            return Ok(Vec::new());
        }

        let entity = self.dictionary.entity(resource.type_name())?;
        entity
            .audits()
            .iter()
            .filter(|audit| audit.action == action && audit.field.as_deref() == field)
            .map(|binding| {
                LogMessage::render(binding, resource, &self.dictionary, &self.arena, &self.user)
            })
            .collect()
    }

    /// Hands buffered audit messages to the logger.
    pub(crate) fn commit_audit(&mut self) -> Result<()> {
        let messages = std::mem::take(&mut self.pending_audit);
        if messages.is_empty() {
            return Ok(());
        }
        self.audit_logger.commit(messages)
    }
}
