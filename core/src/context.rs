//! Four-tier context hierarchy: global → project → branch → task.
//!
//! Each level is a row owned by one user (global templates may be shared
//! with `user_id = NULL`). Resolution walks the parent chain and merges
//! contributions in child-override-parent order; see [`merge_payloads`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::TaskStatus;

/// Synthetic id for the per-user global context row, mirroring the
/// singleton semantics of the global level.
pub const GLOBAL_CONTEXT_ID: Uuid = Uuid::nil();

/// Default organization name stamped on auto-materialised global contexts.
pub const DEFAULT_ORGANIZATION_NAME: &str = "Default Organization";

/// The four context levels, ordered by increasing specificity.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContextLevel {
    Global,
    Project,
    Branch,
    Task,
}

impl ContextLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Project => "project",
            Self::Branch => "branch",
            Self::Task => "task",
        }
    }

    /// Position in the resolution chain: global = 0 … task = 3.
    pub fn depth_index(&self) -> usize {
        match self {
            Self::Global => 0,
            Self::Project => 1,
            Self::Branch => 2,
            Self::Task => 3,
        }
    }

    /// Specificity ordering used by delegation: task < branch < project <
    /// global. A delegation must flow from lower to higher.
    pub fn specificity(&self) -> u8 {
        match self {
            Self::Task => 0,
            Self::Branch => 1,
            Self::Project => 2,
            Self::Global => 3,
        }
    }

    /// The next-higher level, if any.
    pub fn parent_level(&self) -> Option<ContextLevel> {
        match self {
            Self::Global => None,
            Self::Project => Some(Self::Global),
            Self::Branch => Some(Self::Project),
            Self::Task => Some(Self::Branch),
        }
    }
}

impl std::fmt::Display for ContextLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContextLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "project" => Ok(Self::Project),
            "branch" => Ok(Self::Branch),
            "task" => Ok(Self::Task),
            other => Err(format!("Unknown context level: '{other}'")),
        }
    }
}

fn empty_map() -> Value {
    Value::Object(Map::new())
}

/// Organization-wide context. Exactly one row per user, auto-materialised
/// on first access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalContext {
    pub id: Uuid,
    pub organization_id: String,
    pub organization_name: String,
    pub global_settings: Value,
    pub autonomous_rules: Value,
    pub security_policies: Value,
    pub coding_standards: Value,
    pub workflow_templates: Value,
    pub delegation_rules: Value,
    /// `None` marks a shared template readable by every tenant.
    pub user_id: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GlobalContext {
    /// Auto-materialised default for a user's first access.
    pub fn materialise(user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id: "default".to_string(),
            organization_name: DEFAULT_ORGANIZATION_NAME.to_string(),
            global_settings: empty_map(),
            autonomous_rules: empty_map(),
            security_policies: empty_map(),
            coding_standards: empty_map(),
            workflow_templates: empty_map(),
            delegation_rules: empty_map(),
            user_id: Some(user_id.to_string()),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Project-level context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectContext {
    pub id: Uuid,
    pub project_id: Uuid,
    pub parent_global_id: Uuid,
    pub data: Value,
    pub team_preferences: Value,
    pub technology_stack: Value,
    pub project_workflow: Value,
    pub local_standards: Value,
    pub global_overrides: Value,
    pub delegation_rules: Value,
    pub user_id: Option<String>,
    pub version: i64,
    pub inheritance_disabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectContext {
    pub fn new(project_id: Uuid, data: Value, user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            parent_global_id: GLOBAL_CONTEXT_ID,
            data: as_object(data),
            team_preferences: empty_map(),
            technology_stack: empty_map(),
            project_workflow: empty_map(),
            local_standards: empty_map(),
            global_overrides: empty_map(),
            delegation_rules: empty_map(),
            user_id: Some(user_id.to_string()),
            version: 1,
            inheritance_disabled: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Branch-level context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BranchContext {
    pub id: Uuid,
    pub branch_id: Uuid,
    pub parent_project_id: Uuid,
    pub data: Value,
    pub branch_workflow: Value,
    pub feature_flags: Value,
    pub active_patterns: Value,
    pub local_overrides: Value,
    pub delegation_rules: Value,
    pub user_id: Option<String>,
    pub version: i64,
    pub inheritance_disabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BranchContext {
    pub fn new(branch_id: Uuid, parent_project_id: Uuid, data: Value, user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            branch_id,
            parent_project_id,
            data: as_object(data),
            branch_workflow: empty_map(),
            feature_flags: empty_map(),
            active_patterns: empty_map(),
            local_overrides: empty_map(),
            delegation_rules: empty_map(),
            user_id: Some(user_id.to_string()),
            version: 1,
            inheritance_disabled: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Task-level context. `task_data` mirrors the owning task (title, status,
/// priority, …) so agents read one document; its `status` key is what the
/// selector's consistency gate compares against the task row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskContext {
    pub id: Uuid,
    pub task_id: Uuid,
    pub parent_branch_id: Uuid,
    pub parent_branch_context_id: Option<Uuid>,
    pub data: Value,
    pub task_data: Value,
    pub execution_context: Value,
    pub discovered_patterns: Value,
    pub local_decisions: Value,
    pub delegation_queue: Value,
    pub local_overrides: Value,
    pub implementation_notes: Value,
    pub delegation_triggers: Value,
    pub user_id: Option<String>,
    pub version: i64,
    pub inheritance_disabled: bool,
    /// Skip inheritance entirely; the resolved document is this level only.
    pub force_local_only: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskContext {
    pub fn new(task_id: Uuid, parent_branch_id: Uuid, data: Value, user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id,
            parent_branch_id,
            parent_branch_context_id: None,
            data: as_object(data),
            task_data: empty_map(),
            execution_context: empty_map(),
            discovered_patterns: empty_map(),
            local_decisions: empty_map(),
            delegation_queue: empty_map(),
            local_overrides: empty_map(),
            implementation_notes: empty_map(),
            delegation_triggers: empty_map(),
            user_id: Some(user_id.to_string()),
            version: 1,
            inheritance_disabled: false,
            force_local_only: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Status mirrored into `task_data`, if present. The selector compares
    /// this against the task row and refuses to pick while they diverge.
    pub fn reported_status(&self) -> Option<TaskStatus> {
        self.task_data
            .get("status")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    /// Mirror a status into `task_data` (kept in step on task transitions).
    pub fn set_reported_status(&mut self, status: TaskStatus) {
        if let Value::Object(map) = &mut self.task_data {
            map.insert("status".to_string(), Value::String(status.as_str().into()));
        }
        self.updated_at = Utc::now();
    }
}

/// One context row at any level.
///
/// The repository layer stores and returns this enum; the hierarchy engine
/// works against its accessors instead of matching per level everywhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum ContextRecord {
    Global(GlobalContext),
    Project(ProjectContext),
    Branch(BranchContext),
    Task(TaskContext),
}

impl ContextRecord {
    pub fn level(&self) -> ContextLevel {
        match self {
            Self::Global(_) => ContextLevel::Global,
            Self::Project(_) => ContextLevel::Project,
            Self::Branch(_) => ContextLevel::Branch,
            Self::Task(_) => ContextLevel::Task,
        }
    }

    /// Id of the entity this context attaches to. Global rows answer the
    /// singleton id.
    pub fn context_id(&self) -> Uuid {
        match self {
            Self::Global(_) => GLOBAL_CONTEXT_ID,
            Self::Project(c) => c.project_id,
            Self::Branch(c) => c.branch_id,
            Self::Task(c) => c.task_id,
        }
    }

    /// Primary-key id of the row itself.
    pub fn row_id(&self) -> Uuid {
        match self {
            Self::Global(c) => c.id,
            Self::Project(c) => c.id,
            Self::Branch(c) => c.id,
            Self::Task(c) => c.id,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Global(c) => c.user_id.as_deref(),
            Self::Project(c) => c.user_id.as_deref(),
            Self::Branch(c) => c.user_id.as_deref(),
            Self::Task(c) => c.user_id.as_deref(),
        }
    }

    pub fn set_user_id(&mut self, user_id: &str) {
        let target = Some(user_id.to_string());
        match self {
            Self::Global(c) => c.user_id = target,
            Self::Project(c) => c.user_id = target,
            Self::Branch(c) => c.user_id = target,
            Self::Task(c) => c.user_id = target,
        }
    }

    pub fn version(&self) -> i64 {
        match self {
            Self::Global(c) => c.version,
            Self::Project(c) => c.version,
            Self::Branch(c) => c.version,
            Self::Task(c) => c.version,
        }
    }

    pub fn bump_version(&mut self) {
        let now = Utc::now();
        match self {
            Self::Global(c) => {
                c.version += 1;
                c.updated_at = now;
            }
            Self::Project(c) => {
                c.version += 1;
                c.updated_at = now;
            }
            Self::Branch(c) => {
                c.version += 1;
                c.updated_at = now;
            }
            Self::Task(c) => {
                c.version += 1;
                c.updated_at = now;
            }
        }
    }

    pub fn inheritance_disabled(&self) -> bool {
        match self {
            Self::Global(_) => false,
            Self::Project(c) => c.inheritance_disabled,
            Self::Branch(c) => c.inheritance_disabled,
            Self::Task(c) => c.inheritance_disabled,
        }
    }

    pub fn force_local_only(&self) -> bool {
        match self {
            Self::Task(c) => c.force_local_only,
            _ => false,
        }
    }

    /// Id of the parent entity at the next-higher level.
    pub fn parent(&self) -> Option<(ContextLevel, Uuid)> {
        match self {
            Self::Global(_) => None,
            Self::Project(_) => Some((ContextLevel::Global, GLOBAL_CONTEXT_ID)),
            Self::Branch(c) => Some((ContextLevel::Project, c.parent_project_id)),
            Self::Task(c) => Some((ContextLevel::Branch, c.parent_branch_id)),
        }
    }

    /// The keys this level contributes to a resolved document. Free-form
    /// `data` entries are spread at the top level, then the named sections
    /// are inserted under their field names.
    pub fn contribution(&self) -> Map<String, Value> {
        let mut doc = Map::new();
        match self {
            Self::Global(c) => {
                doc.insert("organization_id".into(), Value::String(c.organization_id.clone()));
                doc.insert(
                    "organization_name".into(),
                    Value::String(c.organization_name.clone()),
                );
                doc.insert("global_settings".into(), c.global_settings.clone());
                insert_section(&mut doc, "autonomous_rules", &c.autonomous_rules);
                insert_section(&mut doc, "security_policies", &c.security_policies);
                insert_section(&mut doc, "coding_standards", &c.coding_standards);
                insert_section(&mut doc, "workflow_templates", &c.workflow_templates);
                insert_section(&mut doc, "delegation_rules", &c.delegation_rules);
            }
            Self::Project(c) => {
                spread_data(&mut doc, &c.data);
                insert_section(&mut doc, "team_preferences", &c.team_preferences);
                insert_section(&mut doc, "technology_stack", &c.technology_stack);
                insert_section(&mut doc, "project_workflow", &c.project_workflow);
                insert_section(&mut doc, "local_standards", &c.local_standards);
                insert_section(&mut doc, "global_overrides", &c.global_overrides);
                insert_section(&mut doc, "delegation_rules", &c.delegation_rules);
            }
            Self::Branch(c) => {
                spread_data(&mut doc, &c.data);
                insert_section(&mut doc, "branch_workflow", &c.branch_workflow);
                insert_section(&mut doc, "feature_flags", &c.feature_flags);
                insert_section(&mut doc, "active_patterns", &c.active_patterns);
                insert_section(&mut doc, "local_overrides", &c.local_overrides);
                insert_section(&mut doc, "delegation_rules", &c.delegation_rules);
            }
            Self::Task(c) => {
                spread_data(&mut doc, &c.data);
                insert_section(&mut doc, "task_data", &c.task_data);
                insert_section(&mut doc, "execution_context", &c.execution_context);
                insert_section(&mut doc, "discovered_patterns", &c.discovered_patterns);
                insert_section(&mut doc, "local_decisions", &c.local_decisions);
                insert_section(&mut doc, "local_overrides", &c.local_overrides);
                insert_section(&mut doc, "implementation_notes", &c.implementation_notes);
            }
        }
        doc
    }

    /// Apply an update patch. Keys matching a named section merge into that
    /// section; everything else merges into the free-form `data` map
    /// (`global_settings` for the global level). Bumps the version.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            match self {
                Self::Global(c) => match key.as_str() {
                    "organization_name" => {
                        if let Some(name) = value.as_str() {
                            c.organization_name = name.to_string();
                        }
                    }
                    "autonomous_rules" => merge_into(&mut c.autonomous_rules, value),
                    "security_policies" => merge_into(&mut c.security_policies, value),
                    "coding_standards" => merge_into(&mut c.coding_standards, value),
                    "workflow_templates" => merge_into(&mut c.workflow_templates, value),
                    "delegation_rules" => merge_into(&mut c.delegation_rules, value),
                    "global_settings" => merge_into(&mut c.global_settings, value),
                    _ => merge_key(&mut c.global_settings, key, value),
                },
                Self::Project(c) => match key.as_str() {
                    "team_preferences" => merge_into(&mut c.team_preferences, value),
                    "technology_stack" => merge_into(&mut c.technology_stack, value),
                    "project_workflow" => merge_into(&mut c.project_workflow, value),
                    "local_standards" => merge_into(&mut c.local_standards, value),
                    "global_overrides" => merge_into(&mut c.global_overrides, value),
                    "delegation_rules" => merge_into(&mut c.delegation_rules, value),
                    "inheritance_disabled" => {
                        c.inheritance_disabled = value.as_bool().unwrap_or(c.inheritance_disabled)
                    }
                    _ => merge_key(&mut c.data, key, value),
                },
                Self::Branch(c) => match key.as_str() {
                    "branch_workflow" => merge_into(&mut c.branch_workflow, value),
                    "feature_flags" => merge_into(&mut c.feature_flags, value),
                    "active_patterns" => merge_into(&mut c.active_patterns, value),
                    "local_overrides" => merge_into(&mut c.local_overrides, value),
                    "delegation_rules" => merge_into(&mut c.delegation_rules, value),
                    "inheritance_disabled" => {
                        c.inheritance_disabled = value.as_bool().unwrap_or(c.inheritance_disabled)
                    }
                    _ => merge_key(&mut c.data, key, value),
                },
                Self::Task(c) => match key.as_str() {
                    "task_data" => merge_into(&mut c.task_data, value),
                    "execution_context" => merge_into(&mut c.execution_context, value),
                    "discovered_patterns" => merge_into(&mut c.discovered_patterns, value),
                    "local_decisions" => merge_into(&mut c.local_decisions, value),
                    "delegation_queue" => merge_into(&mut c.delegation_queue, value),
                    "local_overrides" => merge_into(&mut c.local_overrides, value),
                    "implementation_notes" => merge_into(&mut c.implementation_notes, value),
                    "delegation_triggers" => merge_into(&mut c.delegation_triggers, value),
                    "inheritance_disabled" => {
                        c.inheritance_disabled = value.as_bool().unwrap_or(c.inheritance_disabled)
                    }
                    "force_local_only" => {
                        c.force_local_only = value.as_bool().unwrap_or(c.force_local_only)
                    }
                    _ => merge_key(&mut c.data, key, value),
                },
            }
        }
        self.bump_version();
    }
}

fn as_object(value: Value) -> Value {
    if value.is_object() {
        value
    } else if value.is_null() {
        empty_map()
    } else {
        let mut map = Map::new();
        map.insert("value".to_string(), value);
        Value::Object(map)
    }
}

fn spread_data(doc: &mut Map<String, Value>, data: &Value) {
    if let Value::Object(map) = data {
        for (k, v) in map {
            doc.insert(k.clone(), v.clone());
        }
    }
}

fn insert_section(doc: &mut Map<String, Value>, name: &str, value: &Value) {
    let non_empty = match value {
        Value::Object(m) => !m.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Null => false,
        _ => true,
    };
    if non_empty {
        doc.insert(name.to_string(), value.clone());
    }
}

fn merge_into(target: &mut Value, incoming: &Value) {
    let mut current = target.take();
    current = merge_values(current, incoming.clone());
    *target = current;
}

fn merge_key(target: &mut Value, key: &str, value: &Value) {
    if !target.is_object() {
        *target = empty_map();
    }
    if let Value::Object(map) = target {
        let merged = match map.remove(key) {
            Some(existing) => merge_values(existing, value.clone()),
            None => value.clone(),
        };
        map.insert(key.to_string(), merged);
    }
}

/// Merge `child` over `parent` at the key level.
///
/// Scalars from the child replace the parent's value; maps merge
/// recursively; lists concatenate and de-duplicate, keeping the parent's
/// order and appending new child elements.
pub fn merge_values(parent: Value, child: Value) -> Value {
    match (parent, child) {
        (Value::Object(mut parent_map), Value::Object(child_map)) => {
            for (key, child_value) in child_map {
                let merged = match parent_map.remove(&key) {
                    Some(parent_value) => merge_values(parent_value, child_value),
                    None => child_value,
                };
                parent_map.insert(key, merged);
            }
            Value::Object(parent_map)
        }
        (Value::Array(mut parent_list), Value::Array(child_list)) => {
            for item in child_list {
                if !parent_list.contains(&item) {
                    parent_list.push(item);
                }
            }
            Value::Array(parent_list)
        }
        // Child scalar (or mismatched shape) wins
        (_, child) => child,
    }
}

/// Merge an ordered chain of contributions (topmost ancestor first) into a
/// single document.
pub fn merge_chain(contributions: Vec<Map<String, Value>>) -> Map<String, Value> {
    let mut doc = Map::new();
    for contribution in contributions {
        let merged = merge_values(Value::Object(doc), Value::Object(contribution));
        doc = match merged {
            Value::Object(map) => map,
            _ => Map::new(),
        };
    }
    doc
}

/// What a delegation record looked like when it was raised.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    AutoPattern,
    AutoThreshold,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::AutoPattern => "auto_pattern",
            Self::AutoThreshold => "auto_threshold",
        }
    }

    pub fn is_auto(&self) -> bool {
        !matches!(self, Self::Manual)
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "auto_pattern" => Ok(Self::AutoPattern),
            "auto_threshold" => Ok(Self::AutoThreshold),
            other => Err(format!("Unknown trigger type: '{other}'")),
        }
    }
}

/// A request to promote a pattern from a lower context level upward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextDelegation {
    pub id: Uuid,
    pub source_level: ContextLevel,
    pub source_id: Uuid,
    pub target_level: ContextLevel,
    pub target_id: Uuid,
    pub delegated_data: Value,
    pub delegation_reason: String,
    pub trigger_type: TriggerType,
    pub auto_delegated: bool,
    pub confidence_score: Option<f64>,
    pub processed: bool,
    pub approved: Option<bool>,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// One row of the resolved-context cache, keyed `(context_id, level)` per
/// user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextCacheEntry {
    pub context_id: Uuid,
    pub context_level: ContextLevel,
    pub resolved_context: Value,
    pub dependencies_hash: String,
    pub resolution_path: Vec<String>,
    /// Ancestor context ids that contributed; used to cascade invalidation.
    pub parent_chain: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: i64,
    pub last_hit: DateTime<Utc>,
    pub cache_size_bytes: i64,
    pub invalidated: bool,
    pub invalidation_reason: Option<String>,
    pub user_id: String,
}

/// The product of a hierarchy resolution: the merged document plus its
/// `_inheritance` metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedContext {
    pub level: ContextLevel,
    pub context_id: Uuid,
    pub document: Value,
    pub chain: Vec<ContextLevel>,
    pub inheritance_depth: usize,
    pub dependencies_hash: String,
    /// Ancestor context ids walked during resolution (excluding self).
    pub parent_chain: Vec<Uuid>,
}

impl ResolvedContext {
    /// Final document with `_inheritance.chain` / `_inheritance.inheritance_depth`
    /// stitched in.
    pub fn into_document(mut self) -> Value {
        if let Value::Object(map) = &mut self.document {
            let mut meta = Map::new();
            meta.insert(
                "chain".to_string(),
                Value::Array(
                    self.chain
                        .iter()
                        .map(|l| Value::String(l.as_str().to_string()))
                        .collect(),
                ),
            );
            meta.insert(
                "inheritance_depth".to_string(),
                Value::Number(self.inheritance_depth.into()),
            );
            map.insert("_inheritance".to_string(), Value::Object(meta));
        }
        self.document
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_level_ordering() {
        assert!(ContextLevel::Task.specificity() < ContextLevel::Branch.specificity());
        assert!(ContextLevel::Branch.specificity() < ContextLevel::Project.specificity());
        assert!(ContextLevel::Project.specificity() < ContextLevel::Global.specificity());

        assert_eq!(ContextLevel::Global.depth_index(), 0);
        assert_eq!(ContextLevel::Task.depth_index(), 3);
        assert_eq!(ContextLevel::Task.parent_level(), Some(ContextLevel::Branch));
        assert_eq!(ContextLevel::Global.parent_level(), None);
    }

    #[test]
    fn test_merge_scalar_override() {
        let parent = json!({"a": 1, "b": "keep"});
        let child = json!({"a": 2});
        let merged = merge_values(parent, child);
        assert_eq!(merged, json!({"a": 2, "b": "keep"}));
    }

    #[test]
    fn test_merge_maps_recursively() {
        let parent = json!({"settings": {"x": 1, "y": 2}});
        let child = json!({"settings": {"y": 3, "z": 4}});
        let merged = merge_values(parent, child);
        assert_eq!(merged, json!({"settings": {"x": 1, "y": 3, "z": 4}}));
    }

    #[test]
    fn test_merge_lists_concat_dedupe() {
        let parent = json!({"tags": ["a", "b"]});
        let child = json!({"tags": ["b", "c"]});
        let merged = merge_values(parent, child);
        assert_eq!(merged, json!({"tags": ["a", "b", "c"]}));
    }

    #[test]
    fn test_merge_mismatched_shapes_child_wins() {
        let parent = json!({"v": {"nested": true}});
        let child = json!({"v": "flat"});
        let merged = merge_values(parent, child);
        assert_eq!(merged, json!({"v": "flat"}));
    }

    #[test]
    fn test_merge_chain_order() {
        let global = json!({"organization_name": "Org", "style": "tabs"});
        let project = json!({"style": "spaces", "stack": ["rust"]});
        let doc = merge_chain(vec![
            global.as_object().unwrap().clone(),
            project.as_object().unwrap().clone(),
        ]);
        assert_eq!(doc.get("organization_name"), Some(&json!("Org")));
        assert_eq!(doc.get("style"), Some(&json!("spaces")));
    }

    #[test]
    fn test_global_materialise_defaults() {
        let ctx = GlobalContext::materialise("user-1");
        assert_eq!(ctx.organization_name, DEFAULT_ORGANIZATION_NAME);
        assert_eq!(ctx.user_id.as_deref(), Some("user-1"));
        assert_eq!(ctx.version, 1);

        let record = ContextRecord::Global(ctx);
        let doc = record.contribution();
        assert!(doc.contains_key("organization_name"));
        assert!(doc.contains_key("global_settings"));
    }

    #[test]
    fn test_record_parents() {
        let project_id = Uuid::new_v4();
        let branch_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();

        let project = ContextRecord::Project(ProjectContext::new(project_id, json!({}), "u"));
        assert_eq!(
            project.parent(),
            Some((ContextLevel::Global, GLOBAL_CONTEXT_ID))
        );

        let branch = ContextRecord::Branch(BranchContext::new(branch_id, project_id, json!({}), "u"));
        assert_eq!(branch.parent(), Some((ContextLevel::Project, project_id)));

        let task = ContextRecord::Task(TaskContext::new(task_id, branch_id, json!({}), "u"));
        assert_eq!(task.parent(), Some((ContextLevel::Branch, branch_id)));
    }

    #[test]
    fn test_apply_patch_bumps_version_and_merges() {
        let mut record = ContextRecord::Project(ProjectContext::new(
            Uuid::new_v4(),
            json!({"existing": 1}),
            "u",
        ));
        let v0 = record.version();

        let patch = json!({"technology_stack": {"lang": "rust"}, "freeform": true});
        record.apply_patch(patch.as_object().unwrap());

        assert_eq!(record.version(), v0 + 1);
        let doc = record.contribution();
        assert_eq!(doc.get("existing"), Some(&json!(1)));
        assert_eq!(doc.get("freeform"), Some(&json!(true)));
        assert_eq!(
            doc.get("technology_stack"),
            Some(&json!({"lang": "rust"}))
        );
    }

    #[test]
    fn test_task_context_reported_status() {
        let mut ctx = TaskContext::new(Uuid::new_v4(), Uuid::new_v4(), json!({}), "u");
        assert_eq!(ctx.reported_status(), None);

        ctx.set_reported_status(TaskStatus::InProgress);
        assert_eq!(ctx.reported_status(), Some(TaskStatus::InProgress));

        ctx.set_reported_status(TaskStatus::Done);
        assert_eq!(ctx.reported_status(), Some(TaskStatus::Done));
    }

    #[test]
    fn test_resolved_context_metadata() {
        let resolved = ResolvedContext {
            level: ContextLevel::Project,
            context_id: Uuid::new_v4(),
            document: json!({"organization_name": "Org"}),
            chain: vec![ContextLevel::Global, ContextLevel::Project],
            inheritance_depth: 2,
            dependencies_hash: "abc".to_string(),
            parent_chain: vec![GLOBAL_CONTEXT_ID],
        };
        let doc = resolved.into_document();
        assert_eq!(doc["_inheritance"]["inheritance_depth"], json!(2));
        assert_eq!(doc["_inheritance"]["chain"], json!(["global", "project"]));
    }
}
