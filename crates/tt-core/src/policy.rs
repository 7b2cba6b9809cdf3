//! Workspace policy configuration and the project/task catalog.
//!
//! Policies are typed documents validated once at the boundary
//! ([`WorkspacePolicy::validate`]); every other module reads them as trusted.

use std::collections::HashMap;
use std::fmt;

use chrono::{Datelike, NaiveDate, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{ProjectId, Role, TaskId, UserId, WorkflowKind, WorkspaceId};

/// Who may decide one approval step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverSpec {
    /// A specific user.
    User(UserId),
    /// Anyone holding this role or a higher one.
    Role(Role),
}

impl fmt::Display for ApproverSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(user) => write!(f, "user:{user}"),
            Self::Role(role) => write!(f, "role:{role}"),
        }
    }
}

impl std::str::FromStr for ApproverSpec {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("user", user)) => Ok(Self::User(UserId::new(user)?)),
            Some(("role", role)) => Ok(Self::Role(role.parse()?)),
            _ => Err(ValidationError::UnknownVariant {
                field: "approver",
                value: s.to_string(),
            }),
        }
    }
}

/// The person acting on a timesheet, with the roles the caller resolved for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user: UserId,
    #[serde(default)]
    pub roles: Vec<Role>,
}

impl Actor {
    pub fn new(user: UserId, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            user,
            roles: roles.into_iter().collect(),
        }
    }

    /// The identity used for automatic decisions.
    #[must_use]
    pub fn system() -> Self {
        Self {
            user: UserId::system(),
            roles: vec![Role::Owner],
        }
    }

    #[must_use]
    pub fn is_system(&self) -> bool {
        self.user == UserId::system()
    }

    /// The single permission check for approval steps.
    #[must_use]
    pub fn may_decide(&self, step: &ApproverSpec) -> bool {
        match step {
            ApproverSpec::User(user) => &self.user == user,
            ApproverSpec::Role(required) => self.roles.iter().any(|role| role.satisfies(*required)),
        }
    }

    /// Whether the actor holds any role that can approve.
    #[must_use]
    pub fn is_approver(&self) -> bool {
        self.roles.iter().any(|role| role.can_approve())
    }
}

/// Ordered approval steps of a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "default_workflow_kind")]
    pub kind: WorkflowKind,
    pub steps: Vec<ApproverSpec>,
}

const fn default_workflow_kind() -> WorkflowKind {
    WorkflowKind::Sequential
}

impl Default for WorkflowDefinition {
    fn default() -> Self {
        Self {
            kind: WorkflowKind::Sequential,
            steps: vec![ApproverSpec::Role(Role::Manager)],
        }
    }
}

/// What to do with a step left undecided past its deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    /// Decide the step as approved on behalf of the system.
    AutoApprove,
    /// Hand the step to another approver.
    Escalate { to: ApproverSpec },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub deadline_hours: i64,
    pub action: EscalationAction,
}

/// Which days a user is expected to record time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCalendar {
    #[serde(default = "default_working_days")]
    pub working_days: Vec<Weekday>,
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

fn default_working_days() -> Vec<Weekday> {
    vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
    ]
}

impl Default for WorkCalendar {
    fn default() -> Self {
        Self {
            working_days: default_working_days(),
            holidays: Vec::new(),
        }
    }
}

impl WorkCalendar {
    #[must_use]
    pub fn is_work_day(&self, date: NaiveDate) -> bool {
        self.working_days.contains(&date.weekday()) && !self.holidays.contains(&date)
    }
}

/// Policy knobs of one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspacePolicy {
    /// Hours per period above which time counts as overtime. Default: 40.
    pub weekly_overtime_hours: Decimal,
    /// Hours per day above which a day is flagged. Default: 8.
    pub daily_overtime_hours: Decimal,
    /// Inactivity that auto-pauses a timer. Default: 5 minutes.
    pub idle_threshold_minutes: i64,
    /// Upper bound of a single entry. Default: 1440 (24h).
    pub max_entry_minutes: i64,
    /// Maximum length of combined timesheet descriptions.
    pub description_limit: usize,
    /// Absolute rate difference tolerated before flagging a mismatch.
    pub rate_tolerance: Decimal,
    pub workflow: WorkflowDefinition,
    pub escalation: Option<EscalationPolicy>,
    pub calendar: WorkCalendar,
}

impl Default for WorkspacePolicy {
    fn default() -> Self {
        Self {
            weekly_overtime_hours: Decimal::from(40),
            daily_overtime_hours: Decimal::from(8),
            idle_threshold_minutes: 5,
            max_entry_minutes: 24 * 60,
            description_limit: 500,
            rate_tolerance: Decimal::ZERO,
            workflow: WorkflowDefinition::default(),
            escalation: None,
            calendar: WorkCalendar::default(),
        }
    }
}

impl WorkspacePolicy {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |message: &str| {
            Err(ValidationError::InvalidPolicy {
                message: message.to_string(),
            })
        };
        if self.weekly_overtime_hours <= Decimal::ZERO {
            return invalid("weekly_overtime_hours must be positive");
        }
        if self.daily_overtime_hours <= Decimal::ZERO {
            return invalid("daily_overtime_hours must be positive");
        }
        if self.idle_threshold_minutes <= 0 {
            return invalid("idle_threshold_minutes must be positive");
        }
        if !(1..=24 * 60).contains(&self.max_entry_minutes) {
            return invalid("max_entry_minutes must be between 1 and 1440");
        }
        if self.description_limit == 0 {
            return invalid("description_limit must be positive");
        }
        if self.rate_tolerance.is_sign_negative() {
            return invalid("rate_tolerance cannot be negative");
        }
        if self.workflow.steps.is_empty() {
            return invalid("workflow needs at least one step");
        }
        if let Some(escalation) = &self.escalation {
            if escalation.deadline_hours <= 0 {
                return invalid("escalation deadline_hours must be positive");
            }
        }
        Ok(())
    }
}

/// Default policy plus per-workspace overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policies {
    #[serde(default)]
    pub default: WorkspacePolicy,
    #[serde(default)]
    pub workspaces: HashMap<WorkspaceId, WorkspacePolicy>,
}

impl Policies {
    pub fn new(default: WorkspacePolicy) -> Self {
        Self {
            default,
            workspaces: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_workspace(mut self, workspace: WorkspaceId, policy: WorkspacePolicy) -> Self {
        self.workspaces.insert(workspace, policy);
        self
    }

    #[must_use]
    pub fn for_workspace(&self, workspace: &WorkspaceId) -> &WorkspacePolicy {
        self.workspaces.get(workspace).unwrap_or(&self.default)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.default.validate()?;
        for (workspace, policy) in &self.workspaces {
            policy
                .validate()
                .map_err(|err| ValidationError::InvalidPolicy {
                    message: format!("workspace {workspace}: {err}"),
                })?;
        }
        Ok(())
    }
}

/// Lookup of externally owned project and task metadata.
///
/// The catalog may be partial: unknown ids are not an error, the caller has
/// already resolved identity.
pub trait Catalog: Send + Sync {
    /// Workspace that owns the project.
    fn project_workspace(&self, project: &ProjectId) -> Option<WorkspaceId>;

    /// Project that owns the task.
    fn task_project(&self, task: &TaskId) -> Option<ProjectId>;

    /// Canonical hourly rate: the task's if set, otherwise the project's.
    fn canonical_rate(&self, project: Option<&ProjectId>, task: Option<&TaskId>) -> Option<Decimal>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub workspace: WorkspaceId,
    #[serde(default)]
    pub rate: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub project: ProjectId,
    #[serde(default)]
    pub rate: Option<Decimal>,
}

/// A catalog loaded from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticCatalog {
    #[serde(default)]
    pub projects: HashMap<ProjectId, ProjectInfo>,
    #[serde(default)]
    pub tasks: HashMap<TaskId, TaskInfo>,
}

impl StaticCatalog {
    #[must_use]
    pub fn with_project(mut self, id: ProjectId, workspace: WorkspaceId, rate: Option<Decimal>) -> Self {
        self.projects.insert(id, ProjectInfo { workspace, rate });
        self
    }

    #[must_use]
    pub fn with_task(mut self, id: TaskId, project: ProjectId, rate: Option<Decimal>) -> Self {
        self.tasks.insert(id, TaskInfo { project, rate });
        self
    }
}

impl Catalog for StaticCatalog {
    fn project_workspace(&self, project: &ProjectId) -> Option<WorkspaceId> {
        self.projects.get(project).map(|info| info.workspace.clone())
    }

    fn task_project(&self, task: &TaskId) -> Option<ProjectId> {
        self.tasks.get(task).map(|info| info.project.clone())
    }

    fn canonical_rate(&self, project: Option<&ProjectId>, task: Option<&TaskId>) -> Option<Decimal> {
        let task_info = task.and_then(|task| self.tasks.get(task));
        if let Some(rate) = task_info.and_then(|info| info.rate) {
            return Some(rate);
        }
        let project = project.or_else(|| task_info.map(|info| &info.project))?;
        self.projects.get(project).and_then(|info| info.rate)
    }
}

/// Checks that the referenced project and task live in `workspace`.
pub fn validate_references(
    catalog: &dyn Catalog,
    workspace: &WorkspaceId,
    project: Option<&ProjectId>,
    task: Option<&TaskId>,
) -> Result<(), ValidationError> {
    if let Some(project) = project {
        if let Some(owner) = catalog.project_workspace(project) {
            if &owner != workspace {
                return Err(ValidationError::WorkspaceMismatch {
                    what: format!("project {project}"),
                    expected: workspace.to_string(),
                    actual: owner.to_string(),
                });
            }
        }
    }
    if let Some(task) = task {
        if let Some(task_project) = catalog.task_project(task) {
            if let Some(project) = project {
                if &task_project != project {
                    return Err(ValidationError::TaskProjectMismatch {
                        task: task.to_string(),
                        expected: project.to_string(),
                        actual: task_project.to_string(),
                    });
                }
            }
            if let Some(owner) = catalog.project_workspace(&task_project) {
                if &owner != workspace {
                    return Err(ValidationError::WorkspaceMismatch {
                        what: format!("task {task}"),
                        expected: workspace.to_string(),
                        actual: owner.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws(id: &str) -> WorkspaceId {
        WorkspaceId::new(id).unwrap()
    }

    fn project(id: &str) -> ProjectId {
        ProjectId::new(id).unwrap()
    }

    fn task(id: &str) -> TaskId {
        TaskId::new(id).unwrap()
    }

    fn catalog() -> StaticCatalog {
        StaticCatalog::default()
            .with_project(project("web"), ws("acme"), Some(Decimal::from(100)))
            .with_project(project("ops"), ws("globex"), None)
            .with_task(task("t-login"), project("web"), Some(Decimal::from(120)))
            .with_task(task("t-docs"), project("web"), None)
    }

    #[test]
    fn default_policy_is_valid() {
        assert!(WorkspacePolicy::default().validate().is_ok());
        assert!(Policies::default().validate().is_ok());
    }

    #[test]
    fn empty_workflow_is_rejected() {
        let policy = WorkspacePolicy {
            workflow: WorkflowDefinition {
                kind: WorkflowKind::Sequential,
                steps: Vec::new(),
            },
            ..WorkspacePolicy::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(ValidationError::InvalidPolicy { .. })
        ));
    }

    #[test]
    fn workspace_override_wins() {
        let custom = WorkspacePolicy {
            weekly_overtime_hours: Decimal::from(45),
            ..WorkspacePolicy::default()
        };
        let policies = Policies::default().with_workspace(ws("acme"), custom);
        assert_eq!(
            policies.for_workspace(&ws("acme")).weekly_overtime_hours,
            Decimal::from(45)
        );
        assert_eq!(
            policies.for_workspace(&ws("other")).weekly_overtime_hours,
            Decimal::from(40)
        );
    }

    #[test]
    fn canonical_rate_prefers_task() {
        let catalog = catalog();
        assert_eq!(
            catalog.canonical_rate(Some(&project("web")), Some(&task("t-login"))),
            Some(Decimal::from(120))
        );
        assert_eq!(
            catalog.canonical_rate(Some(&project("web")), Some(&task("t-docs"))),
            Some(Decimal::from(100))
        );
        assert_eq!(catalog.canonical_rate(None, Some(&task("t-docs"))), Some(Decimal::from(100)));
        assert_eq!(catalog.canonical_rate(Some(&project("ops")), None), None);
    }

    #[test]
    fn references_must_share_workspace() {
        let catalog = catalog();
        assert!(validate_references(&catalog, &ws("acme"), Some(&project("web")), Some(&task("t-login"))).is_ok());
        assert!(matches!(
            validate_references(&catalog, &ws("acme"), Some(&project("ops")), None),
            Err(ValidationError::WorkspaceMismatch { .. })
        ));
        assert!(matches!(
            validate_references(&catalog, &ws("globex"), None, Some(&task("t-login"))),
            Err(ValidationError::WorkspaceMismatch { .. })
        ));
        assert!(matches!(
            validate_references(&catalog, &ws("acme"), Some(&project("ops")), Some(&task("t-login"))),
            Err(ValidationError::WorkspaceMismatch { .. })
        ));
    }

    #[test]
    fn task_must_belong_to_project() {
        let catalog = StaticCatalog::default()
            .with_project(project("web"), ws("acme"), None)
            .with_project(project("api"), ws("acme"), None)
            .with_task(task("t-login"), project("web"), None);
        assert!(matches!(
            validate_references(&catalog, &ws("acme"), Some(&project("api")), Some(&task("t-login"))),
            Err(ValidationError::TaskProjectMismatch { .. })
        ));
    }

    #[test]
    fn unknown_references_pass() {
        let catalog = StaticCatalog::default();
        assert!(validate_references(&catalog, &ws("acme"), Some(&project("x")), Some(&task("y"))).is_ok());
    }

    #[test]
    fn actor_permission_check() {
        let bob = UserId::new("bob").unwrap();
        let manager = Actor::new(bob.clone(), [Role::Manager]);
        assert!(manager.may_decide(&ApproverSpec::User(bob)));
        assert!(manager.may_decide(&ApproverSpec::Role(Role::Manager)));
        assert!(!manager.may_decide(&ApproverSpec::Role(Role::Admin)));
        let member = Actor::new(UserId::new("carol").unwrap(), [Role::Member]);
        assert!(!member.may_decide(&ApproverSpec::Role(Role::Member)));
        assert!(!member.is_approver());
    }

    #[test]
    fn approver_spec_round_trips_through_text() {
        let spec: ApproverSpec = "role:admin".parse().unwrap();
        assert_eq!(spec, ApproverSpec::Role(Role::Admin));
        assert_eq!(spec.to_string(), "role:admin");
        let spec: ApproverSpec = "user:bob".parse().unwrap();
        assert_eq!(spec.to_string(), "user:bob");
        assert!("group:x".parse::<ApproverSpec>().is_err());
    }

    #[test]
    fn calendar_skips_weekends_and_holidays() {
        let calendar = WorkCalendar {
            holidays: vec![NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()],
            ..WorkCalendar::default()
        };
        assert!(!calendar.is_work_day(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()));
        assert!(calendar.is_work_day(NaiveDate::from_ymd_opt(2025, 1, 2).unwrap()));
        assert!(!calendar.is_work_day(NaiveDate::from_ymd_opt(2025, 1, 4).unwrap()));
    }

    #[test]
    fn policy_deserializes_from_toml_shaped_json() {
        let json = r#"{
            "weekly_overtime_hours": "45",
            "workflow": {"kind": "parallel", "steps": [{"user": "bob"}, {"role": "admin"}]},
            "escalation": {"deadline_hours": 48, "action": {"escalate": {"to": {"role": "owner"}}}}
        }"#;
        let policy: WorkspacePolicy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.weekly_overtime_hours, Decimal::from(45));
        assert_eq!(policy.workflow.kind, WorkflowKind::Parallel);
        assert_eq!(policy.workflow.steps.len(), 2);
        assert_eq!(policy.idle_threshold_minutes, 5);
        assert!(policy.validate().is_ok());
    }
}
