use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use fieldsync_core::models::{
    ConditionOperator, ConflictSeverity, ConflictStatus, EntityType, PriorityTier, QueueAction,
    ResolutionStrategy, ResolverRole,
};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Queue, prioritize and sync field assessment data while offline")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to a JSON configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Base URL of the sync server
    #[arg(long, global = true, value_name = "URL")]
    pub server_url: Option<String>,

    /// Bearer token sent to the sync server
    #[arg(long, global = true, value_name = "TOKEN")]
    pub api_token: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and feed the local mutation queue
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Manage priority rules
    #[command(subcommand)]
    Rules(RulesCommand),
    /// Review and resolve sync conflicts
    #[command(subcommand)]
    Conflicts(ConflictsCommand),
    /// Inspect, retry and roll back optimistic updates
    #[command(subcommand)]
    Updates(UpdatesCommand),
    /// Run and monitor synchronization
    #[command(subcommand)]
    Sync(SyncCommand),
}

#[derive(Subcommand)]
pub enum QueueCommand {
    /// Apply a local mutation and queue it for sync
    Add(QueueAddArgs),
    /// List queued mutations in sync order
    List {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Recompute priority scores of pending mutations
    Rescore,
}

#[derive(Args)]
pub struct QueueAddArgs {
    /// Entity type of the mutation
    #[arg(value_enum)]
    pub entity_type: EntityKind,
    /// Identifier of the entity
    pub entity_id: String,
    /// Mutation kind
    #[arg(long, value_enum, default_value = "update")]
    pub action: ActionKind,
    /// Operator-chosen priority tier
    #[arg(long, value_enum, default_value = "normal")]
    pub priority: TierKind,
    /// Entity data as JSON; read from stdin when omitted
    #[arg(long, value_name = "JSON")]
    pub data: Option<String>,
}

#[derive(Subcommand)]
pub enum RulesCommand {
    /// Add a priority rule with one condition
    Add(RuleAddArgs),
    /// List priority rules
    List,
    /// Deactivate a priority rule
    Disable {
        /// Rule ID
        id: String,
    },
    /// Reactivate a priority rule
    Enable {
        /// Rule ID
        id: String,
    },
}

#[derive(Args)]
pub struct RuleAddArgs {
    /// Rule name
    pub name: String,
    /// Entity type the rule targets
    #[arg(long, value_enum)]
    pub entity_type: EntityKind,
    /// Dotted field path into the entity data
    #[arg(long)]
    pub field: String,
    /// Comparison operator
    #[arg(long, value_enum, default_value = "equals")]
    pub operator: OperatorKind,
    /// Expected value; parsed as JSON when possible
    #[arg(long)]
    pub value: String,
    /// Score added when the rule applies
    #[arg(long, allow_negative_numbers = true)]
    pub modifier: i32,
    /// Author of the rule
    #[arg(long, default_value = "cli")]
    pub author: String,
}

#[derive(Subcommand)]
pub enum ConflictsCommand {
    /// List conflicts
    List(ConflictListArgs),
    /// Show one conflict with its audit trail
    Show {
        /// Conflict ID
        id: String,
    },
    /// Resolve a pending conflict
    Resolve(ResolveArgs),
    /// Force a resolution with elevated privileges
    Override(OverrideArgs),
    /// Audit trail of an entity's conflicts
    Audit {
        /// Entity ID
        entity_id: String,
        /// Include resolved conflicts
        #[arg(long)]
        include_resolved: bool,
    },
    /// Suggest a resolution strategy
    Suggest {
        /// Conflict ID
        id: String,
    },
    /// Pending and resolved counts
    Stats,
}

#[derive(Args)]
pub struct ConflictListArgs {
    #[arg(long, value_enum)]
    pub status: Option<StatusKind>,
    #[arg(long, value_enum)]
    pub severity: Option<SeverityKind>,
    #[arg(long, value_enum)]
    pub entity_type: Option<EntityKind>,
    #[arg(long)]
    pub entity_id: Option<String>,
    /// 1-based page number
    #[arg(long, default_value = "1")]
    pub page: usize,
    #[arg(long, default_value = "20")]
    pub page_size: usize,
}

#[derive(Args)]
pub struct ResolveArgs {
    /// Conflict ID
    pub id: String,
    #[arg(long, value_enum)]
    pub strategy: StrategyKind,
    /// Merged entity data as JSON, required for manual resolution
    #[arg(long, value_name = "JSON")]
    pub merged: Option<String>,
    /// Why this resolution is correct
    #[arg(long)]
    pub justification: String,
    /// Who resolved the conflict
    #[arg(long)]
    pub by: String,
}

#[derive(Args)]
pub struct OverrideArgs {
    /// Conflict ID
    pub id: String,
    #[arg(long, value_enum)]
    pub strategy: StrategyKind,
    /// Forced entity data as JSON, required for manual resolution
    #[arg(long, value_name = "JSON")]
    pub data: Option<String>,
    /// Why the override is needed
    #[arg(long)]
    pub reason: String,
    /// Who performs the override
    #[arg(long)]
    pub by: String,
    /// Role of the person performing the override
    #[arg(long, value_enum)]
    pub role: RoleKind,
    /// Emergency override; requires supervisor or admin
    #[arg(long)]
    pub emergency: bool,
}

#[derive(Subcommand)]
pub enum UpdatesCommand {
    /// Counts of tracked updates by status
    Stats,
    /// Local state and update history of one entity
    Show {
        #[arg(value_enum)]
        entity_type: EntityKind,
        entity_id: String,
    },
    /// Show one update
    Get {
        /// Update ID
        id: String,
    },
    /// Resubmit a failed update
    Retry {
        /// Update ID
        id: String,
    },
    /// Restore the state before a failed update
    Rollback {
        /// Update ID
        id: String,
    },
    /// Roll back every failed update
    RollbackFailed,
}

#[derive(Subcommand)]
pub enum SyncCommand {
    /// Run one sync session now
    Run {
        /// Recorded as the session trigger
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Keep syncing on the configured interval until interrupted
    Watch,
    /// Current sync status and queue summary
    Status,
    /// Recent sync sessions
    History {
        /// Number of sessions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EntityKind {
    Assessment,
    Response,
    Entity,
    Incident,
}

impl From<EntityKind> for EntityType {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Assessment => Self::Assessment,
            EntityKind::Response => Self::Response,
            EntityKind::Entity => Self::Entity,
            EntityKind::Incident => Self::Incident,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

impl From<ActionKind> for QueueAction {
    fn from(kind: ActionKind) -> Self {
        match kind {
            ActionKind::Create => Self::Create,
            ActionKind::Update => Self::Update,
            ActionKind::Delete => Self::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TierKind {
    Low,
    Normal,
    High,
}

impl From<TierKind> for PriorityTier {
    fn from(kind: TierKind) -> Self {
        match kind {
            TierKind::Low => Self::Low,
            TierKind::Normal => Self::Normal,
            TierKind::High => Self::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OperatorKind {
    Equals,
    GreaterThan,
    Contains,
}

impl From<OperatorKind> for ConditionOperator {
    fn from(kind: OperatorKind) -> Self {
        match kind {
            OperatorKind::Equals => Self::Equals,
            OperatorKind::GreaterThan => Self::GreaterThan,
            OperatorKind::Contains => Self::Contains,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyKind {
    LocalWins,
    ServerWins,
    Manual,
}

impl From<StrategyKind> for ResolutionStrategy {
    fn from(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::LocalWins => Self::LocalWins,
            StrategyKind::ServerWins => Self::ServerWins,
            StrategyKind::Manual => Self::Manual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoleKind {
    FieldWorker,
    Coordinator,
    Supervisor,
    Admin,
}

impl From<RoleKind> for ResolverRole {
    fn from(kind: RoleKind) -> Self {
        match kind {
            RoleKind::FieldWorker => Self::FieldWorker,
            RoleKind::Coordinator => Self::Coordinator,
            RoleKind::Supervisor => Self::Supervisor,
            RoleKind::Admin => Self::Admin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SeverityKind {
    Low,
    High,
    Critical,
}

impl From<SeverityKind> for ConflictSeverity {
    fn from(kind: SeverityKind) -> Self {
        match kind {
            SeverityKind::Low => Self::Low,
            SeverityKind::High => Self::High,
            SeverityKind::Critical => Self::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusKind {
    Pending,
    Resolved,
}

impl From<StatusKind> for ConflictStatus {
    fn from(kind: StatusKind) -> Self {
        match kind {
            StatusKind::Pending => Self::Pending,
            StatusKind::Resolved => Self::Resolved,
        }
    }
}
