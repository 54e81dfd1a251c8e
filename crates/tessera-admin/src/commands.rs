//! Subcommands
//!
//! Every command prints its result as JSON on stdout.

use std::sync::Arc;

use clap::Subcommand;
use serde::Serialize;
use serde_json::json;

use tessera_changeset::ChangesetService;
use tessera_common::UserContext;
use tessera_persistence::{ChangesetState, PersistenceService};
use tessera_variation::{
    HierarchyCache, PropertyNode, ServiceTypeNode, ValueNode, VariationHierarchy,
};

use crate::config::Configuration;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check that the storage backend answers
    Health,
    /// Inspect and move changesets
    Changeset {
        #[command(subcommand)]
        action: ChangesetCommand,
    },
    /// Inspect the variation hierarchy
    Hierarchy {
        #[command(subcommand)]
        action: HierarchyCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ChangesetCommand {
    /// A changeset with its changes and actions
    Show { id: i64 },
    /// Changesets filtered by owner and state
    List {
        #[arg(long)]
        user: Option<i64>,
        #[arg(long, value_parser = parse_state)]
        state: Option<ChangesetState>,
    },
    /// Pending changes with their conflicts against the live state
    Conflicts { id: i64 },
    Commit {
        id: i64,
        #[arg(short = 'm', long)]
        comment: Option<String>,
    },
    Apply {
        id: i64,
        #[arg(short = 'm', long)]
        comment: Option<String>,
    },
    Discard {
        id: i64,
        #[arg(short = 'm', long)]
        comment: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum HierarchyCommand {
    /// Service types with their ranked properties, and every property's value tree
    Dump,
}

/// Core services the commands run against
pub struct Services {
    persistence: Arc<dyn PersistenceService>,
    changesets: ChangesetService,
    hierarchy: HierarchyCache,
}

impl Services {
    pub fn new(persistence: Arc<dyn PersistenceService>, configuration: &Configuration) -> Self {
        Self {
            changesets: ChangesetService::new(
                persistence.clone(),
                configuration.changeset_options(),
            ),
            hierarchy: HierarchyCache::new(configuration.hierarchy_options()),
            persistence,
        }
    }
}

pub async fn run(command: Command, services: &Services, user: &UserContext) -> anyhow::Result<()> {
    match command {
        Command::Health => {
            services.persistence.health_check().await?;
            print(&json!({
                "status": "UP",
                "storageMode": services.persistence.storage_mode().to_string(),
            }))
        }
        Command::Changeset { action } => run_changeset(action, services, user).await,
        Command::Hierarchy {
            action: HierarchyCommand::Dump,
        } => {
            let snapshot = services
                .hierarchy
                .refresh(services.persistence.as_ref())
                .await?;
            print(&HierarchyDump::from(&snapshot.hierarchy))
        }
    }
}

async fn run_changeset(
    action: ChangesetCommand,
    services: &Services,
    user: &UserContext,
) -> anyhow::Result<()> {
    let changesets = &services.changesets;
    match action {
        ChangesetCommand::Show { id } => {
            let changeset = changesets.get_changeset(id).await?;
            let changes = changesets.list_changes(id).await?;
            let actions = changesets.list_actions(id).await?;
            print(&json!({
                "changeset": changeset,
                "changes": changes,
                "actions": actions,
            }))
        }
        ChangesetCommand::List { user, state } => {
            print(&changesets.list_changesets(user, state).await?)
        }
        ChangesetCommand::Conflicts { id } => {
            let views = changesets.changes_with_conflicts(id).await?;
            let conflicting = views.iter().filter(|v| v.conflict.is_some()).count();
            let applicable = changesets.can_be_applied_by(user, id).await?;
            print(&json!({
                "changes": views,
                "conflicting": conflicting,
                "canBeApplied": applicable,
            }))
        }
        ChangesetCommand::Commit { id, comment } => {
            print(&changesets.commit(user, id, comment.as_deref()).await?)
        }
        ChangesetCommand::Apply { id, comment } => {
            print(&changesets.apply(user, id, comment.as_deref()).await?)
        }
        ChangesetCommand::Discard { id, comment } => {
            print(&changesets.discard(user, id, comment.as_deref()).await?)
        }
    }
}

fn parse_state(s: &str) -> Result<ChangesetState, String> {
    s.to_ascii_uppercase().parse()
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HierarchyDump<'a> {
    service_types: Vec<&'a ServiceTypeNode>,
    properties: Vec<PropertyDump<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PropertyDump<'a> {
    #[serde(flatten)]
    property: &'a PropertyNode,
    /// Values in pre-order
    values: Vec<&'a ValueNode>,
}

impl<'a> From<&'a VariationHierarchy> for HierarchyDump<'a> {
    fn from(hierarchy: &'a VariationHierarchy) -> Self {
        let mut service_types: Vec<&ServiceTypeNode> = hierarchy.service_type_nodes().collect();
        service_types.sort_by_key(|st| st.id);

        let mut properties: Vec<&PropertyNode> = hierarchy.property_nodes().collect();
        properties.sort_by_key(|p| p.id);

        let properties = properties
            .into_iter()
            .map(|property| {
                let mut values = Vec::new();
                let mut stack: Vec<i64> = property.roots.iter().rev().copied().collect();
                while let Some(id) = stack.pop() {
                    if let Some(node) = hierarchy.value_node(id) {
                        stack.extend(node.children.iter().rev());
                        values.push(node);
                    }
                }
                PropertyDump { property, values }
            })
            .collect();

        HierarchyDump {
            service_types,
            properties,
        }
    }
}
