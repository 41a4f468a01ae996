//! allocctl
//!
//! Operator CLI over a local allocation database. Results are printed as JSON
//! on stdout, logs go to stderr.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ipnet::IpNet;
use serde::Serialize;
use site_allocator::{
    AllocationEngine, AllocationFilter, ConstraintRequest, ConstraintType, CreateAllocationRequest,
    EngineConfig, NewIpBlock, RequestContext, ResourceType, RoutingType, UpdateAllocationRequest,
    UpdateConstraintRequest,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "allocctl")]
#[command(about = "Manage site allocations, reservations and prefixes")]
struct Args {
    /// TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Database file, overrides the configuration
    #[arg(short = 'd', long)]
    db: Option<PathBuf>,

    /// User recorded as creator of new rows
    #[arg(long, default_value_t = Uuid::nil())]
    actor: Uuid,

    /// Request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database and schema
    Init,

    /// Register a site owned by a provider
    SeedSite {
        #[arg(long)]
        name: String,
        #[arg(long)]
        provider: Uuid,
    },

    /// Register a tenant
    SeedTenant {
        #[arg(long)]
        org: String,
        #[arg(long)]
        display_name: Option<String>,
    },

    /// Register an Instance Type
    SeedInstanceType {
        #[arg(long)]
        name: String,
        #[arg(long)]
        provider: Uuid,
        #[arg(long)]
        site: Option<Uuid>,
    },

    /// Register machines, optionally of an Instance Type
    SeedMachine {
        #[arg(long)]
        site: Uuid,
        #[arg(long)]
        instance_type: Option<Uuid>,
        #[arg(long, default_value_t = 1)]
        count: u32,
    },

    /// Register a provider IP Block
    SeedIpBlock {
        #[arg(long)]
        name: String,
        #[arg(long)]
        provider: Uuid,
        #[arg(long)]
        site: Uuid,
        #[arg(long)]
        prefix: IpNet,
        /// Public or DatacenterOnly
        #[arg(long, default_value = "DatacenterOnly")]
        routing: RoutingType,
    },

    /// Create an allocation
    Create {
        #[arg(long)]
        provider: Uuid,
        #[arg(long)]
        tenant: Uuid,
        #[arg(long)]
        site: Uuid,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// instance-type:<id>:<count> or ip-block:<id>:<prefix length>
        #[arg(long = "constraint", required = true, value_parser = parse_constraint)]
        constraints: Vec<ConstraintRequest>,
    },

    /// Rename an allocation or change its description
    Rename {
        #[arg(long)]
        provider: Uuid,
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },

    /// Change one constraint's value
    Update {
        #[arg(long)]
        provider: Uuid,
        #[arg(long)]
        constraint: Uuid,
        #[arg(long)]
        value: i64,
    },

    /// Delete an allocation
    Delete {
        #[arg(long)]
        provider: Uuid,
        #[arg(long)]
        id: Uuid,
    },

    /// List allocations with their constraints
    List {
        #[arg(long)]
        tenant: Option<Uuid>,
        #[arg(long)]
        site: Option<Uuid>,
        #[arg(long)]
        name: Option<String>,
    },

    /// Show prefix usage of a parent IP Block
    Usage {
        #[arg(long)]
        ip_block: Uuid,
    },

    /// Show reservations against an Instance Type
    Capacity {
        #[arg(long)]
        instance_type: Uuid,
    },

    /// Replay queued orchestration workflows
    DrainOutbox,
}

/// Parse a constraint from `kind:id:value`
fn parse_constraint(s: &str) -> Result<ConstraintRequest, String> {
    let mut parts = s.splitn(3, ':');
    let (Some(kind), Some(id), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!(
            "Invalid constraint '{}'. Expected instance-type:<id>:<count> or ip-block:<id>:<length>",
            s
        ));
    };
    let resource_type = match kind.to_lowercase().as_str() {
        "instance-type" | "instancetype" => ResourceType::InstanceType,
        "ip-block" | "ipblock" => ResourceType::IpBlock,
        _ => {
            return Err(format!(
                "Invalid resource type '{}'. Valid options: instance-type, ip-block",
                kind
            ))
        }
    };
    let resource_type_id = id
        .parse::<Uuid>()
        .map_err(|e| format!("Invalid id '{}': {}", id, e))?;
    let constraint_value = value
        .parse::<i64>()
        .map_err(|e| format!("Invalid value '{}': {}", value, e))?;

    Ok(ConstraintRequest {
        resource_type,
        resource_type_id,
        constraint_type: ConstraintType::Reserved,
        constraint_value,
    })
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(db) = &args.db {
        config.database_path = db.clone();
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let engine = AllocationEngine::open(config)?;

    let mut ctx = RequestContext::new(args.actor);
    if let Some(ms) = args.timeout_ms {
        ctx = ctx.with_timeout(Duration::from_millis(ms));
    }

    match args.command {
        Command::Init => {
            info!(path = %engine.store().path().display(), "database initialized");
        }
        Command::SeedSite { name, provider } => print(&engine.add_site(&ctx, &name, provider)?)?,
        Command::SeedTenant { org, display_name } => {
            print(&engine.add_tenant(&ctx, &org, display_name.as_deref())?)?
        }
        Command::SeedInstanceType { name, provider, site } => {
            print(&engine.add_instance_type(&ctx, &name, provider, site)?)?
        }
        Command::SeedMachine {
            site,
            instance_type,
            count,
        } => {
            if count == 0 {
                bail!("count must be at least 1");
            }
            let ids = (0..count)
                .map(|_| engine.add_machine(&ctx, site, instance_type))
                .collect::<Result<Vec<_>, _>>()?;
            print(&ids)?
        }
        Command::SeedIpBlock {
            name,
            provider,
            site,
            prefix,
            routing,
        } => print(&engine.add_ip_block(
            &ctx,
            provider,
            &NewIpBlock {
                name,
                site_id: site,
                routing_type: routing,
                prefix,
            },
        )?)?,
        Command::Create {
            provider,
            tenant,
            site,
            name,
            description,
            constraints,
        } => {
            let req = CreateAllocationRequest {
                name,
                description,
                tenant_id: tenant,
                site_id: site,
                constraints,
            };
            print(&engine.create_allocation(&ctx, provider, &req)?)?
        }
        Command::Rename {
            provider,
            id,
            name,
            description,
        } => {
            let req = UpdateAllocationRequest {
                allocation_id: id,
                name,
                description,
            };
            print(&engine.update_allocation(&ctx, provider, &req)?)?
        }
        Command::Update {
            provider,
            constraint,
            value,
        } => {
            let req = UpdateConstraintRequest {
                constraint_id: constraint,
                constraint_value: value,
            };
            print(&engine.update_constraint(&ctx, provider, &req)?)?
        }
        Command::Delete { provider, id } => print(&engine.delete_allocation(&ctx, provider, id)?)?,
        Command::List { tenant, site, name } => {
            let filter = AllocationFilter {
                tenant_id: tenant,
                site_id: site,
                name,
            };
            print(&engine.list_allocations(&filter)?)?
        }
        Command::Usage { ip_block } => print(&engine.block_usage(ip_block)?)?,
        Command::Capacity { instance_type } => print(&engine.admission_snapshot(instance_type, 0)?)?,
        Command::DrainOutbox => print(&engine.drain_outbox()?)?,
    }

    Ok(())
}
