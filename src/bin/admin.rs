//! Administrative CLI over the cluster metadata

use clap::{Args, Parser, Subcommand};
use ringkv::common::{format_timestamp_millis, split_flags, Config, PartitionServerAddress};
use ringkv::coordinator::{
    remote_deleter, Coordinator, EqualSizePartitionAssigner, Host, HostCommand,
    RemoteDomainVersionDeleter,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ringkv-admin")]
#[command(about = "ringkv cluster administration")]
#[command(version)]
struct Cli {
    /// Configuration file stem (ringkv.toml is read when present)
    #[arg(long, default_value = "ringkv")]
    config: String,

    /// Coordination store directory (overrides store.path)
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage domains and domain versions
    #[command(subcommand)]
    Domain(DomainCommand),

    /// Manage domain groups
    #[command(subcommand)]
    DomainGroup(DomainGroupCommand),

    /// Manage ring groups and rollouts
    #[command(subcommand)]
    RingGroup(RingGroupCommand),

    /// Manage rings
    #[command(subcommand)]
    Ring(RingCommand),

    /// Manage hosts
    #[command(subcommand)]
    Host(HostCommandArgs),
}

#[derive(Args)]
struct DomainDefinition {
    /// Number of partitions
    #[arg(long)]
    partitions: u32,

    /// Storage engine factory
    #[arg(long, default_value = "")]
    engine: String,

    /// Storage engine options
    #[arg(long, default_value = "")]
    engine_options: String,

    /// Partitioner
    #[arg(long, default_value = "")]
    partitioner: String,

    /// Comma-separated host flags required to serve the domain
    #[arg(long, default_value = "")]
    required_flags: String,
}

#[derive(Args)]
struct RemoteArtifacts {
    /// The domain's engine keeps nothing outside the coordination store.
    /// Without it, versions are not deleted since their remote artifacts
    /// cannot be reclaimed.
    #[arg(long)]
    no_remote_artifacts: bool,
}

impl RemoteArtifacts {
    fn deleter(&self) -> &'static dyn RemoteDomainVersionDeleter {
        remote_deleter(self.no_remote_artifacts)
    }
}

#[derive(Subcommand)]
enum DomainCommand {
    /// Create a domain
    Add {
        name: String,
        #[command(flatten)]
        definition: DomainDefinition,
    },
    /// Replace a domain's definition
    Update {
        name: String,
        #[command(flatten)]
        definition: DomainDefinition,
    },
    /// Delete a domain no ring group uses
    Delete { name: String },
    /// List domains
    List,
    /// Show a domain and its versions
    Show { name: String },
    /// Open a new version
    OpenVersion { name: String },
    /// Close a version
    CloseVersion { name: String, version: u32 },
    /// Mark a version defunct
    Defunct {
        name: String,
        version: u32,
        /// Clear the mark instead
        #[arg(long)]
        undo: bool,
    },
    /// Delete a version no ring group references
    DeleteVersion {
        name: String,
        version: u32,
        #[command(flatten)]
        artifacts: RemoteArtifacts,
    },
    /// Reclaim a version's remote artifacts and mark it defunct
    Cleanup {
        name: String,
        version: u32,
        #[command(flatten)]
        artifacts: RemoteArtifacts,
    },
    /// Delete every defunct version
    DeleteDefunct {
        name: String,
        #[command(flatten)]
        artifacts: RemoteArtifacts,
    },
    /// Delete defunct versions of every domain
    CleanAll {
        #[command(flatten)]
        artifacts: RemoteArtifacts,
    },
}

#[derive(Subcommand)]
enum DomainGroupCommand {
    /// Create a domain group
    Add { name: String },
    /// Add a version from domain=version pairs
    AddVersion {
        name: String,
        #[arg(value_parser = parse_domain_version)]
        versions: Vec<(String, u32)>,
    },
    /// List domain groups
    List,
    /// Show a domain group and its versions
    Show { name: String },
}

#[derive(Subcommand)]
enum RingGroupCommand {
    /// Create a ring group
    Add {
        name: String,
        #[arg(long)]
        domain_group: String,
    },
    /// Delete a ring group
    Delete { name: String },
    /// List ring groups
    List,
    /// Show rings and rollout state
    Show { name: String },
    /// Start rolling out a domain group version
    SetUpdating { name: String, version: u32 },
    /// Mark the rollout in flight complete
    UpdateComplete { name: String },
    /// Print rollout state on every change
    Watch { name: String },
}

#[derive(Subcommand)]
enum RingCommand {
    /// Add a ring
    Add { ring_group: String, number: u32 },
    /// Remove a ring and its hosts
    Remove { ring_group: String, number: u32 },
    /// List hosts with their state
    Hosts { ring_group: String, number: u32 },
    /// Reassign partitions over the ring's hosts
    Redistribute { ring_group: String, number: u32 },
    /// Enqueue a command on every host of the ring
    CommandAll {
        ring_group: String,
        number: u32,
        #[arg(value_parser = parse_command)]
        command: HostCommand,
    },
}

#[derive(Subcommand)]
enum HostCommandArgs {
    /// Register a host
    Add {
        ring_group: String,
        ring: u32,
        address: PartitionServerAddress,
        /// Comma-separated flags
        #[arg(long, default_value = "")]
        flags: String,
    },
    /// Remove a host
    Remove {
        ring_group: String,
        ring: u32,
        address: PartitionServerAddress,
    },
    /// Show a host
    Show {
        ring_group: String,
        ring: u32,
        address: PartitionServerAddress,
    },
    /// Enqueue a command on one host
    Enqueue {
        ring_group: String,
        ring: u32,
        address: PartitionServerAddress,
        #[arg(value_parser = parse_command)]
        command: HostCommand,
    },
    /// Drop every pending command
    ClearQueue {
        ring_group: String,
        ring: u32,
        address: PartitionServerAddress,
    },
}

fn parse_domain_version(s: &str) -> Result<(String, u32), String> {
    let (domain, version) = s
        .split_once('=')
        .ok_or_else(|| format!("expected domain=version, got {}", s))?;
    let version = version
        .parse()
        .map_err(|_| format!("invalid version in {}", s))?;
    Ok((domain.to_string(), version))
}

fn parse_command(s: &str) -> Result<HostCommand, String> {
    s.to_ascii_uppercase().parse().map_err(|e: ringkv::Error| e.to_string())
}

fn print_json(value: serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn find_host(
    coord: &Coordinator,
    ring_group: &str,
    ring: u32,
    address: &PartitionServerAddress,
) -> anyhow::Result<Host> {
    coord
        .ring_group(ring_group)?
        .ring(ring)?
        .host(address)?
        .ok_or_else(|| anyhow::anyhow!("host {} not found in ring {} of {}", address, ring, ring_group))
}

fn host_json(host: &Host) -> anyhow::Result<serde_json::Value> {
    let commands: Vec<String> = host
        .command_queue()?
        .iter()
        .map(|c| c.to_string())
        .collect();
    Ok(json!({
        "address": host.address().to_string(),
        "state": host.state()?.to_string(),
        "up_since": host.up_since()?.map(format_timestamp_millis),
        "flags": host.flags()?,
        "partitions": host.assigned_partitions()?,
        "current_command": host.current_command()?.map(|c| c.to_string()),
        "command_queue": commands,
        "statistics": host.statistics()?,
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_from(&cli.config)?;
    if let Some(db) = cli.db {
        config.store.path = Some(db);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let coord = Coordinator::from_config(&config)?;

    match cli.command {
        Commands::Domain(command) => run_domain(&coord, command)?,
        Commands::DomainGroup(command) => run_domain_group(&coord, command)?,
        Commands::RingGroup(command) => run_ring_group(&coord, command).await?,
        Commands::Ring(command) => run_ring(&coord, command)?,
        Commands::Host(command) => run_host(&coord, command)?,
    }

    coord.store().flush()?;
    Ok(())
}

fn run_domain(coord: &Coordinator, command: DomainCommand) -> anyhow::Result<()> {
    match command {
        DomainCommand::Add { name, definition } => {
            let domain = coord.add_domain(
                &name,
                definition.partitions,
                &definition.engine,
                &definition.engine_options,
                &definition.partitioner,
                &split_flags(&definition.required_flags),
            )?;
            println!("Added domain {} (id {})", domain.name(), domain.id());
        }
        DomainCommand::Update { name, definition } => {
            coord.update_domain(
                &name,
                definition.partitions,
                &definition.engine,
                &definition.engine_options,
                &definition.partitioner,
                &split_flags(&definition.required_flags),
            )?;
            println!("Updated domain {}", name);
        }
        DomainCommand::Delete { name } => {
            if coord.delete_domain(&name)? {
                println!("Deleted domain {}", name);
            } else {
                println!("Domain {} does not exist", name);
            }
        }
        DomainCommand::List => {
            let domains: Vec<_> = coord
                .domains()?
                .iter()
                .map(|d| json!({ "name": d.name(), "id": d.id(), "partitions": d.num_partitions() }))
                .collect();
            print_json(json!(domains))?;
        }
        DomainCommand::Show { name } => {
            let domain = coord.domain(&name)?;
            let mut versions = Vec::new();
            for version in domain.versions()? {
                let metadata = version.metadata()?;
                versions.push(json!({
                    "number": version.number(),
                    "created_at": format_timestamp_millis(metadata.created_at),
                    "closed_at": metadata.closed_at.map(format_timestamp_millis),
                    "defunct": metadata.defunct,
                }));
            }
            print_json(json!({
                "definition": domain.metadata(),
                "in_use": coord.is_domain_in_use(&name)?,
                "versions": versions,
            }))?;
        }
        DomainCommand::OpenVersion { name } => {
            let version = coord.domain(&name)?.open_new_version()?;
            println!("Opened version {} of {}", version.number(), name);
        }
        DomainCommand::CloseVersion { name, version } => {
            coord.close_domain_version(&name, version)?;
            println!("Closed version {} of {}", version, name);
        }
        DomainCommand::Defunct {
            name,
            version,
            undo,
        } => {
            coord.set_domain_version_defunct(&name, version, !undo)?;
            println!("Version {} of {} defunct={}", version, name, !undo);
        }
        DomainCommand::DeleteVersion {
            name,
            version,
            artifacts,
        } => {
            coord.delete_domain_version(&name, version, artifacts.deleter())?;
            println!("Deleted version {} of {}", version, name);
        }
        DomainCommand::Cleanup {
            name,
            version,
            artifacts,
        } => {
            coord.cleanup_domain_version(&name, version, artifacts.deleter())?;
            println!("Cleaned up version {} of {}", version, name);
        }
        DomainCommand::DeleteDefunct { name, artifacts } => {
            let deleted = coord.delete_defunct_domain_versions(&name, artifacts.deleter())?;
            println!("Deleted versions {:?} of {}", deleted, name);
        }
        DomainCommand::CleanAll { artifacts } => {
            let cleaned = coord.clean_domains(artifacts.deleter())?;
            print_json(json!(cleaned))?;
        }
    }
    Ok(())
}

fn run_domain_group(coord: &Coordinator, command: DomainGroupCommand) -> anyhow::Result<()> {
    match command {
        DomainGroupCommand::Add { name } => {
            coord.add_domain_group(&name)?;
            println!("Added domain group {}", name);
        }
        DomainGroupCommand::AddVersion { name, versions } => {
            let versions: BTreeMap<String, u32> = versions.into_iter().collect();
            let version = coord.add_domain_group_version(&name, versions)?;
            println!("Added version {} of domain group {}", version.number, name);
        }
        DomainGroupCommand::List => {
            let names: Vec<String> = coord
                .domain_groups()?
                .iter()
                .map(|g| g.name().to_string())
                .collect();
            print_json(json!(names))?;
        }
        DomainGroupCommand::Show { name } => {
            let group = coord.domain_group(&name)?;
            print_json(json!({ "name": name, "versions": group.versions()? }))?;
        }
    }
    Ok(())
}

async fn run_ring_group(coord: &Coordinator, command: RingGroupCommand) -> anyhow::Result<()> {
    match command {
        RingGroupCommand::Add { name, domain_group } => {
            coord.add_ring_group(&name, &domain_group)?;
            println!("Added ring group {}", name);
        }
        RingGroupCommand::Delete { name } => {
            if coord.delete_ring_group(&name)? {
                println!("Deleted ring group {}", name);
            } else {
                println!("Ring group {} does not exist", name);
            }
        }
        RingGroupCommand::List => {
            let names: Vec<String> = coord
                .ring_groups()?
                .iter()
                .map(|g| g.name().to_string())
                .collect();
            print_json(json!(names))?;
        }
        RingGroupCommand::Show { name } => {
            let ring_group = coord.ring_group(&name)?;
            let mut rings = Vec::new();
            for ring in ring_group.rings()? {
                let hosts: Vec<String> = ring.hosts()?.iter().map(|h| h.address().to_string()).collect();
                rings.push(json!({ "number": ring.number(), "hosts": hosts }));
            }
            print_json(json!({
                "name": name,
                "domain_group": ring_group.domain_group_name(),
                "versions": ring_group.version_pointers()?,
                "is_updating": ring_group.is_updating()?,
                "data_deployer": ring_group.has_data_deployer(),
                "rings": rings,
            }))?;
        }
        RingGroupCommand::SetUpdating { name, version } => {
            coord.ring_group(&name)?.set_updating_to_version(version)?;
            println!("Ring group {} updating to version {}", name, version);
        }
        RingGroupCommand::UpdateComplete { name } => {
            let ring_group = coord.ring_group(&name)?;
            ring_group.update_complete()?;
            println!(
                "Ring group {} serves version {:?}",
                name,
                ring_group.current_version()?
            );
        }
        RingGroupCommand::Watch { name } => {
            let mut subscription = coord.ring_group(&name)?.subscribe();
            print_json(json!(subscription.current()?))?;
            loop {
                let pointers = subscription.next().await?;
                print_json(json!(pointers))?;
            }
        }
    }
    Ok(())
}

fn run_ring(coord: &Coordinator, command: RingCommand) -> anyhow::Result<()> {
    match command {
        RingCommand::Add { ring_group, number } => {
            coord.ring_group(&ring_group)?.add_ring(number)?;
            println!("Added ring {} to {}", number, ring_group);
        }
        RingCommand::Remove { ring_group, number } => {
            coord.ring_group(&ring_group)?.remove_ring(number)?;
            println!("Removed ring {} from {}", number, ring_group);
        }
        RingCommand::Hosts { ring_group, number } => {
            let ring = coord.ring_group(&ring_group)?.ring(number)?;
            let mut hosts = Vec::new();
            for host in ring.hosts()? {
                hosts.push(host_json(&host)?);
            }
            print_json(json!(hosts))?;
        }
        RingCommand::Redistribute { ring_group, number } => {
            coord.redistribute_partitions(&ring_group, number, &EqualSizePartitionAssigner)?;
            println!("Redistributed partitions of ring {} in {}", number, ring_group);
        }
        RingCommand::CommandAll {
            ring_group,
            number,
            command,
        } => {
            let count = coord.command_all(&ring_group, number, command)?;
            println!("Sent {} to {} hosts", command, count);
        }
    }
    Ok(())
}

fn run_host(coord: &Coordinator, command: HostCommandArgs) -> anyhow::Result<()> {
    match command {
        HostCommandArgs::Add {
            ring_group,
            ring,
            address,
            flags,
        } => {
            coord.add_host(&ring_group, ring, &address, &split_flags(&flags))?;
            println!("Added host {}", address);
        }
        HostCommandArgs::Remove {
            ring_group,
            ring,
            address,
        } => {
            if coord.remove_host(&ring_group, ring, &address)? {
                println!("Removed host {}", address);
            } else {
                println!("Host {} does not exist", address);
            }
        }
        HostCommandArgs::Show {
            ring_group,
            ring,
            address,
        } => {
            let host = find_host(coord, &ring_group, ring, &address)?;
            print_json(host_json(&host)?)?;
        }
        HostCommandArgs::Enqueue {
            ring_group,
            ring,
            address,
            command,
        } => {
            find_host(coord, &ring_group, ring, &address)?.enqueue_command(command)?;
            println!("Enqueued {} on {}", command, address);
        }
        HostCommandArgs::ClearQueue {
            ring_group,
            ring,
            address,
        } => {
            find_host(coord, &ring_group, ring, &address)?.clear_command_queue()?;
            println!("Cleared command queue of {}", address);
        }
    }
    Ok(())
}
