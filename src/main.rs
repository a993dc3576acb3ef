use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcppool::{BackendRegistry, Config, Error, MacAddr, PoolConfig, Result};

#[derive(Parser)]
#[command(name = "dhcppool")]
#[command(author, version, about = "Inspect and operate DHCP address pools", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "dhcppool.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration.
    ShowConfig,
    /// Capacity and free addresses of every pool.
    Status,
    /// Claim a free address for a MAC.
    Allocate { pool: String, mac: String },
    /// Bind a specific slot (index or address) to a MAC.
    Reserve {
        pool: String,
        slot: String,
        mac: String,
    },
    /// Release a slot (index or address).
    Free { pool: String, slot: String },
    /// Show what a slot (index or address) is bound to.
    Lookup { pool: String, slot: String },
    /// List every binding of a pool.
    List { pool: String },
    /// Compare a pool against the MACs known to be in use.
    Reconcile { pool: String, macs: Vec<String> },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    let command = match cli.command {
        Some(command) => command,
        None => Commands::Status,
    };

    if let Commands::ShowConfig = command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    info!("Loading pools from {:?}", cli.config);
    let pools = config.build_pools(&BackendRegistry::default())?;

    match command {
        Commands::ShowConfig => Ok(()),
        Commands::Status => {
            println!(
                "{:<16} {:<10} {:<16} {:<16} {:>8} {:>8}",
                "Pool", "Backend", "First", "Last", "Size", "Free"
            );
            println!("{}", "-".repeat(79));

            for pool_config in &config.pools {
                let pool = pools.get(&pool_config.name)?;
                println!(
                    "{:<16} {:<10} {:<16} {:<16} {:>8} {:>8}",
                    pool_config.name,
                    pool_config.backend,
                    pool_config.pool_start,
                    pool_config.pool_end,
                    pool.capacity(),
                    pool.remaining()?
                );
            }
            Ok(())
        }
        Commands::Allocate { pool, mac } => {
            let pool_config = pool_config(&config, &pool)?;
            let binding = pools.get(&pool)?.allocate(mac.parse()?)?;
            println!(
                "{} -> {} (slot {})",
                binding.mac,
                display_address(pool_config, binding.index),
                binding.index
            );
            Ok(())
        }
        Commands::Reserve { pool, slot, mac } => {
            let pool_config = pool_config(&config, &pool)?;
            let index = resolve_slot(pool_config, &slot)?;
            let mac = pools.get(&pool)?.reserve(index, mac.parse()?)?;
            println!(
                "{} -> {} (slot {})",
                mac,
                display_address(pool_config, index),
                index
            );
            Ok(())
        }
        Commands::Free { pool, slot } => {
            let pool_config = pool_config(&config, &pool)?;
            let index = resolve_slot(pool_config, &slot)?;
            pools.get(&pool)?.free(index)?;
            println!(
                "Released {} (slot {})",
                display_address(pool_config, index),
                index
            );
            Ok(())
        }
        Commands::Lookup { pool, slot } => {
            let pool_config = pool_config(&config, &pool)?;
            let index = resolve_slot(pool_config, &slot)?;
            let mac = pools.get(&pool)?.lookup(index)?;
            if mac.is_unbound() {
                println!("{} (slot {}) is free", display_address(pool_config, index), index);
            } else {
                println!(
                    "{} (slot {}) is bound to {}",
                    display_address(pool_config, index),
                    index,
                    mac
                );
            }
            Ok(())
        }
        Commands::List { pool } => {
            let pool_config = pool_config(&config, &pool)?;
            let bindings = pools.get(&pool)?.bindings()?;

            if bindings.is_empty() {
                println!("No reserved addresses.");
                return Ok(());
            }

            println!("{:<8} {:<16} {:<18}", "Slot", "IP Address", "MAC Address");
            println!("{}", "-".repeat(44));
            for binding in bindings {
                println!(
                    "{:<8} {:<16} {:<18}",
                    binding.index,
                    display_address(pool_config, binding.index),
                    binding.mac
                );
            }
            Ok(())
        }
        Commands::Reconcile { pool, macs } => {
            let known = macs
                .iter()
                .map(|mac| mac.parse())
                .collect::<Result<HashSet<MacAddr>>>()?;
            let report = pools.get(&pool)?.reconcile(&known)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn pool_config<'a>(config: &'a Config, name: &str) -> Result<&'a PoolConfig> {
    config
        .pool(name)
        .ok_or_else(|| Error::UnknownPool(name.to_string()))
}

fn resolve_slot(pool_config: &PoolConfig, slot: &str) -> Result<u32> {
    if let Ok(ip) = slot.parse::<Ipv4Addr>() {
        return pool_config.index_of(ip).ok_or_else(|| {
            Error::InvalidConfig(format!("{} is outside pool {}", ip, pool_config.name))
        });
    }
    slot.parse()
        .map_err(|_| Error::InvalidConfig(format!("{} is neither an address nor an index", slot)))
}

fn display_address(pool_config: &PoolConfig, index: u32) -> String {
    pool_config
        .address_of(index)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "-".to_string())
}
