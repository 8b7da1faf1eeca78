use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod cmdline;
mod config;
mod daemon;
mod error;
mod libzfs;
mod machines;
mod zfs;

use cmdline::Cmdline;
use config::Config;
use daemon::{Envelope, Request, Zsys};
pub(crate) use error::ZsysError;
use libzfs::ZfsPool;
use libzfs::cli::CliPool;
use libzfs::mock::MockPool;
use machines::boot::{BootMenu, GrubMenu, NoopMenu};

/// Marker strings consumed by the init-time scripts.
const MODIFIED_BOOT: &str = "zsys-meta:modified-boot";
const NO_MODIFIED_BOOT: &str = "zsys-meta:no-modified-boot";

#[derive(Parser)]
#[command(version, about = "ZFS system state management")]
struct Cli {
    /// How to reach the machine graph
    #[arg(
        long = "backend",
        global = true,
        help_heading = "Global options",
        default_value = "socket"
    )]
    backend: Backend,

    /// Socket path (also via ZSYS_SOCKET)
    #[arg(long, global = true, help_heading = "Global options")]
    socket: Option<PathBuf>,

    /// Configuration file path
    #[arg(long, global = true, help_heading = "Global options")]
    config: Option<PathBuf>,

    /// Verbose output (repeat for more)
    #[arg(short = 'v', global = true, help_heading = "Global options", action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Backend selection.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Backend {
    /// Send the request to the zsysd daemon.
    #[value(name = "socket")]
    Socket,
    /// Drive the pools directly in-process.
    #[value(name = "local")]
    Local,
    /// Use an in-memory sample pool (for testing).
    #[value(name = "mock")]
    Mock,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect the machines on this host.
    Machine {
        #[command(subcommand)]
        command: MachineCommands,
    },
    /// Save the current system state, or one user's state.
    Save {
        /// A name for the saved state (generated when omitted).
        state_name: Option<String>,

        /// Save only this user's datasets.
        #[arg(short = 'u', long)]
        user: Option<String>,
    },
    /// Remove a saved state.
    Remove {
        /// The state to remove (dataset name, tag or suffix).
        state: String,

        /// Remove a state of this user instead of a system state.
        #[arg(short = 'u', long)]
        user: Option<String>,

        /// Remove even when dependent states exist.
        #[arg(long)]
        force: bool,

        /// Only show what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
    /// Boot-time integration, called from the initramfs and systemd units.
    Boot {
        #[command(subcommand)]
        command: BootCommands,
    },
    /// Manage user home datasets.
    Userdata {
        #[command(subcommand)]
        command: UserdataCommands,
    },
    /// Collect old states according to the retention policy.
    Gc {
        /// Also collect manually named states.
        #[arg(long)]
        all: bool,
    },
    /// Run the zsysd daemon.
    Daemon,
}

#[derive(Subcommand)]
enum MachineCommands {
    /// List every machine.
    List,
    /// Show one machine in detail.
    Show {
        /// Machine identifier (defaults to the current machine).
        machine: Option<String>,
    },
}

#[derive(Subcommand)]
enum BootCommands {
    /// Make the dataset layout match the boot choice.
    Prepare,
    /// Confirm a successful boot.
    Commit,
}

#[derive(Subcommand)]
enum UserdataCommands {
    /// Create (or re-point) a user's home dataset.
    Create { user: String, home: String },
    /// Move a home dataset to a new path.
    SetHome { home: String, new_home: String },
    /// Detach a user from the current system state.
    Dissociate {
        user: String,

        /// Destroy homes left without any association.
        #[arg(long)]
        remove_home: bool,
    },
}

fn to_request(command: &Commands) -> Option<Request> {
    match command {
        Commands::Machine { command } => Some(match command {
            MachineCommands::List => Request::MachineList,
            MachineCommands::Show { machine } => Request::MachineShow {
                machine: machine.clone(),
            },
        }),
        Commands::Save { state_name, user } => Some(match user {
            Some(user) => Request::SaveUserState {
                user: user.clone(),
                state_name: state_name.clone(),
            },
            None => Request::SaveSystemState {
                state_name: state_name.clone(),
            },
        }),
        Commands::Remove {
            state,
            user,
            force,
            dry_run,
        } => Some(Request::RemoveState {
            state: state.clone(),
            user: user.clone(),
            force: *force,
            dry_run: *dry_run,
        }),
        Commands::Boot { command } => Some(match command {
            BootCommands::Prepare => Request::EnsureBoot,
            BootCommands::Commit => Request::CommitBoot,
        }),
        Commands::Userdata { command } => Some(match command {
            UserdataCommands::Create { user, home } => Request::CreateUserData {
                user: user.clone(),
                home: home.clone(),
            },
            UserdataCommands::SetHome { home, new_home } => Request::ChangeHomeOnUserData {
                home: home.clone(),
                new_home: new_home.clone(),
            },
            UserdataCommands::Dissociate { user, remove_home } => Request::DissociateUser {
                user: user.clone(),
                remove_home: *remove_home,
            },
        }),
        Commands::Gc { all } => Some(Request::GarbageCollect { all: *all }),
        Commands::Daemon => None,
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    // Logs in journald don't need colours.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(tracing_subscriber::fmt::format().with_ansi(false).compact())
        .try_init();
}

/// Build an in-process service for the local and mock backends.
fn local_service(backend: Backend, config: Config) -> Result<Zsys> {
    let (pool, cmdline, menu): (Box<dyn ZfsPool>, Cmdline, Box<dyn BootMenu>) = match backend {
        Backend::Mock => (
            Box::new(MockPool::sampled()),
            Cmdline::parse("root=ZFS=rpool/ROOT/ubuntu_e2wti1"),
            Box::new(NoopMenu),
        ),
        _ => (
            Box::new(CliPool::new()),
            Cmdline::from_proc("/proc/cmdline").context("cannot read /proc/cmdline")?,
            Box::new(GrubMenu),
        ),
    };
    Ok(Zsys::new(pool, config, cmdline, menu)?)
}

fn format_timestamp(timestamp: i64) -> String {
    if timestamp == 0 {
        return "never".to_string();
    }
    match Local.timestamp_opt(timestamp, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
        _ => format!("{}", timestamp),
    }
}

/// The machine table: dynamic name column, fixed short columns.
fn print_machine_list(result: &serde_json::Value, mut writer: impl std::io::Write) -> Result<()> {
    let machines = result["machines"].as_array().cloned().unwrap_or_default();

    let mut name_width = 4;
    for machine in &machines {
        name_width = name_width.max(machine["id"].as_str().unwrap_or("").len());
    }
    writeln!(
        writer,
        "{:<name_width$}  {:<4}  {:<7}  {:<16}  {}",
        "NAME",
        "ZSYS",
        "HISTORY",
        "LAST USED",
        "USERS",
        name_width = name_width
    )?;
    for machine in &machines {
        let users = machine["users"]
            .as_array()
            .map(|users| {
                users
                    .iter()
                    .filter_map(|u| u.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        writeln!(
            writer,
            "{:<name_width$}  {:<4}  {:<7}  {:<16}  {}",
            machine["id"].as_str().unwrap_or("-"),
            if machine["zsys"].as_bool().unwrap_or(false) {
                "yes"
            } else {
                "no"
            },
            machine["history"].as_u64().unwrap_or(0),
            format_timestamp(machine["last_used"].as_i64().unwrap_or(0)),
            users,
            name_width = name_width
        )?;
    }
    let unmanaged = result["unmanaged"].as_array().cloned().unwrap_or_default();
    if !unmanaged.is_empty() {
        writeln!(writer)?;
        writeln!(writer, "Unmanaged datasets:")?;
        for dataset in unmanaged {
            writeln!(writer, "  {}", dataset.as_str().unwrap_or("-"))?;
        }
    }
    Ok(())
}

fn render(command: &Commands, result: &serde_json::Value) -> Result<()> {
    match command {
        Commands::Machine { command } => match command {
            MachineCommands::List => print_machine_list(result, std::io::stdout())?,
            MachineCommands::Show { .. } => {
                println!("{}", serde_json::to_string_pretty(result)?);
            }
        },
        Commands::Save { user, .. } => {
            let state = result["state"].as_str().unwrap_or("?");
            match user {
                Some(user) => println!("Saved state '{state}' for user '{user}'."),
                None => println!("Saved system state '{state}'."),
            }
        }
        Commands::Remove { dry_run, .. } => {
            for line in result["plan"].as_array().cloned().unwrap_or_default() {
                println!("{}", line.as_str().unwrap_or(""));
            }
            if *dry_run {
                println!("Dry run: nothing was changed.");
            }
        }
        Commands::Boot { .. } => {
            // The init scripts watch stdout for these markers.
            if result["changed"].as_bool().unwrap_or(false) {
                println!("{MODIFIED_BOOT}");
            } else {
                println!("{NO_MODIFIED_BOOT}");
            }
        }
        Commands::Userdata { command } => match command {
            UserdataCommands::Create { user, home } => {
                println!("Home of '{user}' is now '{home}'.");
            }
            UserdataCommands::SetHome { new_home, .. } => {
                println!("Home moved to '{new_home}'.");
            }
            UserdataCommands::Dissociate { user, .. } => {
                println!("User '{user}' detached from the current state.");
            }
        },
        Commands::Gc { .. } => {
            let removed = result["removed"].as_array().cloned().unwrap_or_default();
            for dataset in &removed {
                println!("removed {}", dataset.as_str().unwrap_or(""));
            }
            println!("Collected {} state(s).", removed.len());
        }
        Commands::Daemon => {}
    }
    Ok(())
}

fn execute(cli: &Cli) -> Result<()> {
    let config = Config::load(
        cli.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIG_PATH)),
    )?;

    let Some(request) = to_request(&cli.command) else {
        // The daemon subcommand runs the server loop instead.
        init_logging(cli.verbose.max(1));
        let service = local_service(cli.backend, config)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("cannot start the async runtime")?;
        return runtime.block_on(daemon::serve(service, cli.socket.clone()));
    };

    let result = match cli.backend {
        Backend::Socket => {
            let socket = cli.socket.clone().unwrap_or_else(|| config.socket_path());
            daemon::request(
                &socket,
                &Envelope {
                    verbosity: cli.verbose,
                    request,
                },
            )?
        }
        Backend::Local | Backend::Mock => {
            init_logging(cli.verbose);
            let mut service = local_service(cli.backend, config)?;
            service.handle(&request)?
        }
    };
    render(&cli.command, &result)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(err) = execute(&cli) {
        // Dependency lists deserve a proper prompt, not a debug dump.
        if let Some(ZsysError::NeedsConfirmation {
            summary,
            dependencies,
        }) = err.downcast_ref::<ZsysError>()
        {
            eprintln!("{summary}:");
            for dependency in dependencies {
                eprintln!("  {dependency}");
            }
            eprintln!("Re-run with --force to proceed.");
            std::process::exit(1);
        }
        return Err(err);
    }
    Ok(())
}
