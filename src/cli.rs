//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::phases::Phase;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Declarative multi-node VM cluster provisioner for AWS.
///
/// Compiles a flat configuration into the cloud resources of one cluster,
/// reconciles them against what exists and bootstraps Talos Linux on the
/// instances, phase by phase.
#[derive(Parser, Debug)]
#[command(name = "kshape")]
#[command(about = "Declarative multi-node VM cluster provisioner for AWS")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    /// Path to the cluster configuration file
    #[arg(
        short,
        long,
        global = true,
        default_value = "kshape.yaml",
        env = "KSHAPE_CONFIG"
    )]
    pub config: PathBuf,

    /// Directory generated credentials are written to, one subdirectory per cluster
    #[arg(long, global = true, default_value = "_out", env = "KSHAPE_OUTPUT_DIR")]
    pub output_dir: PathBuf,

    /// Skip confirmation prompts
    #[arg(short, long, global = true, default_value = "false")]
    pub yes: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "KSHAPE_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[arg(long, global = true, default_value = "pretty", env = "KSHAPE_LOG_FORMAT")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run every phase from the first incomplete one
    Create,

    /// Converge every phase against the configuration, prompting before deletes
    Apply,

    /// Delete every resource labeled for the cluster
    Destroy,

    /// Show the phase marker and the cluster's resources
    Status,

    /// Run read-only health checks
    Diagnose,

    /// Report labeled resources no configuration accounts for
    #[command(after_help = r"Examples:
  kshape orphans              Orphans of the configured cluster
  kshape orphans --all        Orphans of every labeled cluster
  kshape orphans clean        Delete the configured cluster's orphans")]
    Orphans {
        /// Scan every labeled cluster instead of the configured one
        #[arg(long, default_value = "false")]
        all: bool,

        #[command(subcommand)]
        action: Option<OrphanAction>,
    },

    /// Phase 1: OS images, service accounts and state bucket
    Phase1,

    /// Phase 2: network, firewall rules, instances, load balancer and schedule
    Phase2,

    /// Phase 3: wait until every instance is running
    Phase3,

    /// Phase 4: bastion host
    Phase4,

    /// Phase 5: bootstrap Talos and register nodes
    Phase5,

    /// Start every cluster instance
    Start,

    /// Stop every cluster instance
    Stop,

    /// Reconcile only the start/stop schedule
    UpdateSchedule,

    /// Restore credentials from the state bucket
    GetCredentials,

    /// Grant bastion admin access to an email address
    GrantAdmin {
        #[arg(value_name = "EMAIL")]
        email: String,
    },

    /// List bastion admins
    ListAdmins,

    /// Revoke a bastion admin and delete the account
    BastionRemoveUser {
        #[arg(value_name = "USER")]
        user: String,
    },

    /// Delete and provision the bastion again
    RecreateBastion,

    /// Open an SSH session to the bastion
    #[command(after_help = r"Examples:
  kshape ssh-bastion
  kshape ssh-bastion -- -L 6443:10.0.16.10:6443 -N")]
    SshBastion {
        /// Extra arguments passed to ssh
        #[arg(last = true, value_name = "SSH_ARGS")]
        args: Vec<String>,
    },

    /// Check that the configured storage class exists
    VerifyStorage,

    /// Install or upgrade the Traefik ingress controller
    UpdateTraefik,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum OrphanAction {
    /// Delete the reported orphans
    Clean,
}

impl Command {
    /// Phase run by a `phaseN` command.
    pub const fn phase(&self) -> Option<Phase> {
        match self {
            Self::Phase1 => Some(Phase::Resources),
            Self::Phase2 => Some(Phase::Infrastructure),
            Self::Phase3 => Some(Phase::WaitReady),
            Self::Phase4 => Some(Phase::BastionSetup),
            Self::Phase5 => Some(Phase::BootstrapRegister),
            _ => None,
        }
    }

    /// Whether the command works from the compiled configuration. The
    /// others only read or delete what is labeled for the cluster, so they
    /// still run when the configuration is missing or no longer validates.
    pub const fn needs_desired(&self) -> bool {
        !matches!(
            self,
            Self::Destroy | Self::Status | Self::GetCredentials | Self::Orphans { all: true, .. }
        )
    }
}
