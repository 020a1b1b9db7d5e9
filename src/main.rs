//! kshape - declarative multi-node VM cluster provisioner for AWS.
//!
//! Compiles a flat configuration into the resources of one cluster,
//! reconciles them phase by phase against what exists in the account and
//! bootstraps Talos Linux on the instances.

mod addons;
mod aws;
mod bastion;
mod bootstrap;
mod cli;
mod command;
mod compiler;
mod config;
mod credentials;
mod diagnose;
mod error;
mod k8s;
mod logging;
mod model;
mod notify;
mod orchestrator;
mod orphans;
mod output;
mod phases;
mod power;
mod provider;
mod reader;
mod reconcile;
mod retry;
mod status;
#[cfg(test)]
mod testing;

use std::collections::HashMap;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use dialoguer::{Confirm, theme::ColorfulTheme};
use tracing::{debug, error, info, warn};

use aws::AwsProvider;
use bootstrap::talos::TalosBootstrapper;
use cli::{Args, Command, OrphanAction};
use command::SystemRunner;
use config::Config;
use diagnose::CheckStatus;
use orchestrator::{Orchestrator, RunMode};
use orphans::OrphanGroup;
use phases::PhaseContext;
use provider::CloudProvider;
use reconcile::{Approval, ReconcileAction, ReconcileOptions};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logging::init(&args.log_format, &args.log_level);

    debug!(
        version = cli::VERSION,
        commit = cli::COMMIT,
        build_date = cli::BUILD_DATE,
        "Starting kshape"
    );

    match run(&args).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}

/// Run one command. `Ok(false)` means it finished but left something out of
/// sync.
async fn run(args: &Args) -> Result<bool> {
    let env: HashMap<String, String> = std::env::vars()
        .filter(|(k, _)| k.starts_with(config::ENV_PREFIX))
        .collect();
    let path = args.config.is_file().then_some(args.config.as_path());
    if path.is_none() {
        warn!(
            path = %args.config.display(),
            "Config file not found, using defaults and environment"
        );
    }
    let cfg = Config::load(path, &env)?;
    cfg.display();

    let aws = AwsProvider::new(&cfg).await;

    // The project-wide sweep needs no cluster of its own.
    if let Command::Orphans { all: true, action } = &args.command {
        let groups = orphans::detect_all(&aws, &orphans::known_clusters(&cfg)).await?;
        let options = ReconcileOptions::from_config(&cfg);
        return handle_orphans(&aws, groups, options, action.as_ref(), args.yes).await;
    }

    let bootstrapper = TalosBootstrapper::from_config(&cfg);

    // `create` only ever moves forward; every other command asks before
    // deleting unless --yes is given.
    let approval = if args.yes || args.command == Command::Create {
        Approval::Granted
    } else {
        Approval::Ask(&confirm_deletes)
    };
    let ctx = if args.command.needs_desired() {
        PhaseContext::new(&cfg, &aws, &aws, &bootstrapper, &args.output_dir)?
    } else {
        PhaseContext::without_desired(&cfg, &aws, &aws, &bootstrapper, &args.output_dir)?
    }
    .with_approval(approval);
    let orchestrator = Orchestrator::new(ctx);
    let ctx = orchestrator.context();

    match &args.command {
        Command::Create => run_phases(&orchestrator, RunMode::Resume).await,
        Command::Apply => run_phases(&orchestrator, RunMode::All).await,
        Command::Phase1
        | Command::Phase2
        | Command::Phase3
        | Command::Phase4
        | Command::Phase5 => {
            let phase = args
                .command
                .phase()
                .context("phase command without a phase")?;
            run_phases(&orchestrator, RunMode::Single(phase)).await
        }
        Command::Destroy => {
            let report = orchestrator.destroy().await?;
            output::print_report("Destroy", &report);
            Ok(report.is_converged())
        }
        Command::Status => {
            let marker = orchestrator.marker().await?;
            let snapshot = reader::read(ctx.provider, ctx.cluster(), &[]).await?;
            output::print_status(ctx.cluster(), &marker, &snapshot);
            Ok(true)
        }
        Command::Diagnose => {
            let checks = diagnose::run(ctx).await;
            output::print_checks(&checks);
            Ok(!checks.iter().any(|c| c.status == CheckStatus::Fail))
        }
        Command::Orphans { action, .. } => {
            let group =
                orphans::detect(ctx.provider, ctx.cluster(), Some(ctx.desired.as_slice())).await?;
            handle_orphans(
                ctx.provider,
                vec![group],
                ctx.options.clone(),
                action.as_ref(),
                args.yes,
            )
            .await
        }
        Command::Start => {
            let report = power::set_running(ctx, true).await?;
            output::print_power("started", &report);
            Ok(report.failed.is_empty())
        }
        Command::Stop => {
            let report = power::set_running(ctx, false).await?;
            output::print_power("stopped", &report);
            Ok(report.failed.is_empty())
        }
        Command::UpdateSchedule => {
            let report = power::update_schedule(ctx).await?;
            output::print_report("Schedule", &report);
            Ok(report.is_converged())
        }
        Command::GetCredentials => {
            let bucket = ctx.naming.state_bucket();
            let written = credentials::restore(ctx.store, &bucket, &ctx.credentials, true).await?;
            if written.is_empty() {
                warn!(bucket = %bucket, "No credentials found in the state bucket");
                return Ok(false);
            }
            for path in &written {
                println!("{} {}", "✓".green(), path.display());
            }
            Ok(true)
        }
        Command::GrantAdmin { email } => {
            let grant = bastion::grant_admin(ctx.provider, &ctx.naming, email).await?;
            println!(
                "{} Granted bastion admin {} ({})",
                "✓".green(),
                grant.user.bold(),
                grant.email
            );
            Ok(true)
        }
        Command::ListAdmins => {
            let admins = bastion::list_admins(ctx.provider, &ctx.naming).await?;
            output::print_admins(&admins);
            Ok(true)
        }
        Command::BastionRemoveUser { user } => {
            if !confirm(args.yes, &format!("Remove bastion user '{user}'?"))? {
                info!(user = %user, "Removal cancelled");
                return Ok(true);
            }
            bastion::remove_user(ctx.provider, &SystemRunner, ctx.cfg, &ctx.naming, user).await?;
            println!("{} Removed bastion user {}", "✓".green(), user.bold());
            Ok(true)
        }
        Command::RecreateBastion => {
            if !confirm(args.yes, "Delete and provision the bastion again?")? {
                info!("Bastion recreation cancelled");
                return Ok(true);
            }
            let report = bastion::recreate(ctx).await?;
            output::print_report("Recreate bastion", &report);
            Ok(report.is_converged())
        }
        Command::SshBastion { args: extra } => {
            let address = bastion::address(ctx.provider, &ctx.naming).await?;
            let argv = bastion::ssh_args(ctx.cfg, &address, extra);
            debug!(args = ?argv, "Executing ssh");
            let status = tokio::process::Command::new("ssh")
                .args(&argv)
                .status()
                .await
                .context("failed to execute ssh")?;
            Ok(status.success())
        }
        Command::VerifyStorage => {
            let kubeconfig = ctx.credentials.path(credentials::KUBECONFIG);
            let check = addons::verify_storage(ctx.cfg, &kubeconfig).await?;
            if check.is_default {
                println!(
                    "{} Storage class {} exists and is the default",
                    "✓".green(),
                    check.class.bold()
                );
            } else {
                println!(
                    "{} Storage class {} exists but is not the default (default: {})",
                    "⚠".yellow(),
                    check.class.bold(),
                    check.default_class.as_deref().unwrap_or("none")
                );
            }
            Ok(true)
        }
        Command::UpdateTraefik => {
            let kubeconfig = ctx.credentials.path(credentials::KUBECONFIG);
            addons::update_traefik(&SystemRunner, ctx.cfg, &kubeconfig).await?;
            println!(
                "{} Traefik {} installed in namespace {}",
                "✓".green(),
                cfg.traefik_version,
                cfg.traefik_namespace
            );
            Ok(true)
        }
    }
}

async fn run_phases(orchestrator: &Orchestrator<'_>, mode: RunMode) -> Result<bool> {
    let outcome = orchestrator.run(mode).await?;
    let cluster = orchestrator.context().cluster();
    if outcome.ran.is_empty() {
        println!(
            "{} Cluster {} is {}, nothing to do",
            "✓".green(),
            cluster.bold(),
            outcome.state
        );
        return Ok(true);
    }

    for (phase, report) in &outcome.reports {
        output::print_report(&phase.to_string(), report);
    }
    let converged = outcome.is_converged();
    let ran: Vec<String> = outcome.ran.iter().map(ToString::to_string).collect();
    let mark = if converged { "✓".green() } else { "⚠".yellow() };
    println!(
        "{mark} Ran {} on cluster {}: {}",
        ran.join(", "),
        cluster.bold(),
        outcome.state
    );
    if !converged {
        warn!(cluster = %cluster, "Resources remain out of sync");
    }
    Ok(converged)
}

async fn handle_orphans(
    provider: &dyn CloudProvider,
    groups: Vec<OrphanGroup>,
    options: ReconcileOptions,
    action: Option<&OrphanAction>,
    yes: bool,
) -> Result<bool> {
    output::print_orphans(&groups);

    if action != Some(&OrphanAction::Clean) {
        return Ok(true);
    }
    let mut converged = true;
    for group in groups.into_iter().filter(|g| !g.is_empty()) {
        let prompt = format!(
            "Delete {} orphaned resource(s) of cluster '{}'?",
            group.resources.len(),
            group.cluster
        );
        if !confirm(yes, &prompt)? {
            info!(cluster = %group.cluster, "Orphan cleanup skipped");
            continue;
        }
        let title = format!("Orphans of {}", group.cluster);
        let report = orphans::clean(provider, group, options.clone(), true).await;
        output::print_report(&title, &report);
        converged &= report.is_converged();
    }
    Ok(converged)
}

/// Ask before a destructive step; `yes` answers for the operator.
fn confirm(yes: bool, prompt: &str) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

/// Approval prompt for a reconcile pass with pending deletes or replaces.
fn confirm_deletes(actions: &[&ReconcileAction]) -> bool {
    output::print_pending_deletes(actions);
    match confirm(false, "Proceed with these actions?") {
        Ok(answer) => answer,
        Err(e) => {
            warn!(error = %e, "Confirmation prompt failed, treating as declined");
            false
        }
    }
}
