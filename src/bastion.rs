//! Bastion administration.
//!
//! Admin grants are `kshape-status-admin-<user>` labels on the bastion
//! instance holding the grantee's email. The bastion's login provisioning
//! creates a POSIX account for every label it finds.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{info, warn};

use crate::command::{CommandRunner, args};
use crate::compiler::Naming;
use crate::config::Config;
use crate::error::KshapeError;
use crate::model::{ObservedResource, ResourceKind, STATUS_LABEL_PREFIX};
use crate::phases::{self, Phase, PhaseContext};
use crate::provider::CloudProvider;
use crate::reader;
use crate::reconcile::ReconcileReport;

const ADMIN_KEY_PREFIX: &str = "admin-";

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("static regex")
});

static USER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminGrant {
    pub user: String,
    pub email: String,
}

/// POSIX user name derived from the local part of an email address.
pub fn username_for(email: &str) -> Result<String, KshapeError> {
    if !EMAIL_RE.is_match(email) {
        return Err(KshapeError::config(format!("invalid email address: {email}")));
    }
    let local = email.split('@').next().unwrap_or_default();
    let mut user: String = local
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(32)
        .collect();
    if user.starts_with(|c: char| c.is_ascii_digit()) {
        user.insert(0, '_');
        user.truncate(32);
    }
    validate_user(&user)?;
    Ok(user)
}

fn validate_user(user: &str) -> Result<(), KshapeError> {
    if USER_RE.is_match(user) {
        Ok(())
    } else {
        Err(KshapeError::config(format!("invalid user name: {user}")))
    }
}

/// Admin grants recorded on a bastion instance, sorted by user.
pub fn grants(bastion: &ObservedResource) -> Vec<AdminGrant> {
    let prefix = format!("{STATUS_LABEL_PREFIX}{ADMIN_KEY_PREFIX}");
    let mut grants: Vec<AdminGrant> = bastion
        .spec
        .labels
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(&prefix).map(|user| AdminGrant {
                user: user.to_string(),
                email: v.clone(),
            })
        })
        .collect();
    grants.sort_by(|a, b| a.user.cmp(&b.user));
    grants
}

async fn find_bastion(
    provider: &dyn CloudProvider,
    naming: &Naming,
) -> Result<(ObservedResource, Option<String>), KshapeError> {
    let snapshot = reader::read(
        provider,
        naming.cluster(),
        &[ResourceKind::Instance, ResourceKind::StaticAddress],
    )
    .await?;
    let instance = snapshot
        .find(ResourceKind::Instance, &naming.bastion())
        .cloned()
        .ok_or_else(|| {
            KshapeError::config(format!(
                "bastion {} not found, run phase4 first",
                naming.bastion()
            ))
        })?;
    let address = snapshot
        .find(ResourceKind::StaticAddress, &naming.bastion())
        .and_then(|a| a.public_ip.clone())
        .or_else(|| instance.public_ip.clone());
    Ok((instance, address))
}

pub async fn grant_admin(
    provider: &dyn CloudProvider,
    naming: &Naming,
    email: &str,
) -> Result<AdminGrant, KshapeError> {
    let user = username_for(email)?;
    let (bastion, _) = find_bastion(provider, naming).await?;
    if let Some(existing) = grants(&bastion).into_iter().find(|g| g.user == user)
        && existing.email != email
    {
        return Err(KshapeError::config(format!(
            "user {user} is already granted to {}",
            existing.email
        )));
    }
    provider
        .set_status_label(&bastion, &format!("{ADMIN_KEY_PREFIX}{user}"), Some(email))
        .await
        .map_err(|e| KshapeError::provider(e, Some(bastion.reference())))?;
    info!(user = %user, email = %email, bastion = %bastion.name(), "Admin access granted");
    Ok(AdminGrant {
        user,
        email: email.to_string(),
    })
}

pub async fn list_admins(
    provider: &dyn CloudProvider,
    naming: &Naming,
) -> Result<Vec<AdminGrant>, KshapeError> {
    let (bastion, _) = find_bastion(provider, naming).await?;
    Ok(grants(&bastion))
}

/// Revoke a grant and delete the account on the running bastion.
pub async fn remove_user(
    provider: &dyn CloudProvider,
    runner: &dyn CommandRunner,
    cfg: &Config,
    naming: &Naming,
    user: &str,
) -> Result<(), KshapeError> {
    validate_user(user)?;
    let (bastion, address) = find_bastion(provider, naming).await?;
    provider
        .set_status_label(&bastion, &format!("{ADMIN_KEY_PREFIX}{user}"), None)
        .await
        .map_err(|e| KshapeError::provider(e, Some(bastion.reference())))?;
    info!(user = %user, "Admin grant revoked");

    let address = address.ok_or_else(|| {
        KshapeError::config(format!("bastion {} has no public address", bastion.name()))
    })?;
    let mut argv = ssh_args(cfg, &address, &[]);
    argv.extend(args(["sudo", "userdel", "--remove", user]));
    let output = runner.run("ssh", &argv).await?;
    if output.success {
        info!(user = %user, bastion = %address, "Account removed from bastion");
    } else if output.message().contains("does not exist") {
        warn!(user = %user, "Account was not present on the bastion");
    } else {
        return Err(KshapeError::bootstrap(format!(
            "removing {user} from bastion: {}",
            output.message()
        )));
    }
    Ok(())
}

/// Delete the bastion instance and provision it again.
pub async fn recreate(ctx: &PhaseContext<'_>) -> Result<ReconcileReport, KshapeError> {
    let (bastion, _) = find_bastion(ctx.provider, &ctx.naming).await?;
    info!(bastion = %bastion.name(), id = %bastion.id, "Recreating bastion");
    let mut report = ctx
        .reconciler()
        .delete_resources(vec![bastion], true)
        .await
        .into_result(Phase::BastionSetup)?;
    if let Some(provisioned) = phases::execute(ctx, Phase::BastionSetup).await? {
        report.merge(provisioned);
    }
    Ok(report)
}

/// Arguments for `ssh` to the bastion, followed by `extra`.
pub fn ssh_args(cfg: &Config, address: &str, extra: &[String]) -> Vec<String> {
    let mut argv = args([
        "-o",
        "StrictHostKeyChecking=accept-new",
        "-l",
        cfg.ssh_user.as_str(),
        address,
    ]);
    argv.extend(extra.iter().cloned());
    argv
}

/// Public address of the bastion for interactive `ssh`.
pub async fn address(provider: &dyn CloudProvider, naming: &Naming) -> Result<String, KshapeError> {
    let (bastion, address) = find_bastion(provider, naming).await?;
    address.ok_or_else(|| {
        KshapeError::config(format!("bastion {} has no public address", bastion.name()))
    })
}
