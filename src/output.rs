//! Terminal rendering of reports and tables. Everything here writes to stdout.

use colored::Colorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::bastion::AdminGrant;
use crate::diagnose::{Check, CheckStatus};
use crate::model::{ObservedResource, ResourceKind, ResourceState};
use crate::orphans::OrphanGroup;
use crate::power::PowerReport;
use crate::reader::RemoteSnapshot;
use crate::reconcile::{ActionKind, ReconcileAction, ReconcileReport};
use crate::status::{ClusterState, PhaseMarker};

#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "ROLE")]
    role: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "PRIVATE IP")]
    private_ip: String,
    #[tabled(rename = "PUBLIC IP")]
    public_ip: String,
    #[tabled(rename = "ID")]
    id: String,
}

#[derive(Tabled)]
struct KindRow {
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "COUNT")]
    count: usize,
}

#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "ID")]
    id: String,
}

#[derive(Tabled)]
struct ActionRow {
    #[tabled(rename = "ACTION")]
    action: String,
    #[tabled(rename = "RESOURCE")]
    resource: String,
    #[tabled(rename = "REASON")]
    reason: String,
}

#[derive(Tabled)]
struct CheckRow {
    #[tabled(rename = "CHECK")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

#[derive(Tabled)]
struct AdminRow {
    #[tabled(rename = "USER")]
    user: String,
    #[tabled(rename = "EMAIL")]
    email: String,
}

fn print_table(table: &mut Table) {
    table.with(Style::blank());
    println!("{table}");
}

fn colored_state(state: ResourceState) -> String {
    match state {
        ResourceState::Available => state.to_string().green().to_string(),
        ResourceState::Stopped => state.to_string().yellow().to_string(),
        ResourceState::Failed => state.to_string().red().to_string(),
        ResourceState::Pending | ResourceState::Deleting => state.to_string(),
    }
}

fn colored_action(action: ActionKind) -> String {
    match action {
        ActionKind::Create => action.to_string().green().to_string(),
        ActionKind::Update => action.to_string().yellow().to_string(),
        ActionKind::Replace | ActionKind::Delete => action.to_string().red().to_string(),
    }
}

fn colored_cluster_state(state: &ClusterState) -> String {
    match state {
        ClusterState::Ready => state.to_string().green().to_string(),
        ClusterState::Failed { .. } => state.to_string().red().to_string(),
        ClusterState::NotStarted | ClusterState::InProgress { .. } => {
            state.to_string().yellow().to_string()
        }
    }
}

/// Print the outcome of a reconcile pass.
pub fn print_report(title: &str, report: &ReconcileReport) {
    if report.applied.is_empty() && report.is_converged() {
        println!("{} {title}: already in sync", "✓".green());
        return;
    }

    println!(
        "{} ({} created, {} updated, {} replaced, {} deleted):",
        title.bold(),
        report.count(ActionKind::Create),
        report.count(ActionKind::Update),
        report.count(ActionKind::Replace),
        report.count(ActionKind::Delete),
    );
    for applied in &report.applied {
        println!(
            "  {} {} {} ({})",
            "✓".green(),
            colored_action(applied.action),
            applied.resource,
            applied.reason
        );
    }
    for failed in &report.failed {
        println!("  {} {}: {}", "✗".red(), failed.resource, failed.error);
    }
    for blocked in &report.blocked {
        println!("  {} {blocked} blocked by a failed dependency", "⚠".yellow());
    }
    for skipped in &report.skipped {
        println!("  {} {skipped} not approved", "⚠".yellow());
    }
}

/// Print pending destructive actions before asking for confirmation.
pub fn print_pending_deletes(actions: &[&ReconcileAction]) {
    let rows: Vec<ActionRow> = actions
        .iter()
        .map(|a| ActionRow {
            action: colored_action(a.kind),
            resource: a.resource.to_string(),
            reason: a.reason.to_string(),
        })
        .collect();
    println!(
        "{} destructive action(s) pending:",
        actions.len().to_string().bold()
    );
    print_table(&mut Table::new(&rows));
}

pub fn print_status(cluster: &str, marker: &PhaseMarker, snapshot: &RemoteSnapshot) {
    let updated = marker
        .updated_at
        .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
    println!("{} {}", "Cluster:".bold(), cluster);
    println!(
        "{} {}",
        "State:".bold(),
        colored_cluster_state(&marker.state())
    );
    println!(
        "{} {}",
        "Completed phase:".bold(),
        marker
            .completed
            .map_or_else(|| "-".to_string(), |p| format!("{p} ({}/5)", p.number()))
    );
    println!("{} {updated}", "Updated:".bold());

    if snapshot.is_empty() {
        println!();
        println!("No resources found.");
        return;
    }

    let kinds: Vec<KindRow> = snapshot
        .count_by_kind()
        .into_iter()
        .map(|(kind, count)| KindRow {
            kind: kind.to_string(),
            count,
        })
        .collect();
    println!();
    print_table(&mut Table::new(&kinds));

    let mut instances = snapshot.of_kind(ResourceKind::Instance);
    if instances.is_empty() {
        return;
    }
    instances.sort_by(|a, b| a.name().cmp(b.name()));
    let rows: Vec<InstanceRow> = instances.iter().map(instance_row).collect();
    println!();
    println!("{} ({}):", "Instances".bold(), rows.len());
    print_table(&mut Table::new(&rows));
}

fn instance_row(instance: &ObservedResource) -> InstanceRow {
    InstanceRow {
        name: instance.name().to_string(),
        role: instance.spec.role().unwrap_or("-").to_string(),
        state: colored_state(instance.state),
        private_ip: instance.private_ip.clone().unwrap_or_else(|| "-".to_string()),
        public_ip: instance.public_ip.clone().unwrap_or_else(|| "-".to_string()),
        id: instance.id.clone(),
    }
}

pub fn print_checks(checks: &[Check]) {
    let rows: Vec<CheckRow> = checks
        .iter()
        .map(|c| CheckRow {
            name: c.name.to_string(),
            status: match c.status {
                CheckStatus::Pass => format!("{} {}", "✓".green(), c.status),
                CheckStatus::Warn => format!("{} {}", "⚠".yellow(), c.status),
                CheckStatus::Fail => format!("{} {}", "✗".red(), c.status),
            },
            detail: c.detail.clone(),
        })
        .collect();
    print_table(&mut Table::new(&rows));
}

pub fn print_orphans(groups: &[OrphanGroup]) {
    if groups.iter().all(OrphanGroup::is_empty) {
        println!("{} No orphaned resources found.", "✓".green());
        return;
    }
    for group in groups.iter().filter(|g| !g.is_empty()) {
        println!(
            "{} {} ({}, {} resources):",
            "Cluster".bold(),
            group.cluster.bold(),
            group.mode,
            group.resources.len()
        );
        let rows: Vec<ResourceRow> = group
            .by_kind()
            .into_values()
            .flatten()
            .map(|r| ResourceRow {
                kind: r.kind().to_string(),
                name: r.name().to_string(),
                id: r.id.clone(),
            })
            .collect();
        print_table(&mut Table::new(&rows));
    }
}

pub fn print_admins(admins: &[AdminGrant]) {
    if admins.is_empty() {
        println!("No bastion admins granted.");
        return;
    }
    let rows: Vec<AdminRow> = admins
        .iter()
        .map(|a| AdminRow {
            user: a.user.clone(),
            email: a.email.clone(),
        })
        .collect();
    print_table(&mut Table::new(&rows));
}

pub fn print_power(verb: &str, report: &PowerReport) {
    for name in &report.changed {
        println!("  {} {verb} {name}", "✓".green());
    }
    for name in &report.unchanged {
        println!("  {} {name} unchanged", "-".dimmed());
    }
    for (name, error) in &report.failed {
        println!("  {} {name}: {error}", "✗".red());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BucketConfig, ROLE_CONTROL_PLANE, ResourceConfig, ResourceSpec};

    #[test]
    fn test_instance_row_fills_missing_fields() {
        let mut instance = ObservedResource::new(
            "i-0abc",
            ResourceSpec::new(
                ResourceKind::Instance,
                "demo-cp-0",
                "demo",
                ROLE_CONTROL_PLANE,
                ResourceConfig::Unknown,
            ),
        );
        instance.private_ip = Some("10.0.16.10".to_string());
        let row = instance_row(&instance);
        assert_eq!(row.role, "control-plane");
        assert_eq!(row.private_ip, "10.0.16.10");
        assert_eq!(row.public_ip, "-");
    }

    #[test]
    fn test_instance_row_without_role() {
        let mut spec = ResourceSpec::new(
            ResourceKind::Bucket,
            "b",
            "demo",
            "state",
            ResourceConfig::Bucket(BucketConfig { versioning: true }),
        );
        spec.labels.remove(crate::model::LABEL_ROLE);
        let row = instance_row(&ObservedResource::new("b", spec));
        assert_eq!(row.role, "-");
    }
}
