//! Notifications for provisioning lifecycle events.

pub mod slack;

pub use slack::{SlackMessage, SlackNotifier};

use std::time::Duration;

use crate::config::Config;
use crate::phases::Phase;

fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}m {}s", secs / 60, secs % 60)
}

fn context(cfg: &Config) -> String {
    format!(
        "Sent by kshape for cluster {} in account {}",
        cfg.cluster_name, cfg.project
    )
}

/// Build the message sent after a run finished every requested phase.
pub fn build_completed_message(cfg: &Config, phases: &[Phase], elapsed: Duration) -> SlackMessage {
    let ran = phases
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" → ");

    SlackMessage {
        header: "Cluster Provisioning Completed".to_string(),
        fields: vec![
            ("Cluster".to_string(), cfg.cluster_name.clone()),
            ("Region".to_string(), cfg.region.clone()),
            ("Phases".to_string(), ran),
            ("Duration".to_string(), format_duration(elapsed)),
        ],
        context: context(cfg),
    }
}

/// Build the message sent when a phase fails.
pub fn build_failed_message(
    cfg: &Config,
    phase: Phase,
    error: &str,
    retryable: bool,
    elapsed: Duration,
) -> SlackMessage {
    SlackMessage {
        header: "Cluster Provisioning Failed".to_string(),
        fields: vec![
            ("Cluster".to_string(), cfg.cluster_name.clone()),
            ("Region".to_string(), cfg.region.clone()),
            ("Failed Phase".to_string(), phase.to_string()),
            ("Duration".to_string(), format_duration(elapsed)),
            (
                "Retryable".to_string(),
                if retryable { "yes" } else { "no" }.to_string(),
            ),
            ("Error".to_string(), error.to_string()),
        ],
        context: context(cfg),
    }
}
