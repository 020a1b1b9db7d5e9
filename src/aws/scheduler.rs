//! EventBridge Scheduler group holding the start and stop schedules.

use std::collections::BTreeSet;

use aws_sdk_scheduler::types::{
    FlexibleTimeWindow, FlexibleTimeWindowMode, ScheduleGroupState, ScheduleState, Tag, Target,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::tags::{self, TagChanges, TagMap};
use super::{AwsProvider, build_err, mismatch};
use crate::error::ProviderError;
use crate::model::{
    ObservedResource, ResourceConfig, ResourceKind, ResourceSpec, ResourceState,
    SchedulePolicyConfig,
};

const START_TARGET: &str = "arn:aws:scheduler:::aws-sdk:ec2:startInstances";
const STOP_TARGET: &str = "arn:aws:scheduler:::aws-sdk:ec2:stopInstances";
const DEFAULT_GROUP: &str = "default";

fn aws_err<E: std::error::Error>(err: E) -> ProviderError {
    ProviderError::aws(module_path!(), err)
}

/// Request body of the EC2 start/stop universal targets.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
struct InstanceList {
    instance_ids: Vec<String>,
}

fn cron(expr: &str) -> String {
    format!("cron({expr})")
}

fn uncron(expr: &str) -> &str {
    expr.strip_prefix("cron(")
        .and_then(|e| e.strip_suffix(')'))
        .unwrap_or(expr)
}

/// Role name from a role ARN (`arn:aws:iam::123:role/kshape/demo/demo-scheduler`).
fn role_name(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

fn to_tags(tags: &TagMap) -> Result<Vec<Tag>, ProviderError> {
    tags.iter()
        .map(|(k, v)| Tag::builder().key(k).value(v).build().map_err(build_err))
        .collect()
}

/// One of the two schedules as read back.
struct ScheduleView {
    expression: String,
    timezone: Option<String>,
    enabled: bool,
    role: String,
    instance_ids: Vec<String>,
}

impl AwsProvider {
    pub(super) async fn list_schedules(&self) -> Result<Vec<ObservedResource>, ProviderError> {
        let mut groups = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let resp = self
                .scheduler
                .list_schedule_groups()
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(aws_err)?;
            groups.extend(
                resp.schedule_groups()
                    .iter()
                    .filter(|g| g.name() != Some(DEFAULT_GROUP))
                    .cloned(),
            );
            match resp.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        let mut observed = Vec::new();
        for group in &groups {
            let (Some(name), Some(arn)) = (group.name(), group.arn()) else {
                continue;
            };
            let resp = self
                .scheduler
                .list_tags_for_resource()
                .resource_arn(arn)
                .send()
                .await
                .map_err(aws_err)?;
            let tags: TagMap = resp
                .tags()
                .iter()
                .map(|t| (t.key().to_string(), t.value().to_string()))
                .collect();
            let Some(spec) = tags::decode(ResourceKind::SchedulePolicy, tags) else {
                continue;
            };
            let mut resource = ObservedResource::new(arn, spec);
            if group.state() == Some(&ScheduleGroupState::Deleting) {
                resource.state = ResourceState::Deleting;
                observed.push(resource);
                continue;
            }

            let start = self.read_schedule(name, "start").await?;
            let stop = self.read_schedule(name, "stop").await?;
            match (start, stop) {
                (Some(start), Some(stop)) => {
                    let mut ids: BTreeSet<String> = start.instance_ids.into_iter().collect();
                    ids.extend(stop.instance_ids);
                    let names = self.instance_names(ids.into_iter().collect()).await?;
                    if let ResourceConfig::SchedulePolicy(c) = &mut resource.spec.config {
                        c.start = start.expression;
                        c.stop = stop.expression;
                        if let Some(tz) = start.timezone {
                            c.timezone = tz;
                        }
                        c.enabled = start.enabled && stop.enabled;
                        c.service_account = start.role;
                        c.targets = names.into_values().collect();
                        c.targets.sort();
                    }
                }
                // A group missing either schedule is rebuilt.
                _ => resource.state = ResourceState::Failed,
            }
            observed.push(resource);
        }
        Ok(observed)
    }

    async fn read_schedule(
        &self,
        group: &str,
        action: &str,
    ) -> Result<Option<ScheduleView>, ProviderError> {
        let resp = match self
            .scheduler
            .get_schedule()
            .group_name(group)
            .name(format!("{group}-{action}"))
            .send()
            .await
            .map_err(aws_err)
        {
            Ok(resp) => resp,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let target = resp.target();
        let input: InstanceList = target
            .and_then(|t| t.input())
            .and_then(|i| serde_json::from_str(i).ok())
            .unwrap_or_default();
        Ok(Some(ScheduleView {
            expression: uncron(resp.schedule_expression().unwrap_or_default()).to_string(),
            timezone: resp.schedule_expression_timezone().map(str::to_string),
            enabled: resp.state() == Some(&ScheduleState::Enabled),
            role: target.map(|t| role_name(t.role_arn()).to_string()).unwrap_or_default(),
            instance_ids: input.instance_ids,
        }))
    }

    pub(super) async fn create_schedule(
        &self,
        cluster: &str,
        spec: &ResourceSpec,
        tags: &TagMap,
    ) -> Result<String, ProviderError> {
        let resp = self
            .scheduler
            .create_schedule_group()
            .name(&spec.name)
            .set_tags(Some(to_tags(tags)?))
            .send()
            .await
            .map_err(aws_err)?;
        self.put_schedules(cluster, spec, true).await?;
        info!(schedule = %spec.name, "Created schedule group");
        Ok(resp.schedule_group_arn().to_string())
    }

    /// Write both schedules of `spec`. A fresh group creates them; otherwise
    /// they are updated in place, falling back to create when missing.
    pub(super) async fn put_schedules(
        &self,
        cluster: &str,
        spec: &ResourceSpec,
        fresh: bool,
    ) -> Result<(), ProviderError> {
        let ResourceConfig::SchedulePolicy(c) = &spec.config else {
            return Err(mismatch(spec));
        };
        let role_arn = self
            .lookup_id(cluster, ResourceKind::ServiceAccount, &c.service_account)
            .await?;
        let mut instance_ids = Vec::with_capacity(c.targets.len());
        for name in &c.targets {
            instance_ids.push(
                self.lookup_id(cluster, ResourceKind::Instance, name)
                    .await?,
            );
        }
        let input = serde_json::to_string(&InstanceList { instance_ids }).map_err(|e| {
            ProviderError::fatal(module_path!(), format!("serializing targets: {e}"))
        })?;

        for (action, expression, target_arn) in [
            ("start", &c.start, START_TARGET),
            ("stop", &c.stop, STOP_TARGET),
        ] {
            let target = Target::builder()
                .arn(target_arn)
                .role_arn(&role_arn)
                .input(&input)
                .build()
                .map_err(build_err)?;
            let name = format!("{}-{action}", spec.name);
            if !fresh {
                match self.update_one(&spec.name, &name, expression, c, target.clone()).await {
                    Ok(()) => continue,
                    Err(e) if e.is_not_found() => {
                        debug!(schedule = %name, "Schedule missing, creating");
                    }
                    Err(e) => return Err(e),
                }
            }
            self.create_one(&spec.name, &name, expression, c, target)
                .await?;
        }
        Ok(())
    }

    async fn create_one(
        &self,
        group: &str,
        name: &str,
        expression: &str,
        config: &SchedulePolicyConfig,
        target: Target,
    ) -> Result<(), ProviderError> {
        self.scheduler
            .create_schedule()
            .group_name(group)
            .name(name)
            .schedule_expression(cron(expression))
            .schedule_expression_timezone(&config.timezone)
            .state(schedule_state(config.enabled))
            .flexible_time_window(no_window()?)
            .target(target)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    async fn update_one(
        &self,
        group: &str,
        name: &str,
        expression: &str,
        config: &SchedulePolicyConfig,
        target: Target,
    ) -> Result<(), ProviderError> {
        self.scheduler
            .update_schedule()
            .group_name(group)
            .name(name)
            .schedule_expression(cron(expression))
            .schedule_expression_timezone(&config.timezone)
            .state(schedule_state(config.enabled))
            .flexible_time_window(no_window()?)
            .target(target)
            .send()
            .await
            .map_err(aws_err)?;
        Ok(())
    }

    /// Deleting a group deletes its schedules.
    pub(super) async fn delete_schedule(&self, name: &str) -> Result<(), ProviderError> {
        self.scheduler
            .delete_schedule_group()
            .name(name)
            .send()
            .await
            .map_err(aws_err)?;
        // A replacement reuses the name.
        self.wait_for("schedule group deletion", || async move {
            match self
                .scheduler
                .get_schedule_group()
                .name(name)
                .send()
                .await
                .map_err(aws_err)
            {
                Ok(_) => Ok(false),
                Err(e) if e.is_not_found() => Ok(true),
                Err(e) => Err(e),
            }
        })
        .await
    }

    pub(super) async fn tag_schedule(
        &self,
        arn: &str,
        changes: &TagChanges,
    ) -> Result<(), ProviderError> {
        if !changes.set.is_empty() {
            self.scheduler
                .tag_resource()
                .resource_arn(arn)
                .set_tags(Some(to_tags(&changes.set)?))
                .send()
                .await
                .map_err(aws_err)?;
        }
        if !changes.remove.is_empty() {
            self.scheduler
                .untag_resource()
                .resource_arn(arn)
                .set_tag_keys(Some(changes.remove.clone()))
                .send()
                .await
                .map_err(aws_err)?;
        }
        Ok(())
    }
}

fn schedule_state(enabled: bool) -> ScheduleState {
    if enabled {
        ScheduleState::Enabled
    } else {
        ScheduleState::Disabled
    }
}

fn no_window() -> Result<FlexibleTimeWindow, ProviderError> {
    FlexibleTimeWindow::builder()
        .mode(FlexibleTimeWindowMode::Off)
        .build()
        .map_err(build_err)
}
