//! Periodic backfill through a bulk historical command.
//!
//! The same supervision loop as the live tail, pointed at a command that replays
//! the whole log (rotated copies included) at low priority every 60 to 120 minutes.
//! Its envelopes go through the same acceptance window and into the same collection,
//! so records the live path already stored collapse on their fingerprint.

use crate::config::Config;
use crate::supervisor::plan::delivery_route;
use crate::supervisor::{RoleCommands, SupervisionPlan, SupervisorSettings, TemplateContext};
use anyhow::Result;
use std::path::Path;
use std::time::Duration;

pub fn plan(config: &Config, config_path: &Path) -> Result<SupervisionPlan> {
    let executable = config.executable()?;
    let context = TemplateContext {
        config,
        executable: &executable,
        config_path,
    };
    let reconcile = &config.reconcile;
    let (delivery, envelope_addr) = delivery_route(config, &context, &reconcile.parser_addr)?;

    Ok(SupervisionPlan {
        settings: SupervisorSettings {
            name: format!("{}/{} reconcile", config.node.host, config.node.log_source),
            grace_period: config.grace_period(),
            restart_jitter: (
                Duration::from_secs(reconcile.interval_min_secs),
                Duration::from_secs(reconcile.interval_max_secs),
            ),
            start_immediately: reconcile.run_on_start,
            parser_policy: config.processes.parser_policy,
        },
        commands: RoleCommands {
            tail: context.tap(&config.reconcile_command(), &reconcile.tap_addr)?,
            watchdog: None,
            parser: context.parser(&reconcile.tap_addr, &reconcile.parser_addr)?,
            delivery,
        },
        envelope_addr,
        watchdog_addr: None,
    })
}
