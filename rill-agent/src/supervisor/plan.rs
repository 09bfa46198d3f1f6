use super::command::{RoleCommands, TemplateContext};
use super::SupervisorSettings;
use crate::config::{Config, DeliveryMode};
use anyhow::Result;
use std::path::Path;

/// Everything a supervision loop needs: role commands, timing and which bus
/// endpoints it consumes itself.
#[derive(Debug, Clone)]
pub struct SupervisionPlan {
    pub settings: SupervisorSettings,
    pub commands: RoleCommands,
    /// Parser output consumed in-process when delivery is inline.
    pub envelope_addr: Option<String>,
    pub watchdog_addr: Option<String>,
}

impl SupervisionPlan {
    /// Live tail of the configured log.
    pub fn live(config: &Config, config_path: &Path) -> Result<Self> {
        let executable = config.executable()?;
        let context = TemplateContext {
            config,
            executable: &executable,
            config_path,
        };

        let watchdog = config
            .watchdog_command()
            .map(|command| context.tap(&command, &config.bus.watchdog_addr))
            .transpose()?;
        let watchdog_addr = watchdog.as_ref().map(|_| config.bus.watchdog_addr.clone());
        let (delivery, envelope_addr) = delivery_route(config, &context, &config.bus.parser_addr)?;

        Ok(Self {
            settings: SupervisorSettings::live(config),
            commands: RoleCommands {
                tail: context.tap(&config.tail_command(), &config.bus.tap_addr)?,
                watchdog,
                parser: context.parser(&config.bus.tap_addr, &config.bus.parser_addr)?,
                delivery,
            },
            envelope_addr,
            watchdog_addr,
        })
    }
}

/// Inline delivery subscribes to `parser_addr` in-process; process delivery
/// spawns a `deliver` child for it instead.
pub(crate) fn delivery_route(
    config: &Config,
    context: &TemplateContext<'_>,
    parser_addr: &str,
) -> Result<(Option<String>, Option<String>)> {
    match config.processes.delivery {
        DeliveryMode::Inline => Ok((None, Some(parser_addr.to_string()))),
        DeliveryMode::Process => Ok((Some(context.delivery(parser_addr)?), None)),
    }
}
