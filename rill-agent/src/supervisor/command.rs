//! Command lines for the supervised roles, rendered from `[processes]` templates.

use super::process::Role;
use crate::config::Config;
use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{([a-z_]+)\}").unwrap();
}

/// Substitute `{name}` placeholders; values are shell-quoted. Unknown placeholders
/// are a configuration error.
pub fn render(template: &str, values: &BTreeMap<&str, String>) -> Result<String> {
    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = values
            .get(key.as_str())
            .ok_or_else(|| anyhow!("unknown placeholder {{{}}} in command template", key.as_str()))?;
        rendered.push_str(&template[last..whole.start()]);
        rendered.push_str(&shell_quote(value));
        last = whole.end();
    }
    rendered.push_str(&template[last..]);
    Ok(rendered)
}

pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "_-./:@%+=,".contains(ch));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Fully rendered command line per role. Roles without a command are not supervised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleCommands {
    pub tail: String,
    pub watchdog: Option<String>,
    pub parser: String,
    pub delivery: Option<String>,
}

impl RoleCommands {
    pub fn get(&self, role: Role) -> Option<&str> {
        match role {
            Role::Tail => Some(&self.tail),
            Role::Watchdog => self.watchdog.as_deref(),
            Role::Parser => Some(&self.parser),
            Role::Delivery => self.delivery.as_deref(),
        }
    }
}

/// Inputs shared by every rendered command of one supervised pair.
pub struct TemplateContext<'a> {
    pub config: &'a Config,
    pub executable: &'a Path,
    pub config_path: &'a Path,
}

impl TemplateContext<'_> {
    fn base_values(&self) -> BTreeMap<&'static str, String> {
        let config = self.config;
        BTreeMap::from([
            ("exe", self.executable.display().to_string()),
            ("host", config.node.host.clone()),
            ("username", config.credentials.username.clone()),
            ("password", config.credentials.password.clone()),
            ("format", config.format().to_string()),
            ("config", self.config_path.display().to_string()),
        ])
    }

    /// Remote command streamed onto `bind`.
    pub fn tap(&self, command: &str, bind: &str) -> Result<String> {
        let mut values = self.base_values();
        values.insert("command", command.to_string());
        values.insert("bind", bind.to_string());
        render(&self.config.processes.tap_template, &values)
    }

    pub fn parser(&self, input: &str, output: &str) -> Result<String> {
        let mut values = self.base_values();
        values.insert("input", input.to_string());
        values.insert("output", output.to_string());
        render(&self.config.processes.parser_template, &values)
    }

    pub fn delivery(&self, input: &str) -> Result<String> {
        let mut values = self.base_values();
        values.insert("input", input.to_string());
        render(&self.config.processes.delivery_template, &values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_replaced_and_quoted() {
        let values = BTreeMap::from([
            ("exe", "/usr/bin/rill-agent".to_string()),
            ("command", "tail -n 0 -f /var/log/ep.log".to_string()),
            ("password", String::new()),
        ]);
        let rendered = render("{exe} tap --command {command} --password {password}", &values)
            .expect("render");
        assert_eq!(
            rendered,
            "/usr/bin/rill-agent tap --command 'tail -n 0 -f /var/log/ep.log' --password ''"
        );
    }

    #[test]
    fn unknown_placeholders_are_rejected() {
        let err = render("{exe} {nope}", &BTreeMap::from([("exe", "x".to_string())]))
            .expect_err("unknown placeholder");
        assert!(err.to_string().contains("{nope}"));
    }

    #[test]
    fn single_quotes_survive_quoting() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("tcp://127.0.0.1:5601"), "tcp://127.0.0.1:5601");
    }
}
