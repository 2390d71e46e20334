use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use nsbroker::{BrokerConfig, Credential, ListenerConfig, StartupTask};

use crate::cli::ServeArgs;

/// TOML config file structure
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub listen_stdin: Option<bool>,

    /// Listener policy
    pub listener: ListenerSection,

    /// Namespaces created at startup
    pub init: Vec<InitSection>,

    /// Local namespaces offered to other brokers
    pub export: Vec<LinkSection>,

    /// Namespaces of other brokers made reachable here
    pub import: Vec<LinkSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListenerSection {
    /// Passwords or digests, same syntax as `--password`
    pub passwords: Option<Vec<String>>,
    pub allow_new_namespaces: Option<bool>,
    pub namespace_whitelist: Option<Vec<String>>,
    pub kill_server_on_close: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct InitSection {
    pub namespace: String,
    pub code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LinkSection {
    pub namespace: String,
    pub hostspec: String,
}

/// Merged configuration from file + CLI
pub struct MergedConfig {
    pub broker: BrokerConfig,
    pub stdio: bool,
}

/// Load config from file
pub fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            parse_config(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))
        }
        None => Ok(FileConfig::default()),
    }
}

fn parse_config(content: &str) -> Result<FileConfig> {
    Ok(toml::from_str(content)?)
}

/// Merge file config with CLI args (CLI takes precedence, lists are combined)
pub fn merge_config(file: FileConfig, cli: &ServeArgs) -> Result<MergedConfig> {
    let mut passwords = file.listener.passwords.unwrap_or_default();
    passwords.extend(cli.passwords.iter().cloned());
    let credentials = passwords
        .iter()
        .map(|password| password.parse::<Credential>())
        .collect::<Result<Vec<_>, _>>()?;

    let mut listener = ListenerConfig::builder()
        .credentials(credentials)
        .allow_new_namespaces(
            !cli.no_new_namespaces && file.listener.allow_new_namespaces.unwrap_or(true),
        )
        .kill_server_on_close(
            cli.kill_on_close || file.listener.kill_server_on_close.unwrap_or(false),
        );
    let mut whitelist = file.listener.namespace_whitelist;
    if !cli.namespace_whitelist.is_empty() {
        whitelist
            .get_or_insert_with(Vec::new)
            .extend(cli.namespace_whitelist.iter().cloned());
    }
    if let Some(names) = whitelist {
        listener = listener.namespace_whitelist(names);
    }

    // file tasks run before the ones given on the command line
    let mut tasks: Vec<StartupTask> = file
        .init
        .into_iter()
        .map(|init| StartupTask::Init {
            namespace: init.namespace,
            code: init.code,
        })
        .collect();
    tasks.extend(file.export.into_iter().map(|link| StartupTask::Export {
        namespace: link.namespace,
        hostspec: link.hostspec,
    }));
    tasks.extend(file.import.into_iter().map(|link| StartupTask::Import {
        namespace: link.namespace,
        hostspec: link.hostspec,
    }));
    for init in &cli.inits {
        let (namespace, code) = match init.split_once('=') {
            Some((namespace, code)) => (namespace, Some(code.to_string())),
            None => (init.as_str(), None),
        };
        tasks.push(StartupTask::Init {
            namespace: namespace.to_string(),
            code,
        });
    }
    for export in &cli.exports {
        let (namespace, hostspec) = link(export, "--export")?;
        tasks.push(StartupTask::Export { namespace, hostspec });
    }
    for import in &cli.imports {
        let (namespace, hostspec) = link(import, "--import")?;
        tasks.push(StartupTask::Import { namespace, hostspec });
    }

    let mut broker = BrokerConfig::builder()
        .listen_stdin(cli.listen_stdin || file.listen_stdin.unwrap_or(false))
        .listener(listener.build())
        .tasks(tasks);
    if let Some(host) = cli.host.clone().or(file.host) {
        broker = broker.host(host);
    }
    if let Some(port) = cli.port.or(file.port) {
        broker = broker.port(port);
    }

    Ok(MergedConfig {
        broker: broker.build(),
        stdio: cli.stdio,
    })
}

fn link(arg: &str, flag: &str) -> Result<(String, String)> {
    match arg.split_once('=') {
        Some((namespace, hostspec)) if !namespace.is_empty() && !hostspec.is_empty() => {
            Ok((namespace.to_string(), hostspec.to_string()))
        }
        _ => anyhow::bail!("invalid {flag} (expected NAMESPACE=HOSTSPEC): {arg}"),
    }
}
