use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::configuration::{LocalConfig, NetTools, TunnelDescriptor};
use crate::error::{Error, Result};

/// Runs the platform script that brings the tunnel interface up.
pub trait ScriptRunner {
    /// `Err` means the script reported failure.
    fn run(&self, tunnel: &TunnelDescriptor, tools: &NetTools) -> Result<()>;
}

impl<T: ScriptRunner + ?Sized> ScriptRunner for &T {
    fn run(&self, tunnel: &TunnelDescriptor, tools: &NetTools) -> Result<()> {
        (**self).run(tunnel, tools)
    }
}

/// Executes `<template_dir>/<template>.sh` with no arguments, passing the
/// tunnel parameters through `TSP_*` environment variables.
#[derive(Clone, Debug)]
pub struct TemplateScript {
    path: PathBuf,
    verbose: u8,
}

impl TemplateScript {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        TemplateScript {
            path: path.into(),
            verbose: 1,
        }
    }
    pub fn from_config(config: &LocalConfig) -> Self {
        TemplateScript {
            path: config.script_path(),
            verbose: config.verbose,
        }
    }
    pub fn verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScriptRunner for TemplateScript {
    fn run(&self, tunnel: &TunnelDescriptor, tools: &NetTools) -> Result<()> {
        log::info!("executing configuration script {}", self.path.display());
        let out = Command::new(&self.path)
            .envs(script_env(tunnel, tools, self.verbose))
            .stdin(Stdio::null())
            .output()?;
        for line in String::from_utf8_lossy(&out.stdout).lines() {
            log::debug!("{line}");
        }
        for line in String::from_utf8_lossy(&out.stderr).lines() {
            log::warn!("{line}");
        }
        match out.status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(Error::ScriptFailed(code)),
            None => Err(Error::ScriptAbnormal),
        }
    }
}

/// Environment handed to the configuration script.
pub fn script_env(
    tunnel: &TunnelDescriptor,
    tools: &NetTools,
    verbose: u8,
) -> Vec<(&'static str, String)> {
    let mut env = vec![
        ("TSP_OPERATION", "TSP_TUNNEL_CREATION".to_string()),
        ("TSP_TUNNEL_MODE", tunnel.mode.to_string()),
        (
            "TSP_TUNNEL_INTERFACE",
            tools.interface_for(tunnel.mode).to_string(),
        ),
        ("TSP_HOST_TYPE", tools.host_type.as_str().to_string()),
        ("TSP_CLIENT_ADDRESS_IPV4", tunnel.client_address_ipv4.to_string()),
        ("TSP_SERVER_ADDRESS_IPV4", tunnel.server_address_ipv4.to_string()),
        ("TSP_CLIENT_ADDRESS_IPV6", tunnel.client_address_ipv6.to_string()),
        ("TSP_SERVER_ADDRESS_IPV6", tunnel.server_address_ipv6.to_string()),
        ("TSP_TUNNEL_PREFIXLEN", "128".to_string()),
        ("TSP_VERBOSE", verbose.to_string()),
    ];
    if let Some(prefix) = tunnel.prefix {
        env.push(("TSP_PREFIX", prefix.network().to_string()));
        env.push(("TSP_PREFIXLEN", prefix.prefix_len().to_string()));
        if let Some(home) = &tools.if_prefix {
            env.push(("TSP_HOME_INTERFACE", home.clone()));
        }
    }
    env
}
