//! Command line definition and dispatch

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};

use netgate_core::{AccessService, MacAddress, NetworkAction, Role};

#[derive(Debug, Parser)]
#[command(name = "netgate", version, about = "Captive-portal device access controller")]
pub struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// State file, overriding the configured one
    #[arg(long, global = true)]
    pub state: Option<PathBuf>,

    /// Record firewall calls instead of running iptables; nothing is saved
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage portal users
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    /// Manage registered devices
    Device {
        #[command(subcommand)]
        command: DeviceCommand,
    },
    /// Register-or-connect a client MAC after portal login
    Admit {
        user: u64,
        mac: String,
        /// Shown in the auto-generated device name
        #[arg(long, default_value = "portal")]
        label: String,
    },
    /// Usage statistics
    Stats,
    /// Runtime settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    /// Re-apply accept rules for every connected, unblocked device
    Resync,
    /// Insert the accept rule for a MAC directly
    Allow { mac: String },
    /// Delete the accept rule for a MAC directly
    Block { mac: String },
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    Add {
        username: String,
        #[arg(long)]
        admin: bool,
    },
    List,
    Activate { id: u64 },
    /// Deactivate and block all of the user's devices
    Deactivate { id: u64 },
}

#[derive(Debug, Subcommand)]
pub enum DeviceCommand {
    Add { user: u64, name: String, mac: String },
    List {
        /// Only this user's devices
        #[arg(long)]
        user: Option<u64>,
    },
    Connect { user: u64, id: u64 },
    Disconnect { user: u64, id: u64 },
    Remove { user: u64, id: u64 },
    Block { id: u64 },
    Unblock { id: u64 },
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    Show,
    /// Set the per-user device ceiling
    MaxDevices { max: u32 },
}

/// Run one command against the service, returning its JSON output
pub async fn run(service: &AccessService, command: Command) -> anyhow::Result<Value> {
    let output = match command {
        Command::User { command } => match command {
            UserCommand::Add { username, admin } => {
                let role = if admin { Role::Admin } else { Role::User };
                serde_json::to_value(service.add_user(&username, role).await?)?
            }
            UserCommand::List => serde_json::to_value(service.list_users().await)?,
            UserCommand::Activate { id } => {
                serde_json::to_value(service.set_user_active(id, true).await?)?
            }
            UserCommand::Deactivate { id } => {
                serde_json::to_value(service.set_user_active(id, false).await?)?
            }
        },

        Command::Device { command } => match command {
            DeviceCommand::Add { user, name, mac } => {
                serde_json::to_value(service.register_device(user, &name, &mac).await?)?
            }
            DeviceCommand::List { user: Some(user) } => {
                serde_json::to_value(service.list_devices(user).await?)?
            }
            DeviceCommand::List { user: None } => {
                serde_json::to_value(service.list_all_devices().await)?
            }
            DeviceCommand::Connect { user, id } => {
                serde_json::to_value(service.connect(user, id).await?)?
            }
            DeviceCommand::Disconnect { user, id } => {
                serde_json::to_value(service.disconnect(user, id).await?)?
            }
            DeviceCommand::Remove { user, id } => {
                serde_json::to_value(service.remove_device(user, id).await?)?
            }
            DeviceCommand::Block { id } => serde_json::to_value(service.set_blocked(id, true).await?)?,
            DeviceCommand::Unblock { id } => {
                serde_json::to_value(service.set_blocked(id, false).await?)?
            }
        },

        Command::Admit { user, mac, label } => {
            serde_json::to_value(service.admit(user, &mac, &label).await?)?
        }

        Command::Stats => serde_json::to_value(service.stats().await)?,

        Command::Settings { command } => match command {
            SettingsCommand::Show => serde_json::to_value(service.settings().await)?,
            SettingsCommand::MaxDevices { max } => {
                serde_json::to_value(service.set_max_devices_per_user(max).await?)?
            }
        },

        Command::Resync => serde_json::to_value(service.resync().await)?,

        Command::Allow { mac } => apply_raw(service, NetworkAction::Allow, &mac).await?,
        Command::Block { mac } => apply_raw(service, NetworkAction::Block, &mac).await?,
    };

    Ok(output)
}

async fn apply_raw(service: &AccessService, action: NetworkAction, mac: &str) -> anyhow::Result<Value> {
    service
        .synchronizer()
        .apply(action, mac)
        .await
        .with_context(|| format!("Failed to {action} {mac}"))?;

    // Valid by now, apply() parsed it
    let canonical = MacAddress::parse(mac).map(|m| m.to_string())?;
    Ok(json!({ "action": action, "mac_address": canonical }))
}
