//! Device lifecycle service
//!
//! Every operation follows the same shape: take the registry lock, apply the
//! state change, persist, release the lock, then tell the synchronizer.
//! Nothing is rolled back when the firewall call fails. The error is
//! returned and the written state stays as it is until the next operation
//! (or a [`AccessService::resync`]) touches that device again.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::mac::MacAddress;
use crate::network::{NetworkAccessSynchronizer, NetworkAction, NetworkError};
use crate::registry::{DailyCount, Device, Reachability, Registry, Role, Settings, User};
use crate::store::{StateFile, StoreError};

/// Window used for the per-day connection statistics
const STATS_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Device limit of {max} reached, remove an existing device first")]
    DeviceLimit { max: u32 },

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// User row with device counts for the admin listing
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    #[serde(flatten)]
    pub user: User,
    pub device_count: usize,
    pub active_devices: usize,
}

/// Device row joined with its owner's username
#[derive(Debug, Clone, Serialize)]
pub struct DeviceWithOwner {
    #[serde(flatten)]
    pub device: Device,
    pub username: String,
    pub reachability: Reachability,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub total_users: usize,
    pub total_devices: usize,
    pub connected_devices: usize,
    pub blocked_devices: usize,
    pub daily_connections: Vec<DailyCount>,
}

/// Outcome of re-applying accept rules for reachable devices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub applied: usize,
    pub failed: usize,
}

/// Lifecycle operations over the shared registry
pub struct AccessService {
    registry: Arc<RwLock<Registry>>,
    sync: NetworkAccessSynchronizer,
    store: Option<StateFile>,
}

impl AccessService {
    pub fn new(registry: Registry, sync: NetworkAccessSynchronizer) -> Self {
        Self {
            registry: Arc::new(RwLock::new(registry)),
            sync,
            store: None,
        }
    }

    /// Persist the registry to `store` after every change
    pub fn with_store(mut self, store: StateFile) -> Self {
        self.store = Some(store);
        self
    }

    pub fn synchronizer(&self) -> &NetworkAccessSynchronizer {
        &self.sync
    }

    /// Copy of the current registry
    pub async fn snapshot(&self) -> Registry {
        self.registry.read().await.clone()
    }

    fn persist(&self, registry: &Registry) -> Result<()> {
        if let Some(store) = &self.store {
            store.save(registry)?;
        }
        Ok(())
    }

    async fn apply(&self, action: NetworkAction, device: &Device) -> Result<()> {
        self.sync
            .apply_mac(action, &device.mac_address)
            .await
            .map_err(|e| {
                tracing::error!(
                    device_id = device.id,
                    "{} failed, stored state left as written: {}",
                    action,
                    e
                );
                ServiceError::from(e)
            })
    }

    // Users

    pub async fn add_user(&self, username: &str, role: Role) -> Result<User> {
        let username = username.trim();
        if username.is_empty() {
            return Err(ServiceError::Validation("Username is required".into()));
        }

        let mut registry = self.registry.write().await;
        if registry.user_by_name(username).is_some() {
            return Err(ServiceError::Conflict(format!("Username {username} already in use")));
        }

        let user = registry.insert_user(username, role, Utc::now()).clone();
        self.persist(&registry)?;

        tracing::info!(user_id = user.id, "Created user {}", user.username);
        Ok(user)
    }

    pub async fn list_users(&self) -> Vec<UserSummary> {
        let registry = self.registry.read().await;
        let mut users: Vec<UserSummary> = registry
            .users()
            .map(|user| UserSummary {
                user: user.clone(),
                device_count: registry.device_count(user.id),
                active_devices: registry.devices_of(user.id).filter(|d| d.is_connected).count(),
            })
            .collect();

        users.sort_by(|a, b| {
            b.user
                .created_at
                .cmp(&a.user.created_at)
                .then(b.user.id.cmp(&a.user.id))
        });
        users
    }

    /// Activate or deactivate a user
    ///
    /// Deactivation disconnects every device the user owns and issues a
    /// `Block` for each of them, connected or not. All devices are attempted;
    /// the first failure is returned.
    pub async fn set_user_active(&self, user_id: u64, active: bool) -> Result<User> {
        let (user, revoked) = {
            let mut registry = self.registry.write().await;
            let user = registry
                .user_mut(user_id)
                .ok_or_else(|| ServiceError::NotFound("User not found".into()))?;
            user.active = active;
            let user = user.clone();

            let mut revoked = Vec::new();
            if !active {
                let now = Utc::now();
                for device in registry.devices_of_mut(user_id) {
                    device.is_connected = false;
                    revoked.push(device.clone());
                }
                for device in &revoked {
                    registry.close_logs(device.id, now);
                }
            }

            self.persist(&registry)?;
            (user, revoked)
        };

        tracing::info!(user_id, active, "Updated user status");

        let mut first_error = None;
        for device in &revoked {
            if let Err(e) = self.apply(NetworkAction::Block, device).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(user),
        }
    }

    // Devices

    /// Register a new device; it starts disconnected and no rule is written
    pub async fn register_device(&self, user_id: u64, name: &str, mac_address: &str) -> Result<Device> {
        let name = name.trim();
        if name.is_empty() || mac_address.is_empty() {
            return Err(ServiceError::Validation("Device name and MAC address are required".into()));
        }
        let mac = MacAddress::parse(mac_address)
            .map_err(|e| ServiceError::Validation(e.to_string()))?;

        let mut registry = self.registry.write().await;
        Self::require_active_user(&registry, user_id)?;

        let max = registry.settings.max_devices_per_user;
        if registry.device_count(user_id) >= max as usize {
            return Err(ServiceError::DeviceLimit { max });
        }

        if registry.device_by_mac(&mac).is_some() {
            return Err(ServiceError::Conflict(format!("Device {mac} is already registered")));
        }

        let device = registry.insert_device(user_id, name, mac, Utc::now()).clone();
        self.persist(&registry)?;

        tracing::info!(user_id, device_id = device.id, %mac, "Registered device");
        Ok(device)
    }

    /// The user's devices, newest first
    pub async fn list_devices(&self, user_id: u64) -> Result<Vec<Device>> {
        let registry = self.registry.read().await;
        if registry.user(user_id).is_none() {
            return Err(ServiceError::NotFound("User not found".into()));
        }

        let mut devices: Vec<Device> = registry.devices_of(user_id).cloned().collect();
        devices.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(devices)
    }

    /// Every device with its owner, most recently connected first
    pub async fn list_all_devices(&self) -> Vec<DeviceWithOwner> {
        let registry = self.registry.read().await;
        let mut devices: Vec<DeviceWithOwner> = registry
            .devices()
            .map(|device| DeviceWithOwner {
                device: device.clone(),
                username: registry
                    .user(device.user_id)
                    .map(|u| u.username.clone())
                    .unwrap_or_default(),
                reachability: device.reachability(),
            })
            .collect();

        // None sorts lowest, so never-connected devices end up last
        devices.sort_by(|a, b| {
            b.device
                .last_connected
                .cmp(&a.device.last_connected)
                .then(a.device.id.cmp(&b.device.id))
        });
        devices
    }

    /// Mark a device connected and allow its MAC
    pub async fn connect(&self, user_id: u64, device_id: u64) -> Result<Device> {
        let device = {
            let mut registry = self.registry.write().await;
            Self::require_active_user(&registry, user_id)?;

            let device = registry
                .owned_device(user_id, device_id)
                .ok_or_else(|| ServiceError::NotFound("Device not found".into()))?;
            if device.blocked {
                return Err(ServiceError::Forbidden("Device is blocked".into()));
            }

            let now = Utc::now();
            let device = registry
                .device_mut(device_id)
                .ok_or_else(|| ServiceError::NotFound("Device not found".into()))?;
            device.is_connected = true;
            device.last_connected = Some(now);
            let device = device.clone();

            registry.open_log(user_id, device_id, now);
            self.persist(&registry)?;
            device
        };

        self.apply(NetworkAction::Allow, &device).await?;
        Ok(device)
    }

    /// Mark a device disconnected and block its MAC
    pub async fn disconnect(&self, user_id: u64, device_id: u64) -> Result<Device> {
        let device = {
            let mut registry = self.registry.write().await;
            if registry.owned_device(user_id, device_id).is_none() {
                return Err(ServiceError::NotFound("Device not found".into()));
            }

            let now = Utc::now();
            let device = registry
                .device_mut(device_id)
                .ok_or_else(|| ServiceError::NotFound("Device not found".into()))?;
            device.is_connected = false;
            let device = device.clone();

            registry.close_logs(device_id, now);
            self.persist(&registry)?;
            device
        };

        self.apply(NetworkAction::Block, &device).await?;
        Ok(device)
    }

    /// Delete a device; always issues exactly one `Block`
    pub async fn remove_device(&self, user_id: u64, device_id: u64) -> Result<Device> {
        let device = {
            let mut registry = self.registry.write().await;
            if registry.owned_device(user_id, device_id).is_none() {
                return Err(ServiceError::NotFound("Device not found".into()));
            }

            registry.close_logs(device_id, Utc::now());
            let device = registry
                .remove_device(device_id)
                .ok_or_else(|| ServiceError::NotFound("Device not found".into()))?;
            self.persist(&registry)?;
            device
        };

        tracing::info!(user_id, device_id, mac = %device.mac_address, "Removed device");
        self.apply(NetworkAction::Block, &device).await?;
        Ok(device)
    }

    /// Admin block/unblock
    ///
    /// Blocking always issues a `Block`, even for a device that was already
    /// unreachable. Unblocking touches no rule: access returns on the next
    /// connect.
    pub async fn set_blocked(&self, device_id: u64, blocked: bool) -> Result<Device> {
        let device = {
            let mut registry = self.registry.write().await;
            let now = Utc::now();
            let device = registry
                .device_mut(device_id)
                .ok_or_else(|| ServiceError::NotFound("Device not found".into()))?;
            device.blocked = blocked;
            if blocked {
                device.is_connected = false;
            }
            let device = device.clone();

            if blocked {
                registry.close_logs(device_id, now);
            }
            self.persist(&registry)?;
            device
        };

        tracing::info!(device_id, blocked, "Updated device block state");
        if blocked {
            self.apply(NetworkAction::Block, &device).await?;
        }
        Ok(device)
    }

    /// Captive-portal admission after a successful login
    ///
    /// Registers the client's MAC under the user if it is unknown, then
    /// connects it unless it is already connected.
    pub async fn admit(&self, user_id: u64, mac_address: &str, client_label: &str) -> Result<Device> {
        let mac = MacAddress::parse(mac_address)
            .map_err(|e| ServiceError::Validation(e.to_string()))?;

        let existing = {
            let registry = self.registry.read().await;
            registry
                .devices_of(user_id)
                .find(|d| d.mac_address == mac)
                .cloned()
        };

        match existing {
            None => {
                let name = format!("Auto device ({client_label})");
                let device = self.register_device(user_id, &name, &mac.to_string()).await?;
                self.connect(user_id, device.id).await
            }
            Some(device) if !device.is_connected => self.connect(user_id, device.id).await,
            Some(device) => Ok(device),
        }
    }

    // Admin views

    pub async fn stats(&self) -> Stats {
        let registry = self.registry.read().await;
        Stats {
            total_users: registry.users().filter(|u| u.role == Role::User).count(),
            total_devices: registry.devices().count(),
            connected_devices: registry.devices().filter(|d| d.is_connected).count(),
            blocked_devices: registry.devices().filter(|d| d.blocked).count(),
            daily_connections: registry.daily_connections(Utc::now(), STATS_WINDOW_DAYS),
        }
    }

    pub async fn settings(&self) -> Settings {
        self.registry.read().await.settings.clone()
    }

    pub async fn set_max_devices_per_user(&self, max: u32) -> Result<Settings> {
        if max == 0 {
            return Err(ServiceError::Validation("Device limit must be at least 1".into()));
        }

        let mut registry = self.registry.write().await;
        registry.settings.max_devices_per_user = max;
        self.persist(&registry)?;
        Ok(registry.settings.clone())
    }

    /// Re-issue `Allow` for every device that should be reachable
    ///
    /// Each device gets a `Block` first, so at most one accept rule is left
    /// per MAC. A device whose `Block` fails is counted as failed and skipped.
    pub async fn resync(&self) -> ResyncReport {
        let reachable: Vec<Device> = {
            let registry = self.registry.read().await;
            registry
                .devices()
                .filter(|d| d.should_be_reachable())
                .cloned()
                .collect()
        };

        let mut report = ResyncReport::default();
        for device in &reachable {
            // Delete first so repeated runs never stack duplicate rules
            let result = match self.apply(NetworkAction::Block, device).await {
                Ok(()) => self.apply(NetworkAction::Allow, device).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => report.applied += 1,
                Err(_) => report.failed += 1,
            }
        }

        tracing::info!(applied = report.applied, failed = report.failed, "Resync finished");
        report
    }

    fn require_active_user(registry: &Registry, user_id: u64) -> Result<()> {
        match registry.user(user_id) {
            None => Err(ServiceError::NotFound("User not found".into())),
            Some(user) if !user.active => {
                Err(ServiceError::Forbidden("Account disabled, contact the administrator".into()))
            }
            Some(_) => Ok(()),
        }
    }
}
