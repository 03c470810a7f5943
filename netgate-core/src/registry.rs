//! Persisted access-control model
//!
//! Users own devices; devices carry the connected/blocked flags the
//! synchronizer mirrors onto the firewall. Connection logs record each
//! connect/disconnect pair. The registry is plain data: policy checks live
//! in [`crate::service`].

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::mac::MacAddress;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    pub role: Role,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Reachability derived from a device's flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    Disconnected,
    Connected,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: u64,
    pub user_id: u64,
    pub name: String,
    pub mac_address: MacAddress,
    pub is_connected: bool,
    pub blocked: bool,
    pub last_connected: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Device {
    pub fn reachability(&self) -> Reachability {
        if self.blocked {
            Reachability::Blocked
        } else if self.is_connected {
            Reachability::Connected
        } else {
            Reachability::Disconnected
        }
    }

    /// Whether the firewall should currently accept this device
    pub fn should_be_reachable(&self) -> bool {
        self.is_connected && !self.blocked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionLog {
    pub id: u64,
    pub user_id: u64,
    pub device_id: u64,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub max_devices_per_user: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_devices_per_user: crate::DEFAULT_MAX_DEVICES_PER_USER,
        }
    }
}

/// Connections opened on one calendar day (UTC)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    users: BTreeMap<u64, User>,
    #[serde(default)]
    devices: BTreeMap<u64, Device>,
    #[serde(default)]
    logs: Vec<ConnectionLog>,
    #[serde(default)]
    pub settings: Settings,
}

impl Registry {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // Users

    pub fn insert_user(&mut self, username: &str, role: Role, now: DateTime<Utc>) -> &User {
        let id = self.allocate_id();
        self.users.entry(id).or_insert(User {
            id,
            username: username.to_string(),
            role,
            active: true,
            created_at: now,
        })
    }

    pub fn user(&self, id: u64) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn user_mut(&mut self, id: u64) -> Option<&mut User> {
        self.users.get_mut(&id)
    }

    pub fn user_by_name(&self, username: &str) -> Option<&User> {
        self.users.values().find(|u| u.username == username)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    // Devices

    pub fn insert_device(
        &mut self,
        user_id: u64,
        name: &str,
        mac_address: MacAddress,
        now: DateTime<Utc>,
    ) -> &Device {
        let id = self.allocate_id();
        self.devices.entry(id).or_insert(Device {
            id,
            user_id,
            name: name.to_string(),
            mac_address,
            is_connected: false,
            blocked: false,
            last_connected: None,
            created_at: now,
        })
    }

    pub fn device(&self, id: u64) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn device_mut(&mut self, id: u64) -> Option<&mut Device> {
        self.devices.get_mut(&id)
    }

    /// Device `id` if it belongs to `user_id`
    pub fn owned_device(&self, user_id: u64, id: u64) -> Option<&Device> {
        self.devices.get(&id).filter(|d| d.user_id == user_id)
    }

    pub fn device_by_mac(&self, mac: &MacAddress) -> Option<&Device> {
        self.devices.values().find(|d| d.mac_address == *mac)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn devices_of(&self, user_id: u64) -> impl Iterator<Item = &Device> {
        self.devices.values().filter(move |d| d.user_id == user_id)
    }

    pub fn devices_of_mut(&mut self, user_id: u64) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut().filter(move |d| d.user_id == user_id)
    }

    pub fn device_count(&self, user_id: u64) -> usize {
        self.devices_of(user_id).count()
    }

    pub fn remove_device(&mut self, id: u64) -> Option<Device> {
        self.devices.remove(&id)
    }

    // Connection logs

    pub fn open_log(&mut self, user_id: u64, device_id: u64, now: DateTime<Utc>) -> u64 {
        let id = self.allocate_id();
        self.logs.push(ConnectionLog {
            id,
            user_id,
            device_id,
            connected_at: now,
            disconnected_at: None,
            duration_secs: None,
        });
        id
    }

    /// Close every open log row for `device_id`, returning how many closed
    pub fn close_logs(&mut self, device_id: u64, now: DateTime<Utc>) -> usize {
        let mut closed = 0;
        for log in self
            .logs
            .iter_mut()
            .filter(|l| l.device_id == device_id && l.disconnected_at.is_none())
        {
            log.disconnected_at = Some(now);
            log.duration_secs = Some((now - log.connected_at).num_seconds());
            closed += 1;
        }
        closed
    }

    pub fn logs(&self) -> &[ConnectionLog] {
        &self.logs
    }

    /// Connections per UTC day over the `days` days ending at `now`, newest first
    pub fn daily_connections(&self, now: DateTime<Utc>, days: i64) -> Vec<DailyCount> {
        let since = now - Duration::days(days);
        let mut per_day: BTreeMap<NaiveDate, u64> = BTreeMap::new();

        for log in self.logs.iter().filter(|l| l.connected_at > since) {
            *per_day.entry(log.connected_at.date_naive()).or_default() += 1;
        }

        per_day
            .into_iter()
            .rev()
            .map(|(date, count)| DailyCount { date, count })
            .collect()
    }

    /// Devices breaking the blocked ⇒ disconnected rule
    pub fn blocked_but_connected(&self) -> Vec<u64> {
        self.devices
            .values()
            .filter(|d| d.blocked && d.is_connected)
            .map(|d| d.id)
            .collect()
    }
}
