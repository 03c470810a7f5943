//! Network access synchronization
//!
//! Maps a desired reachability for a MAC address onto the firewall:
//! - `Allow` inserts a NAT PREROUTING rule accepting traffic from the MAC
//! - `Block` deletes that rule again
//!
//! The firewall is reached through [`NetworkRuleController`] so the
//! privileged part can be swapped out. Calls are not idempotent and never
//! retried; whoever calls [`NetworkAccessSynchronizer::apply`] owns the
//! consequences of a failure.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::config::FirewallConfig;
use crate::mac::{MacAddress, MacParseError};

/// stderr fragment iptables prints when deleting a rule that is not there
const MISSING_RULE_MARKER: &str = "does a matching rule exist";

/// Desired reachability for a MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkAction {
    Allow,
    Block,
}

impl fmt::Display for NetworkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkAction::Allow => f.write_str("allow"),
            NetworkAction::Block => f.write_str("block"),
        }
    }
}

/// Failure reported by a rule controller
#[derive(Debug, Error)]
pub enum FacilityError {
    #[error("Failed to spawn firewall command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Firewall command exited with {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    #[error("Firewall unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error(transparent)]
    InvalidAddress(#[from] MacParseError),

    #[error("Failed to {action} network access for {mac_address}")]
    Facility {
        action: NetworkAction,
        mac_address: MacAddress,
        #[source]
        cause: FacilityError,
    },
}

/// Privileged rule table keyed by source MAC
#[async_trait]
pub trait NetworkRuleController: Send + Sync {
    /// Insert the accept rule for `mac`
    async fn insert_accept(&self, mac: &MacAddress) -> Result<(), FacilityError>;

    /// Delete the accept rule for `mac`
    async fn delete_accept(&self, mac: &MacAddress) -> Result<(), FacilityError>;
}

/// Applies allow/block decisions through an injected controller
#[derive(Clone)]
pub struct NetworkAccessSynchronizer {
    controller: Arc<dyn NetworkRuleController>,
}

impl NetworkAccessSynchronizer {
    pub fn new(controller: Arc<dyn NetworkRuleController>) -> Self {
        Self { controller }
    }

    /// Validate `mac_address` and apply `action` to it
    ///
    /// Malformed addresses fail with [`NetworkError::InvalidAddress`] before
    /// the controller is touched.
    pub async fn apply(&self, action: NetworkAction, mac_address: &str) -> Result<(), NetworkError> {
        let mac = MacAddress::parse(mac_address)?;
        self.apply_mac(action, &mac).await
    }

    /// Apply `action` to an already parsed address
    pub async fn apply_mac(&self, action: NetworkAction, mac: &MacAddress) -> Result<(), NetworkError> {
        let result = match action {
            NetworkAction::Allow => self.controller.insert_accept(mac).await,
            NetworkAction::Block => self.controller.delete_accept(mac).await,
        };

        match result {
            Ok(()) => {
                tracing::info!(%mac, %action, "network access updated");
                Ok(())
            }
            Err(cause) => {
                tracing::error!(%mac, %action, error = %cause, "network command failed");
                Err(NetworkError::Facility {
                    action,
                    mac_address: *mac,
                    cause,
                })
            }
        }
    }
}

/// Accept rule for one source MAC
#[derive(Debug, Clone)]
struct AcceptRule<'a> {
    table: &'a str,
    chain: &'a str,
    mac: &'a MacAddress,
}

impl AcceptRule<'_> {
    fn to_args(&self, op: &str) -> Vec<String> {
        vec![
            "-t".to_string(),
            self.table.to_string(),
            op.to_string(),
            self.chain.to_string(),
            "-m".to_string(),
            "mac".to_string(),
            "--mac-source".to_string(),
            self.mac.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ]
    }
}

/// Controller that shells out to `iptables`
#[derive(Debug, Clone)]
pub struct IptablesController {
    config: FirewallConfig,
}

impl IptablesController {
    pub fn new(config: FirewallConfig) -> Self {
        Self { config }
    }

    fn rule<'a>(&'a self, mac: &'a MacAddress) -> AcceptRule<'a> {
        AcceptRule {
            table: &self.config.table,
            chain: &self.config.chain,
            mac,
        }
    }

    /// Program and arguments for one rule operation
    fn command_line(&self, op: &str, mac: &MacAddress) -> (String, Vec<String>) {
        let mut args = self.rule(mac).to_args(op);
        if self.config.use_sudo {
            args.insert(0, self.config.binary.clone());
            ("sudo".to_string(), args)
        } else {
            (self.config.binary.clone(), args)
        }
    }

    async fn execute(&self, op: &str, mac: &MacAddress) -> Result<(), FacilityError> {
        let (program, args) = self.command_line(op, mac);
        tracing::debug!("Executing: {} {}", program, args.join(" "));

        let output = Command::new(&program).args(&args).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(FacilityError::Exited {
                code: output.status.code(),
                stderr,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl NetworkRuleController for IptablesController {
    async fn insert_accept(&self, mac: &MacAddress) -> Result<(), FacilityError> {
        self.execute("-I", mac).await
    }

    async fn delete_accept(&self, mac: &MacAddress) -> Result<(), FacilityError> {
        let result = self.execute("-D", mac).await;
        self.absorb_missing_rule(mac, result)
    }
}

impl IptablesController {
    /// Turn "no such rule" on delete into success when configured to
    fn absorb_missing_rule(
        &self,
        mac: &MacAddress,
        result: Result<(), FacilityError>,
    ) -> Result<(), FacilityError> {
        match result {
            Err(FacilityError::Exited { stderr, .. })
                if self.config.tolerate_missing_rule && stderr.contains(MISSING_RULE_MARKER) =>
            {
                tracing::warn!(%mac, "accept rule not found, treating as success");
                Ok(())
            }
            other => other,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryRules {
    /// Accept rules currently present, counted per MAC like iptables does
    rules: HashMap<MacAddress, usize>,
    calls: Vec<(NetworkAction, MacAddress)>,
    failing: HashSet<NetworkAction>,
}

/// In-memory rule table that records every call
///
/// Inserts stack up like duplicate iptables rules and each delete removes
/// one of them; deleting an absent rule succeeds. Used for tests and for
/// `--dry-run`.
#[derive(Debug, Default)]
pub struct MemoryController {
    inner: Mutex<MemoryRules>,
}

impl MemoryController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `action` fail until [`Self::clear_failures`]
    pub fn fail_on(&self, action: NetworkAction) {
        self.lock().failing.insert(action);
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// All calls seen so far, including failed ones
    pub fn calls(&self) -> Vec<(NetworkAction, MacAddress)> {
        self.lock().calls.clone()
    }

    /// Number of `action` calls seen for `mac`
    pub fn count(&self, action: NetworkAction, mac: &MacAddress) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|(a, m)| *a == action && m == mac)
            .count()
    }

    pub fn is_allowed(&self, mac: &MacAddress) -> bool {
        self.rule_count(mac) > 0
    }

    /// Accept rules currently held for `mac`
    pub fn rule_count(&self, mac: &MacAddress) -> usize {
        self.lock().rules.get(mac).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryRules> {
        // A poisoned lock only means a test thread panicked mid-call
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, action: NetworkAction, mac: &MacAddress) -> Result<(), FacilityError> {
        let mut rules = self.lock();
        rules.calls.push((action, *mac));

        if rules.failing.contains(&action) {
            return Err(FacilityError::Unavailable(format!("{action} disabled")));
        }

        match action {
            NetworkAction::Allow => *rules.rules.entry(*mac).or_default() += 1,
            NetworkAction::Block => {
                if let Some(count) = rules.rules.get_mut(mac) {
                    *count -= 1;
                    if *count == 0 {
                        rules.rules.remove(mac);
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkRuleController for MemoryController {
    async fn insert_accept(&self, mac: &MacAddress) -> Result<(), FacilityError> {
        tracing::debug!(%mac, "memory controller: insert accept");
        self.record(NetworkAction::Allow, mac)
    }

    async fn delete_accept(&self, mac: &MacAddress) -> Result<(), FacilityError> {
        tracing::debug!(%mac, "memory controller: delete accept");
        self.record(NetworkAction::Block, mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(s: &str) -> MacAddress {
        MacAddress::parse(s).unwrap()
    }

    fn memory_sync() -> (Arc<MemoryController>, NetworkAccessSynchronizer) {
        let controller = Arc::new(MemoryController::new());
        let sync = NetworkAccessSynchronizer::new(controller.clone());
        (controller, sync)
    }

    #[tokio::test]
    async fn test_apply_accepts_both_separator_styles() {
        let (controller, sync) = memory_sync();

        sync.apply(NetworkAction::Allow, "aa:bb:cc:dd:ee:ff").await.unwrap();
        sync.apply(NetworkAction::Block, "AA-BB-CC-DD-EE-FF").await.unwrap();

        let target = mac("AA:BB:CC:DD:EE:FF");
        assert_eq!(controller.count(NetworkAction::Allow, &target), 1);
        assert_eq!(controller.count(NetworkAction::Block, &target), 1);
        assert!(!controller.is_allowed(&target));
    }

    #[tokio::test]
    async fn test_invalid_address_never_reaches_controller() {
        let (controller, sync) = memory_sync();

        for bad in ["", "AA:BB:CC:DD:EE", "zz:zz:zz:zz:zz:zz", "AA:BB:CC:DD:EE:FF -j DROP"] {
            let err = sync.apply(NetworkAction::Allow, bad).await.unwrap_err();
            assert!(matches!(err, NetworkError::InvalidAddress(_)));
        }

        assert!(controller.calls().is_empty());
    }

    #[tokio::test]
    async fn test_double_calls_are_tolerated_by_stub() {
        let (controller, sync) = memory_sync();

        sync.apply(NetworkAction::Allow, "00:11:22:33:44:55").await.unwrap();
        sync.apply(NetworkAction::Allow, "00:11:22:33:44:55").await.unwrap();
        sync.apply(NetworkAction::Block, "00:11:22:33:44:55").await.unwrap();
        sync.apply(NetworkAction::Block, "00:11:22:33:44:55").await.unwrap();

        assert_eq!(controller.calls().len(), 4);
        assert_eq!(controller.rule_count(&mac("00:11:22:33:44:55")), 0);
    }

    #[tokio::test]
    async fn test_stub_stacks_duplicate_inserts() {
        let (controller, sync) = memory_sync();
        let target = mac("00:11:22:33:44:55");

        sync.apply_mac(NetworkAction::Allow, &target).await.unwrap();
        sync.apply_mac(NetworkAction::Allow, &target).await.unwrap();
        assert_eq!(controller.rule_count(&target), 2);

        sync.apply_mac(NetworkAction::Block, &target).await.unwrap();
        assert!(controller.is_allowed(&target));
    }

    #[tokio::test]
    async fn test_facility_failure_carries_action_and_mac() {
        let (controller, sync) = memory_sync();
        controller.fail_on(NetworkAction::Allow);

        let err = sync.apply(NetworkAction::Allow, "00:11:22:33:44:55").await.unwrap_err();
        match err {
            NetworkError::Facility { action, mac_address, .. } => {
                assert_eq!(action, NetworkAction::Allow);
                assert_eq!(mac_address, mac("00:11:22:33:44:55"));
            }
            other => panic!("unexpected error: {other}"),
        }

        // Block is unaffected
        sync.apply(NetworkAction::Block, "00:11:22:33:44:55").await.unwrap();

        controller.clear_failures();
        sync.apply(NetworkAction::Allow, "00:11:22:33:44:55").await.unwrap();
        assert!(controller.is_allowed(&mac("00:11:22:33:44:55")));
    }

    fn exited(stderr: &str) -> Result<(), FacilityError> {
        Err(FacilityError::Exited {
            code: Some(1),
            stderr: stderr.to_string(),
        })
    }

    #[test]
    fn test_missing_rule_is_absorbed_when_tolerated() {
        let controller = IptablesController::new(FirewallConfig::default());
        let target = mac("00:11:22:33:44:55");
        let missing = "iptables: Bad rule (does a matching rule exist in that chain?).";

        assert!(controller.absorb_missing_rule(&target, exited(missing)).is_ok());
        assert!(matches!(
            controller.absorb_missing_rule(&target, exited("Permission denied (you must be root)")),
            Err(FacilityError::Exited { .. })
        ));
    }

    #[test]
    fn test_missing_rule_fails_when_not_tolerated() {
        let config = FirewallConfig {
            tolerate_missing_rule: false,
            ..FirewallConfig::default()
        };
        let controller = IptablesController::new(config);
        let missing = "iptables: Bad rule (does a matching rule exist in that chain?).";

        assert!(matches!(
            controller.absorb_missing_rule(&mac("00:11:22:33:44:55"), exited(missing)),
            Err(FacilityError::Exited { code: Some(1), .. })
        ));
    }

    /// Executable stand-in for iptables that prints `stderr` and exits 1
    #[cfg(unix)]
    fn failing_iptables(dir: &std::path::Path, stderr: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("iptables");
        std::fs::write(&path, format!("#!/bin/sh\necho '{stderr}' >&2\nexit 1\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_delete_of_absent_rule_through_command() {
        let dir = tempfile::tempdir().unwrap();
        let binary = failing_iptables(
            dir.path(),
            "iptables: Bad rule (does a matching rule exist in that chain?).",
        );
        let target = mac("00:11:22:33:44:55");

        let tolerant = IptablesController::new(FirewallConfig {
            binary: binary.clone(),
            ..FirewallConfig::default()
        });
        tolerant.delete_accept(&target).await.unwrap();

        let strict = IptablesController::new(FirewallConfig {
            binary,
            tolerate_missing_rule: false,
            ..FirewallConfig::default()
        });
        match strict.delete_accept(&target).await {
            Err(FacilityError::Exited { code, stderr }) => {
                assert_eq!(code, Some(1));
                assert!(stderr.contains(MISSING_RULE_MARKER));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        // Inserts never get the tolerance
        assert!(tolerant.insert_accept(&target).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_other_delete_failures_still_fail() {
        let dir = tempfile::tempdir().unwrap();
        let binary = failing_iptables(dir.path(), "iptables v1.8.7: Permission denied (you must be root)");
        let controller = IptablesController::new(FirewallConfig {
            binary,
            ..FirewallConfig::default()
        });

        let err = controller.delete_accept(&mac("00:11:22:33:44:55")).await.unwrap_err();
        assert!(matches!(err, FacilityError::Exited { code: Some(1), .. }));
    }

    #[test]
    fn test_facility_error_message_leaves_cause_to_source() {
        let err = NetworkError::Facility {
            action: NetworkAction::Block,
            mac_address: mac("00:11:22:33:44:55"),
            cause: FacilityError::Unavailable("offline".to_string()),
        };

        assert_eq!(err.to_string(), "Failed to block network access for 00:11:22:33:44:55");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "Firewall unavailable: offline");
    }

    #[test]
    fn test_iptables_command_line() {
        let controller = IptablesController::new(FirewallConfig::default());
        let (program, args) = controller.command_line("-I", &mac("aa-bb-cc-dd-ee-ff"));

        assert_eq!(program, "iptables");
        assert_eq!(
            args,
            [
                "-t", "nat", "-I", "PREROUTING", "-m", "mac", "--mac-source",
                "AA:BB:CC:DD:EE:FF", "-j", "ACCEPT"
            ]
        );
    }

    #[test]
    fn test_iptables_command_line_with_sudo() {
        let config = FirewallConfig {
            use_sudo: true,
            binary: "/usr/sbin/iptables".to_string(),
            ..FirewallConfig::default()
        };
        let controller = IptablesController::new(config);
        let (program, args) = controller.command_line("-D", &mac("01:02:03:04:05:06"));

        assert_eq!(program, "sudo");
        assert_eq!(args[0], "/usr/sbin/iptables");
        assert_eq!(args[3], "-D");
        assert_eq!(args[8], "01:02:03:04:05:06");
    }

    #[tokio::test]
    async fn test_missing_binary_surfaces_as_facility_error() {
        let config = FirewallConfig {
            binary: "/nonexistent/netgate-iptables".to_string(),
            ..FirewallConfig::default()
        };
        let sync = NetworkAccessSynchronizer::new(Arc::new(IptablesController::new(config)));

        let err = sync.apply(NetworkAction::Allow, "00:11:22:33:44:55").await.unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Facility { cause: FacilityError::Spawn(_), .. }
        ));
    }
}
