//! Kernel blocklist backed by nftables.
//!
//! # Responsibilities
//! - Create the `inet` table, the input chain and the timed `blocklist` set
//! - Install the drop rule for the set once
//! - Add source addresses with a per-element timeout
//!
//! # Design Decisions
//! - The `nft` binary is driven through scripts on stdin; the packet filter is
//!   a trait so the ruleset can be recorded in tests
//! - Calls block, callers run them on the blocking pool

use std::io::{self, Write};
use std::net::IpAddr;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use crate::firewall::FirewallError;

const CHAIN: &str = "input";
const SET: &str = "blocklist";

/// Something that can apply nft scripts and list chains.
pub trait PacketFilter: Send + Sync {
    fn apply(&self, script: &str) -> io::Result<()>;
    fn list_chain(&self, table: &str, chain: &str) -> io::Result<String>;
}

/// Runs the `nft` command line tool.
#[derive(Debug, Clone)]
pub struct NftCommand {
    binary: String,
}

impl NftCommand {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl PacketFilter for NftCommand {
    fn apply(&self, script: &str) -> io::Result<()> {
        let mut child = Command::new(&self.binary)
            .args(["-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(io::Error::other(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }

    fn list_chain(&self, table: &str, chain: &str) -> io::Result<String> {
        let output = Command::new(&self.binary)
            .args(["list", "chain", "inet", table, chain])
            .output()?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(io::Error::other(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }
}

pub struct KernelBlocklist {
    filter: Box<dyn PacketFilter>,
    table: String,
    enabled: bool,
    init_lock: Mutex<()>,
}

impl KernelBlocklist {
    pub fn new(filter: Box<dyn PacketFilter>, table: impl Into<String>) -> Self {
        Self {
            filter,
            table: table.into(),
            enabled: true,
            init_lock: Mutex::new(()),
        }
    }

    /// A blocklist that accepts every call and touches nothing.
    pub fn disabled() -> Self {
        Self {
            filter: Box::new(NftCommand::new("nft")),
            table: String::new(),
            enabled: false,
            init_lock: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Create table, chain and set, and the drop rule when it is missing.
    pub fn init(&self) -> Result<(), FirewallError> {
        if !self.enabled {
            return Ok(());
        }
        let _guard = self.init_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.apply(&self.setup_script())?;
        tracing::info!(table = %self.table, "Kernel blocklist initialized");
        Ok(())
    }

    /// Drop traffic from `ip` for `ttl`. When the drop rule has gone missing
    /// the ruleset is rebuilt in the same script as the insert.
    pub fn block(&self, ip: IpAddr, ttl: Duration) -> Result<(), FirewallError> {
        if !self.enabled {
            return Ok(());
        }
        let IpAddr::V4(v4) = ip else {
            return Err(FirewallError::UnsupportedAddress(ip));
        };

        let element = format!(
            "add element inet {} {SET} {{ {v4} timeout {}s }}\n",
            self.table,
            ttl.as_secs().max(1)
        );
        if self.rule_installed() {
            self.apply(&element)?;
        } else {
            let _guard = self.init_lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut script = self.setup_script();
            script.push_str(&element);
            self.apply(&script)?;
            tracing::info!(table = %self.table, "Kernel blocklist re-initialized");
        }
        tracing::info!(ip = %v4, ttl_secs = ttl.as_secs(), "Address added to kernel blocklist");
        Ok(())
    }

    fn setup_script(&self) -> String {
        let table = &self.table;
        let mut script = format!(
            "add table inet {table}\n\
             add chain inet {table} {CHAIN} {{ type filter hook input priority 0 ; }}\n\
             add set inet {table} {SET} {{ type ipv4_addr ; flags timeout ; }}\n"
        );
        if !self.rule_installed() {
            script.push_str(&format!("add rule inet {table} {CHAIN} ip saddr @{SET} drop\n"));
        }
        script
    }

    fn apply(&self, script: &str) -> Result<(), FirewallError> {
        self.filter
            .apply(script)
            .map_err(|e| FirewallError::Kernel(e.to_string()))
    }

    /// Whether the chain already carries the drop rule for the set.
    pub fn rule_installed(&self) -> bool {
        match self.filter.list_chain(&self.table, CHAIN) {
            Ok(listing) => listing.contains(&format!("@{SET}")),
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for KernelBlocklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelBlocklist")
            .field("table", &self.table)
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Records scripts and mimics the chain listing.
    #[derive(Default)]
    struct RecordingFilter {
        scripts: Arc<Mutex<Vec<String>>>,
    }

    impl PacketFilter for RecordingFilter {
        fn apply(&self, script: &str) -> io::Result<()> {
            self.scripts.lock().unwrap().push(script.to_string());
            Ok(())
        }

        fn list_chain(&self, _table: &str, _chain: &str) -> io::Result<String> {
            let scripts = self.scripts.lock().unwrap();
            if scripts.iter().any(|s| s.contains("add rule")) {
                Ok("chain input {\n ip saddr @blocklist drop\n}".to_string())
            } else {
                Err(io::Error::other("No such file or directory"))
            }
        }
    }

    fn blocklist() -> (KernelBlocklist, Arc<Mutex<Vec<String>>>) {
        let filter = RecordingFilter::default();
        let scripts = filter.scripts.clone();
        (KernelBlocklist::new(Box::new(filter), "waf_gateway"), scripts)
    }

    #[test]
    fn test_init_installs_rule_once() {
        let (blocklist, scripts) = blocklist();
        blocklist.init().unwrap();
        blocklist.init().unwrap();

        let scripts = scripts.lock().unwrap();
        assert_eq!(scripts.len(), 2);
        assert!(scripts[0].contains("add set inet waf_gateway blocklist { type ipv4_addr ; flags timeout ; }"));
        assert!(scripts[0].contains("add rule inet waf_gateway input ip saddr @blocklist drop"));
        assert!(!scripts[1].contains("add rule"));
    }

    #[test]
    fn test_block_initializes_missing_rule() {
        let (blocklist, scripts) = blocklist();
        blocklist
            .block("203.0.113.7".parse().unwrap(), Duration::from_secs(7200))
            .unwrap();

        let scripts = scripts.lock().unwrap();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].starts_with("add table inet waf_gateway\n"));
        assert!(scripts[0].contains("add rule inet waf_gateway input ip saddr @blocklist drop\n"));
        assert!(scripts[0].ends_with("add element inet waf_gateway blocklist { 203.0.113.7 timeout 7200s }\n"));
    }

    #[test]
    fn test_block_with_rule_present_only_inserts() {
        let (blocklist, scripts) = blocklist();
        blocklist.init().unwrap();
        blocklist
            .block("203.0.113.8".parse().unwrap(), Duration::from_secs(60))
            .unwrap();

        let scripts = scripts.lock().unwrap();
        assert_eq!(scripts.len(), 2);
        assert_eq!(scripts[1], "add element inet waf_gateway blocklist { 203.0.113.8 timeout 60s }\n");
    }

    #[test]
    fn test_ipv6_is_rejected() {
        let (blocklist, scripts) = blocklist();
        let result = blocklist.block("2001:db8::1".parse().unwrap(), Duration::from_secs(60));

        assert!(matches!(result, Err(FirewallError::UnsupportedAddress(_))));
        assert!(scripts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disabled_blocklist_is_inert() {
        let blocklist = KernelBlocklist::disabled();
        assert!(!blocklist.is_enabled());
        blocklist.init().unwrap();
        blocklist
            .block("198.51.100.1".parse().unwrap(), Duration::from_secs(1))
            .unwrap();
    }
}
