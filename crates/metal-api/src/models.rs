//! Data models for metal-api

use chrono::{DateTime, Utc};
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Persisted machine record, keyed by machine ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: String,
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub hardware: Hardware,
    /// Switch ports this machine's NICs are wired to
    #[serde(default)]
    pub connections: Vec<SwitchConnection>,
    /// Present once an operator allocated the machine
    #[serde(default)]
    pub allocation: Option<Allocation>,
    /// Diagnostic flag: some replica holds (or held) a wait stream for this machine
    #[serde(default)]
    pub waiting: bool,
    pub created_at: DateTime<Utc>,
    pub changed_at: DateTime<Utc>,
}

impl MachineRecord {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            partition: String::new(),
            hardware: Hardware::default(),
            connections: Vec::new(),
            allocation: None,
            waiting: false,
            created_at: now,
            changed_at: now,
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.allocation.is_some()
    }

    /// Merge switch connections keyed by switch and NIC MAC. A NIC already
    /// wired to the given switch keeps its existing entry.
    ///
    /// Returns the number of newly attached connections.
    pub fn attach_connections(&mut self, connections: &[SwitchConnection]) -> usize {
        let mut added = 0;
        for conn in connections {
            let known = self
                .connections
                .iter()
                .any(|c| c.switch_id == conn.switch_id && c.nic_mac == conn.nic_mac);
            if !known {
                self.connections.push(conn.clone());
                added += 1;
            }
        }
        added
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hardware {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    #[serde(default)]
    pub nics: Vec<Nic>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nic {
    pub name: String,
    pub mac: MacAddr6,
}

/// A NIC-to-switch-port wiring observed during registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchConnection {
    pub switch_id: String,
    pub port: String,
    pub nic_mac: MacAddr6,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub project: String,
    pub hostname: String,
    pub image: String,
    #[serde(default)]
    pub vrf: Option<u32>,
    /// Allocation is a reinstall of an existing installation
    #[serde(default)]
    pub reinstall: bool,
    /// Set by the machine's final report
    #[serde(default)]
    pub succeeded: bool,
    #[serde(default)]
    pub report_message: Option<String>,
    pub allocated_at: DateTime<Utc>,
}

impl From<AllocateRequest> for Allocation {
    fn from(req: AllocateRequest) -> Self {
        Self {
            project: req.project,
            hostname: req.hostname,
            image: req.image,
            vrf: req.vrf,
            reinstall: req.reinstall,
            succeeded: false,
            report_message: None,
            allocated_at: Utc::now(),
        }
    }
}

/// Broadcast to every replica when a machine gets allocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationEvent {
    pub machine_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProvisioningEventKind {
    Registered,
    Allocated,
    Provisioned,
    Failed,
    ReinstallAborted,
}

/// Provisioning lifecycle entry appended by the machine flows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningEvent {
    pub kind: ProvisioningEventKind,
    #[serde(default)]
    pub message: String,
    pub time: DateTime<Utc>,
}

impl ProvisioningEvent {
    pub fn new(kind: ProvisioningEventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            time: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub hardware: Hardware,
    #[serde(default)]
    pub connections: Vec<SwitchConnection>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AllocateRequest {
    pub project: String,
    pub hostname: String,
    pub image: String,
    #[serde(default)]
    pub vrf: Option<u32>,
    #[serde(default)]
    pub reinstall: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportRequest {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(switch: &str, port: &str, nic: u8) -> SwitchConnection {
        SwitchConnection {
            switch_id: switch.to_string(),
            port: port.to_string(),
            nic_mac: MacAddr6::new(0x00, 0xde, 0x11, 0x64, 0x00, nic),
        }
    }

    #[test]
    fn test_attach_connections_dedupes() {
        let mut record = MachineRecord::new("m1");
        assert_eq!(
            record.attach_connections(&[conn("leaf01", "swp1", 1), conn("leaf02", "swp1", 1)]),
            2
        );
        // Same NIC on a known switch keeps the first port.
        assert_eq!(
            record.attach_connections(&[conn("leaf01", "swp9", 1), conn("leaf01", "swp2", 2)]),
            1
        );
        assert_eq!(record.connections.len(), 3);
        assert_eq!(record.connections[0].port, "swp1");
    }

    #[test]
    fn test_record_deserialize_defaults() {
        let json = r#"{
            "id": "m1",
            "created_at": "2024-01-01T00:00:00Z",
            "changed_at": "2024-01-01T00:00:00Z"
        }"#;
        let record: MachineRecord = serde_json::from_str(json).unwrap();
        assert!(!record.is_allocated());
        assert!(!record.waiting);
        assert!(record.connections.is_empty());
    }

    #[test]
    fn test_event_kind_strings() {
        assert_eq!(ProvisioningEventKind::ReinstallAborted.to_string(), "reinstall_aborted");
        assert_eq!(
            "allocated".parse::<ProvisioningEventKind>().unwrap(),
            ProvisioningEventKind::Allocated
        );
    }
}
