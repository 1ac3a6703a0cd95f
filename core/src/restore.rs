//! State restoration after process relaunch
//!
//! When the platform relaunches the process to deliver a background radio
//! event, it hands back what each role was doing. Coordinators adopt these
//! snapshots with replace semantics and issue no start commands, since the
//! platform has already resumed scanning/advertising on their behalf.

use crate::gatt::{CentralId, CharRef, Peer, ScanFilter, Service};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Initiator state handed back by the platform
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoredCentral {
    /// Scan configuration the platform kept running
    pub scan_filter: Option<ScanFilter>,
    /// Peers the platform still tracks (connected or pending)
    pub peers: Vec<Peer>,
}

/// A subscriber the platform still remembers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredSubscription {
    pub central: CentralId,
    pub characteristic: CharRef,
    pub max_update_len: usize,
}

/// Responder state handed back by the platform
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoredPeripheral {
    pub services: Vec<Service>,
    pub subscriptions: Vec<RestoredSubscription>,
    pub advertising: bool,
}

/// Combined relaunch snapshot for both roles
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestorationSnapshot {
    pub central: Option<RestoredCentral>,
    pub peripheral: Option<RestoredPeripheral>,
}

impl RestorationSnapshot {
    pub fn is_empty(&self) -> bool {
        self.central.is_none() && self.peripheral.is_none()
    }

    pub fn from_json_str(json: &str) -> Result<Self, RestoreError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_string(&self) -> Result<String, RestoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RestoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), RestoreError> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    /// Split into the per-role parts consumed by each coordinator
    pub fn into_parts(self) -> (Option<RestoredCentral>, Option<RestoredPeripheral>) {
        (self.central, self.peripheral)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{
        Characteristic, PeerId, Permission, Property, TARGET_CHARACTERISTIC_UUID,
        TARGET_SERVICE_UUID,
    };

    fn sample() -> RestorationSnapshot {
        RestorationSnapshot {
            central: Some(RestoredCentral {
                scan_filter: Some(ScanFilter::for_service(TARGET_SERVICE_UUID)),
                peers: vec![Peer::new(PeerId::random())],
            }),
            peripheral: Some(RestoredPeripheral {
                services: vec![Service::new(
                    TARGET_SERVICE_UUID,
                    true,
                    vec![Characteristic::new(TARGET_CHARACTERISTIC_UUID, [Property::Notify])
                        .with_permissions([Permission::Readable])],
                )],
                subscriptions: vec![RestoredSubscription {
                    central: CentralId::random(),
                    characteristic: CharRef::new(TARGET_SERVICE_UUID, TARGET_CHARACTERISTIC_UUID),
                    max_update_len: 182,
                }],
                advertising: true,
            }),
        }
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let snapshot = sample();
        let json = snapshot.to_json_string().expect("serialize");
        let parsed = RestorationSnapshot::from_json_str(&json).expect("parse");
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_snapshot_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("restore.json");

        let snapshot = sample();
        snapshot.save(&path).expect("save");
        assert_eq!(RestorationSnapshot::load(&path).expect("load"), snapshot);
    }

    #[test]
    fn test_empty_snapshot() {
        assert!(RestorationSnapshot::default().is_empty());
        assert!(!sample().is_empty());
        let (central, peripheral) = sample().into_parts();
        assert!(central.is_some() && peripheral.is_some());
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(RestorationSnapshot::from_json_str("{ not json").is_err());
    }
}
