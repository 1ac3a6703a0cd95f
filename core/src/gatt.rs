//! Capability model shared by both coordinator roles
//!
//! Services own characteristics, characteristics own descriptors. A service
//! whose characteristics have not been enumerated yet carries `None`, which is
//! distinct from an enumerated service with no characteristics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Application protocol service UUID
pub const TARGET_SERVICE_UUID: Uuid = Uuid::from_u128(0x7A1E_0001_5C0D_4E2B_9F3A_1D6B_8C4E_2A10);

/// Application protocol characteristic UUID
pub const TARGET_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x7A1E_0002_5C0D_4E2B_9F3A_1D6B_8C4E_2A10);

/// Characteristic User Description descriptor (0x2901)
pub const USER_DESCRIPTION_UUID: Uuid = Uuid::from_u128(0x0000_2901_0000_1000_8000_0080_5F9B_34FB);

/// Transport identity of a remote responder, as seen by the initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub Uuid);

impl PeerId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport identity of a remote initiator, as seen by the responder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CentralId(pub Uuid);

impl CentralId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CentralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of a characteristic within its owning service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharRef {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Connection lifecycle of a discovered peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    /// Reconnect budget exhausted
    Unreachable,
}

/// Capability discovery progress of a connected peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiscoveryPhase {
    Idle,
    Services,
    Characteristics,
    Descriptors,
    Ready,
}

/// A remote responder seen during a scan/connect session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub advertised_services: Vec<Uuid>,
    pub state: ConnectionState,
    pub phase: DiscoveryPhase,
}

impl Peer {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            name: None,
            rssi: None,
            advertised_services: Vec::new(),
            state: ConnectionState::Discovered,
            phase: DiscoveryPhase::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Property {
    Broadcast,
    Read,
    WriteWithoutResponse,
    Write,
    Notify,
    Indicate,
    AuthenticatedSignedWrites,
    ExtendedProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    Readable,
    Writeable,
    ReadEncryptionRequired,
    WriteEncryptionRequired,
}

/// Declared characteristic properties
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties(BTreeSet<Property>);

impl Properties {
    pub fn has(&self, property: Property) -> bool {
        self.0.contains(&property)
    }

    pub fn iter(&self) -> impl Iterator<Item = Property> + '_ {
        self.0.iter().copied()
    }

    pub fn can_notify(&self) -> bool {
        self.has(Property::Notify) || self.has(Property::Indicate)
    }

    /// Read is the only declared property
    pub fn is_read_only(&self) -> bool {
        self.0.len() == 1 && self.has(Property::Read)
    }
}

impl<const N: usize> From<[Property; N]> for Properties {
    fn from(props: [Property; N]) -> Self {
        Self(props.into_iter().collect())
    }
}

/// Responder-side attribute permissions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions(BTreeSet<Permission>);

impl Permissions {
    pub fn has(&self, permission: Permission) -> bool {
        self.0.contains(&permission)
    }

    pub fn readable(&self) -> bool {
        self.has(Permission::Readable) || self.has(Permission::ReadEncryptionRequired)
    }

    pub fn writeable(&self) -> bool {
        self.has(Permission::Writeable) || self.has(Permission::WriteEncryptionRequired)
    }
}

impl<const N: usize> From<[Permission; N]> for Permissions {
    fn from(perms: [Permission; N]) -> Self {
        Self(perms.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptorValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl DescriptorValue {
    /// Interpret raw descriptor bytes, preferring UTF-8 text
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => DescriptorValue::Text(text),
            Err(e) => DescriptorValue::Bytes(e.into_bytes()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            DescriptorValue::Text(t) => Some(t),
            DescriptorValue::Bytes(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub value: Option<DescriptorValue>,
}

impl Descriptor {
    pub fn user_description(text: impl Into<String>) -> Self {
        Self {
            uuid: USER_DESCRIPTION_UUID,
            value: Some(DescriptorValue::Text(text.into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub properties: Properties,
    /// Only meaningful for locally published characteristics
    pub permissions: Permissions,
    /// Cached value; on the responder side a value here makes the characteristic static
    pub value: Option<Vec<u8>>,
    pub description: Option<String>,
    pub notifying: bool,
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    pub fn new(uuid: Uuid, properties: impl Into<Properties>) -> Self {
        Self {
            uuid,
            properties: properties.into(),
            permissions: Permissions::default(),
            value: None,
            description: None,
            notifying: false,
            descriptors: Vec::new(),
        }
    }

    pub fn with_permissions(mut self, permissions: impl Into<Permissions>) -> Self {
        self.permissions = permissions.into();
        self
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_descriptor(mut self, descriptor: Descriptor) -> Self {
        if descriptor.uuid == USER_DESCRIPTION_UUID {
            if let Some(text) = descriptor.value.as_ref().and_then(|v| v.as_text()) {
                self.description = Some(text.to_string());
            }
        }
        self.descriptors.push(descriptor);
        self
    }

    pub fn descriptor(&self, uuid: &Uuid) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| &d.uuid == uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub uuid: Uuid,
    pub primary: bool,
    /// `None` until enumerated
    pub characteristics: Option<Vec<Characteristic>>,
    /// UUIDs of included services
    pub included: Vec<Uuid>,
}

impl Service {
    /// A service whose characteristics are not yet known
    pub fn provisional(uuid: Uuid, primary: bool) -> Self {
        Self {
            uuid,
            primary,
            characteristics: None,
            included: Vec::new(),
        }
    }

    pub fn new(uuid: Uuid, primary: bool, characteristics: Vec<Characteristic>) -> Self {
        Self {
            uuid,
            primary,
            characteristics: Some(characteristics),
            included: Vec::new(),
        }
    }

    pub fn with_included(mut self, included: Uuid) -> Self {
        self.included.push(included);
        self
    }

    pub fn characteristics(&self) -> &[Characteristic] {
        self.characteristics.as_deref().unwrap_or(&[])
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics().iter().find(|c| &c.uuid == uuid)
    }

    pub fn characteristic_mut(&mut self, uuid: &Uuid) -> Option<&mut Characteristic> {
        self.characteristics
            .as_mut()
            .and_then(|chars| chars.iter_mut().find(|c| &c.uuid == uuid))
    }
}

/// Scan session parameters; replaced wholesale on restart
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Empty means any service
    pub services: Vec<Uuid>,
    pub allow_duplicates: bool,
    pub solicited_services: Vec<Uuid>,
}

impl ScanFilter {
    pub fn for_service(service: Uuid) -> Self {
        Self {
            services: vec![service],
            ..Default::default()
        }
    }

    pub fn matches(&self, advertised: &[Uuid]) -> bool {
        self.services.is_empty() || self.services.iter().any(|s| advertised.contains(s))
    }
}
