//! Local legality rules for services before they reach the transport

use crate::error::CoordinatorError;
use crate::gatt::{Permission, Permissions, Property, Service};

/// Check `service` against the already `published` set.
///
/// A characteristic carrying a static value must be read-only: the read
/// property and the readable permission and nothing else. Broadcast and
/// extended properties cannot be hosted locally. Included services must
/// already be published.
pub fn validate_service(service: &Service, published: &[Service]) -> Result<(), CoordinatorError> {
    if published.iter().any(|s| s.uuid == service.uuid) {
        return Err(CoordinatorError::ServiceExists(service.uuid));
    }

    for c in service.characteristics() {
        if c.properties.has(Property::Broadcast) || c.properties.has(Property::ExtendedProperties) {
            return Err(CoordinatorError::UnsupportedProperty(c.uuid));
        }
        let read_only = c.properties.is_read_only()
            && c.permissions == Permissions::from([Permission::Readable]);
        if c.value.is_some() && !read_only {
            return Err(CoordinatorError::PropertiesMismatch(c.uuid));
        }
    }

    for included in &service.included {
        if !published.iter().any(|s| &s.uuid == included) {
            return Err(CoordinatorError::IncludedServiceNotPublished(*included));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{Characteristic, TARGET_CHARACTERISTIC_UUID, TARGET_SERVICE_UUID};
    use uuid::Uuid;

    fn with(c: Characteristic) -> Service {
        Service::new(TARGET_SERVICE_UUID, true, vec![c])
    }

    #[test]
    fn test_static_read_only_value_accepted() {
        let c = Characteristic::new(TARGET_CHARACTERISTIC_UUID, [Property::Read])
            .with_permissions([Permission::Readable])
            .with_value(b"v1".to_vec());
        assert!(validate_service(&with(c), &[]).is_ok());
    }

    #[test]
    fn test_static_value_with_write_rejected() {
        let c = Characteristic::new(TARGET_CHARACTERISTIC_UUID, [Property::Read, Property::Write])
            .with_permissions([Permission::Readable, Permission::Writeable])
            .with_value(b"v1".to_vec());
        assert_eq!(
            validate_service(&with(c), &[]),
            Err(CoordinatorError::PropertiesMismatch(TARGET_CHARACTERISTIC_UUID))
        );
    }

    #[test]
    fn test_static_value_with_write_permission_rejected() {
        let c = Characteristic::new(TARGET_CHARACTERISTIC_UUID, [Property::Read])
            .with_permissions([Permission::Readable, Permission::Writeable])
            .with_value(b"v1".to_vec());
        assert!(matches!(
            validate_service(&with(c), &[]),
            Err(CoordinatorError::PropertiesMismatch(_))
        ));
    }

    #[test]
    fn test_dynamic_writable_accepted() {
        let c = Characteristic::new(
            TARGET_CHARACTERISTIC_UUID,
            [Property::Read, Property::Write, Property::Notify],
        )
        .with_permissions([Permission::Readable, Permission::Writeable]);
        assert!(validate_service(&with(c), &[]).is_ok());
    }

    #[test]
    fn test_broadcast_and_extended_rejected() {
        for property in [Property::Broadcast, Property::ExtendedProperties] {
            let c = Characteristic::new(TARGET_CHARACTERISTIC_UUID, [Property::Read, property]);
            assert_eq!(
                validate_service(&with(c), &[]),
                Err(CoordinatorError::UnsupportedProperty(TARGET_CHARACTERISTIC_UUID))
            );
        }
    }

    #[test]
    fn test_included_must_be_published() {
        let base = Service::new(Uuid::new_v4(), false, vec![]);
        let outer = Service::new(TARGET_SERVICE_UUID, true, vec![]).with_included(base.uuid);

        assert_eq!(
            validate_service(&outer, &[]),
            Err(CoordinatorError::IncludedServiceNotPublished(base.uuid))
        );
        assert!(validate_service(&outer, &[base]).is_ok());
    }

    #[test]
    fn test_duplicate_uuid_rejected() {
        let svc = Service::new(TARGET_SERVICE_UUID, true, vec![]);
        assert_eq!(
            validate_service(&svc, std::slice::from_ref(&svc)),
            Err(CoordinatorError::ServiceExists(TARGET_SERVICE_UUID))
        );
    }
}
