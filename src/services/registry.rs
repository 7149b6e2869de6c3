use crate::db::models::{device_status, Device, DeviceChanges, NewDevice, DEFAULT_SAMPLING_INTERVAL_SECS};
use crate::db::store::{CascadeCounts, Store, StoreError};
use crate::utils::page_count;
use core::fmt;
use log::{info, warn};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const SIZE_PER_PAGE: i64 = 50;
pub const API_KEY_LEN: usize = 32;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    SuperAdmin,
}

/// Identity handed over by the authentication layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: i64,
    pub role: Role,
    pub active: bool,
}

impl Caller {
    pub fn operator(user_id: i64) -> Self {
        Caller {
            user_id,
            role: Role::SuperAdmin,
            active: true,
        }
    }

    fn may_manage(&self, device: &Device) -> bool {
        self.role == Role::SuperAdmin || device.owner_user_id == Some(self.user_id)
    }
}

#[derive(Debug)]
pub enum RegistryError {
    Inactive,
    Forbidden(String),
    NotFound(String),
    Invalid(String),
    Store(StoreError),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Inactive => write!(f, "caller account is inactive"),
            RegistryError::Forbidden(key) => write!(f, "not allowed to manage device {}", key),
            RegistryError::NotFound(key) => write!(f, "device {} not found", key),
            RegistryError::Invalid(msg) => write!(f, "invalid request: {}", msg),
            RegistryError::Store(e) => write!(f, "registry failed: {}", e),
        }
    }
}

impl Error for RegistryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RegistryError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(value: StoreError) -> Self {
        RegistryError::Store(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub name: String,
    pub location: String,
    pub sampling_interval_secs: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DevicePage {
    pub devices: Vec<Device>,
    pub page: i64,
    pub page_count: i64,
    pub size_per_page: i64,
}

/// 32 random alphanumeric characters.
pub fn generate_api_key() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LEN)
        .map(char::from)
        .collect()
}

fn ensure_active(caller: &Caller) -> Result<(), RegistryError> {
    if caller.active {
        Ok(())
    } else {
        warn!("Rejected registry request from inactive user {}", caller.user_id);
        Err(RegistryError::Inactive)
    }
}

fn validate_text(field: &str, value: &str) -> Result<(), RegistryError> {
    if value.trim().is_empty() {
        Err(RegistryError::Invalid(format!("{} must not be empty", field)))
    } else {
        Ok(())
    }
}

fn validate_interval(secs: i32) -> Result<(), RegistryError> {
    if secs > 0 {
        Ok(())
    } else {
        Err(RegistryError::Invalid(format!("sampling interval must be positive, got {}", secs)))
    }
}

fn validate_changes(changes: &DeviceChanges) -> Result<(), RegistryError> {
    if let Some(name) = &changes.name {
        validate_text("name", name)?;
    }
    if let Some(location) = &changes.location {
        validate_text("location", location)?;
    }
    if let Some(status) = &changes.status {
        if !device_status::is_valid(status) {
            return Err(RegistryError::Invalid(format!(
                "status must be {} or {}, got {}",
                device_status::ONLINE,
                device_status::OFFLINE,
                status
            )));
        }
    }
    if let Some(secs) = changes.sampling_interval_secs {
        validate_interval(secs)?;
    }
    Ok(())
}

/// Register a device owned by `caller` under a fresh API key. New devices
/// start offline.
pub fn register_device<S: Store>(
    store: &S,
    caller: &Caller,
    registration: &DeviceRegistration,
) -> Result<Device, RegistryError> {
    ensure_active(caller)?;
    validate_text("name", &registration.name)?;
    validate_text("location", &registration.location)?;
    let interval = registration
        .sampling_interval_secs
        .unwrap_or(DEFAULT_SAMPLING_INTERVAL_SECS);
    validate_interval(interval)?;

    let row = NewDevice {
        api_key: generate_api_key(),
        name: registration.name.trim().to_string(),
        location: registration.location.trim().to_string(),
        status: device_status::OFFLINE.to_string(),
        sampling_interval_secs: interval,
        owner_user_id: Some(caller.user_id),
    };
    let device = store.insert_device(&row)?;
    info!(
        "Registered device {} ({}) for user {}",
        device.id, device.name, caller.user_id
    );
    Ok(device)
}

/// Apply `changes` to the device. Runs as a unit for the device, so it is
/// ordered against concurrent ingests.
pub fn update_device<S: Store>(
    store: &S,
    caller: &Caller,
    api_key: &str,
    changes: &DeviceChanges,
) -> Result<Device, RegistryError> {
    ensure_active(caller)?;
    validate_changes(changes)?;

    store.in_device_unit(api_key, |unit| {
        let device = unit
            .find_device(api_key)?
            .ok_or_else(|| RegistryError::NotFound(api_key.to_string()))?;
        if !caller.may_manage(&device) {
            return Err(RegistryError::Forbidden(api_key.to_string()));
        }
        let updated = unit
            .update_device(api_key, changes)?
            .ok_or_else(|| RegistryError::NotFound(api_key.to_string()))?;
        info!("Updated device {} by user {}", updated.id, caller.user_id);
        Ok(updated)
    })
}

/// Delete the device with its readings and every derived row.
pub fn delete_device<S: Store>(store: &S, caller: &Caller, api_key: &str) -> Result<CascadeCounts, RegistryError> {
    ensure_active(caller)?;

    store.in_device_unit(api_key, |unit| {
        let device = unit
            .find_device(api_key)?
            .ok_or_else(|| RegistryError::NotFound(api_key.to_string()))?;
        if !caller.may_manage(&device) {
            return Err(RegistryError::Forbidden(api_key.to_string()));
        }
        let counts = unit.delete_device_cascade(api_key)?;
        info!(
            "Deleted device {} (readings={}, daily_averages={}) by user {}",
            device.id, counts.readings, counts.daily_averages, caller.user_id
        );
        Ok(counts)
    })
}

pub fn get_device<S: Store>(store: &S, api_key: &str) -> Result<Device, RegistryError> {
    store
        .device(api_key)?
        .ok_or_else(|| RegistryError::NotFound(api_key.to_string()))
}

/// List devices `SIZE_PER_PAGE` at a time; pages start at 1.
pub fn list_devices<S: Store>(store: &S, page: i64) -> Result<DevicePage, RegistryError> {
    if page < 1 {
        return Err(RegistryError::Invalid(format!("page must be at least 1, got {}", page)));
    }
    let (devices, total) = store.devices_page((page - 1) * SIZE_PER_PAGE, SIZE_PER_PAGE)?;
    Ok(DevicePage {
        devices,
        page,
        page_count: page_count(total, SIZE_PER_PAGE),
        size_per_page: SIZE_PER_PAGE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::models::reading::ReadingInput;
    use crate::services::ingest::ingest;
    use chrono::{TimeZone, Utc};

    fn admin(user_id: i64) -> Caller {
        Caller {
            user_id,
            role: Role::Admin,
            active: true,
        }
    }

    fn registration(name: &str) -> DeviceRegistration {
        DeviceRegistration {
            name: name.to_string(),
            location: "office".to_string(),
            sampling_interval_secs: None,
        }
    }

    fn reading(key: &str, day: u32) -> ReadingInput {
        ReadingInput {
            api_key: key.to_string(),
            pm2_5: Some(12.0),
            pm10: Some(20.0),
            co2: Some(700.0),
            tvoc: Some(80.0),
            humidity: Some(60.0),
            temperature: Some(25.0),
            timestamp: Utc.with_ymd_and_hms(2024, 7, day, 9, 0, 0).unwrap(),
        }
    }

    #[test]
    fn generated_keys_are_alphanumeric() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_eq!(a.len(), API_KEY_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn registration_defaults() {
        let store = MemoryStore::new();
        let device = register_device(&store, &admin(7), &registration("hall")).unwrap();
        assert_eq!(device.status, device_status::OFFLINE);
        assert_eq!(device.sampling_interval_secs, DEFAULT_SAMPLING_INTERVAL_SECS);
        assert_eq!(device.owner_user_id, Some(7));

        ingest(&store, &reading(&device.api_key, 1)).unwrap();
        assert_eq!(store.counts_for(&device.api_key).readings, 1);
    }

    #[test]
    fn registration_checks_caller_and_input() {
        let store = MemoryStore::new();
        let mut inactive = admin(7);
        inactive.active = false;
        assert!(matches!(
            register_device(&store, &inactive, &registration("hall")),
            Err(RegistryError::Inactive)
        ));
        assert!(matches!(
            register_device(&store, &admin(7), &registration("  ")),
            Err(RegistryError::Invalid(_))
        ));
        let mut zero = registration("hall");
        zero.sampling_interval_secs = Some(0);
        assert!(matches!(
            register_device(&store, &admin(7), &zero),
            Err(RegistryError::Invalid(_))
        ));
        assert_eq!(list_devices(&store, 1).unwrap().devices.len(), 0);
    }

    #[test]
    fn only_owner_or_super_admin_may_update() {
        let store = MemoryStore::new();
        let device = register_device(&store, &admin(7), &registration("hall")).unwrap();
        let changes = DeviceChanges {
            status: Some(device_status::ONLINE.to_string()),
            sampling_interval_secs: Some(30),
            ..Default::default()
        };

        assert!(matches!(
            update_device(&store, &admin(8), &device.api_key, &changes),
            Err(RegistryError::Forbidden(_))
        ));
        let updated = update_device(&store, &admin(7), &device.api_key, &changes).unwrap();
        assert_eq!(updated.status, "online");
        assert_eq!(updated.sampling_interval_secs, 30);
        assert_eq!(updated.name, "hall");

        let renamed = DeviceChanges {
            name: Some("lobby".to_string()),
            ..Default::default()
        };
        let updated = update_device(&store, &Caller::operator(1), &device.api_key, &renamed).unwrap();
        assert_eq!(updated.name, "lobby");
        assert_eq!(updated.status, "online");
        assert_eq!(get_device(&store, &device.api_key).unwrap().name, "lobby");
    }

    #[test]
    fn update_rejects_bad_values_and_unknown_devices() {
        let store = MemoryStore::new();
        let device = register_device(&store, &admin(7), &registration("hall")).unwrap();
        let bad = DeviceChanges {
            status: Some("sleeping".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            update_device(&store, &admin(7), &device.api_key, &bad),
            Err(RegistryError::Invalid(_))
        ));
        assert!(matches!(
            update_device(&store, &admin(7), "ghost", &DeviceChanges::default()),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn delete_cascades_to_every_projection() {
        let store = MemoryStore::new();
        let doomed = register_device(&store, &admin(7), &registration("hall")).unwrap();
        let kept = register_device(&store, &admin(7), &registration("kitchen")).unwrap();
        for day in [1, 1, 2] {
            ingest(&store, &reading(&doomed.api_key, day)).unwrap();
        }
        ingest(&store, &reading(&kept.api_key, 1)).unwrap();

        assert!(matches!(
            delete_device(&store, &admin(9), &doomed.api_key),
            Err(RegistryError::Forbidden(_))
        ));

        let counts = delete_device(&store, &admin(7), &doomed.api_key).unwrap();
        assert_eq!(
            counts,
            CascadeCounts {
                readings: 3,
                latest_readings: 1,
                latest_classifications: 1,
                daily_averages: 2,
                devices: 1,
            }
        );
        assert_eq!(store.counts_for(&doomed.api_key), CascadeCounts::default());
        assert_eq!(store.counts_for(&kept.api_key).readings, 1);
        assert_eq!(store.counts_for(&kept.api_key).latest_readings, 1);

        assert!(matches!(
            ingest(&store, &reading(&doomed.api_key, 3)),
            Err(crate::services::ingest::IngestError::InvalidApiKey(_))
        ));
        assert!(matches!(
            delete_device(&store, &admin(7), &doomed.api_key),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn single_device_lookup() {
        let store = MemoryStore::new();
        let device = register_device(&store, &admin(7), &registration("hall")).unwrap();

        let found = get_device(&store, &device.api_key).unwrap();
        assert_eq!(found.id, device.id);
        assert_eq!(found.location, "office");

        match get_device(&store, "ghost") {
            Err(RegistryError::NotFound(key)) => assert_eq!(key, "ghost"),
            other => panic!("expected NotFound, got {:?}", other),
        }
        delete_device(&store, &admin(7), &device.api_key).unwrap();
        assert!(matches!(
            get_device(&store, &device.api_key),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn devices_are_paged_fifty_at_a_time() {
        let store = MemoryStore::new();
        for i in 0..(SIZE_PER_PAGE + 3) {
            register_device(&store, &admin(1), &registration(&format!("dev {}", i))).unwrap();
        }
        let first = list_devices(&store, 1).unwrap();
        assert_eq!(first.devices.len(), SIZE_PER_PAGE as usize);
        assert_eq!(first.page_count, 2);
        assert_eq!(first.devices[0].name, "dev 0");

        let second = list_devices(&store, 2).unwrap();
        assert_eq!(second.devices.len(), 3);
        assert_eq!(second.devices[2].name, format!("dev {}", SIZE_PER_PAGE + 2));

        assert!(list_devices(&store, 3).unwrap().devices.is_empty());
        assert!(matches!(list_devices(&store, 0), Err(RegistryError::Invalid(_))));
    }
}
