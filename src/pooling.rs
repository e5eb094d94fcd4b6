//! Partitioning devices into pools.
//!
//! Every device lands in exactly one pool. A device the strategy cannot
//! place is a configuration error, as is a duplicated serial.
//!
//! | Strategy | Pool names |
//! |----------|------------|
//! | omni | `omni` |
//! | manual | as configured |
//! | tablet | `tablets`, `phones` |
//! | capability | `<characteristic>-<lo>..<hi>`, or `<characteristic>-<v>` for a single value |
//! | per-device | the device serial |

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::config::{Characteristic, ConfigError, PoolingConfig};
use crate::device::{Device, DevicePool};

/// Groups `devices` into pools according to `strategy`.
///
/// Empty pools are never returned.
pub fn partition(
    devices: Vec<Device>,
    strategy: &PoolingConfig,
) -> Result<Vec<DevicePool>, ConfigError> {
    let mut seen = BTreeSet::new();
    for device in &devices {
        if !seen.insert(device.id().clone()) {
            return Err(ConfigError::DuplicateDevice(device.id().to_string()));
        }
    }
    if devices.is_empty() {
        return Err(ConfigError::NoPools(
            "the device provider returned no devices".to_string(),
        ));
    }

    let pools = match strategy {
        PoolingConfig::Omni => vec![DevicePool::new("omni", devices)],
        PoolingConfig::Manual { pools } => manual(devices, pools)?,
        PoolingConfig::Tablet => {
            let (tablets, phones): (Vec<_>, Vec<_>) =
                devices.into_iter().partition(Device::is_tablet);
            vec![
                DevicePool::new("tablets", tablets),
                DevicePool::new("phones", phones),
            ]
        }
        PoolingConfig::Capability {
            characteristic: Characteristic::PlatformVersion,
            buckets,
        } => by_characteristic(
            devices,
            Characteristic::PlatformVersion,
            *buckets,
            |d| d.platform_version,
            |v| v.to_string(),
        ),
        PoolingConfig::Capability {
            characteristic: Characteristic::Display,
            buckets,
        } => by_characteristic(
            devices,
            Characteristic::Display,
            *buckets,
            |d| d.display,
            |c| c.as_str().to_string(),
        ),
        PoolingConfig::PerDevice => devices
            .into_iter()
            .map(|d| DevicePool::new(d.id().to_string(), vec![d]))
            .collect(),
    };

    let pools: Vec<DevicePool> = pools.into_iter().filter(|p| !p.is_empty()).collect();
    if pools.is_empty() {
        return Err(ConfigError::NoPools(
            "the pooling strategy produced no pools".to_string(),
        ));
    }
    Ok(pools)
}

fn manual(
    devices: Vec<Device>,
    pools: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<DevicePool>, ConfigError> {
    let mut owner: BTreeMap<&str, &str> = BTreeMap::new();
    for (pool, serials) in pools {
        for serial in serials {
            if let Some(previous) = owner.insert(serial.as_str(), pool.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "device {} is listed in pools {} and {}",
                    serial, previous, pool
                )));
            }
        }
    }

    let mut members: BTreeMap<&str, Vec<Device>> = BTreeMap::new();
    for device in devices {
        let Some(pool) = owner.get(device.id().as_str()) else {
            return Err(ConfigError::NoPoolMatched {
                device: device.id().to_string(),
            });
        };
        members.entry(*pool).or_default().push(device);
    }

    for pool in pools.keys() {
        if !members.contains_key(pool.as_str()) {
            warn!("Pool {} has no available devices and will be skipped", pool);
        }
    }

    Ok(members
        .into_iter()
        .map(|(pool, devices)| DevicePool::new(pool.to_string(), devices))
        .collect())
}

/// Splits the distinct values of a characteristic into at most `buckets`
/// contiguous ranges of roughly equal size.
fn by_characteristic<K, F, L>(
    devices: Vec<Device>,
    characteristic: Characteristic,
    buckets: usize,
    key: F,
    label: L,
) -> Vec<DevicePool>
where
    K: Ord + Copy,
    F: Fn(&Device) -> K,
    L: Fn(K) -> String,
{
    let values: Vec<K> = devices.iter().map(&key).collect::<BTreeSet<_>>().into_iter().collect();
    let buckets = buckets.clamp(1, values.len().max(1));
    let per_bucket = values.len().div_ceil(buckets).max(1);

    values
        .chunks(per_bucket)
        .map(|range| {
            let (lo, hi) = (range[0], range[range.len() - 1]);
            let name = if lo == hi {
                format!("{}-{}", characteristic.as_str(), label(lo))
            } else {
                format!("{}-{}..{}", characteristic.as_str(), label(lo), label(hi))
            };
            let members = devices
                .iter()
                .filter(|d| (lo..=hi).contains(&key(*d)))
                .cloned()
                .collect();
            DevicePool::new(name, members)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DisplayClass;

    fn fleet() -> Vec<Device> {
        vec![
            Device::new("p1").with_platform_version(28),
            Device::new("p2").with_platform_version(30),
            Device::new("t1")
                .with_platform_version(33)
                .with_display(DisplayClass::Tablet),
            Device::new("p3").with_platform_version(34),
        ]
    }

    fn shape(pools: &[DevicePool]) -> Vec<(String, usize)> {
        pools
            .iter()
            .map(|p| (p.id().to_string(), p.len()))
            .collect()
    }

    #[test]
    fn test_omni_and_per_device() {
        let omni = partition(fleet(), &PoolingConfig::Omni).unwrap();
        assert_eq!(shape(&omni), vec![("omni".to_string(), 4)]);

        let single = partition(fleet(), &PoolingConfig::PerDevice).unwrap();
        assert_eq!(single.len(), 4);
        assert!(single.iter().all(|p| p.len() == 1));
    }

    #[test]
    fn test_tablet_split() {
        let pools = partition(fleet(), &PoolingConfig::Tablet).unwrap();
        assert_eq!(
            shape(&pools),
            vec![("tablets".to_string(), 1), ("phones".to_string(), 3)]
        );
    }

    #[test]
    fn test_tablet_split_drops_empty_pool() {
        let phones = vec![Device::new("a"), Device::new("b")];
        let pools = partition(phones, &PoolingConfig::Tablet).unwrap();
        assert_eq!(shape(&pools), vec![("phones".to_string(), 2)]);
    }

    #[test]
    fn test_capability_platform_version_buckets() {
        let strategy = PoolingConfig::Capability {
            characteristic: Characteristic::PlatformVersion,
            buckets: 2,
        };
        let pools = partition(fleet(), &strategy).unwrap();
        assert_eq!(
            shape(&pools),
            vec![
                ("platform_version-28..30".to_string(), 2),
                ("platform_version-33..34".to_string(), 2)
            ]
        );
    }

    #[test]
    fn test_capability_display_respects_bucket_count() {
        let devices = vec![
            Device::new("phone"),
            Device::new("tab").with_display(DisplayClass::Tablet),
            Device::new("watch").with_display(DisplayClass::Watch),
        ];

        let one = PoolingConfig::Capability {
            characteristic: Characteristic::Display,
            buckets: 1,
        };
        let pools = partition(devices.clone(), &one).unwrap();
        assert_eq!(shape(&pools), vec![("display-phone..watch".to_string(), 3)]);

        let two = PoolingConfig::Capability {
            characteristic: Characteristic::Display,
            buckets: 2,
        };
        let pools = partition(devices, &two).unwrap();
        assert_eq!(
            shape(&pools),
            vec![
                ("display-phone..tablet".to_string(), 2),
                ("display-watch".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_capability_display() {
        let strategy = PoolingConfig::Capability {
            characteristic: Characteristic::Display,
            buckets: 2,
        };
        let pools = partition(fleet(), &strategy).unwrap();
        assert_eq!(
            shape(&pools),
            vec![
                ("display-phone".to_string(), 3),
                ("display-tablet".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_manual_unmatched_device_is_error() {
        let strategy = PoolingConfig::Manual {
            pools: BTreeMap::from([
                ("old".to_string(), vec!["p1".to_string(), "p2".to_string()]),
                ("new".to_string(), vec!["t1".to_string()]),
            ]),
        };
        let err = partition(fleet(), &strategy).unwrap_err();
        assert!(matches!(err, ConfigError::NoPoolMatched { device } if device == "p3"));
    }

    #[test]
    fn test_manual_pools() {
        let strategy = PoolingConfig::Manual {
            pools: BTreeMap::from([
                ("old".to_string(), vec!["p1".to_string(), "p2".to_string()]),
                (
                    "new".to_string(),
                    vec!["t1".to_string(), "p3".to_string(), "missing".to_string()],
                ),
            ]),
        };
        let pools = partition(fleet(), &strategy).unwrap();
        assert_eq!(
            shape(&pools),
            vec![("new".to_string(), 2), ("old".to_string(), 2)]
        );
    }

    #[test]
    fn test_duplicate_serial_rejected() {
        let devices = vec![Device::new("a"), Device::new("a")];
        assert!(matches!(
            partition(devices, &PoolingConfig::Omni),
            Err(ConfigError::DuplicateDevice(serial)) if serial == "a"
        ));
    }

    #[test]
    fn test_no_devices() {
        assert!(matches!(
            partition(Vec::new(), &PoolingConfig::Omni),
            Err(ConfigError::NoPools(_))
        ));
    }
}
