use std::{fmt, str::FromStr};

use candle_core::Device;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{select_best_device, Error, Result};

/// Which compute devices model replicas are placed on.
///
/// Parsed from `cpu`, `cpu:N` (N CPU replicas), `cuda:0,1,2,3`,
/// `metal:0` or a bare ordinal list `0,1`. Bare ordinals go to the best
/// accelerator compiled in and fall back to CPU; a named backend is used
/// as given.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu { replicas: usize },
    Ordinals(Vec<usize>),
    Cuda(Vec<usize>),
    Metal(Vec<usize>),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinals(vec![0])
    }
}

impl DeviceMap {
    /// Number of device replicas, i.e. the width of one sampling round.
    pub fn len(&self) -> usize {
        match self {
            Self::ForceCpu { replicas } => *replicas,
            Self::Ordinals(ordinals) | Self::Cuda(ordinals) | Self::Metal(ordinals) => {
                ordinals.len()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Instantiates one candle device per replica.
    pub fn devices(&self) -> Result<Vec<Device>> {
        if self.is_empty() {
            return Err(Error::Config("device map must name at least one device".into()));
        }
        match self {
            Self::ForceCpu { replicas } => Ok(vec![Device::Cpu; *replicas]),
            Self::Ordinals(ordinals) => ordinals
                .iter()
                .map(|&ordinal| select_best_device(ordinal).map_err(Error::from))
                .collect(),
            Self::Cuda(ordinals) => ordinals
                .iter()
                .map(|&ordinal| Device::new_cuda(ordinal).map_err(Error::from))
                .collect(),
            Self::Metal(ordinals) => ordinals
                .iter()
                .map(|&ordinal| Device::new_metal(ordinal).map_err(Error::from))
                .collect(),
        }
    }
}

impl FromStr for DeviceMap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || Error::Config(format!("invalid device map `{s}`"));
        if s == "cpu" {
            return Ok(Self::ForceCpu { replicas: 1 });
        }
        if let Some(count) = s.strip_prefix("cpu:") {
            let replicas = count.parse::<usize>().map_err(|_| invalid())?;
            if replicas == 0 {
                return Err(invalid());
            }
            return Ok(Self::ForceCpu { replicas });
        }
        let parse_list = |list: &str| {
            list.split(',')
                .map(|o| o.trim().parse::<usize>().map_err(|_| invalid()))
                .collect::<Result<Vec<_>>>()
        };
        if let Some(list) = s.strip_prefix("cuda:") {
            return Ok(Self::Cuda(parse_list(list)?));
        }
        if let Some(list) = s.strip_prefix("metal:") {
            return Ok(Self::Metal(parse_list(list)?));
        }
        Ok(Self::Ordinals(parse_list(s)?))
    }
}

fn join(ordinals: &[usize]) -> String {
    ordinals
        .iter()
        .map(|o| o.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForceCpu { replicas: 1 } => write!(f, "cpu"),
            Self::ForceCpu { replicas } => write!(f, "cpu:{replicas}"),
            Self::Ordinals(ordinals) => write!(f, "{}", join(ordinals)),
            Self::Cuda(ordinals) => write!(f, "cuda:{}", join(ordinals)),
            Self::Metal(ordinals) => write!(f, "metal:{}", join(ordinals)),
        }
    }
}

impl Serialize for DeviceMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpu_replicas() {
        assert_eq!("cpu".parse::<DeviceMap>().unwrap(), DeviceMap::ForceCpu { replicas: 1 });
        assert_eq!("cpu:4".parse::<DeviceMap>().unwrap(), DeviceMap::ForceCpu { replicas: 4 });
        assert!("cpu:0".parse::<DeviceMap>().is_err());
    }

    #[test]
    fn parses_ordinal_lists() {
        let map: DeviceMap = "cuda:0,1,2,3".parse().unwrap();
        assert_eq!(map, DeviceMap::Cuda(vec![0, 1, 2, 3]));
        assert_eq!(map.len(), 4);
        assert_eq!("1,2".parse::<DeviceMap>().unwrap(), DeviceMap::Ordinals(vec![1, 2]));
        assert!("cuda:a".parse::<DeviceMap>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for s in ["cpu", "cpu:3", "cuda:0,2", "metal:0", "1,2"] {
            assert_eq!(s.parse::<DeviceMap>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn cpu_map_builds_one_device_per_replica() {
        let devices = DeviceMap::ForceCpu { replicas: 3 }.devices().unwrap();
        assert_eq!(devices.len(), 3);
        assert!(devices.iter().all(|d| matches!(d, Device::Cpu)));
    }

    #[test]
    fn named_backend_is_kept() {
        assert_eq!("metal:1".parse::<DeviceMap>().unwrap(), DeviceMap::Metal(vec![1]));
        let yaml = serde_yaml::to_string(&DeviceMap::Metal(vec![0])).unwrap();
        assert_eq!(serde_yaml::from_str::<DeviceMap>(&yaml).unwrap(), DeviceMap::Metal(vec![0]));
        assert!("metal:".parse::<DeviceMap>().is_err());
    }
}
