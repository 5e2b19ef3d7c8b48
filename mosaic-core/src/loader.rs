use candle_core::{DType, Device};
use tracing::info;

use crate::{error::boxed, effective_dtype, Error, ModelFiles, Result};

pub trait Loader {
    type Model: Send + Sync + 'static;

    /// Files the backend needs from the resolved source.
    const FILES: &'static [&'static str];

    fn load(files: &ModelFiles, dtype: DType, device: &Device) -> anyhow::Result<Self::Model>;
}

/// A loaded model with one replica per device.
pub struct ModelHandle<M: ?Sized> {
    identifier: String,
    revision: String,
    dtype: DType,
    replicas: Vec<Box<M>>,
}

impl<M: ?Sized> ModelHandle<M> {
    pub fn from_replicas(
        identifier: impl Into<String>,
        revision: impl Into<String>,
        dtype: DType,
        replicas: Vec<Box<M>>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            revision: revision.into(),
            dtype,
            replicas,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn replica(&self, index: usize) -> &M {
        &self.replicas[index]
    }

    /// Re-boxes every replica, typically into a trait object.
    pub fn boxed<T: ?Sized>(self, f: impl Fn(Box<M>) -> Box<T>) -> ModelHandle<T> {
        ModelHandle {
            identifier: self.identifier,
            revision: self.revision,
            dtype: self.dtype,
            replicas: self.replicas.into_iter().map(f).collect(),
        }
    }
}

impl<M: ?Sized> std::fmt::Debug for ModelHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("identifier", &self.identifier)
            .field("revision", &self.revision)
            .field("dtype", &self.dtype)
            .field("replicas", &self.replicas.len())
            .finish()
    }
}

/// Loads one replica of `L` onto every device.
pub fn load_replicated<L: Loader>(
    files: &ModelFiles,
    dtype: DType,
    devices: &[Device],
) -> Result<ModelHandle<L::Model>> {
    if devices.is_empty() {
        return Err(Error::Config("no devices to replicate onto".into()));
    }
    let mut replicas = Vec::with_capacity(devices.len());
    for (index, device) in devices.iter().enumerate() {
        let dtype = effective_dtype(dtype, device);
        let replica = L::load(files, dtype, device)
            .map_err(|e| Error::load(&files.identifier, boxed(e)))?;
        info!(model = %files.identifier, replica = index, ?dtype, "loaded replica");
        replicas.push(Box::new(replica));
    }
    Ok(ModelHandle::from_replicas(
        files.identifier.clone(),
        files.revision.clone(),
        dtype,
        replicas,
    ))
}
