//! Session-scoped execution context: owns the device driver, lazily built
//! named resources, and the fatal error channel.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::backend::driver::DeviceDriver;
use crate::backend::spec::{BackendError, BackendResult, ContextError, ErrorKind};
use crate::env;

type Resource = Arc<dyn Any + Send + Sync>;

pub struct ExecutionContext {
    driver: Arc<dyn DeviceDriver>,
    resources: Mutex<HashMap<String, Resource>>,
    error: Mutex<Option<ContextError>>,
}

impl ExecutionContext {
    pub fn new(driver: Arc<dyn DeviceDriver>) -> Self {
        let toggles = env::compiler_toggles();
        log::debug!(
            "execution context on driver '{}': compute_intensive_fuse={} stitch={} shape_constraint_ir={}",
            driver.name(),
            toggles.compute_intensive_fuse,
            toggles.stitch,
            toggles.shape_constraint_ir
        );
        Self {
            driver,
            resources: Mutex::new(HashMap::new()),
            error: Mutex::new(None),
        }
    }

    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    /// Returns the resource registered under `name`, constructing it with
    /// `factory` on first use. The factory runs at most once per name.
    pub fn get_or_create_resource<T, F>(&self, name: &str, factory: F) -> BackendResult<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut resources = self
            .resources
            .lock()
            .map_err(|_| BackendError::execution("execution context resource mutex poisoned"))?;
        let resource = resources
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(factory()) as Resource);
        Arc::clone(resource)
            .downcast::<T>()
            .map_err(|_| BackendError::ResourceType {
                name: name.to_string(),
            })
    }

    pub fn has_resource(&self, name: &str) -> bool {
        self.resources
            .lock()
            .map(|resources| resources.contains_key(name))
            .unwrap_or(false)
    }

    /// Records a fatal diagnostic for the current execution. The first error wins.
    pub fn signal_error(&self, kind: ErrorKind, message: impl Into<String>) {
        let message = message.into();
        log::error!("execution context error ({kind:?}): {message}");
        if let Ok(mut slot) = self.error.lock() {
            if slot.is_none() {
                *slot = Some(ContextError { kind, message });
            }
        }
    }

    /// `Err` once an error has been signalled.
    pub fn status(&self) -> Result<(), ContextError> {
        match self.error.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            },
            Err(_) => Err(ContextError {
                kind: ErrorKind::Failure,
                message: "execution context error mutex poisoned".to_string(),
            }),
        }
    }

    /// Clears and returns the recorded error so the context can run again.
    pub fn take_error(&self) -> Option<ContextError> {
        self.error.lock().ok().and_then(|mut slot| slot.take())
    }
}
