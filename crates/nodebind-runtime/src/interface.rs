use std::any::Any;
use std::collections::HashMap;

use crate::error::{BinderError, Result};
use crate::proxy::Proxy;

/// A typed client view over a [`Proxy`], as generated glue would define it.
pub trait Interface: Sized + Send + 'static {
    /// Descriptor carried in binder URIs and checked on conversion.
    const DESCRIPTOR: &'static str;

    fn from_proxy(proxy: Proxy) -> Self;
}

/// Interface descriptor to typed proxy factory, filled in at startup.
#[derive(Default)]
pub struct InterfaceRegistry {
    factories: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<I: Interface>(&mut self) -> &mut Self {
        let factory: fn(Proxy) -> I = I::from_proxy;
        self.factories.insert(I::DESCRIPTOR, Box::new(factory));
        self
    }

    pub fn contains(&self, descriptor: &str) -> bool {
        self.factories.contains_key(descriptor)
    }

    pub fn descriptors(&self) -> Vec<&'static str> {
        let mut descriptors: Vec<&'static str> = self.factories.keys().copied().collect();
        descriptors.sort_unstable();
        descriptors
    }

    /// Turn `proxy` into the typed interface `I`.
    ///
    /// Fails if `I` was never registered or the proxy advertises a different
    /// interface.
    pub fn as_interface<I: Interface>(&self, proxy: Proxy) -> Result<I> {
        if let Some(descriptor) = proxy.descriptor() {
            if descriptor != I::DESCRIPTOR {
                return Err(BinderError::LocalDispatch(format!(
                    "{} implements {descriptor}, not {}",
                    proxy.uri(),
                    I::DESCRIPTOR
                )));
            }
        }
        let factory = self
            .factories
            .get(I::DESCRIPTOR)
            .and_then(|factory| factory.downcast_ref::<fn(Proxy) -> I>())
            .ok_or_else(|| {
                BinderError::LocalDispatch(format!("unknown interface {}", I::DESCRIPTOR))
            })?;
        Ok(factory(proxy))
    }
}

impl std::fmt::Debug for InterfaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceRegistry")
            .field("descriptors", &self.descriptors())
            .finish()
    }
}
