//! Activator values, the loader seam, and the per-observer load cache.

use crate::element::{Disposer, Element};
use crate::instance::Instance;
use futures::future::{self, FutureExt, LocalBoxFuture, Shared};
use log::error;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

type ActivatorFn<E> = dyn Fn(&Instance<E>) -> anyhow::Result<Option<Disposer>>;

/// A loaded behavior. Invoked once per matching directive with the fresh
/// [`Instance`]; may hand back a disposer that runs on teardown.
pub struct Activator<E: Element> {
    run: Rc<ActivatorFn<E>>,
}

impl<E: Element> Activator<E> {
    pub fn new(run: impl Fn(&Instance<E>) -> anyhow::Result<Option<Disposer>> + 'static) -> Self {
        Self { run: Rc::new(run) }
    }

    /// Activator without a return value of its own; cleanup goes through
    /// [`Instance::auto_dispose`].
    pub fn from_fn(run: impl Fn(&Instance<E>) + 'static) -> Self {
        Self::new(move |instance| {
            run(instance);
            Ok(None)
        })
    }

    pub(crate) fn invoke(&self, instance: &Instance<E>) -> anyhow::Result<Option<Disposer>> {
        (self.run)(instance)
    }
}

impl<E: Element> Clone for Activator<E> {
    fn clone(&self) -> Self {
        Self {
            run: Rc::clone(&self.run),
        }
    }
}

impl<E: Element> fmt::Debug for Activator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activator").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("unknown activator '{0}'")]
    Unknown(String),
    #[error("failed to load activator '{name}': {message}")]
    Failed { name: String, message: String },
}

impl LoadError {
    pub fn failed(name: &str, message: impl fmt::Display) -> Self {
        Self::Failed {
            name: name.to_string(),
            message: message.to_string(),
        }
    }
}

pub type LoadFuture<E> = LocalBoxFuture<'static, Result<Activator<E>, LoadError>>;

/// Resolves an activator name. Need not deduplicate; the observer caches.
pub trait Loader<E: Element> {
    fn load(&self, name: &str) -> LoadFuture<E>;
}

impl<E, F, Fut> Loader<E> for F
where
    E: Element,
    F: Fn(&str) -> Fut,
    Fut: Future<Output = Result<Activator<E>, LoadError>> + 'static,
{
    fn load(&self, name: &str) -> LoadFuture<E> {
        self(name).boxed_local()
    }
}

/// Loader over activators registered up front; resolves immediately.
pub struct ActivatorCatalog<E: Element> {
    activators: HashMap<String, Activator<E>>,
}

impl<E: Element> ActivatorCatalog<E> {
    pub fn new() -> Self {
        Self {
            activators: HashMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, activator: Activator<E>) -> Self {
        self.register(name, activator);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, activator: Activator<E>) {
        self.activators.insert(name.into(), activator);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.activators.contains_key(name)
    }
}

impl<E: Element> Default for ActivatorCatalog<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Element> Loader<E> for ActivatorCatalog<E> {
    fn load(&self, name: &str) -> LoadFuture<E> {
        let result = self
            .activators
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::Unknown(name.to_string()));
        future::ready(result).boxed_local()
    }
}

pub(crate) type SharedLoad<E> = Shared<LoadFuture<E>>;

/// Name → shared load. Entries are never evicted, failures included.
pub(crate) struct ActivatorCache<E: Element> {
    loads: RefCell<HashMap<String, SharedLoad<E>>>,
}

impl<E: Element> ActivatorCache<E> {
    pub(crate) fn new() -> Self {
        Self {
            loads: RefCell::new(HashMap::new()),
        }
    }

    /// Returns the load for `name`, starting it through `loader` only when no
    /// load is cached yet.
    pub(crate) fn get_or_load(&self, name: &str, loader: &dyn Loader<E>) -> SharedLoad<E> {
        if let Some(load) = self.loads.borrow().get(name) {
            return load.clone();
        }

        let activator_name = name.to_string();
        let load = loader
            .load(name)
            .map(move |result| {
                if let Err(err) = &result {
                    error!("Cannot load '{activator_name}' activator: {err}");
                }
                result
            })
            .boxed_local()
            .shared();

        self.loads
            .borrow_mut()
            .entry(name.to_string())
            .or_insert(load)
            .clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.loads.borrow().len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.loads.borrow().contains_key(name)
    }
}
