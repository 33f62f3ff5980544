//! Per-(node, name) activation context.
//!
//! Every lookup is namespaced as `name:attribute`. Resources acquired through
//! an [`Instance`] register their release on its disposal stack, which the
//! observer drains exactly once, most recent first, when the node leaves the
//! tree.

use crate::element::{Disposer, Element, Listener, ListenerOptions};
use log::{error, warn};
use serde::de::DeserializeOwned;
use shared::{ObserverConfig, scoped_key};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

/// Where [`Instance::on_with`] subscribes.
#[derive(Debug, Clone, Copy)]
pub enum EventTarget<'a, E> {
    /// The activated node itself.
    Root,
    /// First descendant carrying `name:{child}`.
    Named(&'a str),
    /// An element the caller already resolved; `None` makes the call a no-op.
    Element(Option<&'a E>),
}

pub struct Instance<E: Element> {
    inner: Rc<InstanceInner<E>>,
}

struct InstanceInner<E: Element> {
    root: E,
    name: String,
    config: Rc<ObserverConfig>,
    disposers: RefCell<Vec<Disposer>>,
    disconnected: Cell<bool>,
}

impl<E: Element> Clone for Instance<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<E: Element + fmt::Debug> fmt::Debug for Instance<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.inner.name)
            .field("root", &self.inner.root)
            .field("disposers", &self.inner.disposers.borrow().len())
            .field("disconnected", &self.inner.disconnected.get())
            .finish()
    }
}

impl<E: Element> Instance<E> {
    pub(crate) fn new(root: E, name: impl Into<String>, config: Rc<ObserverConfig>) -> Self {
        Self {
            inner: Rc::new(InstanceInner {
                root,
                name: name.into(),
                config,
                disposers: RefCell::new(Vec::new()),
                disconnected: Cell::new(false),
            }),
        }
    }

    pub fn root(&self) -> &E {
        &self.inner.root
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn scoped_key(&self, attribute: &str) -> String {
        scoped_key(&self.inner.name, attribute)
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.get()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ----- attributes -----

    /// Raw value of `name:{attribute}`, falling back to the matching metadata
    /// element inside the node.
    pub fn attribute(&self, attribute: &str) -> Option<String> {
        let key = self.scoped_key(attribute);
        self.raw_value(&key)
    }

    pub fn attribute_or(&self, attribute: &str, fallback: &str) -> String {
        self.attribute(attribute)
            .unwrap_or_else(|| fallback.to_string())
    }

    /// Attribute (or metadata) value parsed as JSON into `T`. Malformed
    /// payloads are logged and read as absent.
    pub fn json_attribute<T: DeserializeOwned>(&self, attribute: &str) -> Option<T> {
        self.json_attribute_where(attribute, |_: &T| true)
    }

    pub fn json_attribute_where<T: DeserializeOwned>(
        &self,
        attribute: &str,
        predicate: impl FnOnce(&T) -> bool,
    ) -> Option<T> {
        let key = self.scoped_key(attribute);
        let raw = self.raw_value(&key)?;
        parse_payload(&key, &raw, predicate)
    }

    pub fn json_attribute_or<T: DeserializeOwned>(&self, attribute: &str, fallback: T) -> T {
        self.json_attribute(attribute).unwrap_or(fallback)
    }

    fn raw_value(&self, key: &str) -> Option<String> {
        self.inner
            .root
            .attribute(key)
            .or_else(|| self.inner.root.metadata(&self.inner.config.metadata_tag, key))
    }

    // ----- targets -----

    pub fn target(&self, child: &str) -> Option<E> {
        self.inner
            .root
            .query_first_with_attribute(&self.scoped_key(child))
    }

    /// Snapshot of all matching descendants at call time.
    pub fn targets(&self, child: &str) -> Vec<E> {
        self.inner
            .root
            .query_all_with_attribute(&self.scoped_key(child))
    }

    // ----- data blocks -----

    /// JSON text content of the default data target (`name:data`).
    pub fn data<T: DeserializeOwned>(&self) -> Option<T> {
        self.data_named(&self.inner.config.data_target)
    }

    pub fn data_where<T: DeserializeOwned>(&self, predicate: impl FnOnce(&T) -> bool) -> Option<T> {
        self.data_named_where(&self.inner.config.data_target, predicate)
    }

    pub fn data_named<T: DeserializeOwned>(&self, child: &str) -> Option<T> {
        self.data_named_where(child, |_: &T| true)
    }

    pub fn data_named_where<T: DeserializeOwned>(
        &self,
        child: &str,
        predicate: impl FnOnce(&T) -> bool,
    ) -> Option<T> {
        let block = self.target(child)?;
        parse_payload(&self.scoped_key(child), &block.text_content(), predicate)
    }

    // ----- events -----

    /// Subscribes on the activated node for as long as this instance lives.
    pub fn on(&self, event: &str, listener: impl Fn(&E::Event) + 'static) -> bool {
        self.on_with(EventTarget::Root, event, ListenerOptions::default(), listener)
    }

    /// Subscribes on the first `name:{child}` descendant; no-op if absent.
    pub fn on_target(
        &self,
        child: &str,
        event: &str,
        listener: impl Fn(&E::Event) + 'static,
    ) -> bool {
        self.on_with(
            EventTarget::Named(child),
            event,
            ListenerOptions::default(),
            listener,
        )
    }

    /// Returns whether a subscription was made. The matching removal is
    /// registered on the disposal stack.
    pub fn on_with(
        &self,
        target: EventTarget<'_, E>,
        event: &str,
        options: ListenerOptions,
        listener: impl Fn(&E::Event) + 'static,
    ) -> bool {
        let element = match target {
            EventTarget::Root => Some(self.inner.root.clone()),
            EventTarget::Named(child) => self.target(child),
            EventTarget::Element(element) => element.cloned(),
        };
        let Some(element) = element else {
            return false;
        };
        let listener: Listener<E::Event> = Rc::new(listener);
        match element.add_listener(event, options, listener) {
            Some(remove) => {
                self.auto_dispose(remove);
                true
            }
            None => false,
        }
    }

    // ----- disposal -----

    /// Pushes `disposer` onto the disposal stack. On an instance that was
    /// already disconnected it runs right away.
    pub fn auto_dispose(&self, disposer: impl FnOnce() + 'static) {
        if self.inner.disconnected.get() {
            warn!(
                "Instance '{}' is already disconnected, disposing immediately",
                self.inner.name
            );
            run_disposer(&self.inner.name, Box::new(disposer));
            return;
        }
        self.inner.disposers.borrow_mut().push(Box::new(disposer));
    }

    /// Drains the disposal stack, newest first. Runs once; a panicking
    /// disposer is logged and the rest still run. Returns how many failed.
    pub(crate) fn disconnect(&self) -> usize {
        if self.inner.disconnected.replace(true) {
            return 0;
        }
        let mut failures = 0;
        loop {
            let next = self.inner.disposers.borrow_mut().pop();
            let Some(disposer) = next else { break };
            if !run_disposer(&self.inner.name, disposer) {
                failures += 1;
            }
        }
        failures
    }

    #[cfg(test)]
    pub(crate) fn pending_disposers(&self) -> usize {
        self.inner.disposers.borrow().len()
    }
}

fn run_disposer(name: &str, disposer: Disposer) -> bool {
    match catch_unwind(AssertUnwindSafe(disposer)) {
        Ok(()) => true,
        Err(payload) => {
            error!(
                "Disposer of instance '{name}' panicked: {}",
                panic_message(payload.as_ref())
            );
            false
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn parse_payload<T: DeserializeOwned>(
    key: &str,
    raw: &str,
    predicate: impl FnOnce(&T) -> bool,
) -> Option<T> {
    match serde_json::from_str::<T>(raw) {
        Ok(value) if predicate(&value) => Some(value),
        Ok(_) => {
            warn!("JSON content of [{key}] does not have the expected shape");
            None
        }
        Err(err) => {
            warn!("Cannot parse JSON content of [{key}]: {err}");
            None
        }
    }
}
