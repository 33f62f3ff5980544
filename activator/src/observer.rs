//! Discovers marker attributes and drives the activation lifecycle.
//!
//! # Lifecycle per marker node
//!
//! unseen → pending load (per directive) → activated → deactivated
//!
//! Activation waits on the shared load of each named activator and is
//! validated when the load settles: if the node left the tree meanwhile the
//! directive is dropped. Deactivation is synchronous and tears down whatever
//! instances exist at that moment, regardless of directives still loading.
//!
//! # Invariants
//!
//! 1. Each activator name is loaded at most once per observer, failures
//!    included.
//! 2. No instance is created for a node that is disconnected when its load
//!    settles.
//! 3. Deactivating a node removes its whole registry bucket; repeating it is a
//!    no-op.
//! 4. Mutation batches are processed in delivery order, one at a time.

use crate::element::{Element, MutationRecord, MutationSource, marked_subtree};
use crate::instance::{Instance, panic_message};
use crate::loader::{Activator, ActivatorCache, Loader};
use futures::future::{AbortHandle, Abortable};
use futures::task::{LocalSpawn, LocalSpawnExt, SpawnError};
use futures::{FutureExt, StreamExt};
use log::{debug, error, warn};
use shared::{Directive, ObserverConfig};
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};

#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    #[error("observer is already watching")]
    AlreadyStarted,
    #[error("observer was stopped and cannot be restarted")]
    Stopped,
    #[error("failed to spawn the mutation loop: {0}")]
    Spawn(#[from] SpawnError),
}

enum WatchState {
    Idle,
    Watching(AbortHandle),
    Stopped,
}

pub struct Observer<E: Element> {
    inner: Rc<ObserverInner<E>>,
}

struct ObserverInner<E: Element> {
    root: E,
    config: Rc<ObserverConfig>,
    loader: Box<dyn Loader<E>>,
    source: Box<dyn MutationSource<E>>,
    spawner: Rc<dyn LocalSpawn>,
    activators: ActivatorCache<E>,
    instances: RefCell<HashMap<E::Key, Vec<Instance<E>>>>,
    watch: RefCell<WatchState>,
}

impl<E: Element> Drop for ObserverInner<E> {
    fn drop(&mut self) {
        if let WatchState::Watching(handle) = self.watch.get_mut() {
            handle.abort();
        }
    }
}

impl<E: Element> Clone for Observer<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<E: Element> Observer<E> {
    pub fn new(
        root: E,
        loader: impl Loader<E> + 'static,
        source: impl MutationSource<E> + 'static,
        spawner: impl LocalSpawn + 'static,
    ) -> Self {
        Self::with_config(root, loader, source, spawner, ObserverConfig::default())
    }

    pub fn with_config(
        root: E,
        loader: impl Loader<E> + 'static,
        source: impl MutationSource<E> + 'static,
        spawner: impl LocalSpawn + 'static,
        config: ObserverConfig,
    ) -> Self {
        Self {
            inner: Rc::new(ObserverInner {
                root,
                config: Rc::new(config),
                loader: Box::new(loader),
                source: Box::new(source),
                spawner: Rc::new(spawner),
                activators: ActivatorCache::new(),
                instances: RefCell::new(HashMap::new()),
                watch: RefCell::new(WatchState::Idle),
            }),
        }
    }

    pub fn root(&self) -> &E {
        &self.inner.root
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.inner.config
    }

    /// Activates the marker nodes already in the tree, then processes
    /// mutation batches of the root until stopped.
    pub fn start(&self) -> Result<(), ObserverError> {
        match &*self.inner.watch.borrow() {
            WatchState::Idle => {}
            WatchState::Watching(_) => return Err(ObserverError::AlreadyStarted),
            WatchState::Stopped => return Err(ObserverError::Stopped),
        }

        self.activate_tree(&self.inner.root);

        let mut batches = self.inner.source.observe(&self.inner.root);
        let observer = Rc::downgrade(&self.inner);
        let (handle, registration) = AbortHandle::new_pair();
        let watch_loop = async move {
            while let Some(batch) = batches.next().await {
                let Some(inner) = observer.upgrade() else {
                    break;
                };
                Observer { inner }.process_batch(batch);
            }
        };
        self.inner
            .spawner
            .spawn_local(Abortable::new(watch_loop, registration).map(|_| ()))?;

        *self.inner.watch.borrow_mut() = WatchState::Watching(handle);
        debug!("Observer started on {:?}", self.inner.root.key());
        Ok(())
    }

    /// Stops processing mutation batches. Live instances stay as they are.
    pub fn stop(&self) {
        let previous = self.inner.watch.replace(WatchState::Stopped);
        if let WatchState::Watching(handle) = previous {
            handle.abort();
            debug!("Observer stopped on {:?}", self.inner.root.key());
        }
    }

    pub fn is_watching(&self) -> bool {
        matches!(&*self.inner.watch.borrow(), WatchState::Watching(_))
    }

    /// Applies one delivered batch: per record, added subtrees are activated
    /// and then removed subtrees are deactivated.
    pub fn process_batch(&self, batch: Vec<MutationRecord<E>>) {
        for record in batch {
            for added in &record.added {
                self.activate_tree(added);
            }
            for removed in &record.removed {
                self.deactivate_tree(removed);
            }
        }
    }

    pub fn activate_tree(&self, root: &E) {
        for element in marked_subtree(root, &self.inner.config.marker_attribute) {
            self.activate_node(&element);
        }
    }

    pub fn deactivate_tree(&self, root: &E) {
        for element in marked_subtree(root, &self.inner.config.marker_attribute) {
            self.deactivate_node(&element);
        }
    }

    /// Starts every directive of `element`'s marker attribute, left to right.
    /// Completion order follows load resolution.
    pub fn activate_node(&self, element: &E) {
        let Some(marker) = element.attribute(&self.inner.config.marker_attribute) else {
            return;
        };
        for parsed in Directive::parse_all(&marker) {
            let directive = match parsed {
                Ok(directive) => directive,
                Err(err) => {
                    warn!("Skipping directive on {:?}: {err}", element.key());
                    continue;
                }
            };
            let load = self
                .inner
                .activators
                .get_or_load(&directive.activator, self.inner.loader.as_ref());
            let observer = Rc::downgrade(&self.inner);
            let element = element.clone();
            let spawned = self.inner.spawner.spawn_local(async move {
                let Ok(activator) = load.await else {
                    return;
                };
                if let Some(inner) = observer.upgrade() {
                    Observer { inner }.attach(&element, directive, activator);
                }
            });
            if let Err(err) = spawned {
                error!("Cannot schedule activation on {:?}: {err}", self.inner.root.key());
            }
        }
    }

    /// Disconnects every instance living on `element`. Idempotent.
    pub fn deactivate_node(&self, element: &E) {
        let key = element.key();
        let bucket = self.inner.instances.borrow_mut().remove(&key);
        let Some(bucket) = bucket else {
            return;
        };
        for instance in bucket {
            let failures = instance.disconnect();
            if failures > 0 {
                error!(
                    "{failures} disposer(s) of '{}' on {key:?} failed",
                    instance.name()
                );
            }
            debug!("Deactivated '{}' on {key:?}", instance.name());
        }
    }

    fn attach(&self, element: &E, directive: Directive, activator: Activator<E>) {
        if !element.is_connected() {
            debug!(
                "Dropping '{directive}' on {:?}: node left the tree before the load settled",
                element.key()
            );
            return;
        }

        let instance = Instance::new(
            element.clone(),
            directive.reference.clone(),
            Rc::clone(&self.inner.config),
        );
        self.inner
            .instances
            .borrow_mut()
            .entry(element.key())
            .or_default()
            .push(instance.clone());

        let outcome = catch_unwind(AssertUnwindSafe(|| activator.invoke(&instance)));
        match outcome {
            Ok(Ok(Some(disposer))) => instance.auto_dispose(disposer),
            Ok(Ok(None)) => {}
            Ok(Err(err)) => {
                error!("Activator '{}' failed on {:?}: {err:#}", directive.activator, element.key());
                self.abort(element, &instance);
                return;
            }
            Err(payload) => {
                error!(
                    "Activator '{}' panicked on {:?}: {}",
                    directive.activator,
                    element.key(),
                    panic_message(payload.as_ref())
                );
                self.abort(element, &instance);
                return;
            }
        }
        debug!("Activated '{directive}' on {:?}", element.key());
    }

    /// Drops a single failed activation, releasing what it registered.
    fn abort(&self, element: &E, instance: &Instance<E>) {
        let key = element.key();
        {
            let mut instances = self.inner.instances.borrow_mut();
            if let Some(bucket) = instances.get_mut(&key) {
                bucket.retain(|live| !live.ptr_eq(instance));
                if bucket.is_empty() {
                    instances.remove(&key);
                }
            }
        }
        instance.disconnect();
    }

    // ----- introspection -----

    pub fn instances_for(&self, element: &E) -> Vec<Instance<E>> {
        self.inner
            .instances
            .borrow()
            .get(&element.key())
            .cloned()
            .unwrap_or_default()
    }

    pub fn instance_count(&self) -> usize {
        self.inner.instances.borrow().values().map(Vec::len).sum()
    }

    pub fn active_nodes(&self) -> Vec<E::Key> {
        self.inner.instances.borrow().keys().cloned().collect()
    }

    pub fn cached_activators(&self) -> usize {
        self.inner.activators.len()
    }
}

/// Weak handle for callers that must not keep the observer alive.
pub struct WeakObserver<E: Element> {
    inner: Weak<ObserverInner<E>>,
}

impl<E: Element> WeakObserver<E> {
    pub fn upgrade(&self) -> Option<Observer<E>> {
        self.inner.upgrade().map(|inner| Observer { inner })
    }
}

impl<E: Element> Observer<E> {
    pub fn downgrade(&self) -> WeakObserver<E> {
        WeakObserver {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Disposer, ListenerOptions};
    use crate::instance::EventTarget;
    use crate::loader::{ActivatorCatalog, LoadError, LoadFuture};
    use crate::memory::{Document, MemoryElement};
    use crate::testing;
    use futures::channel::oneshot;
    use futures::executor::LocalPool;
    use std::cell::Cell;

    type Resolution = Result<Activator<MemoryElement>, LoadError>;

    /// Loader whose loads settle only when the test says so.
    #[derive(Clone, Default)]
    struct DeferredLoader {
        state: Rc<RefCell<DeferredState>>,
    }

    #[derive(Default)]
    struct DeferredState {
        calls: HashMap<String, usize>,
        pending: HashMap<String, Vec<oneshot::Sender<Resolution>>>,
    }

    impl DeferredLoader {
        fn calls(&self, name: &str) -> usize {
            self.state.borrow().calls.get(name).copied().unwrap_or(0)
        }

        fn settle(&self, name: &str, resolution: Resolution) {
            let senders = self.state.borrow_mut().pending.remove(name).unwrap_or_default();
            for sender in senders {
                let _ = sender.send(resolution.clone());
            }
        }
    }

    impl Loader<MemoryElement> for DeferredLoader {
        fn load(&self, name: &str) -> LoadFuture<MemoryElement> {
            let (sender, receiver) = oneshot::channel();
            let mut state = self.state.borrow_mut();
            *state.calls.entry(name.to_string()).or_default() += 1;
            state.pending.entry(name.to_string()).or_default().push(sender);
            let name = name.to_string();
            async move {
                receiver
                    .await
                    .unwrap_or_else(|_| Err(LoadError::failed(&name, "loader dropped")))
            }
            .boxed_local()
        }
    }

    struct Fixture {
        pool: LocalPool,
        document: Document,
        loader: DeferredLoader,
        observer: Observer<MemoryElement>,
    }

    impl Fixture {
        fn new() -> Self {
            let pool = LocalPool::new();
            let document = Document::new();
            let loader = DeferredLoader::default();
            let observer = Observer::new(
                document.body(),
                loader.clone(),
                document.clone(),
                pool.spawner(),
            );
            Self {
                pool,
                document,
                loader,
                observer,
            }
        }

        fn marked(&self, directives: &str) -> MemoryElement {
            let element = self.document.create_element("div");
            element.set_attribute("act:as", directives);
            element
        }

        fn run(&mut self) {
            self.pool.run_until_stalled();
        }
    }

    fn recording(log: &Rc<RefCell<Vec<String>>>) -> Activator<MemoryElement> {
        let log = log.clone();
        Activator::from_fn(move |instance| log.borrow_mut().push(instance.name().to_string()))
    }

    #[test]
    fn initial_scan_activates_existing_nodes() {
        let mut fx = Fixture::new();
        let node = fx.marked("tabs");
        fx.document.body().append_child(&node);
        let seen = Rc::new(RefCell::new(Vec::new()));

        fx.observer.start().unwrap();
        fx.run();
        fx.loader.settle("tabs", Ok(recording(&seen)));
        fx.run();

        assert_eq!(*seen.borrow(), vec!["tabs"]);
        assert_eq!(fx.observer.instances_for(&node).len(), 1);
        assert!(fx.observer.is_watching());
    }

    #[test]
    fn body_itself_can_carry_the_marker() {
        let catalog = ActivatorCatalog::new().with("app", Activator::from_fn(|_| {}));
        let mut pool = LocalPool::new();
        let document = Document::new();
        document.body().set_attribute("act:as", "app");
        let observer = Observer::new(document.body(), catalog, document.clone(), pool.spawner());

        observer.start().unwrap();
        pool.run_until_stalled();
        assert_eq!(observer.instances_for(&document.body()).len(), 1);
    }

    #[test]
    fn two_directives_create_two_named_instances() {
        let mut fx = Fixture::new();
        fx.observer.start().unwrap();
        let node = fx.marked("tabs:primary modal");
        fx.document.body().append_child(&node);
        fx.run();

        let seen = Rc::new(RefCell::new(Vec::new()));
        fx.loader.settle("modal", Ok(recording(&seen)));
        fx.run();
        fx.loader.settle("tabs", Ok(recording(&seen)));
        fx.run();

        let mut names: Vec<String> = fx
            .observer
            .instances_for(&node)
            .iter()
            .map(|instance| instance.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["modal", "primary"]);
        assert_eq!(*seen.borrow(), vec!["modal", "primary"]);
    }

    #[test]
    fn concurrent_requests_share_one_load() {
        let mut fx = Fixture::new();
        let body = fx.document.body();
        let nodes: Vec<MemoryElement> = (0..5).map(|_| fx.marked("tabs")).collect();
        for node in &nodes {
            body.append_child(node);
        }
        let extra = fx.marked("tabs:again tabs");
        body.append_child(&extra);

        fx.observer.start().unwrap();
        fx.run();
        assert_eq!(fx.loader.calls("tabs"), 1);

        let seen = Rc::new(RefCell::new(Vec::new()));
        fx.loader.settle("tabs", Ok(recording(&seen)));
        fx.run();
        assert_eq!(seen.borrow().len(), 7);
        assert_eq!(fx.observer.instance_count(), 7);
        assert_eq!(fx.observer.cached_activators(), 1);

        let late = fx.marked("tabs");
        body.append_child(&late);
        fx.run();
        assert_eq!(fx.loader.calls("tabs"), 1);
        assert_eq!(fx.observer.instances_for(&late).len(), 1);
    }

    #[test]
    fn removal_before_load_settles_prevents_activation() {
        let mut fx = Fixture::new();
        fx.observer.start().unwrap();
        let node = fx.marked("tabs");
        fx.document.body().append_child(&node);
        fx.run();

        node.remove();
        fx.run();

        let invoked = Rc::new(Cell::new(false));
        let flag = invoked.clone();
        fx.loader
            .settle("tabs", Ok(Activator::from_fn(move |_| flag.set(true))));
        fx.run();

        assert!(!invoked.get());
        assert!(fx.observer.instances_for(&node).is_empty());
        assert_eq!(fx.observer.instance_count(), 0);
    }

    #[test]
    fn readding_a_node_activates_it_again() {
        let mut fx = Fixture::new();
        fx.observer.start().unwrap();
        let node = fx.marked("tabs");
        let body = fx.document.body();
        body.append_child(&node);
        fx.run();
        fx.loader.settle("tabs", Ok(Activator::from_fn(|_| {})));
        fx.run();
        assert_eq!(fx.observer.instances_for(&node).len(), 1);

        node.remove();
        fx.run();
        assert!(fx.observer.instances_for(&node).is_empty());

        body.append_child(&node);
        fx.run();
        assert_eq!(fx.observer.instances_for(&node).len(), 1);
        assert_eq!(fx.loader.calls("tabs"), 1);
    }

    #[test]
    fn failed_load_is_logged_once_and_spares_other_directives() {
        testing::capture_logs();
        let mut fx = Fixture::new();
        fx.observer.start().unwrap();
        let node = fx.marked("broken tabs");
        let other = fx.marked("broken");
        fx.document.body().append_child(&node);
        fx.document.body().append_child(&other);
        fx.run();

        fx.loader.settle("broken", Err(LoadError::failed("broken", "404")));
        fx.loader.settle("tabs", Ok(Activator::from_fn(|_| {})));
        fx.run();

        let names: Vec<String> = fx
            .observer
            .instances_for(&node)
            .iter()
            .map(|instance| instance.name().to_string())
            .collect();
        assert_eq!(names, vec!["tabs"]);
        assert!(fx.observer.instances_for(&other).is_empty());
        assert_eq!(testing::errors().len(), 1);

        let retry = fx.marked("broken");
        fx.document.body().append_child(&retry);
        fx.run();
        assert_eq!(fx.loader.calls("broken"), 1);
        assert!(fx.observer.instances_for(&retry).is_empty());
    }

    #[test]
    fn deactivation_is_idempotent() {
        let mut fx = Fixture::new();
        let node = fx.marked("a b c");
        fx.document.body().append_child(&node);
        fx.observer.start().unwrap();
        fx.run();
        let disposed = Rc::new(Cell::new(0));
        for name in ["a", "b", "c"] {
            let disposed = disposed.clone();
            fx.loader.settle(
                name,
                Ok(Activator::new(move |_| {
                    let disposed = disposed.clone();
                    let disposer: Disposer = Box::new(move || disposed.set(disposed.get() + 1));
                    Ok(Some(disposer))
                })),
            );
        }
        fx.run();
        assert_eq!(fx.observer.instances_for(&node).len(), 3);

        fx.observer.deactivate_node(&node);
        assert!(fx.observer.active_nodes().is_empty());
        assert_eq!(disposed.get(), 3);

        fx.observer.deactivate_node(&node);
        assert_eq!(disposed.get(), 3);

        let never = fx.marked("a");
        fx.observer.deactivate_node(&never);
        assert!(fx.observer.active_nodes().is_empty());
    }

    #[test]
    fn removed_subtree_deactivates_nested_nodes() {
        let mut fx = Fixture::new();
        fx.observer.start().unwrap();
        let wrapper = fx.document.create_element("section");
        let nested = fx.marked("tabs");
        let deeper = fx.marked("tabs:inner");
        wrapper.append_child(&nested);
        nested.append_child(&deeper);
        fx.document.body().append_child(&wrapper);
        fx.run();
        fx.loader.settle("tabs", Ok(Activator::from_fn(|_| {})));
        fx.run();
        assert_eq!(fx.observer.instance_count(), 2);

        wrapper.remove();
        fx.run();
        assert_eq!(fx.observer.instance_count(), 0);
    }

    #[test]
    fn click_listener_stops_after_removal() {
        let mut fx = Fixture::new();
        fx.observer.start().unwrap();
        let node = fx.marked("counter");
        let body = fx.document.body();
        body.append_child(&node);
        fx.run();

        let clicks = Rc::new(Cell::new(0));
        let counter = clicks.clone();
        fx.loader.settle(
            "counter",
            Ok(Activator::from_fn(move |instance| {
                let counter = counter.clone();
                instance.on("click", move |_| counter.set(counter.get() + 1));
            })),
        );
        fx.run();
        node.dispatch("click");
        assert_eq!(clicks.get(), 1);

        node.remove();
        fx.run();
        node.dispatch("click");
        assert_eq!(clicks.get(), 1);
        assert_eq!(node.listener_count("click"), 0);
    }

    #[test]
    fn activator_error_aborts_only_its_directive() {
        testing::capture_logs();
        let mut fx = Fixture::new();
        fx.observer.start().unwrap();
        let node = fx.marked("faulty fine");
        fx.document.body().append_child(&node);
        fx.run();

        let released = Rc::new(Cell::new(false));
        let flag = released.clone();
        fx.loader.settle(
            "faulty",
            Ok(Activator::new(move |instance| {
                let flag = flag.clone();
                instance.auto_dispose(move || flag.set(true));
                anyhow::bail!("missing {}", instance.scoped_key("config"))
            })),
        );
        fx.loader.settle(
            "fine",
            Ok(Activator::from_fn(|instance| {
                instance.on_with(EventTarget::Root, "focus", ListenerOptions::capture(), |_| {});
            })),
        );
        fx.run();

        assert!(released.get());
        let names: Vec<String> = fx
            .observer
            .instances_for(&node)
            .iter()
            .map(|instance| instance.name().to_string())
            .collect();
        assert_eq!(names, vec!["fine"]);
        assert!(testing::errors().iter().any(|e| e.contains("faulty:config")));
    }

    #[test]
    fn panicking_activator_is_contained() {
        testing::capture_logs();
        let mut fx = Fixture::new();
        fx.observer.start().unwrap();
        let node = fx.marked("explosive");
        fx.document.body().append_child(&node);
        fx.run();

        fx.loader
            .settle("explosive", Ok(Activator::from_fn(|_| panic!("boom"))));
        fx.run();

        assert!(fx.observer.instances_for(&node).is_empty());
        assert!(testing::errors().iter().any(|e| e.contains("boom")));
    }

    #[test]
    fn malformed_tokens_are_skipped() {
        testing::capture_logs();
        let mut fx = Fixture::new();
        fx.observer.start().unwrap();
        let node = fx.marked(":orphan tabs");
        fx.document.body().append_child(&node);
        fx.run();
        fx.loader.settle("tabs", Ok(Activator::from_fn(|_| {})));
        fx.run();

        assert_eq!(fx.observer.instances_for(&node).len(), 1);
        assert_eq!(fx.loader.calls(""), 0);
        assert_eq!(testing::warnings().len(), 1);
    }

    #[test]
    fn batched_add_and_remove_is_processed_in_order() {
        let mut fx = Fixture::new();
        fx.observer.start().unwrap();
        let body = fx.document.body();
        let transient = fx.marked("tabs");
        let staying = fx.marked("tabs");

        fx.document.batch(|| {
            body.append_child(&transient);
            body.append_child(&staying);
            transient.remove();
        });
        fx.run();
        fx.loader.settle("tabs", Ok(Activator::from_fn(|_| {})));
        fx.run();

        assert!(fx.observer.instances_for(&transient).is_empty());
        assert_eq!(fx.observer.instances_for(&staying).len(), 1);
    }

    #[test]
    fn stop_ends_watching() {
        let mut fx = Fixture::new();
        fx.observer.start().unwrap();
        assert!(matches!(fx.observer.start(), Err(ObserverError::AlreadyStarted)));
        fx.observer.stop();
        fx.run();
        assert!(!fx.observer.is_watching());
        assert!(matches!(fx.observer.start(), Err(ObserverError::Stopped)));

        let node = fx.marked("tabs");
        fx.document.body().append_child(&node);
        fx.run();
        assert_eq!(fx.loader.calls("tabs"), 0);
        assert_eq!(fx.document.watcher_count(), 0);
    }

    #[test]
    fn custom_marker_attribute() {
        let mut pool = LocalPool::new();
        let document = Document::new();
        let catalog = ActivatorCatalog::new().with("tabs", Activator::from_fn(|_| {}));
        let config = ObserverConfig::from_toml_str("marker_attribute = \"data-activate\"").unwrap();
        let observer =
            Observer::with_config(document.body(), catalog, document.clone(), pool.spawner(), config);
        observer.start().unwrap();

        let ignored = document.create_element("div");
        ignored.set_attribute("act:as", "tabs");
        let used = document.create_element("div");
        used.set_attribute("data-activate", "tabs");
        document.body().append_child(&ignored);
        document.body().append_child(&used);
        pool.run_until_stalled();

        assert!(observer.instances_for(&ignored).is_empty());
        assert_eq!(observer.instances_for(&used).len(), 1);
    }

    #[test]
    fn observers_keep_separate_caches() {
        let mut pool = LocalPool::new();
        let document = Document::new();
        let first_root = document.create_element("main");
        let second_root = document.create_element("aside");
        document.body().append_child(&first_root);
        document.body().append_child(&second_root);
        let loader = DeferredLoader::default();
        let first = Observer::new(first_root.clone(), loader.clone(), document.clone(), pool.spawner());
        let second = Observer::new(second_root.clone(), loader.clone(), document.clone(), pool.spawner());
        first.start().unwrap();
        second.start().unwrap();

        let a = document.create_element("div");
        a.set_attribute("act:as", "tabs");
        let b = document.create_element("div");
        b.set_attribute("act:as", "tabs");
        first_root.append_child(&a);
        second_root.append_child(&b);
        pool.run_until_stalled();
        assert_eq!(loader.calls("tabs"), 2);

        loader.settle("tabs", Ok(Activator::from_fn(|_| {})));
        pool.run_until_stalled();
        assert_eq!(first.instances_for(&a).len(), 1);
        assert!(first.instances_for(&b).is_empty());
        assert_eq!(second.instances_for(&b).len(), 1);
    }

    #[test]
    fn dropping_the_observer_ends_the_loop() {
        let mut fx = Fixture::new();
        fx.observer.start().unwrap();
        let weak = fx.observer.downgrade();
        let Fixture {
            mut pool,
            document,
            loader,
            observer,
        } = fx;
        drop(observer);
        pool.run_until_stalled();
        assert!(weak.upgrade().is_none());

        let node = document.create_element("div");
        node.set_attribute("act:as", "tabs");
        document.body().append_child(&node);
        pool.run_until_stalled();
        assert_eq!(loader.calls("tabs"), 0);
    }
}
