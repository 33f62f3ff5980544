//! Document seams the observer is written against.
//!
//! The observer never touches a concrete tree. Hosts plug in an [`Element`]
//! implementation (the browser binding in `web`, the in-memory document in
//! `memory`) and a [`MutationSource`] delivering childList batches for a
//! watched subtree.

use futures::stream::LocalBoxStream;
use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;

/// Zero-argument cleanup callback.
pub type Disposer = Box<dyn FnOnce()>;

/// Event callback shared between the caller and the element binding.
pub type Listener<Ev> = Rc<dyn Fn(&Ev)>;

/// Options passed through to the event subscription. Removal matches on
/// `capture`, the way the DOM does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    pub capture: bool,
    pub once: bool,
    pub passive: bool,
}

impl ListenerOptions {
    pub fn capture() -> Self {
        Self {
            capture: true,
            ..Self::default()
        }
    }

    pub fn once() -> Self {
        Self {
            once: true,
            ..Self::default()
        }
    }
}

/// A node of the observed document.
pub trait Element: Clone + 'static {
    /// Identity of the node, stable for its whole life.
    type Key: Eq + Hash + Clone + Debug + 'static;
    type Event: 'static;

    fn key(&self) -> Self::Key;

    fn attribute(&self, name: &str) -> Option<String>;

    fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    fn is_connected(&self) -> bool;

    fn text_content(&self) -> String;

    /// Descendants (not the element itself) carrying `name`, in document order.
    fn query_all_with_attribute(&self, name: &str) -> Vec<Self>;

    fn query_first_with_attribute(&self, name: &str) -> Option<Self> {
        self.query_all_with_attribute(name).into_iter().next()
    }

    /// `content` of the first descendant `<{tag} name="{name}">`.
    fn metadata(&self, tag: &str, name: &str) -> Option<String>;

    /// Subscribes `listener` and returns the disposer removing exactly this
    /// subscription, or `None` if the binding refused it.
    fn add_listener(
        &self,
        event: &str,
        options: ListenerOptions,
        listener: Listener<Self::Event>,
    ) -> Option<Disposer>;
}

/// One childList change under the watched subtree.
#[derive(Debug, Clone)]
pub struct MutationRecord<E> {
    pub added: Vec<E>,
    pub removed: Vec<E>,
}

impl<E> MutationRecord<E> {
    pub fn added(nodes: Vec<E>) -> Self {
        Self {
            added: nodes,
            removed: Vec::new(),
        }
    }

    pub fn removed(nodes: Vec<E>) -> Self {
        Self {
            added: Vec::new(),
            removed: nodes,
        }
    }
}

/// Delivers structural-change batches for a subtree, in order.
pub trait MutationSource<E: Element> {
    fn observe(&self, root: &E) -> LocalBoxStream<'static, Vec<MutationRecord<E>>>;
}

/// `root` itself (when marked) followed by its marked descendants.
pub fn marked_subtree<E: Element>(root: &E, attribute: &str) -> Vec<E> {
    let mut marked = Vec::new();
    if root.has_attribute(attribute) {
        marked.push(root.clone());
    }
    marked.extend(root.query_all_with_attribute(attribute));
    marked
}
