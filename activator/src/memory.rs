//! In-memory document.
//!
//! A small element tree with attributes, text, event listeners and childList
//! mutation observation. Non-browser hosts drive the observer with it, and the
//! tests use it to stage removals, re-additions and batched changes.
//!
//! Mutations are delivered per change, or as one batch for everything done
//! inside [`Document::batch`]. Events do not bubble.

use crate::element::{Disposer, Element, Listener, ListenerOptions, MutationRecord, MutationSource};
use futures::channel::mpsc::{UnboundedSender, unbounded};
use futures::stream::{LocalBoxStream, StreamExt};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEvent {
    pub kind: String,
    pub target: ElementId,
}

type Batch = Vec<MutationRecord<MemoryElement>>;

struct Watcher {
    root: MemoryElement,
    sender: UnboundedSender<Batch>,
}

struct DocumentInner {
    body: MemoryElement,
    watchers: RefCell<Vec<Watcher>>,
    pending: RefCell<Option<Vec<(MemoryElement, MutationRecord<MemoryElement>)>>>,
    next_element: Cell<u64>,
    next_listener: Cell<u64>,
}

#[derive(Clone)]
pub struct Document {
    inner: Rc<DocumentInner>,
}

impl Document {
    pub fn new() -> Self {
        let inner = Rc::new_cyclic(|document| DocumentInner {
            body: MemoryElement::detached(ElementId(0), "body", true, document.clone()),
            watchers: RefCell::new(Vec::new()),
            pending: RefCell::new(None),
            next_element: Cell::new(1),
            next_listener: Cell::new(0),
        });
        Self { inner }
    }

    /// Root of the tree. Always connected.
    pub fn body(&self) -> MemoryElement {
        self.inner.body.clone()
    }

    /// Creates a detached element.
    pub fn create_element(&self, tag: &str) -> MemoryElement {
        let id = self.inner.next_element.get();
        self.inner.next_element.set(id + 1);
        MemoryElement::detached(ElementId(id), tag, false, Rc::downgrade(&self.inner))
    }

    /// Runs `changes` and delivers every mutation it made as one batch per
    /// watcher. Nested calls join the outermost batch.
    pub fn batch<R>(&self, changes: impl FnOnce() -> R) -> R {
        let outermost = {
            let mut pending = self.inner.pending.borrow_mut();
            if pending.is_some() {
                false
            } else {
                *pending = Some(Vec::new());
                true
            }
        };
        let result = changes();
        if outermost {
            let records = self.inner.pending.borrow_mut().take().unwrap_or_default();
            self.inner.deliver(records);
        }
        result
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.prune_watchers();
        self.inner.watchers.borrow().len()
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("watchers", &self.inner.watchers.borrow().len())
            .finish_non_exhaustive()
    }
}

impl DocumentInner {
    fn record(&self, parent: &MemoryElement, record: MutationRecord<MemoryElement>) {
        if let Some(pending) = self.pending.borrow_mut().as_mut() {
            pending.push((parent.clone(), record));
            return;
        }
        self.deliver(vec![(parent.clone(), record)]);
    }

    fn deliver(&self, records: Vec<(MemoryElement, MutationRecord<MemoryElement>)>) {
        if records.is_empty() {
            return;
        }
        self.prune_watchers();
        for watcher in self.watchers.borrow().iter() {
            let batch: Batch = records
                .iter()
                .filter(|(parent, _)| parent.is_inclusive_descendant_of(&watcher.root))
                .map(|(_, record)| record.clone())
                .collect();
            if !batch.is_empty() {
                let _ = watcher.sender.unbounded_send(batch);
            }
        }
    }

    fn prune_watchers(&self) {
        self.watchers
            .borrow_mut()
            .retain(|watcher| !watcher.sender.is_closed());
    }

    fn next_listener_id(&self) -> u64 {
        let id = self.next_listener.get();
        self.next_listener.set(id + 1);
        id
    }
}

impl MutationSource<MemoryElement> for Document {
    fn observe(&self, root: &MemoryElement) -> LocalBoxStream<'static, Batch> {
        let (sender, receiver) = unbounded();
        self.inner.watchers.borrow_mut().push(Watcher {
            root: root.clone(),
            sender,
        });
        receiver.boxed_local()
    }
}

struct ListenerEntry {
    id: u64,
    event: String,
    capture: bool,
    once: bool,
    listener: Listener<MemoryEvent>,
}

struct ElementNode {
    id: ElementId,
    tag: String,
    is_body: bool,
    document: Weak<DocumentInner>,
    attributes: RefCell<Vec<(String, String)>>,
    text: RefCell<String>,
    parent: RefCell<Weak<ElementNode>>,
    children: RefCell<Vec<MemoryElement>>,
    listeners: RefCell<Vec<ListenerEntry>>,
}

#[derive(Clone)]
pub struct MemoryElement {
    node: Rc<ElementNode>,
}

impl PartialEq for MemoryElement {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }
}

impl Eq for MemoryElement {}

impl fmt::Debug for MemoryElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} #{}>", self.node.tag, self.node.id.0)
    }
}

impl MemoryElement {
    fn detached(id: ElementId, tag: &str, is_body: bool, document: Weak<DocumentInner>) -> Self {
        Self {
            node: Rc::new(ElementNode {
                id,
                tag: tag.to_string(),
                is_body,
                document,
                attributes: RefCell::new(Vec::new()),
                text: RefCell::new(String::new()),
                parent: RefCell::new(Weak::new()),
                children: RefCell::new(Vec::new()),
                listeners: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> ElementId {
        self.node.id
    }

    pub fn tag(&self) -> &str {
        &self.node.tag
    }

    pub fn set_attribute(&self, name: &str, value: &str) {
        let mut attributes = self.node.attributes.borrow_mut();
        match attributes.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, current)) => *current = value.to_string(),
            None => attributes.push((name.to_string(), value.to_string())),
        }
    }

    pub fn remove_attribute(&self, name: &str) {
        self.node
            .attributes
            .borrow_mut()
            .retain(|(existing, _)| existing != name);
    }

    pub fn set_text(&self, text: &str) {
        *self.node.text.borrow_mut() = text.to_string();
    }

    pub fn parent(&self) -> Option<MemoryElement> {
        self.node
            .parent
            .borrow()
            .upgrade()
            .map(|node| MemoryElement { node })
    }

    pub fn children(&self) -> Vec<MemoryElement> {
        self.node.children.borrow().clone()
    }

    /// Appends `child`, moving it out of its current parent first.
    pub fn append_child(&self, child: &MemoryElement) {
        if child == self || self.is_inclusive_descendant_of(child) {
            log::warn!("Refusing to append {child:?} into its own subtree");
            return;
        }
        child.remove();
        *child.node.parent.borrow_mut() = Rc::downgrade(&self.node);
        self.node.children.borrow_mut().push(child.clone());
        if let Some(document) = self.node.document.upgrade() {
            document.record(self, MutationRecord::added(vec![child.clone()]));
        }
    }

    /// Detaches the element from its parent; no-op when already detached.
    pub fn remove(&self) {
        let Some(parent) = self.parent() else {
            return;
        };
        parent
            .node
            .children
            .borrow_mut()
            .retain(|sibling| sibling != self);
        *self.node.parent.borrow_mut() = Weak::new();
        if let Some(document) = self.node.document.upgrade() {
            document.record(&parent, MutationRecord::removed(vec![self.clone()]));
        }
    }

    /// Fires `kind` on this element. Returns how many listeners ran.
    pub fn dispatch(&self, kind: &str) -> usize {
        let event = MemoryEvent {
            kind: kind.to_string(),
            target: self.node.id,
        };
        let matching: Vec<Listener<MemoryEvent>> = {
            let mut listeners = self.node.listeners.borrow_mut();
            let matching = listeners
                .iter()
                .filter(|entry| entry.event == kind)
                .map(|entry| entry.listener.clone())
                .collect();
            listeners.retain(|entry| !(entry.event == kind && entry.once));
            matching
        };
        for listener in &matching {
            listener(&event);
        }
        matching.len()
    }

    pub fn listener_count(&self, kind: &str) -> usize {
        self.node
            .listeners
            .borrow()
            .iter()
            .filter(|entry| entry.event == kind)
            .count()
    }

    fn is_inclusive_descendant_of(&self, ancestor: &MemoryElement) -> bool {
        let mut current = Some(self.clone());
        while let Some(element) = current {
            if &element == ancestor {
                return true;
            }
            current = element.parent();
        }
        false
    }

    fn collect_descendants(&self, matches: &impl Fn(&MemoryElement) -> bool, out: &mut Vec<MemoryElement>) {
        for child in self.node.children.borrow().iter() {
            if matches(child) {
                out.push(child.clone());
            }
            child.collect_descendants(matches, out);
        }
    }
}

impl Element for MemoryElement {
    type Key = ElementId;
    type Event = MemoryEvent;

    fn key(&self) -> ElementId {
        self.node.id
    }

    fn attribute(&self, name: &str) -> Option<String> {
        self.node
            .attributes
            .borrow()
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.clone())
    }

    fn is_connected(&self) -> bool {
        let mut current = Some(self.clone());
        while let Some(element) = current {
            if element.node.is_body {
                return element.node.document.strong_count() > 0;
            }
            current = element.parent();
        }
        false
    }

    fn text_content(&self) -> String {
        let mut text = self.node.text.borrow().clone();
        for child in self.node.children.borrow().iter() {
            text.push_str(&child.text_content());
        }
        text
    }

    fn query_all_with_attribute(&self, name: &str) -> Vec<Self> {
        let mut found = Vec::new();
        self.collect_descendants(&|element: &MemoryElement| element.has_attribute(name), &mut found);
        found
    }

    fn metadata(&self, tag: &str, name: &str) -> Option<String> {
        let mut found = Vec::new();
        self.collect_descendants(
            &|element: &MemoryElement| {
                element.node.tag == tag && element.attribute("name").as_deref() == Some(name)
            },
            &mut found,
        );
        found.first().and_then(|meta| meta.attribute("content"))
    }

    fn add_listener(
        &self,
        event: &str,
        options: ListenerOptions,
        listener: Listener<MemoryEvent>,
    ) -> Option<Disposer> {
        let document = self.node.document.upgrade()?;
        let id = document.next_listener_id();
        self.node.listeners.borrow_mut().push(ListenerEntry {
            id,
            event: event.to_string(),
            capture: options.capture,
            once: options.once,
            listener,
        });
        let node = Rc::downgrade(&self.node);
        let event = event.to_string();
        let capture = options.capture;
        Some(Box::new(move || {
            if let Some(node) = node.upgrade() {
                node.listeners.borrow_mut().retain(|entry| {
                    !(entry.id == id && entry.event == event && entry.capture == capture)
                });
            }
        }))
    }
}
