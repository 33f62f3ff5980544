//! Lazy activation of behavior on marked document nodes.
//!
//! A node carrying the marker attribute (`act:as` by default) names one or
//! more activators:
//!
//! ```text
//! <div act:as="tabs:primary modal" primary:orientation="\"vertical\"">
//! ```
//!
//! The [`Observer`] loads each named activator once, creates an [`Instance`]
//! per directive when the load settles and the node is still in the tree,
//! runs the activator with it, and disposes everything the activator
//! registered when the node is removed.
//!
//! The document is reached through the [`Element`] and [`MutationSource`]
//! seams. [`memory`] provides an in-memory document; the `web` feature adds a
//! browser binding.

pub mod element;
pub mod instance;
pub mod loader;
pub mod memory;
pub mod observer;

#[cfg(feature = "web")]
pub mod web;

#[cfg(test)]
mod testing;

pub use element::{Disposer, Element, Listener, ListenerOptions, MutationRecord, MutationSource};
pub use instance::{EventTarget, Instance};
pub use loader::{Activator, ActivatorCatalog, LoadError, LoadFuture, Loader};
pub use observer::{Observer, ObserverError, WeakObserver};
pub use shared::{ConfigError, Directive, DirectiveError, ObserverConfig};

use futures::task::LocalSpawn;

/// Creates an observer on `root` and starts it.
pub fn activate<E: Element>(
    root: E,
    loader: impl Loader<E> + 'static,
    source: impl MutationSource<E> + 'static,
    spawner: impl LocalSpawn + 'static,
) -> Result<Observer<E>, ObserverError> {
    let observer = Observer::new(root, loader, source, spawner);
    observer.start()?;
    Ok(observer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Document, MemoryElement};
    use futures::executor::LocalPool;
    use serde::Deserialize;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Tab {
        title: String,
    }

    #[test]
    fn tabs_activator_end_to_end() {
        let mut pool = LocalPool::new();
        let document = Document::new();
        let selected = Rc::new(RefCell::new(Vec::new()));

        let log = selected.clone();
        let tabs = Activator::new(move |it: &Instance<MemoryElement>| {
            let tabs: Vec<Tab> = it.data().unwrap_or_default();
            let orientation: String = it.json_attribute_or("orientation", "horizontal".to_string());
            for (index, target) in it.targets("tab").into_iter().enumerate() {
                let log = log.clone();
                let title = tabs.get(index).map(|tab| tab.title.clone()).unwrap_or_default();
                let orientation = orientation.clone();
                it.on_with(
                    EventTarget::Element(Some(&target)),
                    "click",
                    ListenerOptions::default(),
                    move |_| log.borrow_mut().push(format!("{orientation}:{title}")),
                );
            }
            let log = log.clone();
            Ok(Some(Box::new(move || log.borrow_mut().push("closed".to_string())) as Disposer))
        });
        let catalog = ActivatorCatalog::new().with("tabs", tabs);
        let observer = activate(document.body(), catalog, document.clone(), pool.spawner()).unwrap();

        let widget = document.create_element("div");
        widget.set_attribute("act:as", "tabs:primary");
        widget.set_attribute("primary:orientation", "\"vertical\"");
        let data = document.create_element("script");
        data.set_attribute("primary:data", "");
        data.set_text(r#"[{"title": "One"}, {"title": "Two"}]"#);
        let first = document.create_element("button");
        first.set_attribute("primary:tab", "");
        let second = document.create_element("button");
        second.set_attribute("primary:tab", "");
        widget.append_child(&data);
        widget.append_child(&first);
        widget.append_child(&second);
        document.body().append_child(&widget);
        pool.run_until_stalled();

        second.dispatch("click");
        first.dispatch("click");
        widget.remove();
        pool.run_until_stalled();
        first.dispatch("click");

        assert_eq!(*selected.borrow(), vec!["vertical:Two", "vertical:One", "closed"]);
        assert_eq!(observer.instance_count(), 0);
    }
}
