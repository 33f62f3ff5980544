//! Browser binding over `web-sys`.
//!
//! [`WebElement`] wraps a DOM element, [`WebMutationSource`] feeds
//! `MutationObserver` batches into the observer, and [`WebSpawner`] runs
//! tasks with `wasm_bindgen_futures::spawn_local`.

use crate::element::{Disposer, Element, Listener, ListenerOptions, MutationRecord, MutationSource};
use crate::loader::Loader;
use crate::observer::{Observer, ObserverError};
use futures::channel::mpsc::{UnboundedReceiver, unbounded};
use futures::stream::{self, LocalBoxStream, Stream, StreamExt};
use futures::task::{LocalFutureObj, LocalSpawn, SpawnError};
use js_sys::Reflect;
use log::error;
use shared::css_escape;
use std::cell::Cell;
use std::pin::Pin;
use std::task::{Context, Poll};
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;

const KEY_PROPERTY: &str = "__activatorKey";

thread_local! {
    static NEXT_KEY: Cell<u32> = const { Cell::new(1) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WebElementKey(u32);

#[derive(Debug, Clone, PartialEq)]
pub struct WebElement(web_sys::Element);

impl WebElement {
    pub fn new(element: web_sys::Element) -> Self {
        Self(element)
    }

    pub fn as_element(&self) -> &web_sys::Element {
        &self.0
    }

    fn from_node(node: web_sys::Node) -> Option<Self> {
        node.dyn_into::<web_sys::Element>().ok().map(Self)
    }

    fn collect(list: web_sys::NodeList) -> Vec<Self> {
        (0..list.length())
            .filter_map(|index| list.item(index))
            .filter_map(Self::from_node)
            .collect()
    }
}

impl From<web_sys::Element> for WebElement {
    fn from(element: web_sys::Element) -> Self {
        Self(element)
    }
}

impl Element for WebElement {
    type Key = WebElementKey;
    type Event = web_sys::Event;

    /// Identity is stamped on the element as an expando property the first
    /// time it is asked for.
    fn key(&self) -> WebElementKey {
        let property = JsValue::from_str(KEY_PROPERTY);
        if let Some(existing) = Reflect::get(&self.0, &property).ok().and_then(|v| v.as_f64()) {
            return WebElementKey(existing as u32);
        }
        let key = NEXT_KEY.with(|next| {
            let key = next.get();
            next.set(key.wrapping_add(1));
            key
        });
        if let Err(err) = Reflect::set(&self.0, &property, &JsValue::from_f64(f64::from(key))) {
            error!("Cannot stamp element key: {err:?}");
        }
        WebElementKey(key)
    }

    fn attribute(&self, name: &str) -> Option<String> {
        self.0.get_attribute(name)
    }

    fn has_attribute(&self, name: &str) -> bool {
        self.0.has_attribute(name)
    }

    fn is_connected(&self) -> bool {
        self.0.is_connected()
    }

    fn text_content(&self) -> String {
        self.0.text_content().unwrap_or_default()
    }

    fn query_all_with_attribute(&self, name: &str) -> Vec<Self> {
        match self.0.query_selector_all(&format!("[{}]", css_escape(name))) {
            Ok(list) => Self::collect(list),
            Err(err) => {
                error!("Invalid attribute selector for '{name}': {err:?}");
                Vec::new()
            }
        }
    }

    fn query_first_with_attribute(&self, name: &str) -> Option<Self> {
        self.0
            .query_selector(&format!("[{}]", css_escape(name)))
            .ok()
            .flatten()
            .map(Self)
    }

    fn metadata(&self, tag: &str, name: &str) -> Option<String> {
        let selector = format!("{}[name={}]", css_escape(tag), css_escape(name));
        self.0
            .query_selector(&selector)
            .ok()
            .flatten()
            .and_then(|meta| meta.get_attribute("content"))
    }

    fn add_listener(
        &self,
        event: &str,
        options: ListenerOptions,
        listener: Listener<web_sys::Event>,
    ) -> Option<Disposer> {
        let callback = Closure::<dyn Fn(web_sys::Event)>::new(move |event: web_sys::Event| {
            listener(&event)
        });
        let init = web_sys::AddEventListenerOptions::new();
        init.set_capture(options.capture);
        init.set_once(options.once);
        init.set_passive(options.passive);
        if let Err(err) = self.0.add_event_listener_with_callback_and_add_event_listener_options(
            event,
            callback.as_ref().unchecked_ref(),
            &init,
        ) {
            error!("Cannot subscribe to '{event}': {err:?}");
            return None;
        }

        let element = self.0.clone();
        let event = event.to_string();
        Some(Box::new(move || {
            if let Err(err) = element.remove_event_listener_with_callback_and_bool(
                &event,
                callback.as_ref().unchecked_ref(),
                options.capture,
            ) {
                error!("Cannot unsubscribe from '{event}': {err:?}");
            }
        }))
    }
}

type Batch = Vec<MutationRecord<WebElement>>;

/// `MutationObserver`-backed source; the observer disconnects when the
/// stream is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebMutationSource;

struct ObservedMutations {
    receiver: UnboundedReceiver<Batch>,
    observer: web_sys::MutationObserver,
    _callback: Closure<dyn FnMut(js_sys::Array, web_sys::MutationObserver)>,
}

impl Stream for ObservedMutations {
    type Item = Batch;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Batch>> {
        self.get_mut().receiver.poll_next_unpin(cx)
    }
}

impl Drop for ObservedMutations {
    fn drop(&mut self) {
        self.observer.disconnect();
    }
}

impl MutationSource<WebElement> for WebMutationSource {
    fn observe(&self, root: &WebElement) -> LocalBoxStream<'static, Batch> {
        let (sender, receiver) = unbounded();
        let callback = Closure::<dyn FnMut(js_sys::Array, web_sys::MutationObserver)>::new(
            move |records: js_sys::Array, _observer: web_sys::MutationObserver| {
                let batch: Batch = records
                    .iter()
                    .filter_map(|record| record.dyn_into::<web_sys::MutationRecord>().ok())
                    .filter(|record| record.type_() == "childList")
                    .map(|record| MutationRecord {
                        added: WebElement::collect(record.added_nodes()),
                        removed: WebElement::collect(record.removed_nodes()),
                    })
                    .collect();
                if !batch.is_empty() {
                    let _ = sender.unbounded_send(batch);
                }
            },
        );

        let observer = match web_sys::MutationObserver::new(callback.as_ref().unchecked_ref()) {
            Ok(observer) => observer,
            Err(err) => {
                error!("Cannot create MutationObserver: {err:?}");
                return stream::empty().boxed_local();
            }
        };
        let init = web_sys::MutationObserverInit::new();
        init.set_child_list(true);
        init.set_subtree(true);
        if let Err(err) = observer.observe_with_options(&root.0, &init) {
            error!("Cannot observe the activation root: {err:?}");
            return stream::empty().boxed_local();
        }

        ObservedMutations {
            receiver,
            observer,
            _callback: callback,
        }
        .boxed_local()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSpawner;

impl LocalSpawn for WebSpawner {
    fn spawn_local_obj(&self, future: LocalFutureObj<'static, ()>) -> Result<(), SpawnError> {
        wasm_bindgen_futures::spawn_local(future);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("no document is available")]
    NoDocument,
    #[error("document has no body")]
    NoBody,
    #[error(transparent)]
    Observer(#[from] ObserverError),
}

/// Starts an observer on `document.body`.
pub fn activate(loader: impl Loader<WebElement> + 'static) -> Result<Observer<WebElement>, WebError> {
    let document = web_sys::window()
        .and_then(|window| window.document())
        .ok_or(WebError::NoDocument)?;
    let body = document.body().ok_or(WebError::NoBody)?;
    let root = WebElement::new(body.into());
    Ok(crate::activate(root, loader, WebMutationSource, WebSpawner)?)
}
