//! SelectionView: the entries belonging to one selected entry.
//!
//! With entry `s` selected, the view holds:
//!   - `s` itself,
//!   - every entry whose `container` attribute equals `s`'s id,
//!   - every entry named as a key of `s`'s `children` object.

use std::collections::HashSet;
use std::ops::{ControlFlow, Deref};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use crate::reactive::event::{EventType, StoreEvent, Topic};
use crate::reactive::event_bus::HandlerId;
use crate::reactive::observable::{EventHandler, Observable};
use crate::storage::traits::Store;
use crate::types::{Entry, EntryId};

use super::filtered::{FilteredView, RefreshReport, ViewOptions};

/// Attribute naming an entry's parent.
pub const CONTAINER_ATTRIBUTE: &str = "container";

/// Attribute whose object keys name an entry's children.
pub const CHILDREN_ATTRIBUTE: &str = "children";

#[derive(Debug, Default)]
struct Selection {
    id: Option<EntryId>,
    children: HashSet<EntryId>,
}

impl Selection {
    fn contains<E: Entry>(&self, entry: &E) -> bool {
        let Some(selected) = &self.id else {
            return false;
        };
        let id = entry.id();
        id.as_deref() == Some(selected.as_str())
            || entry
                .attribute(CONTAINER_ATTRIBUTE)
                .and_then(id_value)
                .is_some_and(|container| &container == selected)
            || id.is_some_and(|id| self.children.contains(&id))
    }
}

fn id_value(value: &Value) -> Option<EntryId> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn children_of<E: Entry>(entry: &E) -> HashSet<EntryId> {
    entry
        .attribute(CHILDREN_ATTRIBUTE)
        .and_then(Value::as_object)
        .map(|children| children.keys().cloned().collect())
        .unwrap_or_default()
}

/// A [`FilteredView`] over the selected entry and its members.
pub struct SelectionView<U: Observable + 'static> {
    view: Arc<FilteredView<U>>,
    selection: Arc<Mutex<Selection>>,
    upstream_handler: HandlerId,
}

impl<U: Observable + 'static> SelectionView<U> {
    pub fn new(upstream: Arc<U>, name: Option<String>) -> Self {
        let selection = Arc::new(Mutex::new(Selection::default()));
        let shared = Arc::clone(&selection);
        let options = ViewOptions {
            name,
            ..ViewOptions::with_predicate(move |entry: &U::Item| shared.lock().contains(entry))
        };
        let view = Arc::new(FilteredView::new(Arc::clone(&upstream), options));

        // Bound after the view's own handlers, so membership is recomputed
        // once the view has applied the update.
        let upstream_handler = upstream.bind_handler(
            Topic::Type(EventType::Updated),
            children_tracker(Arc::downgrade(&view), Arc::clone(&selection)),
        );

        Self {
            view,
            selection,
            upstream_handler,
        }
    }

    pub fn selected(&self) -> Option<EntryId> {
        self.selection.lock().id.clone()
    }

    /// Select `id` (or clear the selection) and refresh the view.
    pub fn set_selected(&self, id: Option<&str>) -> RefreshReport {
        let children = match id {
            Some(id) => match self.view.upstream().read(id) {
                Ok(entry) => children_of(&entry),
                Err(e) => {
                    tracing::debug!(view = %self.view.name(), id = %id, error = %e, "selected entry not readable");
                    HashSet::new()
                }
            },
            None => HashSet::new(),
        };
        {
            let mut selection = self.selection.lock();
            selection.id = id.map(str::to_string);
            selection.children = children;
        }
        self.view.refresh()
    }

    pub fn view(&self) -> &FilteredView<U> {
        &self.view
    }
}

/// Refresh when the selected entry's `children` change.
fn children_tracker<U: Observable + 'static>(
    view: Weak<FilteredView<U>>,
    selection: Arc<Mutex<Selection>>,
) -> EventHandler<U::Item> {
    Arc::new(move |event: &StoreEvent<U::Item>| {
        let (Some(view), StoreEvent::Updated { entry_id, entry, .. }) = (view.upgrade(), event) else {
            return ControlFlow::Continue(());
        };
        let changed = {
            let mut selection = selection.lock();
            if selection.id.as_deref() != Some(entry_id.as_str()) {
                false
            } else {
                let children = children_of(entry);
                let changed = children != selection.children;
                selection.children = children;
                changed
            }
        };
        if changed {
            view.refresh();
        }
        ControlFlow::Continue(())
    })
}

impl<U: Observable + 'static> Deref for SelectionView<U> {
    type Target = FilteredView<U>;

    fn deref(&self) -> &Self::Target {
        &self.view
    }
}

impl<U: Observable + 'static> Drop for SelectionView<U> {
    fn drop(&mut self) {
        self.view
            .upstream()
            .unbind(&Topic::Type(EventType::Updated), &self.upstream_handler);
    }
}
