//! Reactive layer: event dispatch and observable stores.
//!
//! # Modules
//!
//! - [`event`]: [`EventType`], [`Topic`], [`StoreEvent`] and [`ErrorEvent`].
//! - [`event_bus`]: ordered, stoppable pub/sub ([`EventBus<T>`]).
//! - [`observable`]: the [`Observable`] seam and [`ObservableExt`] helpers.
//! - [`store`]: [`ObservableStore<S>`], a store that announces its mutations.

pub mod event;
pub mod event_bus;
pub mod observable;
pub mod store;

pub use event::{ErrorEvent, EventType, StoreEvent, Topic, WILDCARD};
pub use event_bus::{EventBus, Handler, HandlerId, Registration};
pub use observable::{EventHandler, Observable, ObservableExt, SnapshotBinding};
pub use store::{ObservableOptions, ObservableStore};
