//! Subscribable state stores.
//!
//! [`Store<T>`] is the reactive boundary handed to consumers: `get`, `set`,
//! `subscribe`, lazy activation through a start hook, and the publish-if-changed
//! primitives every adapter uses for equality based suppression.

mod store;

pub use store::{ListenerFn, Readable, Setter, Store, Unsubscribe};
