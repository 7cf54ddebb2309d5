pub mod notify;
pub mod store;

pub use notify::{ViewChange, ViewNotifier};
pub use store::{ChangeSource, DocumentStore};
