// Emergency contact management.
//
// Architecture:
// - registry.rs: In-memory contact set with validation and change notification
// - store.rs: JSON persistence of the registry

pub mod registry;
pub mod store;

pub use registry::{ContactRegistry, ContactsChanged, NewContact, SharedContacts};
