//! Emergency contact registry.
//!
//! Holds the de-duplicated contact list shared between the contact
//! management surface and the alert engine. The engine only ever reads a
//! [`ContactRegistry::snapshot`] at trigger time.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::error::ValidationError;
use crate::core::model::{ContactId, EmergencyContact};

lazy_static! {
    static ref E164: Regex = Regex::new(r"^\+[1-9]\d{1,14}$").expect("Invalid E.164 regex");
}

/// Registry shared between the contact UI and the engine.
pub type SharedContacts = Arc<RwLock<ContactRegistry>>;

/// Check a phone number against the E.164 format.
pub fn is_valid_phone(phone: &str) -> bool {
    E164.is_match(phone)
}

/// Contact fields as entered by the user, before an id is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContact {
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub relationship: Option<String>,
}

impl NewContact {
    pub fn new(name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phone: phone.into(),
            primary: false,
            relationship: None,
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn with_relationship(mut self, relationship: impl Into<String>) -> Self {
        self.relationship = Some(relationship.into());
        self
    }

    fn normalized(&self) -> Result<(String, String), ValidationError> {
        let name = self.name.trim();
        let phone: String = self.phone.chars().filter(|c| !c.is_whitespace()).collect();
        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if phone.is_empty() {
            return Err(ValidationError::EmptyPhone);
        }
        if !is_valid_phone(&phone) {
            return Err(ValidationError::InvalidPhone(phone));
        }
        Ok((name.to_string(), phone))
    }
}

/// Payload of the change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactsChanged {
    pub count: usize,
}

type ChangeListener = Box<dyn Fn(ContactsChanged) + Send + Sync>;

/// Persisted part of the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactBook {
    pub next_id: u64,
    pub contacts: Vec<EmergencyContact>,
}

#[derive(Default)]
pub struct ContactRegistry {
    book: ContactBook,
    listeners: Vec<ChangeListener>,
}

impl ContactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from a persisted book.
    ///
    /// Hand-edited files may repeat an id or a phone number. A repeated phone
    /// keeps the first entry; a repeated id is given a fresh one so every
    /// contact is still dispatched on its own.
    pub fn from_book(book: ContactBook) -> Self {
        let max_id = book.contacts.iter().map(|c| c.id.0).max().unwrap_or(0);
        let mut next_id = book.next_id.max(max_id + 1).max(1);

        let mut seen_ids = HashSet::new();
        let mut seen_phones = HashSet::new();
        let mut contacts = Vec::with_capacity(book.contacts.len());
        for mut contact in book.contacts {
            if !seen_phones.insert(contact.phone.clone()) {
                log::warn!(
                    "Dropping contact {} ({}): phone {} is already listed",
                    contact.id,
                    contact.name,
                    contact.phone
                );
                continue;
            }
            if !seen_ids.insert(contact.id) {
                let fresh = ContactId(next_id);
                next_id += 1;
                log::warn!("Contact {} ({}) reuses an id, renumbered to {}", contact.id, contact.name, fresh);
                contact.id = fresh;
                seen_ids.insert(fresh);
            }
            contacts.push(contact);
        }

        Self {
            book: ContactBook { next_id, contacts },
            listeners: Vec::new(),
        }
    }

    pub fn into_shared(self) -> SharedContacts {
        Arc::new(RwLock::new(self))
    }

    pub fn book(&self) -> &ContactBook {
        &self.book
    }

    /// Register a callback invoked after every successful mutation.
    pub fn on_change(&mut self, listener: impl Fn(ContactsChanged) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn add(&mut self, contact: NewContact) -> Result<ContactId, ValidationError> {
        let (name, phone) = contact.normalized()?;
        if self.book.contacts.iter().any(|c| c.phone == phone) {
            return Err(ValidationError::DuplicatePhone(phone));
        }

        let id = ContactId(self.book.next_id.max(1));
        self.book.next_id = id.0 + 1;
        self.book.contacts.push(EmergencyContact {
            id,
            name,
            phone,
            primary: contact.primary,
            relationship: contact.relationship,
        });
        log::info!("Added emergency contact {}", id);
        self.notify();
        Ok(id)
    }

    pub fn update(&mut self, id: ContactId, contact: NewContact) -> Result<(), ValidationError> {
        let (name, phone) = contact.normalized()?;
        if self.book.contacts.iter().any(|c| c.id != id && c.phone == phone) {
            return Err(ValidationError::DuplicatePhone(phone));
        }
        let existing = self
            .book
            .contacts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(ValidationError::UnknownContact(id))?;
        existing.name = name;
        existing.phone = phone;
        existing.primary = contact.primary;
        existing.relationship = contact.relationship;
        self.notify();
        Ok(())
    }

    pub fn remove(&mut self, id: ContactId) -> Result<EmergencyContact, ValidationError> {
        let index = self
            .book
            .contacts
            .iter()
            .position(|c| c.id == id)
            .ok_or(ValidationError::UnknownContact(id))?;
        let removed = self.book.contacts.remove(index);
        log::info!("Removed emergency contact {}", id);
        self.notify();
        Ok(removed)
    }

    pub fn set_primary(&mut self, id: ContactId, primary: bool) -> Result<(), ValidationError> {
        let contact = self
            .book
            .contacts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(ValidationError::UnknownContact(id))?;
        if contact.primary != primary {
            contact.primary = primary;
            self.notify();
        }
        Ok(())
    }

    pub fn get(&self, id: ContactId) -> Option<&EmergencyContact> {
        self.book.contacts.iter().find(|c| c.id == id)
    }

    pub fn len(&self) -> usize {
        self.book.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.book.contacts.is_empty()
    }

    /// Ordered copy of the contacts: primaries first, then insertion order.
    pub fn snapshot(&self) -> Vec<EmergencyContact> {
        let mut contacts = self.book.contacts.clone();
        // sort_by_key is stable, so insertion order survives within each group
        contacts.sort_by_key(|c| !c.primary);
        contacts
    }

    fn notify(&self) {
        let change = ContactsChanged { count: self.len() };
        for listener in &self.listeners {
            listener(change);
        }
    }
}

/// Read a consistent snapshot from a shared registry, tolerating a poisoned lock.
pub fn snapshot_shared(contacts: &SharedContacts) -> Vec<EmergencyContact> {
    contacts
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .snapshot()
}
