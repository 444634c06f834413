//! Attachment lifecycle hooks
//!
//! Record fields holding attachments report every change to the active
//! [`StoreManager`] as a key delta: keys that disappeared are orphaned, keys
//! that appeared are adopted. The tracked containers below apply a mutation
//! only after the manager accepted its delta.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::descriptor::Attachable;
use crate::error::{AttachmentError, AttachmentResult};
use crate::manager::{AttachOptions, StoreManager};
use crate::model::Attachment;
use crate::types::AttachmentType;

/// The content of an attachment-bearing field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttachmentValue {
    #[default]
    Empty,
    Single(Attachment),
    List(Vec<Attachment>),
    Map(BTreeMap<String, Attachment>),
}

impl AttachmentValue {
    /// Distinct attachments by key, first occurrence wins
    pub fn references(&self) -> BTreeMap<&str, &Attachment> {
        let mut refs = BTreeMap::new();
        let items: Box<dyn Iterator<Item = &Attachment> + '_> = match self {
            Self::Empty => Box::new(std::iter::empty()),
            Self::Single(a) => Box::new(std::iter::once(a)),
            Self::List(list) => Box::new(list.iter()),
            Self::Map(map) => Box::new(map.values()),
        };
        for a in items {
            refs.entry(a.key.as_str()).or_insert(a);
        }
        refs
    }

    pub fn is_empty(&self) -> bool {
        self.references().is_empty()
    }
}

impl From<Option<Attachment>> for AttachmentValue {
    fn from(value: Option<Attachment>) -> Self {
        value.map_or(Self::Empty, Self::Single)
    }
}

/// Keys that left and joined a field
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub removed: BTreeSet<String>,
    pub added: BTreeSet<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Report a field change. Each key that left is orphaned and each key that
/// joined is adopted, exactly once.
pub fn on_attachment_changed(
    manager: &StoreManager,
    old: &AttachmentValue,
    new: &AttachmentValue,
) -> AttachmentResult<ChangeSet> {
    let before = old.references();
    let after = new.references();
    let mut changes = ChangeSet::default();

    for (key, attachment) in &before {
        if !after.contains_key(key) {
            manager.orphan(attachment)?;
            changes.removed.insert(key.to_string());
        }
    }
    for (key, attachment) in &after {
        if !before.contains_key(key) {
            manager.adopt(attachment)?;
            changes.added.insert(key.to_string());
        }
    }
    Ok(changes)
}

/// The owning record was deleted; schedule everything it referenced
pub fn on_record_deleted(manager: &StoreManager, value: &AttachmentValue) -> AttachmentResult<()> {
    for attachment in value.references().values() {
        manager.record_deleted(attachment)?;
    }
    Ok(())
}

/// What can be assigned to a single attachment field
#[derive(Debug, Clone)]
pub enum Assignment {
    Clear,
    Attachment(Attachment),
    /// Raw content, attached through the field's type when it allows coercion
    Source(Attachable, AttachOptions),
}

impl From<Attachment> for Assignment {
    fn from(a: Attachment) -> Self {
        Self::Attachment(a)
    }
}

impl From<Option<Attachment>> for Assignment {
    fn from(value: Option<Attachment>) -> Self {
        value.map_or(Self::Clear, Self::Attachment)
    }
}

impl From<Attachable> for Assignment {
    fn from(source: Attachable) -> Self {
        Self::Source(source, AttachOptions::default())
    }
}

/// A field holding at most one attachment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentField {
    value: Option<Attachment>,
}

impl AttachmentField {
    /// Wrap a loaded value; loading is not a change
    pub fn new(value: Option<Attachment>) -> Self {
        Self { value }
    }

    pub fn get(&self) -> Option<&Attachment> {
        self.value.as_ref()
    }

    pub fn value(&self) -> AttachmentValue {
        self.value.clone().into()
    }

    pub fn set(&mut self, manager: &StoreManager, value: Option<Attachment>) -> AttachmentResult<ChangeSet> {
        let next = AttachmentValue::from(value.clone());
        let changes = on_attachment_changed(manager, &self.value(), &next)?;
        self.value = value;
        Ok(changes)
    }

    pub fn clear(&mut self, manager: &StoreManager) -> AttachmentResult<ChangeSet> {
        self.set(manager, None)
    }

    /// Assign with coercion of raw sources
    pub async fn assign(
        &mut self,
        manager: &StoreManager,
        attachment_type: &AttachmentType,
        assignment: impl Into<Assignment>,
    ) -> AttachmentResult<ChangeSet> {
        let value = match assignment.into() {
            Assignment::Clear => None,
            Assignment::Attachment(a) => Some(a),
            Assignment::Source(source, options) => {
                if !attachment_type.is_auto_coercion() {
                    return Err(AttachmentError::Coercion(format!(
                        "{} fields accept attachments only, got {}",
                        attachment_type.kind(),
                        source.origin()
                    )));
                }
                Some(manager.attach(attachment_type, source, options).await?)
            }
        };
        self.set(manager, value)
    }
}

/// An ordered list of attachments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentList {
    items: Vec<Attachment>,
}

impl AttachmentList {
    pub fn new(items: Vec<Attachment>) -> Self {
        Self { items }
    }

    pub fn as_slice(&self) -> &[Attachment] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Attachment> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Attachment> {
        self.items.iter()
    }

    pub fn value(&self) -> AttachmentValue {
        AttachmentValue::List(self.items.clone())
    }

    fn apply(&mut self, manager: &StoreManager, next: Vec<Attachment>) -> AttachmentResult<ChangeSet> {
        let next = AttachmentValue::List(next);
        let changes = on_attachment_changed(manager, &self.value(), &next)?;
        if let AttachmentValue::List(items) = next {
            self.items = items;
        }
        Ok(changes)
    }

    pub fn push(&mut self, manager: &StoreManager, attachment: Attachment) -> AttachmentResult<ChangeSet> {
        let mut next = self.items.clone();
        next.push(attachment);
        self.apply(manager, next)
    }

    /// Insert at `index`, clamped to the list length
    pub fn insert(&mut self, manager: &StoreManager, index: usize, attachment: Attachment) -> AttachmentResult<ChangeSet> {
        let mut next = self.items.clone();
        next.insert(index.min(next.len()), attachment);
        self.apply(manager, next)
    }

    pub fn extend(
        &mut self,
        manager: &StoreManager,
        attachments: impl IntoIterator<Item = Attachment>,
    ) -> AttachmentResult<ChangeSet> {
        let mut next = self.items.clone();
        next.extend(attachments);
        self.apply(manager, next)
    }

    /// Replace the item at `index`
    pub fn set(&mut self, manager: &StoreManager, index: usize, attachment: Attachment) -> AttachmentResult<ChangeSet> {
        if index >= self.items.len() {
            return Err(out_of_range(index, self.items.len()));
        }
        let mut next = self.items.clone();
        next[index] = attachment;
        self.apply(manager, next)
    }

    pub fn remove(&mut self, manager: &StoreManager, index: usize) -> AttachmentResult<Attachment> {
        if index >= self.items.len() {
            return Err(out_of_range(index, self.items.len()));
        }
        let mut next = self.items.clone();
        let removed = next.remove(index);
        self.apply(manager, next)?;
        Ok(removed)
    }

    pub fn pop(&mut self, manager: &StoreManager) -> AttachmentResult<Option<Attachment>> {
        let mut next = self.items.clone();
        let popped = next.pop();
        self.apply(manager, next)?;
        Ok(popped)
    }

    pub fn truncate(&mut self, manager: &StoreManager, len: usize) -> AttachmentResult<ChangeSet> {
        let mut next = self.items.clone();
        next.truncate(len);
        self.apply(manager, next)
    }

    pub fn clear(&mut self, manager: &StoreManager) -> AttachmentResult<ChangeSet> {
        self.apply(manager, Vec::new())
    }
}

fn out_of_range(index: usize, len: usize) -> AttachmentError {
    AttachmentError::InvalidOperation(format!("index {} out of range for {} attachments", index, len))
}

/// Attachments keyed by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentMap {
    items: BTreeMap<String, Attachment>,
}

impl AttachmentMap {
    pub fn new(items: BTreeMap<String, Attachment>) -> Self {
        Self { items }
    }

    pub fn get(&self, name: &str) -> Option<&Attachment> {
        self.items.get(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.items.keys()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn value(&self) -> AttachmentValue {
        AttachmentValue::Map(self.items.clone())
    }

    fn apply(&mut self, manager: &StoreManager, next: BTreeMap<String, Attachment>) -> AttachmentResult<ChangeSet> {
        let next = AttachmentValue::Map(next);
        let changes = on_attachment_changed(manager, &self.value(), &next)?;
        if let AttachmentValue::Map(items) = next {
            self.items = items;
        }
        Ok(changes)
    }

    /// Insert under `name`, returning the replaced attachment
    pub fn insert(
        &mut self,
        manager: &StoreManager,
        name: impl Into<String>,
        attachment: Attachment,
    ) -> AttachmentResult<Option<Attachment>> {
        let mut next = self.items.clone();
        let previous = next.insert(name.into(), attachment);
        self.apply(manager, next)?;
        Ok(previous)
    }

    pub fn remove(&mut self, manager: &StoreManager, name: &str) -> AttachmentResult<Option<Attachment>> {
        let mut next = self.items.clone();
        let removed = next.remove(name);
        self.apply(manager, next)?;
        Ok(removed)
    }

    pub fn pop_first(&mut self, manager: &StoreManager) -> AttachmentResult<Option<(String, Attachment)>> {
        let mut next = self.items.clone();
        let popped = next.pop_first();
        self.apply(manager, next)?;
        Ok(popped)
    }

    pub fn extend(
        &mut self,
        manager: &StoreManager,
        items: impl IntoIterator<Item = (String, Attachment)>,
    ) -> AttachmentResult<ChangeSet> {
        let mut next = self.items.clone();
        next.extend(items);
        self.apply(manager, next)
    }

    pub fn clear(&mut self, manager: &StoreManager) -> AttachmentResult<ChangeSet> {
        self.apply(manager, BTreeMap::new())
    }
}
