//! Container → members index with a derived member → container lookup.
//!
//! The list form (`containers`) is authoritative and is what gets persisted.
//! The lookup form is kept in sync on every [`MembershipIndex::merge`], so
//! resolving a member is a single map access instead of a scan over every
//! container.
//!
//! A member listed under several containers resolves to the container with the
//! smallest id, in both forms.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use kernelsync_shared::MemberDescriptor;

/// Where a member belongs: owning container id and its descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub container_id: String,
    pub descriptor: MemberDescriptor,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, Vec<MemberDescriptor>>",
    into = "BTreeMap<String, Vec<MemberDescriptor>>"
)]
pub struct MembershipIndex {
    containers: BTreeMap<String, Vec<MemberDescriptor>>,
    lookup: HashMap<String, Relation>,
}

impl MembershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from a list-form mapping, deriving the lookup by flattening.
    pub fn from_containers(containers: BTreeMap<String, Vec<MemberDescriptor>>) -> Self {
        let mut lookup: HashMap<String, Relation> = HashMap::new();
        // BTreeMap iteration is ascending, so the first insert per member wins.
        for (container_id, members) in &containers {
            for descriptor in members {
                lookup
                    .entry(descriptor.id.clone())
                    .or_insert_with(|| Relation {
                        container_id: container_id.clone(),
                        descriptor: descriptor.clone(),
                    });
            }
        }
        Self { containers, lookup }
    }

    /// Replace the full member list of `container_id`.
    ///
    /// Members dropped since the previous snapshot stop resolving to this
    /// container. Merging the same snapshot twice is a no-op.
    pub fn merge(&mut self, container_id: &str, items: Vec<MemberDescriptor>) {
        let previous = self
            .containers
            .insert(container_id.to_string(), items)
            .unwrap_or_default();

        let mut displaced: Vec<String> = Vec::new();
        for old in previous {
            let points_here = self
                .lookup
                .get(&old.id)
                .is_some_and(|r| r.container_id == container_id);
            if points_here {
                self.lookup.remove(&old.id);
                displaced.push(old.id);
            }
        }

        let members = self
            .containers
            .get(container_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for descriptor in members {
            let replace = match self.lookup.get(&descriptor.id) {
                None => true,
                Some(existing) => container_id < existing.container_id.as_str(),
            };
            if replace {
                self.lookup.insert(
                    descriptor.id.clone(),
                    Relation {
                        container_id: container_id.to_string(),
                        descriptor: descriptor.clone(),
                    },
                );
            }
        }

        // A displaced member may still be listed by another container.
        for member_id in displaced {
            if !self.lookup.contains_key(&member_id) {
                if let Some(relation) = self.resolve_by_scan(&member_id) {
                    self.lookup.insert(member_id, relation);
                }
            }
        }
    }

    /// Ordered members of a container; empty when the container is unknown.
    pub fn members_of(&self, container_id: &str) -> &[MemberDescriptor] {
        self.containers
            .get(container_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Resolve a member through the lookup form.
    pub fn resolve(&self, member_id: &str) -> Option<&Relation> {
        self.lookup.get(member_id)
    }

    /// Resolve a member by scanning the list form.
    pub fn resolve_by_scan(&self, member_id: &str) -> Option<Relation> {
        self.containers
            .iter()
            .find_map(|(container_id, members)| {
                members.iter().find(|d| d.id == member_id).map(|d| Relation {
                    container_id: container_id.clone(),
                    descriptor: d.clone(),
                })
            })
    }

    pub fn contains_container(&self, container_id: &str) -> bool {
        self.containers.contains_key(container_id)
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn member_count(&self) -> usize {
        self.lookup.len()
    }

    pub fn containers(&self) -> &BTreeMap<String, Vec<MemberDescriptor>> {
        &self.containers
    }
}

impl From<BTreeMap<String, Vec<MemberDescriptor>>> for MembershipIndex {
    fn from(containers: BTreeMap<String, Vec<MemberDescriptor>>) -> Self {
        Self::from_containers(containers)
    }
}

impl From<MembershipIndex> for BTreeMap<String, Vec<MemberDescriptor>> {
    fn from(index: MembershipIndex) -> Self {
        index.containers
    }
}
