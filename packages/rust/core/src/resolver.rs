//! Member → relation resolution over a [`MembershipIndex`].

use std::collections::BTreeMap;

use crate::membership::{MembershipIndex, Relation};

/// Which representation of the index answers queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Representation {
    /// Flattened member → container map.
    #[default]
    Lookup,
    /// Linear scan of the container lists.
    Scan,
}

/// Read-only relation resolver. Both representations give the same answers.
#[derive(Debug, Clone, Copy)]
pub struct RelationResolver<'a> {
    index: &'a MembershipIndex,
    representation: Representation,
}

impl<'a> RelationResolver<'a> {
    pub fn new(index: &'a MembershipIndex) -> Self {
        Self::with_representation(index, Representation::Lookup)
    }

    pub fn with_representation(index: &'a MembershipIndex, representation: Representation) -> Self {
        Self {
            index,
            representation,
        }
    }

    pub fn resolve(&self, member_id: &str) -> Option<Relation> {
        match self.representation {
            Representation::Lookup => self.index.resolve(member_id).cloned(),
            Representation::Scan => self.index.resolve_by_scan(member_id),
        }
    }

    /// Group member ids by owning container, keeping input order inside each
    /// group. Unresolvable ids are dropped.
    pub fn group_by_container<'m>(
        &self,
        member_ids: impl IntoIterator<Item = &'m str>,
    ) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for member_id in member_ids {
            if let Some(relation) = self.resolve(member_id) {
                groups
                    .entry(relation.container_id)
                    .or_default()
                    .push(member_id.to_string());
            }
        }
        groups
    }
}
