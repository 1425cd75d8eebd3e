//! Cycle-safe traversal of the space graph and top-level group membership.

use std::collections::{HashMap, HashSet};

use indexmap::IndexSet;
use tracing::trace;

use crate::{client::RoomDirectory, types::GroupKey};

/// Descendants of one space, in first-visit order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Descendants {
    /// Joined non-space rooms.
    pub rooms: IndexSet<String>,
    /// Joined nested spaces, excluding the start space.
    pub spaces: IndexSet<String>,
}

/// Resolves space children over a room directory.
#[derive(Debug)]
pub struct HierarchyResolver<'a, D: RoomDirectory + ?Sized> {
    directory: &'a D,
}

impl<'a, D: RoomDirectory + ?Sized> HierarchyResolver<'a, D> {
    pub fn new(directory: &'a D) -> Self {
        Self { directory }
    }

    /// Flattened, deduplicated descendants of `space_id`.
    ///
    /// Child edges are author-settable on both ends and may form cycles; a
    /// space already visited is never walked twice. Unknown or non-joined
    /// children are skipped.
    pub fn descendants(&self, space_id: &str) -> Descendants {
        let mut result = Descendants::default();
        let mut visited = HashSet::from([space_id.to_owned()]);
        let mut stack = vec![space_id.to_owned()];

        while let Some(current) = stack.pop() {
            let Some(space) = self.directory.room(&current) else {
                continue;
            };
            let mut nested = Vec::new();
            for child_id in &space.child_ids {
                let Some(child) = self.directory.room(child_id).filter(|room| room.is_joined())
                else {
                    trace!(parent = %current, child = %child_id, "skipping unjoined space child");
                    continue;
                };
                if !child.is_space {
                    result.rooms.insert(child_id.clone());
                } else if visited.insert(child_id.clone()) {
                    result.spaces.insert(child_id.clone());
                    nested.push(child_id.clone());
                }
            }
            // Walk nested spaces in declaration order.
            stack.extend(nested.into_iter().rev());
        }

        result
    }

    /// Descendant rooms of `space_id`, plus descendant spaces when `include_spaces`.
    pub fn resolve(&self, space_id: &str, include_spaces: bool) -> IndexSet<String> {
        let Descendants { mut rooms, spaces } = self.descendants(space_id);
        if include_spaces {
            rooms.extend(spaces);
        }
        rooms
    }

    /// Joined spaces that no space outside their own cycle reaches, sorted by id.
    ///
    /// Space `S` is a root iff every other joined space reaching `S` is itself
    /// reachable from `S`. Mutual cycles without an external parent therefore
    /// yield every member of the cycle as a root.
    pub fn root_spaces(&self) -> Vec<String> {
        let reach: HashMap<String, IndexSet<String>> = self
            .directory
            .joined_rooms()
            .iter()
            .filter(|room| room.is_space)
            .map(|space| {
                (
                    space.room_id.clone(),
                    self.descendants(&space.room_id).spaces,
                )
            })
            .collect();

        let mut roots: Vec<String> = reach
            .iter()
            .filter(|(space_id, own_reach)| {
                reach.iter().all(|(parent_id, parent_reach)| {
                    parent_id == *space_id
                        || !parent_reach.contains(*space_id)
                        || own_reach.contains(parent_id)
                })
            })
            .map(|(space_id, _)| space_id.clone())
            .collect();
        roots.sort();
        roots
    }

    /// Member rooms of a top-level group, in stable order.
    ///
    /// `Home` holds joined rooms that are neither direct messages nor part of
    /// any joined space; `Directs` holds joined rooms in the DM registry.
    pub fn group_members(&self, group: &GroupKey) -> Vec<String> {
        match group {
            GroupKey::Space(space_id) => self.resolve(space_id, false).into_iter().collect(),
            GroupKey::Directs => {
                let directs = self.directory.direct_room_ids();
                self.directory
                    .joined_rooms()
                    .iter()
                    .filter(|room| !room.is_space && directs.contains(&room.room_id))
                    .map(|room| room.room_id.clone())
                    .collect()
            }
            GroupKey::Home => {
                let directs = self.directory.direct_room_ids();
                let in_spaces = self.rooms_in_any_space();
                self.directory
                    .joined_rooms()
                    .iter()
                    .filter(|room| {
                        !room.is_space
                            && !directs.contains(&room.room_id)
                            && !in_spaces.contains(&room.room_id)
                    })
                    .map(|room| room.room_id.clone())
                    .collect()
            }
        }
    }

    fn rooms_in_any_space(&self) -> HashSet<String> {
        self.directory
            .joined_rooms()
            .iter()
            .filter(|room| room.is_space)
            .flat_map(|space| self.descendants(&space.room_id).rooms)
            .collect()
    }
}
