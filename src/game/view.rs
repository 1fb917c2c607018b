//! Per-connection view state
//!
//! Tracks which object ids a player currently sees and accumulates the
//! full / partial / deleted lists flushed into the next Update packet.

use std::collections::BTreeSet;

use glam::Vec2;

use super::collision::Aabb;
use super::objects::ObjectId;

/// Zoom level a fresh player sees the world at.
pub const DEFAULT_ZOOM: u8 = 28;

/// Culling rectangle centred on `center`: half extents are `zoom + pad`.
pub fn cull_rect(center: Vec2, zoom: u8, pad_x: f32, pad_y: f32) -> Aabb {
    let zoom = zoom as f32;
    Aabb::from_center(center, Vec2::new(zoom + pad_x, zoom + pad_y))
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmoteEvent {
    pub player_id: ObjectId,
    pub type_id: u16,
    pub is_ping: bool,
    pub position: Vec2,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExplosionEvent {
    pub position: Vec2,
    pub type_id: u16,
    pub layer: u8,
}

/// Cause of a kill, as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DamageType {
    Player = 0,
    Bleeding = 1,
    Gas = 2,
    Airdrop = 3,
    Airstrike = 4,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KillEvent {
    pub damage_type: DamageType,
    pub weapon_type: u16,
    pub source_type: u16,
    pub target_id: ObjectId,
    pub killer_id: ObjectId,
    pub kill_credit_id: ObjectId,
    pub killer_kills: u8,
}

/// Everything accumulated for one recipient since the last flush.
#[derive(Debug, Default, Clone)]
pub struct ViewDiff {
    pub full: Vec<ObjectId>,
    pub partial: Vec<ObjectId>,
    pub deleted: Vec<ObjectId>,
    pub emotes: Vec<EmoteEvent>,
    pub explosions: Vec<ExplosionEvent>,
    pub kills: Vec<KillEvent>,
}

#[derive(Debug, Clone)]
pub struct ViewState {
    visible: BTreeSet<ObjectId>,
    full: BTreeSet<ObjectId>,
    partial: BTreeSet<ObjectId>,
    deleted: BTreeSet<ObjectId>,
    emotes: Vec<EmoteEvent>,
    explosions: Vec<ExplosionEvent>,
    kills: Vec<KillEvent>,

    // active-player block flags
    pub health_dirty: bool,
    pub boost_dirty: bool,
    pub zoom_dirty: bool,
    pub weapons_dirty: bool,
    pub active_id_dirty: bool,
    pub status_dirty: bool,
    /// Send the whole roster in the next player-infos section.
    pub roster_dirty: bool,
    /// Gas state must be re-sent.
    pub gas_dirty: bool,
}

impl Default for ViewState {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewState {
    /// A fresh view has every active-player flag raised so the first Update is complete.
    pub fn new() -> Self {
        Self {
            visible: BTreeSet::new(),
            full: BTreeSet::new(),
            partial: BTreeSet::new(),
            deleted: BTreeSet::new(),
            emotes: Vec::new(),
            explosions: Vec::new(),
            kills: Vec::new(),
            health_dirty: true,
            boost_dirty: true,
            zoom_dirty: true,
            weapons_dirty: true,
            active_id_dirty: true,
            status_dirty: true,
            roster_dirty: true,
            gas_dirty: true,
        }
    }

    pub fn visible(&self) -> &BTreeSet<ObjectId> {
        &self.visible
    }

    pub fn is_visible(&self, id: ObjectId) -> bool {
        self.visible.contains(&id)
    }

    /// Returns true if the object just entered view.
    pub fn mark_visible(&mut self, id: ObjectId) -> bool {
        if !self.visible.insert(id) {
            return false;
        }
        self.partial.remove(&id);
        self.deleted.remove(&id);
        self.full.insert(id);
        true
    }

    /// Returns true if the object just left view.
    pub fn mark_invisible(&mut self, id: ObjectId) -> bool {
        if !self.visible.remove(&id) {
            return false;
        }
        self.full.remove(&id);
        self.partial.remove(&id);
        self.deleted.insert(id);
        true
    }

    /// Replace the visible set with `now_visible`, producing enter/exit entries.
    pub fn update_visible(&mut self, now_visible: &BTreeSet<ObjectId>) {
        let exited: Vec<ObjectId> = self.visible.difference(now_visible).copied().collect();
        for id in exited {
            self.mark_invisible(id);
        }
        for &id in now_visible {
            self.mark_visible(id);
        }
    }

    /// Full sync wins over partial for the same id.
    pub fn mark_full_dirty(&mut self, id: ObjectId) {
        if self.visible.contains(&id) {
            self.partial.remove(&id);
            self.full.insert(id);
        }
    }

    pub fn mark_partial_dirty(&mut self, id: ObjectId) {
        if self.visible.contains(&id) && !self.full.contains(&id) {
            self.partial.insert(id);
        }
    }

    pub fn push_emote(&mut self, emote: EmoteEvent) {
        self.emotes.push(emote);
    }

    pub fn push_explosion(&mut self, explosion: ExplosionEvent) {
        self.explosions.push(explosion);
    }

    pub fn push_kill(&mut self, kill: KillEvent) {
        self.kills.push(kill);
    }

    /// Drain the accumulated lists. Called once per tick by the encoder.
    pub fn flush(&mut self) -> ViewDiff {
        ViewDiff {
            full: std::mem::take(&mut self.full).into_iter().collect(),
            partial: std::mem::take(&mut self.partial).into_iter().collect(),
            deleted: std::mem::take(&mut self.deleted).into_iter().collect(),
            emotes: std::mem::take(&mut self.emotes),
            explosions: std::mem::take(&mut self.explosions),
            kills: std::mem::take(&mut self.kills),
        }
    }

    /// Lower every active-player flag after an Update has been written.
    pub fn clear_flags(&mut self) {
        self.health_dirty = false;
        self.boost_dirty = false;
        self.zoom_dirty = false;
        self.weapons_dirty = false;
        self.active_id_dirty = false;
        self.status_dirty = false;
        self.roster_dirty = false;
        self.gas_dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn entering_and_leaving_view() {
        let mut view = ViewState::new();
        assert!(view.mark_visible(4));
        assert!(!view.mark_visible(4));
        let diff = view.flush();
        assert_eq!(diff.full, vec![4]);
        assert!(diff.deleted.is_empty());

        assert!(view.mark_invisible(4));
        let diff = view.flush();
        assert!(diff.full.is_empty());
        assert_eq!(diff.deleted, vec![4]);
        assert!(!view.is_visible(4));
    }

    #[test]
    fn exit_in_same_tick_cancels_full_entry() {
        let mut view = ViewState::new();
        view.mark_visible(9);
        view.mark_invisible(9);
        let diff = view.flush();
        assert!(diff.full.is_empty());
        assert_eq!(diff.deleted, vec![9]);
    }

    #[test]
    fn full_dirty_overrides_partial() {
        let mut view = ViewState::new();
        view.mark_visible(1);
        view.flush();
        view.mark_partial_dirty(1);
        view.mark_full_dirty(1);
        view.mark_partial_dirty(1);
        let diff = view.flush();
        assert_eq!(diff.full, vec![1]);
        assert!(diff.partial.is_empty());
    }

    #[test]
    fn dirty_marks_ignore_unseen_objects() {
        let mut view = ViewState::new();
        view.mark_full_dirty(2);
        view.mark_partial_dirty(3);
        let diff = view.flush();
        assert!(diff.full.is_empty() && diff.partial.is_empty() && diff.deleted.is_empty());
    }

    #[test]
    fn update_visible_diffs_sets() {
        let mut view = ViewState::new();
        view.update_visible(&BTreeSet::from([1, 2, 3]));
        view.flush();
        view.update_visible(&BTreeSet::from([2, 3, 4]));
        let diff = view.flush();
        assert_eq!(diff.full, vec![4]);
        assert_eq!(diff.deleted, vec![1]);
        assert_eq!(view.visible(), &BTreeSet::from([2, 3, 4]));
    }

    #[test]
    fn cull_rect_is_asymmetric() {
        let rect = cull_rect(Vec2::new(100.0, 100.0), DEFAULT_ZOOM, 20.0, 15.0);
        assert_eq!(rect.min, Vec2::new(52.0, 57.0));
        assert_eq!(rect.max, Vec2::new(148.0, 143.0));
    }

    proptest! {
        #[test]
        fn full_and_partial_never_overlap(ops in prop::collection::vec((0u8..4, 1u16..8), 0..64)) {
            let mut view = ViewState::new();
            for (op, id) in ops {
                match op {
                    0 => { view.mark_visible(id); }
                    1 => { view.mark_invisible(id); }
                    2 => view.mark_full_dirty(id),
                    _ => view.mark_partial_dirty(id),
                }
            }
            let visible = view.visible().clone();
            let diff = view.flush();
            for id in &diff.full {
                prop_assert!(!diff.partial.contains(id));
                prop_assert!(!diff.deleted.contains(id));
                prop_assert!(visible.contains(id));
            }
            for id in &diff.deleted {
                prop_assert!(!visible.contains(id));
            }
        }
    }
}
