//! Long-press-then-drag relocation of a single marker.
//!
//! ```text
//! Idle --down--> Armed --timer--> Dragging --up(moved)--> Committing --resolve--> Idle
//!                  |                  |
//!                  +--up/cancel--> Idle <--up(still)/cancel--+
//! ```
//!
//! The controller performs no side effects itself. Each event returns the
//! [`DragEffect`]s the owner has to carry out, which keeps every acquire of the
//! viewport controls paired with a release in one place.

use egui::{Pos2, Vec2};
use tokio::time::Instant;

use crate::config::DragConfig;
use crate::entity::EntityId;
use crate::map::geo::Coordinate;
use crate::map::viewport::Viewport;

pub type PointerId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum DragPhase {
    Idle,
    Armed {
        pointer_id: PointerId,
        press_pos: Pos2,
        last_pos: Pos2,
        origin: Coordinate,
        deadline: Instant,
    },
    Dragging {
        pointer_id: PointerId,
        origin: Coordinate,
        start_pos: Pos2,
        live: Coordinate,
    },
    /// Released at `target`; waiting for the location update to settle.
    Committing { origin: Coordinate, target: Coordinate },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DragEffect {
    /// Disable pan, scroll zoom and double-click zoom.
    AcquireViewport,
    ReleaseViewport,
    CapturePointer(PointerId),
    ReleasePointer(PointerId),
    /// Tell the user the marker can now be moved.
    Grabbed { name: String },
    /// Ask the location-update collaborator to persist `target`.
    Commit { origin: Coordinate, target: Coordinate },
    /// The update succeeded; an undo record can be created.
    Committed { origin: Coordinate, target: Coordinate },
    /// Put the marker back at `to`.
    SnapBack { to: Coordinate },
    /// The update failed.
    Failed { reason: String },
}

/// Gesture state for one marker.
#[derive(Debug, Clone)]
pub struct DragGestureController {
    entity_id: EntityId,
    name: String,
    config: DragConfig,
    phase: DragPhase,
}

impl DragGestureController {
    pub fn new(entity_id: impl Into<EntityId>, name: impl Into<String>, config: DragConfig) -> Self {
        Self {
            entity_id: entity_id.into(),
            name: name.into(),
            config,
            phase: DragPhase::Idle,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn phase(&self) -> &DragPhase {
        &self.phase
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, DragPhase::Idle)
    }

    pub fn is_dragging(&self) -> bool {
        matches!(self.phase, DragPhase::Dragging { .. })
    }

    /// The pointer this gesture is tracking, if any.
    pub fn pointer_id(&self) -> Option<PointerId> {
        match self.phase {
            DragPhase::Armed { pointer_id, .. } | DragPhase::Dragging { pointer_id, .. } => Some(pointer_id),
            _ => None,
        }
    }

    /// Where the marker should be drawn while a gesture is in flight.
    pub fn display_coordinate(&self) -> Option<Coordinate> {
        match self.phase {
            DragPhase::Dragging { live, .. } => Some(live),
            DragPhase::Committing { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Time left before an armed press turns into a drag.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            DragPhase::Armed { deadline, .. } => Some(deadline),
            _ => None,
        }
    }

    pub fn pointer_down(&mut self, pointer_id: PointerId, pos: Pos2, origin: Coordinate, now: Instant) -> Vec<DragEffect> {
        if !self.is_idle() {
            return Vec::new();
        }
        self.phase = DragPhase::Armed {
            pointer_id,
            press_pos: pos,
            last_pos: pos,
            origin,
            deadline: now + self.config.long_press,
        };
        Vec::new()
    }

    /// Fires the long-press timer once its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Vec<DragEffect> {
        let DragPhase::Armed {
            pointer_id,
            last_pos,
            origin,
            deadline,
            ..
        } = self.phase
        else {
            return Vec::new();
        };
        if now < deadline {
            return Vec::new();
        }
        self.phase = DragPhase::Dragging {
            pointer_id,
            origin,
            start_pos: last_pos,
            live: origin,
        };
        log::info!("drag armed for {} ({})", self.name, self.entity_id);
        vec![
            DragEffect::AcquireViewport,
            DragEffect::CapturePointer(pointer_id),
            DragEffect::Grabbed { name: self.name.clone() },
        ]
    }

    pub fn pointer_move(&mut self, pointer_id: PointerId, pos: Pos2, viewport: &Viewport) -> Vec<DragEffect> {
        match &mut self.phase {
            DragPhase::Armed {
                pointer_id: owner,
                press_pos,
                last_pos,
                ..
            } if *owner == pointer_id => {
                *last_pos = pos;
                if (pos - *press_pos).length() > self.config.arm_tolerance {
                    log::debug!("long press on {} abandoned after pointer travel", self.entity_id);
                    self.phase = DragPhase::Idle;
                }
                Vec::new()
            }
            DragPhase::Dragging {
                pointer_id: owner,
                origin,
                start_pos,
                live,
            } if *owner == pointer_id => {
                *live = dragged_coordinate(viewport, origin, pos - *start_pos);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    pub fn pointer_up(&mut self, pointer_id: PointerId, pos: Pos2, viewport: &Viewport) -> Vec<DragEffect> {
        match self.phase {
            DragPhase::Armed { pointer_id: owner, .. } if owner == pointer_id => {
                self.phase = DragPhase::Idle;
                Vec::new()
            }
            DragPhase::Dragging {
                pointer_id: owner,
                origin,
                start_pos,
                ..
            } if owner == pointer_id => {
                let target = dragged_coordinate(viewport, &origin, pos - start_pos);
                if target.differs_from(&origin, self.config.move_epsilon) {
                    self.phase = DragPhase::Committing { origin, target };
                    vec![DragEffect::ReleasePointer(pointer_id), DragEffect::Commit { origin, target }]
                } else {
                    self.phase = DragPhase::Idle;
                    vec![
                        DragEffect::ReleasePointer(pointer_id),
                        DragEffect::SnapBack { to: origin },
                        DragEffect::ReleaseViewport,
                    ]
                }
            }
            _ => Vec::new(),
        }
    }

    pub fn pointer_cancel(&mut self, pointer_id: PointerId) -> Vec<DragEffect> {
        match self.phase {
            DragPhase::Armed { pointer_id: owner, .. } if owner == pointer_id => {
                self.phase = DragPhase::Idle;
                Vec::new()
            }
            DragPhase::Dragging {
                pointer_id: owner,
                origin,
                ..
            } if owner == pointer_id => {
                self.phase = DragPhase::Idle;
                vec![
                    DragEffect::ReleasePointer(pointer_id),
                    DragEffect::SnapBack { to: origin },
                    DragEffect::ReleaseViewport,
                ]
            }
            _ => Vec::new(),
        }
    }

    /// Pointer left the marker. Only a pending press is affected; a drag holds pointer capture.
    pub fn pointer_leave(&mut self, pointer_id: PointerId) -> Vec<DragEffect> {
        match self.phase {
            DragPhase::Armed { .. } => self.pointer_cancel(pointer_id),
            _ => Vec::new(),
        }
    }

    /// Outcome of the location update started by [`DragEffect::Commit`].
    pub fn resolve(&mut self, result: Result<(), String>) -> Vec<DragEffect> {
        let DragPhase::Committing { origin, target } = self.phase else {
            return Vec::new();
        };
        self.phase = DragPhase::Idle;
        match result {
            Ok(()) => vec![DragEffect::ReleaseViewport, DragEffect::Committed { origin, target }],
            Err(reason) => vec![
                DragEffect::SnapBack { to: origin },
                DragEffect::ReleaseViewport,
                DragEffect::Failed { reason },
            ],
        }
    }

    /// Tears the gesture down from any phase, releasing whatever it holds.
    pub fn abort(&mut self) -> Vec<DragEffect> {
        let phase = std::mem::replace(&mut self.phase, DragPhase::Idle);
        match phase {
            DragPhase::Idle | DragPhase::Armed { .. } => Vec::new(),
            DragPhase::Dragging { pointer_id, origin, .. } => vec![
                DragEffect::ReleasePointer(pointer_id),
                DragEffect::SnapBack { to: origin },
                DragEffect::ReleaseViewport,
            ],
            DragPhase::Committing { origin, .. } => {
                vec![DragEffect::SnapBack { to: origin }, DragEffect::ReleaseViewport]
            }
        }
    }
}

/// The marker's screen position shifted by the raw pointer delta, mapped back to the map.
fn dragged_coordinate(viewport: &Viewport, origin: &Coordinate, delta: Vec2) -> Coordinate {
    viewport.unproject(viewport.project(origin) + delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use egui::{pos2, vec2};
    use std::time::Duration;

    const POINTER: PointerId = 7;

    fn viewport() -> Viewport {
        Viewport::new(Coordinate::new(42.5, 1.52), 14.0, vec2(800.0, 600.0))
    }

    fn controller() -> DragGestureController {
        DragGestureController::new("a", "Alpha", DragConfig::default())
    }

    fn grabbed(c: &mut DragGestureController, now: Instant) -> Vec<DragEffect> {
        let origin = Coordinate::new(42.5, 1.52);
        let at = viewport().project(&origin);
        c.pointer_down(POINTER, at, origin, now);
        c.poll(now + Duration::from_secs(3))
    }

    fn acquires(effects: &[DragEffect]) -> usize {
        effects.iter().filter(|e| **e == DragEffect::AcquireViewport).count()
    }

    fn releases(effects: &[DragEffect]) -> usize {
        effects.iter().filter(|e| **e == DragEffect::ReleaseViewport).count()
    }

    #[test]
    fn short_press_returns_to_idle_without_commit() {
        let now = Instant::now();
        let mut c = controller();
        let vp = viewport();
        let mut effects = c.pointer_down(POINTER, pos2(400.0, 300.0), Coordinate::new(42.5, 1.52), now);
        effects.extend(c.poll(now + Duration::from_millis(2999)));
        effects.extend(c.pointer_up(POINTER, pos2(450.0, 300.0), &vp));
        effects.extend(c.poll(now + Duration::from_secs(10)));
        assert!(c.is_idle());
        assert!(effects.is_empty());
    }

    #[test]
    fn long_press_grabs_marker() {
        let now = Instant::now();
        let mut c = controller();
        let effects = grabbed(&mut c, now);
        assert_eq!(
            effects,
            vec![
                DragEffect::AcquireViewport,
                DragEffect::CapturePointer(POINTER),
                DragEffect::Grabbed { name: "Alpha".into() }
            ]
        );
        assert!(c.is_dragging());
    }

    #[test]
    fn moved_release_commits_once_with_released_coordinate() {
        let now = Instant::now();
        let vp = viewport();
        let mut c = controller();
        let mut effects = grabbed(&mut c, now);
        let start = vp.project(&Coordinate::new(42.5, 1.52));
        effects.extend(c.pointer_move(POINTER, start + vec2(30.0, 10.0), &vp));
        let live = c.display_coordinate().unwrap();
        effects.extend(c.pointer_up(POINTER, start + vec2(40.0, 20.0), &vp));

        let commits: Vec<_> = effects.iter().filter(|e| matches!(e, DragEffect::Commit { .. })).collect();
        assert_eq!(commits.len(), 1);
        let DragEffect::Commit { origin, target } = commits[0] else { unreachable!() };
        assert_eq!(*origin, Coordinate::new(42.5, 1.52));
        assert_eq!(*target, vp.unproject(start + vec2(40.0, 20.0)));
        assert_ne!(live, *target);

        // Controls stay disabled until the update settles.
        assert_eq!(releases(&effects), 0);
        let settled = c.resolve(Ok(()));
        assert_eq!(releases(&settled), 1);
        assert!(matches!(settled[1], DragEffect::Committed { .. }));
        assert!(c.is_idle());
    }

    #[test]
    fn failed_update_snaps_back_and_releases() {
        let now = Instant::now();
        let vp = viewport();
        let mut c = controller();
        let mut effects = grabbed(&mut c, now);
        let start = vp.project(&Coordinate::new(42.5, 1.52));
        effects.extend(c.pointer_up(POINTER, start + vec2(50.0, 0.0), &vp));
        effects.extend(c.resolve(Err("offline".into())));
        assert!(effects.contains(&DragEffect::SnapBack { to: Coordinate::new(42.5, 1.52) }));
        assert!(effects.contains(&DragEffect::Failed { reason: "offline".into() }));
        assert_eq!(acquires(&effects), releases(&effects));
        assert!(c.is_idle());
    }

    #[test]
    fn negligible_move_cancels() {
        let now = Instant::now();
        let vp = viewport();
        let mut c = controller();
        let mut effects = grabbed(&mut c, now);
        let start = vp.project(&Coordinate::new(42.5, 1.52));
        effects.extend(c.pointer_up(POINTER, start, &vp));
        assert!(!effects.iter().any(|e| matches!(e, DragEffect::Commit { .. })));
        assert_eq!(acquires(&effects), releases(&effects));
        assert!(c.is_idle());
    }

    #[test]
    fn every_exit_path_releases_the_viewport() {
        let vp = viewport();
        let start = vp.project(&Coordinate::new(42.5, 1.52));
        let exits: Vec<Box<dyn Fn(&mut DragGestureController) -> Vec<DragEffect>>> = vec![
            Box::new(|c| c.pointer_cancel(POINTER)),
            Box::new(|c| c.abort()),
            Box::new(move |c| c.pointer_up(POINTER, start, &viewport())),
            Box::new(move |c| {
                let mut e = c.pointer_up(POINTER, start + vec2(25.0, 25.0), &viewport());
                e.extend(c.resolve(Ok(())));
                e
            }),
            Box::new(move |c| {
                let mut e = c.pointer_up(POINTER, start + vec2(25.0, 25.0), &viewport());
                e.extend(c.resolve(Err("nope".into())));
                e
            }),
            Box::new(move |c| {
                let mut e = c.pointer_up(POINTER, start + vec2(25.0, 25.0), &viewport());
                e.extend(c.abort());
                e
            }),
        ];
        for exit in exits {
            let mut c = controller();
            let mut effects = grabbed(&mut c, Instant::now());
            effects.extend(exit(&mut c));
            assert_eq!(acquires(&effects), 1);
            assert_eq!(releases(&effects), 1, "{effects:?}");
            assert!(c.is_idle());
        }
    }

    #[test]
    fn other_pointers_are_ignored() {
        let now = Instant::now();
        let vp = viewport();
        let mut c = controller();
        grabbed(&mut c, now);
        assert!(c.pointer_up(POINTER + 1, pos2(0.0, 0.0), &vp).is_empty());
        assert!(c.pointer_cancel(POINTER + 1).is_empty());
        assert!(c.is_dragging());
        assert!(c.pointer_down(POINTER + 1, pos2(0.0, 0.0), Coordinate::default(), now).is_empty());
        assert_eq!(c.pointer_id(), Some(POINTER));
    }

    #[test]
    fn travel_while_armed_gives_up_the_press() {
        let now = Instant::now();
        let vp = viewport();
        let mut c = controller();
        c.pointer_down(POINTER, pos2(100.0, 100.0), Coordinate::new(42.5, 1.52), now);
        c.pointer_move(POINTER, pos2(103.0, 100.0), &vp);
        assert!(matches!(c.phase(), DragPhase::Armed { .. }));
        c.pointer_move(POINTER, pos2(140.0, 100.0), &vp);
        assert!(c.is_idle());
        assert!(c.poll(now + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn leave_cancels_only_pending_press() {
        let now = Instant::now();
        let mut c = controller();
        c.pointer_down(POINTER, pos2(100.0, 100.0), Coordinate::new(42.5, 1.52), now);
        assert!(c.pointer_leave(POINTER).is_empty());
        assert!(c.is_idle());

        grabbed(&mut c, now);
        assert!(c.pointer_leave(POINTER).is_empty());
        assert!(c.is_dragging());
    }
}
