//! Collision shapes and overlap queries

use glam::Vec2;

use super::catalog::ShapeDef;

/// Rotate a template-space vector by a quarter-turn orientation (0..=3).
pub fn rotate_by_orientation(v: Vec2, orientation: u8) -> Vec2 {
    match orientation & 3 {
        0 => v,
        1 => Vec2::new(-v.y, v.x),
        2 => Vec2::new(-v.x, -v.y),
        _ => Vec2::new(v.y, -v.x),
    }
}

/// Two layers interact if the ground bit matches or both are on stairs.
pub fn same_layer(a: u8, b: u8) -> bool {
    (a & 1) == (b & 1) || ((a & 2) != 0 && (b & 2) != 0)
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ColliderError {
    #[error("degenerate collider: {0}")]
    Degenerate(&'static str),
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec2,
    pub max: Vec2,
}

impl Aabb {
    pub fn from_center(center: Vec2, half: Vec2) -> Self {
        Self {
            min: center - half,
            max: center + half,
        }
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }

    pub fn contains(&self, p: Vec2) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    pub fn center(&self) -> Vec2 {
        (self.min + self.max) * 0.5
    }
}

/// Result of an overlap test: `dir` points from the first shape toward the second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Penetration {
    pub dir: Vec2,
    pub depth: f32,
}

/// World-space collider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Collider {
    Circle { pos: Vec2, rad: f32 },
    Rect { min: Vec2, max: Vec2 },
}

impl Collider {
    pub fn circle(pos: Vec2, rad: f32) -> Result<Self, ColliderError> {
        if !(rad.is_finite() && rad > 0.0) || !pos.is_finite() {
            return Err(ColliderError::Degenerate("circle radius must be positive"));
        }
        Ok(Self::Circle { pos, rad })
    }

    pub fn rect(center: Vec2, half: Vec2) -> Result<Self, ColliderError> {
        if !(half.is_finite() && half.x > 0.0 && half.y > 0.0) || !center.is_finite() {
            return Err(ColliderError::Degenerate("rect extents must be positive"));
        }
        Ok(Self::Rect {
            min: center - half,
            max: center + half,
        })
    }

    /// Resolve a template shape at a world position, orientation and scale.
    pub fn from_def(
        shape: &ShapeDef,
        position: Vec2,
        orientation: u8,
        scale: f32,
    ) -> Result<Self, ColliderError> {
        match shape {
            ShapeDef::Circle { radius, offset } => Self::circle(
                position + rotate_by_orientation(*offset, orientation) * scale,
                radius * scale,
            ),
            ShapeDef::Rect {
                half_width,
                half_height,
                offset,
            } => {
                let half = rotate_by_orientation(Vec2::new(*half_width, *half_height), orientation)
                    .abs();
                Self::rect(
                    position + rotate_by_orientation(*offset, orientation) * scale,
                    half * scale,
                )
            }
        }
    }

    pub fn center(&self) -> Vec2 {
        match self {
            Self::Circle { pos, .. } => *pos,
            Self::Rect { min, max } => (*min + *max) * 0.5,
        }
    }

    pub fn bounds(&self) -> Aabb {
        match self {
            Self::Circle { pos, rad } => Aabb::from_center(*pos, Vec2::splat(*rad)),
            Self::Rect { min, max } => Aabb {
                min: *min,
                max: *max,
            },
        }
    }

    pub fn translated(&self, delta: Vec2) -> Self {
        match self {
            Self::Circle { pos, rad } => Self::Circle {
                pos: *pos + delta,
                rad: *rad,
            },
            Self::Rect { min, max } => Self::Rect {
                min: *min + delta,
                max: *max + delta,
            },
        }
    }

    /// Distance from `p` to the collider surface (0 when inside).
    pub fn distance_to_point(&self, p: Vec2) -> f32 {
        match self {
            Self::Circle { pos, rad } => (p.distance(*pos) - rad).max(0.0),
            Self::Rect { min, max } => {
                let closest = p.clamp(*min, *max);
                p.distance(closest)
            }
        }
    }

    pub fn intersects(&self, other: &Collider) -> bool {
        self.penetration(other).is_some()
    }

    pub fn penetration(&self, other: &Collider) -> Option<Penetration> {
        match (self, other) {
            (Self::Circle { pos: a, rad: ra }, Self::Circle { pos: b, rad: rb }) => {
                circle_circle(*a, *ra, *b, *rb)
            }
            (Self::Circle { pos, rad }, Self::Rect { min, max }) => {
                circle_rect(*pos, *rad, *min, *max)
            }
            (Self::Rect { min, max }, Self::Circle { pos, rad }) => {
                circle_rect(*pos, *rad, *min, *max).map(|p| Penetration {
                    dir: -p.dir,
                    depth: p.depth,
                })
            }
            (Self::Rect { min: amin, max: amax }, Self::Rect { min: bmin, max: bmax }) => {
                rect_rect(*amin, *amax, *bmin, *bmax)
            }
        }
    }
}

fn circle_circle(a: Vec2, ra: f32, b: Vec2, rb: f32) -> Option<Penetration> {
    let d = b - a;
    let dist = d.length();
    let r = ra + rb;
    if dist >= r {
        return None;
    }
    let dir = if dist > 1e-5 { d / dist } else { Vec2::X };
    Some(Penetration {
        dir,
        depth: r - dist,
    })
}

fn circle_rect(pos: Vec2, rad: f32, min: Vec2, max: Vec2) -> Option<Penetration> {
    let inside = pos.x >= min.x && pos.x <= max.x && pos.y >= min.y && pos.y <= max.y;
    if inside {
        // push out through the nearest edge
        let edges = [
            (pos.x - min.x, Vec2::X),
            (max.x - pos.x, Vec2::NEG_X),
            (pos.y - min.y, Vec2::Y),
            (max.y - pos.y, Vec2::NEG_Y),
        ];
        let (dist, dir) = edges
            .into_iter()
            .fold((f32::MAX, Vec2::X), |best, e| if e.0 < best.0 { e } else { best });
        return Some(Penetration {
            dir,
            depth: dist + rad,
        });
    }

    let closest = pos.clamp(min, max);
    let d = closest - pos;
    let dist = d.length();
    if dist >= rad {
        return None;
    }
    Some(Penetration {
        dir: d / dist,
        depth: rad - dist,
    })
}

fn rect_rect(amin: Vec2, amax: Vec2, bmin: Vec2, bmax: Vec2) -> Option<Penetration> {
    let ox = amax.x.min(bmax.x) - amin.x.max(bmin.x);
    let oy = amax.y.min(bmax.y) - amin.y.max(bmin.y);
    if ox <= 0.0 || oy <= 0.0 {
        return None;
    }
    let delta = (bmin + bmax) * 0.5 - (amin + amax) * 0.5;
    if ox < oy {
        Some(Penetration {
            dir: Vec2::new(if delta.x < 0.0 { -1.0 } else { 1.0 }, 0.0),
            depth: ox,
        })
    } else {
        Some(Penetration {
            dir: Vec2::new(0.0, if delta.y < 0.0 { -1.0 } else { 1.0 }),
            depth: oy,
        })
    }
}
