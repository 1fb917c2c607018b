//! Gas (red zone): a safe circle that shrinks through a fixed phase table

use glam::Vec2;
use rand::Rng;

/// Gas mode as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GasMode {
    Inactive = 0,
    Waiting = 1,
    Moving = 2,
}

#[derive(Debug, Clone)]
pub struct GasPhase {
    /// Seconds before this phase starts shrinking
    pub wait_secs: f32,
    /// Seconds to shrink to the target
    pub shrink_secs: f32,
    /// Target radius as a fraction of the initial radius
    pub radius_frac: f32,
    /// Damage per second outside the circle once this phase has started
    pub damage_per_second: f32,
}

#[derive(Debug, Clone)]
pub struct GasConfig {
    pub initial_radius: f32,
    pub phases: Vec<GasPhase>,
}

impl GasConfig {
    /// Default phase table for a map of the given size.
    pub fn for_map(width: f32, height: f32) -> Self {
        let phase = |wait_secs, shrink_secs, radius_frac, damage_per_second| GasPhase {
            wait_secs,
            shrink_secs,
            radius_frac,
            damage_per_second,
        };
        Self {
            initial_radius: width.max(height) * 0.75,
            phases: vec![
                phase(80.0, 30.0, 0.6, 2.0),
                phase(60.0, 25.0, 0.35, 5.0),
                phase(45.0, 20.0, 0.18, 10.0),
                phase(30.0, 15.0, 0.05, 15.0),
                phase(20.0, 10.0, 0.0, 25.0),
            ],
        }
    }
}

/// Snapshot of the circle for the Update gas section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GasData {
    pub mode: GasMode,
    pub duration: f32,
    pub pos_old: Vec2,
    pub pos_new: Vec2,
    pub rad_old: f32,
    pub rad_new: f32,
}

/// What changed during one advance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GasTick {
    /// Mode or target circle changed; resend the gas section.
    pub stage_changed: bool,
    /// Damage to apply to every player outside the circle.
    pub damage: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct Gas {
    config: GasConfig,
    pub mode: GasMode,
    stage: usize,
    timer: f32,
    duration: f32,
    pos_old: Vec2,
    pos_new: Vec2,
    rad_old: f32,
    rad_new: f32,
    pub current_pos: Vec2,
    pub current_rad: f32,
    damage_per_second: f32,
    damage_timer: f32,
}

impl Gas {
    pub fn new(config: GasConfig, center: Vec2) -> Self {
        let radius = config.initial_radius;
        Self {
            config,
            mode: GasMode::Inactive,
            stage: 0,
            timer: 0.0,
            duration: 0.0,
            pos_old: center,
            pos_new: center,
            rad_old: radius,
            rad_new: radius,
            current_pos: center,
            current_rad: radius,
            damage_per_second: 0.0,
            damage_timer: 0.0,
        }
    }

    /// Begin the first waiting period.
    pub fn start(&mut self) {
        if self.mode != GasMode::Inactive || self.config.phases.is_empty() {
            return;
        }
        self.mode = GasMode::Waiting;
        self.duration = self.config.phases[0].wait_secs;
        self.timer = self.duration;
    }

    pub fn data(&self) -> GasData {
        GasData {
            mode: self.mode,
            duration: self.duration,
            pos_old: self.pos_old,
            pos_new: self.pos_new,
            rad_old: self.rad_old,
            rad_new: self.rad_new,
        }
    }

    /// Interpolation fraction of the current shrink (0..=1).
    pub fn progress(&self) -> f32 {
        if self.mode != GasMode::Moving || self.duration <= 0.0 {
            return 0.0;
        }
        (1.0 - self.timer / self.duration).clamp(0.0, 1.0)
    }

    pub fn is_outside(&self, pos: Vec2) -> bool {
        pos.distance(self.current_pos) > self.current_rad
    }

    /// Advance by `dt` seconds.
    pub fn advance<R: Rng>(&mut self, dt: f32, rng: &mut R) -> GasTick {
        let mut tick = GasTick::default();
        if self.mode == GasMode::Inactive {
            return tick;
        }

        self.timer -= dt;
        if self.timer <= 0.0 {
            match self.mode {
                GasMode::Waiting if self.stage < self.config.phases.len() => {
                    // Start shrinking toward a random circle inside the current one
                    let phase = &self.config.phases[self.stage];
                    let target = self.config.initial_radius * phase.radius_frac;
                    let max_offset = (self.current_rad - target).max(0.0);
                    let angle = rng.gen_range(0.0..std::f32::consts::TAU);
                    let offset = if max_offset > 0.0 {
                        rng.gen_range(0.0..max_offset)
                    } else {
                        0.0
                    };

                    self.pos_old = self.current_pos;
                    self.rad_old = self.current_rad;
                    self.pos_new = self.current_pos + Vec2::from_angle(angle) * offset;
                    self.rad_new = target;
                    self.damage_per_second = phase.damage_per_second;
                    self.duration = phase.shrink_secs;
                    self.timer = self.duration;
                    self.mode = GasMode::Moving;
                    tick.stage_changed = true;
                }
                GasMode::Moving => {
                    self.current_pos = self.pos_new;
                    self.current_rad = self.rad_new;
                    self.pos_old = self.pos_new;
                    self.rad_old = self.rad_new;
                    self.stage += 1;
                    self.mode = GasMode::Waiting;
                    self.duration = self
                        .config
                        .phases
                        .get(self.stage)
                        .map(|p| p.wait_secs)
                        .unwrap_or(0.0);
                    self.timer = self.duration;
                    tick.stage_changed = true;
                }
                _ => {
                    // Final circle reached; hold it
                    self.timer = 0.0;
                }
            }
        }

        if self.mode == GasMode::Moving {
            let t = self.progress();
            self.current_pos = self.pos_old.lerp(self.pos_new, t);
            self.current_rad = self.rad_old + (self.rad_new - self.rad_old) * t;
        }

        if self.damage_per_second > 0.0 {
            self.damage_timer += dt;
            if self.damage_timer >= 1.0 {
                self.damage_timer -= 1.0;
                tick.damage = Some(self.damage_per_second);
            }
        }

        tick
    }
}
