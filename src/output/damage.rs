// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::VecDeque, mem};

use cosmic_output_config::DamageConfig;
use smithay::utils::{Physical, Size};
use tracing::trace;

use super::{Output, OutputError, OutputEvent, StateFields};
use crate::{
    backend::OutputBackend,
    output::FrameScheduler,
    utils::{
        env::full_damage_forced,
        geometry::{bounds, Rect, Region},
    },
};

/// Outcome of [`DamageTracker::record_frame_start`].
#[derive(Debug, Clone, PartialEq)]
pub struct FrameDamage {
    /// If false, the render binding was already released again.
    pub needs_frame: bool,
    /// Area that has to be redrawn, in buffer coordinates.
    pub damage: Region,
    pub age: i32,
}

/// Accumulates damage between frames and reconstructs what a buffer of a
/// given age is missing.
#[derive(Debug)]
pub struct DamageTracker {
    size: Size<i32, Physical>,
    accumulated: Region,
    /// Damage of committed frames, newest first.
    history: VecDeque<Region>,
    history_len: usize,
    max_rects: usize,
    force_full: bool,
    scheduler: FrameScheduler,
}

impl DamageTracker {
    pub fn new<B: OutputBackend>(output: &Output<B>, config: &DamageConfig) -> DamageTracker {
        let mut tracker = DamageTracker {
            size: output.current().buffer_size(),
            accumulated: Region::new(),
            history: VecDeque::with_capacity(config.history_len),
            history_len: config.history_len,
            max_rects: config.max_rects,
            force_full: full_damage_forced(),
            scheduler: output.scheduler().clone(),
        };
        tracker.add_whole();
        tracker
    }

    pub fn size(&self) -> Size<i32, Physical> {
        self.size
    }

    pub fn accumulated(&self) -> &Region {
        &self.accumulated
    }

    pub fn set_force_full(&mut self, force: bool) {
        self.force_full = force;
    }

    /// Adds damage, clipped to the output, and schedules a frame if any is left.
    pub fn add(&mut self, region: &Region) {
        let clipped = region.intersect_rect(&bounds(self.size));
        if clipped.is_empty() {
            return;
        }
        self.accumulated.union(&clipped);
        self.scheduler.schedule_frame();
    }

    pub fn add_rect(&mut self, rect: Rect) {
        self.add(&Region::from_rect(rect));
    }

    pub fn add_whole(&mut self) {
        self.accumulated = Region::from_rect(bounds(self.size));
        self.scheduler.schedule_frame();
    }

    /// Damage a buffer of `age` needs redrawn to show the current frame.
    pub fn damage_for_age(&self, age: i32) -> Region {
        let whole = bounds(self.size);
        if self.force_full || age <= 0 {
            return Region::from_rect(whole);
        }
        let previous = (age - 1) as usize;
        if previous > self.history_len || previous > self.history.len() {
            return Region::from_rect(whole);
        }

        let mut damage = self.accumulated.clone();
        for frame in self.history.iter().take(previous) {
            damage.union(frame);
        }
        if damage.len() > self.max_rects {
            if let Some(extents) = damage.extents() {
                damage = Region::from_rect(extents);
            }
        }
        damage
    }

    /// Attaches the output for rendering and computes the damage to redraw.
    ///
    /// When nothing needs drawing the render binding is rolled back before
    /// returning, and `needs_frame` is false.
    pub fn record_frame_start<B: OutputBackend>(
        &mut self,
        output: &mut Output<B>,
    ) -> Result<FrameDamage, OutputError> {
        let age = output.attach_for_render()?;
        let damage = self.damage_for_age(age);
        let needs_frame = output.needs_frame() || !damage.is_empty();
        if !needs_frame {
            trace!(output = output.name(), "Skipping frame without damage");
            output.rollback_render();
        }
        Ok(FrameDamage {
            needs_frame,
            damage,
            age,
        })
    }

    /// Records a successfully committed frame.
    ///
    /// Only what changed since the previous frame enters the history, never
    /// the age-expanded damage that was redrawn.
    pub fn commit_frame(&mut self) {
        let frame = mem::take(&mut self.accumulated);
        self.history.push_front(frame);
        self.history.truncate(self.history_len);
    }

    pub fn handle_output_event(&mut self, event: &OutputEvent) {
        match event {
            OutputEvent::Commit { committed, size } => {
                if *size != self.size
                    || committed.intersects(
                        StateFields::ENABLED
                            | StateFields::MODE
                            | StateFields::TRANSFORM
                            | StateFields::SCALE,
                    )
                {
                    self.resize(*size);
                }
            }
            OutputEvent::Mode { size } => self.resize(*size),
            OutputEvent::Present { .. } | OutputEvent::Destroy => {}
        }
    }

    fn resize(&mut self, size: Size<i32, Physical>) {
        self.size = size;
        self.history.clear();
        self.add_whole();
    }
}
