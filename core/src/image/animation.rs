//! Playback position of an animated image.

use std::time::{Duration, Instant};

/// Frames with no delay still advance at this rate, matching common browser behaviour.
const MIN_FRAME_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct AnimationState {
    delays: Vec<Duration>,
    current: usize,
    loops_completed: u32,
    /// `None` loops forever.
    loop_limit: Option<u32>,
    frame_started: Instant,
    finished: bool,
}

impl AnimationState {
    pub fn new(delays: Vec<Duration>, now: Instant) -> Self {
        let delays = delays.into_iter().map(|delay| delay.max(MIN_FRAME_DELAY)).collect();
        Self {
            delays,
            current: 0,
            loops_completed: 0,
            loop_limit: None,
            frame_started: now,
            finished: false,
        }
    }

    pub fn with_loop_limit(mut self, limit: Option<u32>) -> Self {
        self.loop_limit = limit;
        self
    }

    pub fn current_frame(&self) -> usize {
        self.current
    }

    pub fn frame_count(&self) -> usize {
        self.delays.len()
    }

    pub fn loops_completed(&self) -> u32 {
        self.loops_completed
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Advance past every frame whose delay has elapsed by `now`. Returns `true` if the shown
    /// frame changed.
    pub fn advance(&mut self, now: Instant) -> bool {
        if self.finished || self.delays.len() < 2 {
            return false;
        }
        let before = self.current;
        while let Some(delay) = self.delays.get(self.current).copied() {
            let Some(elapsed) = now.checked_duration_since(self.frame_started) else {
                break;
            };
            if elapsed < delay {
                break;
            }
            self.frame_started += delay;
            if self.current + 1 < self.delays.len() {
                self.current += 1;
                continue;
            }
            self.loops_completed += 1;
            if self.loop_limit.is_some_and(|limit| self.loops_completed >= limit) {
                self.finished = true;
                break;
            }
            self.current = 0;
        }
        self.current != before
    }

    pub fn reset(&mut self, now: Instant) {
        self.current = 0;
        self.loops_completed = 0;
        self.frame_started = now;
        self.finished = false;
    }
}
