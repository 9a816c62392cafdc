use log::{debug, warn};
use rand::Rng;

use crate::topics::PWM_CHANNELS;

pub const PWM_MAX_LEVEL: u16 = 1023;

/// (output pin, label) per channel, in channel index order.
pub const CHANNEL_LAYOUT: [(u8, &str); PWM_CHANNELS] =
    [(16, "Red"), (12, "Green"), (13, "Blue"), (2, "White")];

pub trait PwmOutput: Send {
    fn write(&mut self, pin: u8, level: u16);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwmChannel {
    pub pin: u8,
    pub label: &'static str,
    pub level: u16,
    pub target: u16,
}

impl PwmChannel {
    fn step(&mut self) -> bool {
        if self.level < self.target {
            self.level += 1;
            true
        } else if self.level > self.target {
            self.level -= 1;
            true
        } else {
            false
        }
    }
}

pub struct LightingAnimator {
    channels: [PwmChannel; PWM_CHANNELS],
}

impl Default for LightingAnimator {
    fn default() -> Self {
        Self::new()
    }
}

impl LightingAnimator {
    pub fn new() -> Self {
        Self {
            channels: CHANNEL_LAYOUT.map(|(pin, label)| PwmChannel {
                pin,
                label,
                level: 0,
                target: 0,
            }),
        }
    }

    pub fn channels(&self) -> &[PwmChannel; PWM_CHANNELS] {
        &self.channels
    }

    pub fn levels(&self) -> [u16; PWM_CHANNELS] {
        self.channels.map(|channel| channel.level)
    }

    pub fn targets(&self) -> [u16; PWM_CHANNELS] {
        self.channels.map(|channel| channel.target)
    }

    /// Sets one channel's target, clamped to the output range.
    ///
    /// Returns the stored target, or `None` for an unknown channel.
    pub fn set_target(&mut self, index: usize, level: u16) -> Option<u16> {
        let Some(channel) = self.channels.get_mut(index) else {
            warn!("ignoring target for unknown channel {index}");
            return None;
        };
        channel.target = level.min(PWM_MAX_LEVEL);
        Some(channel.target)
    }

    /// Moves every channel one unit toward its target.
    pub fn step(&mut self, out: &mut dyn PwmOutput) {
        for channel in &mut self.channels {
            if channel.step() {
                out.write(channel.pin, channel.level);
            }
        }
    }

    /// Draws a fresh uniform target for every channel.
    pub fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R) -> [u16; PWM_CHANNELS] {
        for channel in &mut self.channels {
            channel.target = rng.gen_range(0..=PWM_MAX_LEVEL);
        }
        let targets = self.targets();
        debug!("randomized targets {targets:?}");
        targets
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::testing::RecordingPwm;

    #[test]
    fn channels_follow_layout() {
        let mut animator = LightingAnimator::new();
        animator.set_target(2, 2000);

        let channels = animator.channels();
        let layout: Vec<(u8, &str)> = channels.iter().map(|c| (c.pin, c.label)).collect();
        assert_eq!(layout, CHANNEL_LAYOUT.to_vec());
        assert_eq!(channels[2].target, PWM_MAX_LEVEL);
        assert_eq!(channels[2].level, 0);
    }

    #[test]
    fn steps_monotonically_without_overshoot() {
        let mut animator = LightingAnimator::new();
        let mut pwm = RecordingPwm::default();
        animator.set_target(0, 5);

        let mut previous = 0;
        for _ in 0..20 {
            animator.step(&mut pwm);
            let level = animator.levels()[0];
            assert!(level >= previous && level <= 5);
            previous = level;
        }

        assert_eq!(animator.levels(), [5, 0, 0, 0]);
        assert_eq!(pwm.writes_for(16), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn reaches_target_in_exact_step_count() {
        let mut animator = LightingAnimator::new();
        let mut pwm = RecordingPwm::default();
        animator.set_target(3, 40);
        animator.set_target(1, 12);

        for _ in 0..40 {
            animator.step(&mut pwm);
        }
        assert_eq!(animator.levels(), [0, 12, 0, 40]);

        animator.set_target(3, 30);
        for _ in 0..10 {
            animator.step(&mut pwm);
        }
        assert_eq!(animator.levels()[3], 30);
        assert_eq!(pwm.writes_for(2).len(), 50);
    }

    #[test]
    fn clamps_targets_and_rejects_unknown_channels() {
        let mut animator = LightingAnimator::new();

        assert_eq!(animator.set_target(2, 5000), Some(PWM_MAX_LEVEL));
        assert_eq!(animator.set_target(7, 10), None);
        assert_eq!(animator.targets(), [0, 0, PWM_MAX_LEVEL, 0]);
    }

    #[test]
    fn randomize_stays_in_range() {
        let mut animator = LightingAnimator::new();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..100 {
            let targets = animator.randomize(&mut rng);
            assert!(targets.iter().all(|t| *t <= PWM_MAX_LEVEL));
            assert_eq!(targets, animator.targets());
        }
    }

    #[test]
    fn idle_step_writes_nothing() {
        let mut animator = LightingAnimator::new();
        let mut pwm = RecordingPwm::default();

        animator.step(&mut pwm);

        assert!(pwm.writes().is_empty());
    }
}
