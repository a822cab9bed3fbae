use std::time::Duration;

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(300);

const FRAMES: [&str; 4] = ["Loading", "Loading.", "Loading..", "Loading..."];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tick {
    Frame(&'static str),
    Finished,
}

/// Fixed-interval "Loading..." animation.
///
/// Readiness never stops the animation directly: [`mark_ready`] only lets the
/// next tick that lands on a cycle boundary (no partial cycle on screen) end
/// it. A run therefore always shows whole cycles, whatever the order of the
/// readiness signal and the timer.
///
/// [`mark_ready`]: LoadingIndicator::mark_ready
#[derive(Debug, Clone)]
pub struct LoadingIndicator {
    interval: Duration,
    next_frame: usize,
    ready: bool,
    finished: bool,
}

impl Default for LoadingIndicator {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

impl LoadingIndicator {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_frame: 0,
            ready: false,
            finished: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn tick(&mut self) -> Tick {
        if self.finished || (self.ready && self.next_frame == 0) {
            self.finished = true;
            return Tick::Finished;
        }
        let frame = FRAMES[self.next_frame];
        self.next_frame = (self.next_frame + 1) % FRAMES.len();
        Tick::Frame(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(indicator: &mut LoadingIndicator, ticks: usize) -> Vec<Tick> {
        (0..ticks).map(|_| indicator.tick()).collect()
    }

    #[test]
    fn cycles_until_ready() {
        let mut indicator = LoadingIndicator::default();
        assert_eq!(
            run(&mut indicator, 5),
            vec![
                Tick::Frame("Loading"),
                Tick::Frame("Loading."),
                Tick::Frame("Loading.."),
                Tick::Frame("Loading..."),
                Tick::Frame("Loading"),
            ]
        );
        assert!(!indicator.is_finished());
    }

    #[test]
    fn readiness_mid_cycle_waits_for_the_last_frame() {
        let mut indicator = LoadingIndicator::default();
        run(&mut indicator, 2);
        indicator.mark_ready();
        assert_eq!(
            run(&mut indicator, 3),
            vec![
                Tick::Frame("Loading.."),
                Tick::Frame("Loading..."),
                Tick::Finished,
            ]
        );
        assert!(indicator.is_finished());
        assert_eq!(indicator.tick(), Tick::Finished);
    }

    #[test]
    fn readiness_on_a_boundary_stops_at_once() {
        let mut indicator = LoadingIndicator::default();
        run(&mut indicator, 4);
        indicator.mark_ready();
        assert_eq!(indicator.tick(), Tick::Finished);

        let mut untouched = LoadingIndicator::default();
        untouched.mark_ready();
        assert_eq!(untouched.tick(), Tick::Finished);
    }
}
