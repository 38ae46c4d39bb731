use chrono::NaiveDateTime;
use std::time::Instant;

/// Time source for deadlines and attendance timestamps.
pub trait Clock: Send + Sync {
    /// Monotonic time, used for session deadlines.
    fn now(&self) -> Instant;
    /// Local wall-clock time, used for attendance records.
    fn local_now(&self) -> NaiveDateTime;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn local_now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Clock that only moves when told to.
    pub struct ManualClock {
        start: Instant,
        state: Mutex<(Duration, NaiveDateTime)>,
    }

    impl ManualClock {
        pub fn new(wall: NaiveDateTime) -> Self {
            Self {
                start: Instant::now(),
                state: Mutex::new((Duration::ZERO, wall)),
            }
        }

        pub fn at(date: &str) -> Self {
            let wall = NaiveDateTime::parse_from_str(date, "%Y-%m-%d %H:%M:%S").unwrap();
            Self::new(wall)
        }

        pub fn advance(&self, by: Duration) {
            let mut state = self.state.lock().unwrap();
            state.0 += by;
            state.1 += chrono::Duration::from_std(by).unwrap();
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.start + self.state.lock().unwrap().0
        }

        fn local_now(&self) -> NaiveDateTime {
            self.state.lock().unwrap().1
        }
    }
}
