//! Adaptive batching windows.
//!
//! A window opens on the first publication and stays open for as long as
//! every event-loop pass brings new publications. The first quiet pass
//! closes it. The surrounding reactor drives this with two hooks:
//!
//! ```text
//! loop {
//!     let wakeup = controller.on_before_wait(&mut room);  // arm timer, reset pass flag
//!     /* block for I/O, at most `wakeup` if armed */
//!     /* dispatch ready I/O -> room.publish(..) */
//!     if let Some(plan) = controller.on_after_ready(&mut room) { /* send */ }
//! }
//! ```

use crate::plan::DispatchPlan;
use crate::room::Room;
use std::time::Duration;
use tracing::trace;

/// Default forced wakeup while a window is open.
pub const DEFAULT_FORCED_WAKEUP: Duration = Duration::from_millis(1);

/// Window controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowConfig {
    /// Upper bound on how long the reactor may block while a window is open.
    pub forced_wakeup: Duration,
    /// Close the window once the shared buffer reaches this size, even if
    /// publications are still arriving. `None` lets busy windows grow.
    pub max_batch_bytes: Option<usize>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            forced_wakeup: DEFAULT_FORCED_WAKEUP,
            max_batch_bytes: None,
        }
    }
}

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// No pending publications.
    Idle,
    /// A window is open.
    Batching,
}

/// Decides when a room's window closes.
#[derive(Debug, Clone)]
pub struct WindowController {
    state: WindowState,
    config: WindowConfig,
}

impl WindowController {
    /// Create a controller with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(WindowConfig::default())
    }

    /// Create a controller with custom configuration.
    #[must_use]
    pub fn with_config(config: WindowConfig) -> Self {
        Self {
            state: WindowState::Idle,
            config,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WindowState {
        self.state
    }

    /// Check if a window was open as of the last hook.
    #[must_use]
    pub fn is_batching(&self) -> bool {
        self.state == WindowState::Batching
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Pick up publications made through [`Room::publish`] since the last
    /// hook. A window is open exactly while the room holds pending
    /// publications.
    fn sync(&mut self, room: &Room) {
        let batching = room.pending_count() > 0;
        if batching && self.state == WindowState::Idle {
            trace!(room = %room.name(), "Window opened");
        }
        self.state = if batching {
            WindowState::Batching
        } else {
            WindowState::Idle
        };
    }

    /// Hook called right before the reactor blocks for I/O.
    ///
    /// Returns the forced wakeup to arm if a window is open, so the reactor
    /// revisits [`on_after_ready`](Self::on_after_ready) even when no more
    /// I/O arrives. Resets the room's per-pass publication flag.
    pub fn on_before_wait(&mut self, room: &mut Room) -> Option<Duration> {
        self.sync(room);
        let wakeup = self.is_batching().then_some(self.config.forced_wakeup);
        room.begin_pass();
        wakeup
    }

    /// Hook called after all ready I/O of a pass has been dispatched.
    ///
    /// Flushes the room if its window is open and the pass was quiet (or the
    /// size cap was reached). Returns `None` while the window keeps extending.
    pub fn on_after_ready(&mut self, room: &mut Room) -> Option<DispatchPlan> {
        self.sync(room);
        if !self.is_batching() {
            return None;
        }

        let capped = self
            .config
            .max_batch_bytes
            .is_some_and(|max| room.buffered_bytes() >= max);

        if room.received_this_pass() && !capped {
            return None;
        }

        self.state = WindowState::Idle;
        trace!(room = %room.name(), capped, "Window closed");
        Some(room.flush())
    }

    /// Close the window unconditionally.
    pub fn force_close(&mut self, room: &mut Room) -> DispatchPlan {
        self.state = WindowState::Idle;
        room.flush()
    }
}

impl Default for WindowController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SubscriberId;

    fn id(index: u32) -> SubscriberId {
        SubscriberId::new(index, 0)
    }

    #[test]
    fn test_idle_does_not_arm_wakeup() {
        let mut room = Room::new("test");
        let mut window = WindowController::new();

        assert_eq!(window.on_before_wait(&mut room), None);
        assert!(window.on_after_ready(&mut room).is_none());
        assert_eq!(window.state(), WindowState::Idle);
    }

    #[test]
    fn test_busy_pass_extends_window() {
        let mut room = Room::new("test");
        room.subscribe(id(0));
        let mut window = WindowController::new();

        window.on_before_wait(&mut room);
        room.publish(id(1), b"a");
        assert!(window.on_after_ready(&mut room).is_none());

        assert_eq!(
            window.on_before_wait(&mut room),
            Some(DEFAULT_FORCED_WAKEUP)
        );
        room.publish(id(1), b"b");
        assert!(window.on_after_ready(&mut room).is_none());
        assert!(window.is_batching());
        assert_eq!(room.pending_count(), 2);
    }

    #[test]
    fn test_quiet_pass_closes_window() {
        let mut room = Room::new("test");
        room.subscribe(id(0));
        let mut window = WindowController::new();

        window.on_before_wait(&mut room);
        room.publish(id(1), b"ab");
        assert!(window.on_after_ready(&mut room).is_none());

        // Forced wakeup fires with nothing new
        assert!(window.on_before_wait(&mut room).is_some());
        let plan = window.on_after_ready(&mut room).unwrap();

        assert_eq!(&plan.verbatim()[..], b"ab");
        assert_eq!(window.state(), WindowState::Idle);
        assert_eq!(room.pending_count(), 0);
        assert_eq!(window.on_before_wait(&mut room), None);
    }

    #[test]
    fn test_size_cap_closes_busy_window() {
        let mut room = Room::new("test");
        room.subscribe(id(0));
        let mut window = WindowController::with_config(WindowConfig {
            max_batch_bytes: Some(4),
            ..WindowConfig::default()
        });

        window.on_before_wait(&mut room);
        room.publish(id(1), b"ab");
        assert!(window.on_after_ready(&mut room).is_none());

        window.on_before_wait(&mut room);
        room.publish(id(1), b"cd");
        let plan = window.on_after_ready(&mut room).unwrap();
        assert_eq!(&plan.verbatim()[..], b"abcd");
    }

    #[test]
    fn test_room_publish_alone_opens_and_closes_window() {
        let mut room = Room::new("test");
        room.subscribe(id(0));
        let mut window = WindowController::new();

        assert_eq!(window.on_before_wait(&mut room), None);
        room.publish(id(1), b"x");
        assert!(window.on_after_ready(&mut room).is_none());
        assert!(window.is_batching());

        assert_eq!(
            window.on_before_wait(&mut room),
            Some(DEFAULT_FORCED_WAKEUP)
        );
        let plan = window
            .on_after_ready(&mut room)
            .expect("quiet pass closes the window");
        assert_eq!(&plan.verbatim()[..], b"x");
        assert_eq!(room.pending_count(), 0);
        assert_eq!(window.state(), WindowState::Idle);
    }

    #[test]
    fn test_publish_between_passes_is_picked_up() {
        let mut room = Room::new("test");
        room.subscribe(id(0));
        let mut window = WindowController::new();

        // Published outside any pass, e.g. before the loop started
        room.publish(id(1), b"early");
        assert_eq!(
            window.on_before_wait(&mut room),
            Some(DEFAULT_FORCED_WAKEUP)
        );
        let plan = window.on_after_ready(&mut room).unwrap();
        assert_eq!(&plan.verbatim()[..], b"early");
    }

    #[test]
    fn test_force_close() {
        let mut room = Room::new("test");
        room.subscribe(id(0));
        let mut window = WindowController::new();

        room.publish(id(1), b"x");
        let plan = window.force_close(&mut room);
        assert_eq!(plan.len(), 1);
        assert!(!window.is_batching());
    }
}
