//! # Outbound Throttler
//!
//! Trailing-edge rate limiter for user-driven state changes. Inside one window
//! the first call goes through immediately; every further call only replaces a
//! pending value, and that latest value is delivered once at the window
//! boundary. A burst of N calls therefore produces at most two sends.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

struct ThrottleState<T> {
    last_fired: Option<Instant>,
    pending: Option<T>,
    timer: Option<CancellationToken>,
}

/// Wraps a send function so bursts collapse to one send per window.
pub struct Throttler<T> {
    window: Duration,
    state: Arc<Mutex<ThrottleState<T>>>,
    sink: Arc<dyn Fn(T) + Send + Sync>,
}

impl<T: Send + 'static> Throttler<T> {
    /// Creates a throttler around `sink`.
    pub fn new<F>(window: Duration, sink: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            window,
            state: Arc::new(Mutex::new(ThrottleState {
                last_fired: None,
                pending: None,
                timer: None,
            })),
            sink: Arc::new(sink),
        }
    }

    /// Offers a value. Either forwards it now or parks it for the trailing edge.
    pub fn call(&self, value: T) {
        let now = Instant::now();
        let mut state = self.state.lock().expect("Throttle lock poisoned");

        let window_open = state.timer.is_none()
            && state
                .last_fired
                .map_or(true, |last| now.duration_since(last) >= self.window);

        if window_open {
            state.last_fired = Some(now);
            drop(state);
            (self.sink)(value);
            return;
        }

        state.pending = Some(value);
        if state.timer.is_some() {
            return;
        }

        // last_fired is always set here: an unset value opens the window above.
        let due = state.last_fired.map_or(now, |last| last + self.window);
        let token = CancellationToken::new();
        state.timer = Some(token.clone());
        drop(state);

        let shared = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep_until(due) => {
                    let value = {
                        let mut state = shared.lock().expect("Throttle lock poisoned");
                        state.timer = None;
                        let value = state.pending.take();
                        if value.is_some() {
                            state.last_fired = Some(Instant::now());
                        }
                        value
                    };
                    if let Some(value) = value {
                        sink(value);
                    }
                }
            }
        });
    }

    /// Drops a parked value without sending it.
    pub fn cancel_pending(&self) {
        let mut state = self.state.lock().expect("Throttle lock poisoned");
        state.pending = None;
        if let Some(token) = state.timer.take() {
            token.cancel();
        }
    }

    /// Whether a trailing send is scheduled.
    pub fn has_pending(&self) -> bool {
        self.state.lock().expect("Throttle lock poisoned").pending.is_some()
    }
}

impl<T> Drop for Throttler<T> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(token) = state.timer.take() {
                token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> (Arc<Mutex<Vec<bool>>>, Throttler<bool>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&sent);
        let throttler = Throttler::new(Duration::from_millis(1000), move |v| {
            log.lock().unwrap().push(v);
        });
        (sent, throttler)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_leading_and_trailing_send() {
        let (sent, throttler) = recording();

        throttler.call(true);
        throttler.call(false);
        throttler.call(true);
        throttler.call(false);
        assert_eq!(*sent.lock().unwrap(), vec![true]);
        assert!(throttler.has_pending());

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(*sent.lock().unwrap(), vec![true]);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(*sent.lock().unwrap(), vec![true, false]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn single_call_has_no_trailing_send() {
        let (sent, throttler) = recording();
        throttler.call(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*sent.lock().unwrap(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn calls_after_the_window_go_straight_through() {
        let (sent, throttler) = recording();
        throttler.call(true);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        throttler.call(false);
        assert_eq!(*sent.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_send_restarts_the_window() {
        let (sent, throttler) = recording();
        throttler.call(true);
        throttler.call(false);
        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(*sent.lock().unwrap(), vec![true, false]);

        // Inside the window that began with the trailing send.
        throttler.call(true);
        assert_eq!(sent.lock().unwrap().len(), 2);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(*sent.lock().unwrap(), vec![true, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_discards_trailing_value() {
        let (sent, throttler) = recording();
        throttler.call(true);
        throttler.call(false);
        throttler.cancel_pending();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*sent.lock().unwrap(), vec![true]);
    }
}
