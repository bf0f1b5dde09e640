//! Pushbutton input: GPIO rising-edge interrupts and the debounce window.

use std::time::{Duration, Instant};

use rppal::gpio::{Gpio, InputPin, Trigger};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::Result;

/// BCM 21 is physical pin 40 on the 40-pin header.
pub const DEFAULT_PIN: u8 = 21;
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Drops edges that arrive within `window` of the last accepted edge.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last_accepted: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: None,
        }
    }

    pub fn accept(&mut self, at: Instant) -> bool {
        match self.last_accepted {
            Some(prev) if at.saturating_duration_since(prev) < self.window => false,
            _ => {
                self.last_accepted = Some(at);
                true
            }
        }
    }
}

/// Keeps the interrupt registered; the pin is released on drop.
pub struct ButtonWatcher {
    _pin: InputPin,
}

/// Forwards the time of every rising edge on `bcm_pin` to `edges`.
pub fn watch(bcm_pin: u8, edges: UnboundedSender<Instant>) -> Result<ButtonWatcher> {
    let mut pin = Gpio::new()?.get(bcm_pin)?.into_input_pulldown();
    pin.set_async_interrupt(Trigger::RisingEdge, None, move |_event| {
        // receiver gone means we are shutting down
        let _ = edges.send(Instant::now());
    })?;
    tracing::info!("Watching pushbutton on BCM {}", bcm_pin);
    Ok(ButtonWatcher { _pin: pin })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_edge_is_accepted() {
        let mut debouncer = Debouncer::new(DEFAULT_DEBOUNCE);
        assert!(debouncer.accept(Instant::now()));
    }

    #[test]
    fn test_bounces_inside_window_are_dropped() {
        let mut debouncer = Debouncer::new(DEFAULT_DEBOUNCE);
        let t0 = Instant::now();
        assert!(debouncer.accept(t0));
        assert!(!debouncer.accept(t0 + Duration::from_millis(5)));
        assert!(!debouncer.accept(t0 + Duration::from_millis(999)));
        assert!(debouncer.accept(t0 + Duration::from_millis(1000)));
    }

    #[test]
    fn test_rejected_edges_do_not_extend_window() {
        let mut debouncer = Debouncer::new(DEFAULT_DEBOUNCE);
        let t0 = Instant::now();
        assert!(debouncer.accept(t0));
        for ms in (100..1000).step_by(100) {
            assert!(!debouncer.accept(t0 + Duration::from_millis(ms)));
        }
        assert!(debouncer.accept(t0 + Duration::from_millis(1001)));
    }
}
