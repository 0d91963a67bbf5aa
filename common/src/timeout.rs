use std::time::{Duration, Instant};

/// A deadline for busy-polling a register.
///
/// ```ignore
/// let timeout = Timeout::from_secs(1);
/// while op.usb_sts.readf(USB_STS_CNR) {
///     timeout.run().map_err(|()| XhciError::Timeout("controller not ready"))?;
/// }
/// ```
pub struct Timeout {
    deadline: Instant,
}

impl Timeout {
    #[inline]
    pub fn new(duration: Duration) -> Self {
        Self {
            deadline: Instant::now() + duration,
        }
    }

    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    #[inline]
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    #[inline]
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Yields once, or fails if the deadline has passed.
    #[inline]
    pub fn run(&self) -> Result<(), ()> {
        if self.expired() {
            Err(())
        } else {
            // Register polls are short; yielding keeps the latency well below a sleep tick.
            std::thread::yield_now();
            Ok(())
        }
    }
}
