use ordered_float::OrderedFloat;
use std::collections::VecDeque;

/// Rolling max/min of closes over a fixed trailing window.
#[derive(Debug, Clone)]
pub struct DonchianChannel {
    period: usize,
    window: VecDeque<f64>,
}

impl DonchianChannel {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            window: VecDeque::with_capacity(period),
        }
    }

    pub fn is_full(&self) -> bool {
        self.window.len() == self.period
    }

    /// `(high, low)` over the closes currently in the window, once it holds
    /// `period` bars.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        if !self.is_full() {
            return None;
        }
        let high = self.window.iter().copied().map(OrderedFloat).max()?;
        let low = self.window.iter().copied().map(OrderedFloat).min()?;
        Some((high.0, low.0))
    }

    pub fn push(&mut self, close: f64) {
        if self.window.len() == self.period {
            self.window.pop_front();
        }
        self.window.push_back(close);
    }
}
