use std::collections::VecDeque;

/// Average True Range over closed bars.
///
/// Each bar contributes `max(high - low, |high - prev_close|, |low - prev_close|)`;
/// the ATR is the simple mean of the most recent `period` true ranges and is
/// undefined until that many exist.
#[derive(Debug, Clone)]
pub struct AverageTrueRange {
    period: usize,
    prev_close: Option<f64>,
    true_ranges: VecDeque<f64>,
}

impl AverageTrueRange {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            prev_close: None,
            true_ranges: VecDeque::with_capacity(period),
        }
    }

    pub fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        if let Some(prev) = self.prev_close {
            let tr1 = high - low;
            let tr2 = (high - prev).abs();
            let tr3 = (low - prev).abs();

            if self.true_ranges.len() == self.period {
                self.true_ranges.pop_front();
            }
            self.true_ranges.push_back(tr1.max(tr2).max(tr3));
        }
        self.prev_close = Some(close);
        self.value()
    }

    pub fn value(&self) -> Option<f64> {
        if self.true_ranges.len() < self.period {
            return None;
        }
        Some(self.true_ranges.iter().sum::<f64>() / self.period as f64)
    }
}
