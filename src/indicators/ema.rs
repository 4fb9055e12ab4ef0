/// Streaming exponential moving average.
///
/// Undefined until `period` prices have been seen; seeded with the simple
/// average of those first `period` prices, then updated recursively with
/// `k = 2 / (period + 1)`.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    alpha: f64,
    warmup_sum: f64,
    seen: usize,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            alpha: 2.0 / (period as f64 + 1.0),
            warmup_sum: 0.0,
            seen: 0,
            value: None,
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn update(&mut self, price: f64) -> Option<f64> {
        self.seen += 1;

        match self.value {
            Some(prev) => {
                self.value = Some(price * self.alpha + prev * (1.0 - self.alpha));
            }
            None => {
                self.warmup_sum += price;
                if self.seen >= self.period {
                    self.value = Some(self.warmup_sum / self.period as f64);
                }
            }
        }

        self.value
    }
}
