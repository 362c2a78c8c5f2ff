//! Patience-based early stopping.

/// Outcome of one validation event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopDecision {
    pub best: f64,
    pub cur_step: usize,
    pub stop: bool,
    /// The new value strictly improved on `best`.
    pub update: bool,
}

/// Compare `value` against `best` in the configured direction.
///
/// Only a strict improvement resets the counter. Training stops when the
/// counter reaches `max_step`.
pub fn early_stopping(value: f64, best: f64, cur_step: usize, max_step: usize, bigger: bool) -> StopDecision {
    let improved = if bigger { value > best } else { value < best };
    if improved {
        StopDecision {
            best: value,
            cur_step: 0,
            stop: false,
            update: true,
        }
    } else {
        let cur_step = cur_step + 1;
        StopDecision {
            best,
            cur_step,
            stop: cur_step >= max_step,
            update: false,
        }
    }
}

/// Starting value of `best` for a metric direction.
pub fn initial_best(bigger: bool) -> f64 {
    if bigger {
        f64::NEG_INFINITY
    } else {
        f64::INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ties_do_not_reset() {
        let d = early_stopping(0.5, 0.5, 2, 10, true);
        assert!(!d.update);
        assert_eq!(d.cur_step, 3);
    }

    #[test]
    fn test_smaller_is_better() {
        let d = early_stopping(0.1, 0.2, 4, 10, false);
        assert!(d.update);
        assert_eq!((d.best, d.cur_step), (0.1, 0));
    }

    #[test]
    fn test_stops_at_patience() {
        let mut best = initial_best(true);
        let mut step = 0;
        let mut stops = Vec::new();
        for v in [0.3, 0.2, 0.2, 0.1] {
            let d = early_stopping(v, best, step, 3, true);
            best = d.best;
            step = d.cur_step;
            stops.push(d.stop);
        }
        assert_eq!(stops, vec![false, false, false, true]);
    }
}
