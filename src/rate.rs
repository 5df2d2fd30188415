use std::time::SystemTime;

use hashbrown::HashMap;

use crate::metric::{Instance, RawValue, Sample, ValueError};

/// Converts counter rows into per-second rates between consecutive samples.
#[derive(Debug, Default)]
pub struct CounterRates {
    previous: HashMap<(String, Instance), f64>,
    timestamp: Option<SystemTime>,
}

impl CounterRates {
    /// Rewrites the rows of every metric for which `is_counter` holds into rates.
    ///
    /// Rows without a prior observation, or whose counter went backwards, become
    /// errors for this tick. Only rows resolved this tick are remembered.
    pub fn apply<F>(&mut self, sample: &mut Sample, is_counter: F)
    where
        F: Fn(&str) -> bool,
    {
        let elapsed = self
            .timestamp
            .and_then(|previous| sample.timestamp.duration_since(previous).ok())
            .map(|elapsed| elapsed.as_secs_f64());

        let mut current = HashMap::default();
        for row in sample.rows.iter_mut().filter(|row| is_counter(&row.metric)) {
            let Ok(value) = &row.value else {
                continue;
            };
            let Some(value) = value.as_f64() else {
                row.value = Err(ValueError::NotNumeric);
                continue;
            };

            let key = (row.metric.clone(), row.instance.clone());
            row.value = Self::rate(self.previous.get(&key).copied(), value, elapsed);
            current.insert(key, value);
        }

        self.previous = current;
        self.timestamp = Some(sample.timestamp);
    }

    fn rate(previous: Option<f64>, value: f64, elapsed: Option<f64>) -> Result<RawValue, ValueError> {
        let previous = previous.ok_or(ValueError::NoPriorSample)?;
        let elapsed = elapsed.filter(|elapsed| *elapsed > 0.0).ok_or(ValueError::Missing)?;
        if value < previous {
            return Err(ValueError::CounterReset);
        }

        Ok(RawValue::Float((value - previous) / elapsed))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;
    use crate::metric::Row;

    fn sample(secs: u64, rows: Vec<Row>) -> Sample {
        Sample { timestamp: UNIX_EPOCH + Duration::from_secs(secs), rows }
    }

    fn disk(instance: &str, bytes: u64) -> Row {
        let id = if instance == "sda" { 0 } else { 1 };

        Row::new("disk.dev.bytes", Instance::id(id, instance), RawValue::Unsigned(bytes))
    }

    fn values(sample: &Sample) -> Vec<Result<RawValue, ValueError>> {
        sample.rows.iter().map(|row| row.value.clone()).collect()
    }

    #[test]
    fn first_sample_has_no_rate() {
        let mut rates = CounterRates::default();
        let mut first = sample(100, vec![disk("sda", 10)]);

        rates.apply(&mut first, |_| true);
        assert_eq!(values(&first), vec![Err(ValueError::NoPriorSample)]);
    }

    #[test]
    fn rate_is_per_second() {
        let mut rates = CounterRates::default();
        rates.apply(&mut sample(100, vec![disk("sda", 10), disk("sdb", 20)]), |_| true);

        let mut second = sample(105, vec![disk("sda", 60), disk("sdb", 20)]);
        rates.apply(&mut second, |_| true);
        assert_eq!(values(&second), vec![Ok(RawValue::Float(10.0)), Ok(RawValue::Float(0.0))]);
    }

    #[test]
    fn reset_counter_is_skipped_then_recovers() {
        let mut rates = CounterRates::default();
        rates.apply(&mut sample(100, vec![disk("sda", 50)]), |_| true);

        let mut reset = sample(101, vec![disk("sda", 5)]);
        rates.apply(&mut reset, |_| true);
        assert_eq!(values(&reset), vec![Err(ValueError::CounterReset)]);

        let mut recovered = sample(102, vec![disk("sda", 7)]);
        rates.apply(&mut recovered, |_| true);
        assert_eq!(values(&recovered), vec![Ok(RawValue::Float(2.0))]);
    }

    #[test]
    fn non_counters_pass_through() {
        let mut rates = CounterRates::default();
        let load = Row::new("kernel.load", Instance::Null, RawValue::Float(0.5));
        let mut first = sample(100, vec![load.clone(), disk("sda", 1)]);

        rates.apply(&mut first, |metric| metric == "disk.dev.bytes");
        assert_eq!(first.rows[0], load);
        assert_eq!(first.rows[1].value, Err(ValueError::NoPriorSample));
    }

    #[test]
    fn unresolved_rows_are_forgotten() {
        let mut rates = CounterRates::default();
        rates.apply(&mut sample(100, vec![disk("sda", 10)]), |_| true);

        let missing = Row { value: Err(ValueError::Missing), ..disk("sda", 0) };
        rates.apply(&mut sample(101, vec![missing]), |_| true);

        let mut later = sample(102, vec![disk("sda", 30)]);
        rates.apply(&mut later, |_| true);
        assert_eq!(values(&later), vec![Err(ValueError::NoPriorSample)]);
    }
}
