//! Focus energy: a per-stream scalar in [0, 1] driving dispatch
//! cadence. Higher energy → shorter distribution interval.

use murmur_config::EnergyConfig;

/// Raw signals blended into an energy value. All components are
/// expected in [0, 1]; the result is clamped anyway.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyInputs {
    pub activity: f64,
    pub avg_interest: f64,
    pub recency: f64,
    pub relationship: f64,
}

pub struct EnergyCalculator {
    config: EnergyConfig,
}

impl EnergyCalculator {
    pub fn new(config: EnergyConfig) -> Self {
        Self { config }
    }

    pub fn energy(&self, inputs: EnergyInputs) -> f64 {
        (inputs.activity * self.config.activity_weight
            + inputs.avg_interest * self.config.interest_weight
            + inputs.recency * self.config.recency_weight
            + inputs.relationship * self.config.relationship_weight)
            .clamp(0.0, 1.0)
    }

    /// Message volume in the recent window, saturating at 10 messages.
    pub fn activity_from_count(message_count: usize) -> f64 {
        (message_count as f64 / 10.0).min(1.0)
    }

    /// Exponential decay of the last-message age, half-life 10 minutes.
    pub fn recency_from_age(age_secs: f64) -> f64 {
        0.5_f64.powf(age_secs.max(0.0) / 600.0)
    }

    /// Map energy to a distribution interval: linear between the
    /// configured rest and peak intervals, strictly decreasing in
    /// energy (peak < rest).
    pub fn interval_from_energy(&self, energy: f64) -> f64 {
        let energy = energy.clamp(0.0, 1.0);
        let rest = self.config.interval_at_rest_secs;
        let peak = self.config.interval_at_peak_secs;
        rest + (peak - rest) * energy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> EnergyCalculator {
        EnergyCalculator::new(EnergyConfig::default())
    }

    #[test]
    fn energy_is_clamped_to_unit_interval() {
        let calc = calculator();
        let high = calc.energy(EnergyInputs {
            activity: 5.0,
            avg_interest: 5.0,
            recency: 5.0,
            relationship: 5.0,
        });
        assert_eq!(high, 1.0);

        let low = calc.energy(EnergyInputs::default());
        assert_eq!(low, 0.0);
    }

    #[test]
    fn interval_is_strictly_decreasing_in_energy() {
        let calc = calculator();
        let mut previous = calc.interval_from_energy(0.0);
        for step in 1..=10 {
            let interval = calc.interval_from_energy(step as f64 / 10.0);
            assert!(interval < previous, "interval must shrink as energy grows");
            previous = interval;
        }
    }

    #[test]
    fn interval_stays_within_configured_bounds() {
        let config = EnergyConfig::default();
        let calc = calculator();
        assert_eq!(calc.interval_from_energy(0.0), config.interval_at_rest_secs);
        assert_eq!(calc.interval_from_energy(1.0), config.interval_at_peak_secs);
        assert_eq!(calc.interval_from_energy(7.0), config.interval_at_peak_secs);
    }

    #[test]
    fn activity_saturates_at_ten_messages() {
        assert_eq!(EnergyCalculator::activity_from_count(0), 0.0);
        assert_eq!(EnergyCalculator::activity_from_count(5), 0.5);
        assert_eq!(EnergyCalculator::activity_from_count(50), 1.0);
    }
}
