//! Weighted event sets and train/validation splits.

use event_table::EventTable;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// An event table with training weights prepared for the loop.
///
/// Weights keep their sign: negative generator weights act as
/// class-direction multipliers in a weighted loss, and are excluded from
/// weighted sampling (probability floored at zero) by the loader. Signal
/// weights are rebalanced so the signal and background sums match.
#[derive(Debug, Clone)]
pub struct WeightedEventSet {
    table: EventTable,
    weights: Vec<f32>,
}

impl WeightedEventSet {
    /// Prepare a table for training.
    ///
    /// With `sign_only`, weight magnitudes are discarded and only the sign
    /// (+1 or -1) is kept before rebalancing.
    pub fn new(table: EventTable, sign_only: bool) -> anyhow::Result<Self> {
        table.validate()?;
        let mut weights: Vec<f32> = if sign_only {
            table
                .weights
                .iter()
                .map(|&w| if w < 0.0 { -1.0 } else { 1.0 })
                .collect()
        } else {
            table.weights.clone()
        };

        let mut sig_sum = 0.0_f64;
        let mut bkg_sum = 0.0_f64;
        for (&w, &label) in weights.iter().zip(&table.labels) {
            if label == 1.0 {
                sig_sum += w as f64;
            } else {
                bkg_sum += w as f64;
            }
        }
        if sig_sum <= 0.0 || bkg_sum <= 0.0 {
            anyhow::bail!(
                "Cannot rebalance: signal weight sum {sig_sum:.3}, background weight sum {bkg_sum:.3}"
            );
        }
        let factor = (bkg_sum / sig_sum) as f32;
        for (w, &label) in weights.iter_mut().zip(&table.labels) {
            if label == 1.0 {
                *w *= factor;
            }
        }

        tracing::info!(
            events = table.n_events(),
            rebalance_factor = factor,
            sign_only,
            "Prepared weighted event set"
        );

        Ok(Self { table, weights })
    }

    pub fn table(&self) -> &EventTable {
        &self.table
    }

    /// Rebalanced per-event training weights.
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn n_events(&self) -> usize {
        self.table.n_events()
    }

    /// Deterministic split by event-number parity: even numbers train,
    /// odd numbers validate. Exhaustive and non-overlapping by construction.
    pub fn split_parity(&self) -> (Vec<usize>, Vec<usize>) {
        let mut train = Vec::new();
        let mut val = Vec::new();
        for (i, &event_number) in self.table.event_number.iter().enumerate() {
            if event_number % 2 == 0 {
                train.push(i);
            } else {
                val.push(i);
            }
        }
        (train, val)
    }

    /// Seeded shuffle split; `fraction` of events go to training.
    pub fn split_random(&self, fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
        let mut indices: Vec<usize> = (0..self.n_events()).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        let cut = ((self.n_events() as f64) * fraction).round() as usize;
        let cut = cut.min(self.n_events());
        let val = indices.split_off(cut);
        (indices, val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_table::TableSchema;

    fn labeled_table(n: usize) -> EventTable {
        let mut table = EventTable::zeros(TableSchema::default(), n);
        for event in 0..n {
            table.set_jet(event, 0, [50.0, 0.0, 0.0, 5.0], &[0.5, 0.5]);
            table.set_jet(event, 1, [30.0, 0.5, 1.0, 4.0], &[0.4, 0.4]);
            table.event_number[event] = event as i64;
            table.labels[event] = if event < n / 3 { 1.0 } else { 0.0 };
            table.weights[event] = 0.1 + event as f32 * 0.01;
        }
        table
    }

    #[test]
    fn test_rebalance_equalizes_class_sums() {
        let set = WeightedEventSet::new(labeled_table(90), false).unwrap();
        let mut sig = 0.0_f64;
        let mut bkg = 0.0_f64;
        for (&w, &label) in set.weights().iter().zip(&set.table().labels) {
            if label == 1.0 {
                sig += w as f64;
            } else {
                bkg += w as f64;
            }
        }
        assert!(
            (sig - bkg).abs() < 1e-3 * bkg.abs(),
            "class sums differ after rebalance: sig={sig}, bkg={bkg}"
        );
    }

    #[test]
    fn test_sign_only_discards_magnitude() {
        let mut table = labeled_table(10);
        table.weights[0] = -3.5;
        table.weights[5] = 17.0;
        let set = WeightedEventSet::new(table, true).unwrap();
        assert_eq!(set.weights()[0].signum(), -1.0);
        // Background weights stay exactly +-1; only signal is rescaled.
        assert_eq!(set.weights()[5], 1.0);
    }

    #[test]
    fn test_single_class_is_fatal() {
        let mut table = labeled_table(10);
        for label in table.labels.iter_mut() {
            *label = 0.0;
        }
        let err = WeightedEventSet::new(table, false).unwrap_err();
        assert!(err.to_string().contains("Cannot rebalance"));
    }

    #[test]
    fn test_parity_split_exhaustive_and_disjoint() {
        let mut table = labeled_table(21);
        // Scatter event numbers so index parity differs from number parity.
        for (i, en) in table.event_number.iter_mut().enumerate() {
            *en = (i as i64) * 3 + 1;
        }
        let set = WeightedEventSet::new(table, false).unwrap();
        let (train, val) = set.split_parity();
        assert_eq!(train.len() + val.len(), 21);
        for &i in &train {
            assert_eq!(set.table().event_number[i] % 2, 0);
            assert!(!val.contains(&i));
        }
        // Deterministic: a second call yields the same partition.
        let (train2, val2) = set.split_parity();
        assert_eq!(train, train2);
        assert_eq!(val, val2);
    }

    #[test]
    fn test_random_split_seeded() {
        let set = WeightedEventSet::new(labeled_table(50), false).unwrap();
        let (train_a, val_a) = set.split_random(0.8, 7);
        let (train_b, val_b) = set.split_random(0.8, 7);
        assert_eq!(train_a, train_b);
        assert_eq!(val_a, val_b);
        assert_eq!(train_a.len(), 40);
        assert_eq!(val_a.len(), 10);

        let (train_c, _) = set.split_random(0.8, 8);
        assert_ne!(train_a, train_c);
    }
}
