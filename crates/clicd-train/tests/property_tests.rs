//! Property-based tests for trainer control flow and batch scoring.
//!
//! - Early stopping: best score is monotone, the counter resets exactly on
//!   improvement, training halts exactly at patience
//! - Split prediction matches whole-batch prediction in order
//! - Meta task splitting yields `len / task_len - 1` pairs

mod common;

use clicd_nn::Recommender;
use clicd_train::early_stopping::{early_stopping, initial_best};
use clicd_train::meta::split_sequence;
use clicd_train::split_predict;
use proptest::prelude::*;

mod early_stopping_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(300))]

        #[test]
        fn best_is_monotone_and_stop_is_exact(
            scores in prop::collection::vec(-1.0f64..1.0, 1..40),
            bigger in any::<bool>(),
            patience in 1usize..6,
        ) {
            let mut best = initial_best(bigger);
            let mut cur_step = 0;
            for (i, &s) in scores.iter().enumerate() {
                let d = early_stopping(s, best, cur_step, patience, bigger);
                if bigger {
                    prop_assert!(d.best >= best);
                } else {
                    prop_assert!(d.best <= best);
                }
                let improved = if bigger { s > best } else { s < best };
                prop_assert_eq!(d.update, improved);
                if improved {
                    prop_assert_eq!(d.cur_step, 0);
                } else {
                    prop_assert_eq!(d.cur_step, cur_step + 1);
                }
                prop_assert_eq!(d.stop, d.cur_step == patience, "event {}", i);
                best = d.best;
                cur_step = d.cur_step;
                if d.stop {
                    break;
                }
            }
        }
    }
}

mod split_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn split_predict_matches_whole_batch(
            rows in prop::collection::vec((prop::collection::vec(1u32..10, 1..5), 1u32..10), 1..20),
            chunk in 1usize..25,
        ) {
            let mut model = common::Toy::new(10, 4);
            let inter = common::batch(&rows, 4);
            let whole = model.predict(&inter).unwrap().to_vec1::<f32>().unwrap();
            let split = split_predict(&mut model, &inter, chunk).unwrap().to_vec1::<f32>().unwrap();
            prop_assert_eq!(whole.len(), split.len());
            for (a, b) in whole.iter().zip(&split) {
                prop_assert!((a - b).abs() < 1e-5);
            }
        }
    }
}

mod meta_split_props {
    use super::*;

    proptest! {
        #[test]
        fn pair_count_follows_whole_chunks(len in 0usize..60, task_len in 1usize..12) {
            let seq: Vec<u32> = (1..=len as u32).collect();
            let pairs = split_sequence(&seq, task_len, 12);
            prop_assert_eq!(pairs.len(), (len / task_len).saturating_sub(1));
            for (s, q) in &pairs {
                prop_assert_eq!(s.len(), 12);
                prop_assert_eq!(q.len(), 12);
                prop_assert_eq!(q[0], s[0] + task_len as u32);
            }
        }
    }
}
