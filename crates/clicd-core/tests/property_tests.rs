//! Property-based tests for graph augmentation and readout invariants.

use candle_core::{Device, Tensor};
use clicd_core::readout::dual_plan;
use clicd_core::{
    graph_augment, graph_mask, graph_neighbor_readout, with_edge_dropout, Error, ItemGraph, UserEdgeIndex,
};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

const NODES: u32 = 12;

prop_compose! {
    fn arb_graph()(edges in prop::collection::vec((0..NODES, 0..NODES, 0.1f32..5.0), 0..60)) -> ItemGraph {
        ItemGraph::from_edges(NODES as usize, edges).unwrap()
    }
}

prop_compose! {
    fn arb_user_index()(
        lists in prop::collection::vec(prop::collection::vec((0..NODES, 0..NODES), 0..8), 1..6)
    ) -> UserEdgeIndex {
        let mut idx = UserEdgeIndex::new();
        for (u, pairs) in lists.into_iter().enumerate() {
            idx.insert(u as u32, pairs);
        }
        idx
    }
}

mod augment_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn augment_never_grows_or_mutates(
            g in arb_graph(),
            idx in arb_user_index(),
            users in prop::collection::vec(0u32..10, 0..6),
        ) {
            let before = g.edge_weights();
            let aug = graph_augment(&g, &users, &idx);
            prop_assert!(aug.edge_count() <= g.edge_count());
            prop_assert_eq!(g.edge_weights(), before);
            for &u in &users {
                for &(s, d) in idx.edges_of(u) {
                    prop_assert!(!aug.has_edge(s, d));
                }
            }
        }

        #[test]
        fn mask_never_mutates(g in arb_graph(), pairs in prop::collection::vec((0..NODES, 0..NODES), 0..10)) {
            let before = g.edge_weights();
            let masked = graph_mask(&g, &pairs);
            prop_assert_eq!(g.edge_weights(), before);
            prop_assert_eq!(masked.edge_count(), g.edge_count());
        }

        #[test]
        fn dropout_restores_weights(g in arb_graph(), keep in 0.05f32..=1.0, seed in any::<u64>()) {
            let mut g = g;
            let before = g.edge_weights();
            let mut rng = StdRng::seed_from_u64(seed);
            let zeros = with_edge_dropout(&mut g, keep, &mut rng, |dropped| {
                Ok::<_, Error>(dropped.edge_weights().iter().filter(|w| **w == 0.0).count())
            }).unwrap();
            let expected = ((1.0 - f64::from(keep)) * before.len() as f64).round() as usize;
            prop_assert_eq!(zeros, expected.min(before.len()));
            prop_assert_eq!(g.edge_weights(), before);
        }
    }
}

mod readout_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn readout_rows_align_with_queries(g in arb_graph(), nodes in prop::collection::vec(0..NODES, 0..20)) {
            let feats: Vec<f32> = (0..NODES).flat_map(|i| [i as f32, 1.0]).collect();
            let feats = Tensor::from_vec(feats, (NODES as usize, 2), &Device::Cpu).unwrap();
            let out = graph_neighbor_readout(&g, &nodes, &feats).unwrap();
            prop_assert_eq!(out.dims()[0], nodes.len());
            let rows = out.to_vec2::<f32>().unwrap();
            for (row, &n) in rows.iter().zip(&nodes) {
                let neigh = g.out_neighbors(n).unwrap();
                if neigh.is_empty() {
                    prop_assert_eq!(row.clone(), vec![0.0, 0.0]);
                } else {
                    let mean = neigh.iter().map(|x| *x as f32).sum::<f32>() / neigh.len() as f32;
                    prop_assert!((row[0] - mean).abs() < 1e-4);
                    prop_assert!((row[1] - 1.0).abs() < 1e-5);
                }
            }
        }

        #[test]
        fn dual_sets_are_disjoint_and_capped(
            g in arb_graph(),
            idx in arb_user_index(),
            nodes in prop::collection::vec(0..NODES, 1..10),
            seed in any::<u64>(),
        ) {
            let aug = graph_augment(&g, &[0, 1, 2], &idx);
            let mut rng = StdRng::seed_from_u64(seed);
            let plan = dual_plan(&g, &aug, &nodes, &mut rng).unwrap();
            prop_assert_eq!(plan.civil.num_rows(), nodes.len());
            prop_assert_eq!(plan.foreign.num_rows(), nodes.len());
            for (civil, foreign) in plan.civil.rows().iter().zip(plan.foreign.rows()) {
                prop_assert!(civil.len() <= 10 && foreign.len() <= 10);
                prop_assert!(civil.iter().all(|c| !foreign.contains(c)));
            }
        }
    }
}
