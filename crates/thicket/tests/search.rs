//! Cross-checks of every structure against the linear baseline, plus the
//! boundary cases of the shared search protocol.

mod common;

use proximity::{Euclidean, Hamming, Manhattan, Metric};
use test_case::test_case;
use thicket::{CentersInit, Checks, Error, Index, IndexParams, PointStore, SearchParams};

fn unlimited() -> SearchParams {
    SearchParams::default().with_checks(Checks::Unlimited)
}

fn five_points() -> Vec<Vec<f32>> {
    vec![
        vec![1.0, 1.0],
        vec![3.0, 3.0],
        vec![3.0, 4.0],
        vec![7.0, 7.0],
        vec![7.0, 6.0],
    ]
}

#[test_case(IndexParams::Linear; "linear")]
#[test_case(IndexParams::KdForest { trees: 4 }; "kd forest")]
#[test_case(IndexParams::KdSingle { leaf_max_size: 2, reorder: false }; "kd single")]
#[test_case(IndexParams::KdSingle { leaf_max_size: 2, reorder: true }; "kd single reordered")]
#[test_case(IndexParams::KMeans { branching: 2, iterations: 5, centers_init: CentersInit::Random, cb_index: 0.2 }; "kmeans")]
#[test_case(IndexParams::Hierarchical { branching: 2, trees: 2, centers_init: CentersInit::Gonzales, leaf_max_size: 2 }; "hierarchical")]
fn five_point_scenario(params: IndexParams) -> thicket::Result<()> {
    let store = PointStore::from_rows(five_points())?;
    let mut index: Index<f32, f32, _> = Index::new(store, Euclidean, params)?.with_seed(42);
    index.build()?;

    let hits = common::knn(&index, &[3.0, 1.0], 3, &unlimited()).remove(0);
    let dists = hits.iter().map(|&(_, d)| d).collect::<Vec<_>>();
    assert_eq!(dists, vec![4.0, 4.0, 9.0]);

    // Rows 0 and 1 tie at distance 4; ties resolve to the lower row first.
    assert_eq!(hits[2].0, 2);
    assert_eq!((hits[0].0, hits[1].0), (0, 1));
    Ok(())
}

#[test_case(IndexParams::Linear; "linear")]
#[test_case(IndexParams::KdForest { trees: 4 }; "kd forest")]
#[test_case(IndexParams::KdSingle { leaf_max_size: 10, reorder: true }; "kd single")]
#[test_case(IndexParams::KMeans { branching: 8, iterations: 7, centers_init: CentersInit::KMeansPP, cb_index: 0.2 }; "kmeans")]
#[test_case(IndexParams::Hierarchical { branching: 8, trees: 2, centers_init: CentersInit::Gonzales, leaf_max_size: 10 }; "hierarchical")]
fn unlimited_checks_match_brute_force(params: IndexParams) -> thicket::Result<()> {
    let rows = common::data_gen::tabular(200, 8, -1.0, 1.0, 71);
    let store = PointStore::from_rows(rows.clone())?;
    let mut index: Index<f32, f32, _> = Index::new(store, Euclidean, params)?.with_seed(7);
    index.build()?;

    let queries = common::data_gen::tabular(5, 8, -1.0, 1.0, 72);
    for query in &queries {
        let got = common::knn(&index, query, 10, &unlimited()).remove(0);
        let want = common::exact_knn(&rows, &Euclidean, query, 10);
        assert_eq!(got, want);
    }
    Ok(())
}

#[test]
fn k_equal_to_size_returns_everything() -> thicket::Result<()> {
    let rows = common::data_gen::tabular(64, 4, 0.0, 1.0, 5);
    let store = PointStore::from_rows(rows.clone())?;
    let mut index: Index<f32, f32, _> = Index::new(store, Euclidean, IndexParams::KdForest { trees: 4 })?.with_seed(1);
    index.build()?;

    let query = vec![0.5_f32; 4];
    let got = common::knn(&index, &query, 64, &SearchParams::default().with_checks(Checks::Count(4)))[0].clone();
    let want = common::exact_knn(&rows, &Euclidean, &query, 64);
    assert_eq!(got, want);
    Ok(())
}

#[test]
fn k_larger_than_size_clamps() -> thicket::Result<()> {
    let store = PointStore::from_rows(five_points())?;
    let mut index: Index<f32, f32, _> = Index::new(store, Euclidean, IndexParams::Linear)?;
    index.build()?;

    let mut ids = vec![0_usize; 8];
    let mut dists = vec![0.0_f32; 8];
    let found = index.knn_search(&[3.0, 1.0], &mut ids, &mut dists, 8, &unlimited())?;
    assert_eq!(found, 5);
    assert!(ids[..5].iter().all(|&i| i < 5));
    assert!(ids[5..].iter().all(|&i| i == usize::MAX));
    assert!(dists[5..].iter().all(|&d| d == f32::MAX));
    Ok(())
}

#[test]
fn multi_core_matches_single_core() -> thicket::Result<()> {
    let rows = common::data_gen::clustered(20, 50, 16, 10.0, 0.5, 11);
    let store = PointStore::from_rows(rows)?;
    let mut index: Index<f32, f32, _> = Index::new(store, Euclidean, IndexParams::KdForest { trees: 4 })?.with_seed(3);
    index.build()?;

    let queries = common::flatten(&common::data_gen::clustered(10, 4, 16, 10.0, 0.5, 12));
    let params = SearchParams::default().with_checks(Checks::Count(64));

    let serial = common::knn(&index, &queries, 5, &params.with_cores(1));
    let pool = common::knn(&index, &queries, 5, &params.with_cores(3));
    let all_cores = common::knn(&index, &queries, 5, &params.with_cores(0));
    assert_eq!(serial, pool);
    assert_eq!(serial, all_cores);
    Ok(())
}

#[test_case(IndexParams::KdForest { trees: 4 }; "kd forest")]
#[test_case(IndexParams::KdSingle { leaf_max_size: 8, reorder: false }; "kd single")]
fn radius_search_matches_brute_force(params: IndexParams) -> thicket::Result<()> {
    let rows = common::data_gen::tabular(300, 3, 0.0, 1.0, 21);
    let store = PointStore::from_rows(rows.clone())?;
    let mut index: Index<f32, f32, _> = Index::new(store, Euclidean, params)?.with_seed(9);
    index.build()?;

    let query = vec![0.5_f32, 0.5, 0.5];
    let radius = 0.01; // squared distances: a 0.1 ball
    let got = index.radius_search(&query, radius, &unlimited())?.remove(0);

    let mut want = rows
        .iter()
        .enumerate()
        .map(|(i, row)| (i, Euclidean.distance(&query, row, None)))
        .filter(|&(_, d)| d <= radius)
        .collect::<Vec<(usize, f32)>>();
    want.sort_by_key(|&(i, d)| thicket::MinItem((), (d, i)));
    assert_eq!(got, want);
    Ok(())
}

#[test]
fn radius_search_honors_cap_and_sort_flag() -> thicket::Result<()> {
    let rows = common::data_gen::tabular(300, 3, 0.0, 1.0, 22);
    let store = PointStore::from_rows(rows.clone())?;
    let mut index: Index<f32, f32, _> = Index::new(store, Euclidean, IndexParams::KdSingle { leaf_max_size: 8, reorder: false })?;
    index.build()?;

    let query = vec![0.5_f32, 0.5, 0.5];
    let radius = 0.04;
    let full = index.radius_search(&query, radius, &unlimited())?.remove(0);
    assert!(full.len() > 3);

    let capped = index
        .radius_search(&query, radius, &unlimited().with_max_neighbors(3))?
        .remove(0);
    assert_eq!(capped, full[..3].to_vec());

    let mut unsorted = index
        .radius_search(&query, radius, &unlimited().with_sorted(false))?
        .remove(0);
    unsorted.sort_by_key(|&(i, d)| (ordered_float::OrderedFloat(d), i));
    assert_eq!(unsorted, full);
    Ok(())
}

#[test_case(IndexParams::KdForest { trees: 2 }; "kd forest")]
#[test_case(IndexParams::KdSingle { leaf_max_size: 4, reorder: false }; "kd single")]
#[test_case(IndexParams::KMeans { branching: 4, iterations: 3, centers_init: CentersInit::Random, cb_index: 0.0 }; "kmeans")]
#[test_case(IndexParams::Hierarchical { branching: 4, trees: 2, centers_init: CentersInit::Random, leaf_max_size: 4 }; "hierarchical")]
fn identical_points_terminate_and_rank(params: IndexParams) -> thicket::Result<()> {
    let store = PointStore::from_rows(vec![vec![2.5_f32, 2.5, 2.5]; 20])?;
    let mut index: Index<f32, f32, _> = Index::new(store, Euclidean, params)?.with_seed(13);
    index.build()?;

    let hits = common::knn(&index, &[2.5, 2.5, 2.5], 5, &unlimited()).remove(0);
    assert_eq!(hits, vec![(0, 0.0), (1, 0.0), (2, 0.0), (3, 0.0), (4, 0.0)]);
    Ok(())
}

#[test]
fn single_point_dataset() -> thicket::Result<()> {
    let store = PointStore::from_rows(vec![vec![1.0_f32, 2.0]])?;
    let mut index: Index<f32, f32, _> = Index::new(store, Euclidean, IndexParams::KdForest { trees: 2 })?;
    index.build()?;
    let hits = common::knn(&index, &[0.0, 0.0], 3, &unlimited()).remove(0);
    assert_eq!(hits, vec![(0, 5.0)]);
    Ok(())
}

#[test]
fn empty_dataset_cannot_build() -> thicket::Result<()> {
    let store = PointStore::from_flat(Vec::<f32>::new(), 4)?;
    let mut index: Index<f32, f32, _> = Index::new(store, Euclidean, IndexParams::Linear)?;
    assert!(matches!(index.build(), Err(Error::InvalidInput(_))));

    // A failed build leaves the index unbuilt.
    let mut ids = vec![0_usize; 1];
    let mut dists = vec![0.0_f32; 1];
    let err = index.knn_search(&[0.0; 4], &mut ids, &mut dists, 1, &SearchParams::default());
    assert!(matches!(err, Err(Error::InvalidInput(_))));
    Ok(())
}

#[test]
fn zero_dimensional_rows_are_rejected() {
    assert!(matches!(PointStore::<f32>::from_flat(vec![], 0), Err(Error::InvalidInput(_))));
}

#[test]
fn shape_and_parameter_errors() -> thicket::Result<()> {
    let store = PointStore::from_rows(five_points())?;
    let mut index: Index<f32, f32, _> = Index::new(store, Euclidean, IndexParams::Linear)?;
    index.build()?;

    let mut ids = vec![0_usize; 3];
    let mut dists = vec![0.0_f32; 3];
    // Query length is not a multiple of the dimensionality.
    assert!(matches!(
        index.knn_search(&[1.0, 2.0, 3.0], &mut ids, &mut dists, 1, &SearchParams::default()),
        Err(Error::InvalidInput(_))
    ));
    // k = 0.
    assert!(matches!(
        index.knn_search(&[1.0, 2.0], &mut ids, &mut dists, 0, &SearchParams::default()),
        Err(Error::InvalidInput(_))
    ));
    // Output buffers too small for rows * k.
    assert!(matches!(
        index.knn_search(&[1.0, 2.0, 3.0, 4.0], &mut ids, &mut dists, 2, &SearchParams::default()),
        Err(Error::InvalidInput(_))
    ));
    Ok(())
}

#[test]
fn metric_pairings_are_validated() -> thicket::Result<()> {
    // kd-trees need a coordinate-decomposable metric.
    let bytes = PointStore::from_rows(vec![vec![1_u8, 2], vec![3, 4]])?;
    let err = Index::<u8, u32, _>::new(bytes.clone(), Hamming, IndexParams::KdForest { trees: 4 });
    assert!(matches!(err, Err(Error::UnsupportedMetric(_))));

    // k-means cannot average bitstrings.
    let err = Index::<u8, u32, _>::new(
        bytes.clone(),
        Hamming,
        IndexParams::KMeans {
            branching: 2,
            iterations: 3,
            centers_init: CentersInit::Random,
            cb_index: 0.2,
        },
    );
    assert!(matches!(err, Err(Error::UnsupportedMetric(_))));

    // LSH needs Hamming over bytes, in both directions.
    let floats = PointStore::from_rows(five_points())?;
    let err = Index::<f32, f32, _>::new(
        floats,
        Euclidean,
        IndexParams::Lsh {
            table_number: 4,
            key_size: 10,
            multi_probe_level: 1,
        },
    );
    assert!(matches!(err, Err(Error::UnsupportedMetric(_))));

    // Hamming over bytes pairs fine with the hierarchical index.
    let ok = Index::<u8, u32, _>::new(
        bytes,
        Hamming,
        IndexParams::Hierarchical {
            branching: 2,
            trees: 1,
            centers_init: CentersInit::Random,
            leaf_max_size: 2,
        },
    );
    assert!(ok.is_ok());
    Ok(())
}

#[test]
fn manhattan_metric_works_in_kd_trees() -> thicket::Result<()> {
    let rows = common::data_gen::tabular(150, 6, -2.0, 2.0, 33);
    let store = PointStore::from_rows(rows.clone())?;
    let mut index: Index<f32, f32, _> = Index::new(store, Manhattan, IndexParams::KdForest { trees: 4 })?.with_seed(17);
    index.build()?;

    let query = vec![0.0_f32; 6];
    let got = common::knn(&index, &query, 5, &unlimited()).remove(0);
    let want = common::exact_knn(&rows, &Manhattan, &query, 5);
    assert_eq!(got, want);
    Ok(())
}
