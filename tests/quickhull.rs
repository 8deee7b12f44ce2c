mod quickhull {
    use grifola::engine::{cnt, manage};
    use grifola::geom::{cloud_max_dist, max_dist_mfn, pt, quickhull, quickhull_mfn};
    use grifola::name::name_of_str;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
        manage::init_dcg();
    }

    #[test]
    fn corner_cloud_hull_excludes_the_interior() {
        init();
        let m = quickhull_mfn(name_of_str("qh"));
        let cloud = [pt(1.0, 1.0), pt(2.0, 2.0), pt(1.0, 2.0), pt(2.0, 1.0), pt(1.5, 1.5)];
        let hull = quickhull(&m, &cloud);
        assert_eq!(hull, vec![pt(1.0, 1.0), pt(1.0, 2.0), pt(2.0, 2.0), pt(2.0, 1.0)]);
        assert!(!hull.contains(&pt(1.5, 1.5)));
    }

    #[test]
    fn hull_subproblems_are_memoized() {
        init();
        let m = quickhull_mfn(name_of_str("qh"));
        let cloud = [pt(1.0, 1.0), pt(2.0, 2.0), pt(1.0, 2.0), pt(2.0, 1.0), pt(1.5, 1.5)];
        let first = quickhull(&m, &cloud);
        let (second, d) = cnt(|| quickhull(&m, &cloud));
        assert_eq!(first, second);
        assert_eq!(d.eval, 0);
    }

    #[test]
    fn degenerate_clouds() {
        init();
        let m = quickhull_mfn(name_of_str("qh"));
        assert_eq!(quickhull(&m, &[]), vec![]);
        assert_eq!(quickhull(&m, &[pt(3.0, 4.0)]), vec![pt(3.0, 4.0)]);
    }

    #[test]
    fn cloud_max_dist_is_fifty_squared_units() {
        init();
        let m = max_dist_mfn(name_of_str("md"));
        let a = [pt(1.0, 1.0), pt(2.0, 2.0), pt(1.0, 2.0), pt(2.0, 1.0), pt(1.5, 1.5)];
        let b = [pt(5.0, 5.0), pt(6.0, 6.0), pt(5.0, 6.0), pt(6.0, 5.0), pt(5.5, 5.5)];
        let d = cloud_max_dist(&m, &a, &b);
        assert_eq!(d, 50.0);
        assert!((d.sqrt() - 7.0710678).abs() < 1e-6);
    }
}
