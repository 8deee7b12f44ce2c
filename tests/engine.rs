mod engine {
    use std::cell::Cell;

    use grifola::engine::*;
    use grifola::memo::mk_mfn;
    use grifola::name::*;

    thread_local!(static CALLS: Cell<usize> = Cell::new(0));

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
        manage::init_dcg();
        CALLS.with(|c| c.set(0));
    }

    fn bump_calls() {
        CALLS.with(|c| c.set(c.get() + 1));
    }

    fn calls() -> usize {
        CALLS.with(|c| c.get())
    }

    #[test]
    fn force_cell() {
        init();
        let a: u32 = 1234;
        let b: Art<u32> = cell(name_of_usize(0), a);
        let c: u32 = force(&b);
        assert_eq!(a, c);
    }

    #[test]
    fn force_empty_cell() {
        init();
        let b = cell(name_of_usize(0), Vec::<usize>::new());
        assert_eq!(force(&b), Vec::<usize>::new());
    }

    #[test]
    fn set_then_force() {
        init();
        let c = cell(name_of_usize(0), 1usize);
        set(&c, 7);
        assert_eq!(force(&c), 7);
    }

    #[test]
    fn force_is_idempotent() {
        init();
        let t = thunk(name_of_usize(0), || {
            bump_calls();
            42usize
        });
        assert_eq!(force(&t), 42);
        assert_eq!(force(&t), 42);
        assert_eq!(force(&t), 42);
        assert_eq!(calls(), 1);
    }

    #[test]
    fn set_without_change_is_a_noop() {
        init();
        let c = cell(name_of_usize(0), 5usize);
        let t = {
            let c = c.clone();
            thunk(name_of_usize(1), move || {
                bump_calls();
                force(&c) + 1
            })
        };
        assert_eq!(force(&t), 6);
        let s0 = seq();
        let (_, d) = cnt(|| set(&c, 5));
        assert_eq!(d.dirty, 0);
        assert_eq!(seq(), s0);
        assert_eq!(force(&t), 6);
        assert_eq!(calls(), 1);
    }

    #[test]
    fn repair_cuts_off_at_unchanged_values() {
        init();
        let c = cell(name_of_usize(0), 2usize);
        let parity = {
            let c = c.clone();
            thunk(name_of_usize(1), move || force(&c) % 2)
        };
        let top = {
            let parity = parity.clone();
            thunk(name_of_usize(2), move || {
                bump_calls();
                force(&parity) + 10
            })
        };
        assert_eq!(force(&top), 10);
        assert_eq!(calls(), 1);

        // 2 -> 4 flips nothing observable at `top`
        set(&c, 4);
        let (_, d) = cnt(|| assert_eq!(force(&top), 10));
        assert_eq!(d.eval, 1); // only `parity` re-ran
        assert_eq!(calls(), 1);

        // 4 -> 5 does
        set(&c, 5);
        assert_eq!(force(&top), 11);
        assert_eq!(calls(), 2);
    }

    #[test]
    fn structural_memo_caches_by_argument() {
        init();
        let m = mk_mfn(name_of_str("double"), |_m, x: usize| {
            bump_calls();
            x * 2
        });
        let (r1, d1) = cnt(|| force(&m.art(21)));
        assert_eq!(r1, 42);
        assert_eq!(d1.eval, 1);
        let (r2, d2) = cnt(|| force(&m.art(21)));
        assert_eq!(r2, 42);
        assert_eq!(d2.eval, 0);
        assert_eq!(calls(), 1);
        assert_eq!(m.table_len(), 1);
    }

    #[test]
    fn structural_recursion_terminates_on_repeat_arguments() {
        init();
        // log2-ish depth; repeated sub-arguments hit the table
        let m = mk_mfn(name_of_str("depth"), |m, n: u64| {
            if n == 0 {
                0
            } else {
                force(&m.art(n / 2)) + 1
            }
        });
        assert_eq!(force(&m.art(1 << 20)), 21);
        let fib = mk_mfn(name_of_str("fib"), |m, n: u64| {
            if n < 2 {
                n
            } else {
                force(&m.art(n - 1)) + force(&m.art(n - 2))
            }
        });
        let (v, d) = cnt(|| force(&fib.art(20)));
        assert_eq!(v, 6765);
        assert_eq!(d.eval, 21); // linear, not exponential
    }

    #[test]
    fn nominal_hit_with_changed_argument_recomputes() {
        init();
        let m = mk_mfn(name_of_str("inc"), |_m, x: usize| {
            bump_calls();
            x + 1
        });
        let a = m.nart(name_of_usize(0), 1);
        assert_eq!(force(&a), 2);
        let b = m.nart(name_of_usize(0), 5);
        assert_eq!(force(&b), 6);
        assert_eq!(m.table_len(), 1);
        assert_eq!(calls(), 2);
        // the original handle observes the overwritten entry too
        assert_eq!(force(&a), 6);
        assert_eq!(calls(), 2);
    }

    #[test]
    fn nominal_rename_evicts_unreferenced_subnodes_after_flush() {
        init();
        let child = mk_mfn(name_of_str("child"), |_m, x: usize| x * 10);
        let parent = {
            let child = child.clone();
            mk_mfn(name_of_str("parent"), move |_m, x: usize| {
                force(&child.nart(name_of_usize(x), x)) + 1
            })
        };
        let a = parent.nart(name_of_str("p"), 5);
        assert_eq!(force(&a), 51);
        assert_eq!(child.table_len(), 1);

        let b = parent.nart(name_of_str("p"), 6);
        assert_eq!(force(&b), 61);
        // the 5-child lost its incoming edges but lingers until flush
        assert_eq!(child.table_len(), 2);
        flush();
        assert_eq!(child.table_len(), 1);
        assert_eq!(parent.table_len(), 1);
    }

    #[test]
    fn flush_is_idempotent() {
        init();
        let m = mk_mfn(name_of_str("id"), |_m, x: usize| x);
        let a = m.art(3);
        assert_eq!(force(&a), 3);
        flush();
        flush();
        assert_eq!(force(&a), 3);
        assert_eq!(m.table_len(), 1);
    }

    #[test]
    fn unrelated_mutations_never_rerun_an_independent_mfn() {
        init();
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let m = mk_mfn(name_of_str("island"), |_m, x: usize| {
            bump_calls();
            x + 1
        });
        let a = m.art(7);
        assert_eq!(force(&a), 8);
        assert_eq!(calls(), 1);

        let cells: Vec<Art<usize>> =
            (0..16).map(|i| cell(name_of_usize(100 + i), 0usize)).collect();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let i = rng.gen_range(0..cells.len());
            let v = rng.gen_range(0..1000usize);
            set(&cells[i], v);
        }
        assert_eq!(force(&a), 8);
        assert_eq!(force(&m.art(7)), 8);
        assert_eq!(calls(), 1);
    }

    #[test]
    #[should_panic(expected = "misuse")]
    fn set_inside_a_force_context_panics() {
        init();
        let c = cell(name_of_usize(0), 1usize);
        let t = {
            let c = c.clone();
            thunk(name_of_usize(1), move || {
                set(&c, 2);
                force(&c)
            })
        };
        force(&t);
    }

    #[test]
    fn panicking_body_unwinds_the_force_stack() {
        init();
        let t = thunk(name_of_usize(0), || {
            if true {
                panic!("body says no");
            }
            0usize
        });
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| force(&t)));
        assert!(r.is_err());
        // the stack unwound: outer-layer operations still work
        let c = cell(name_of_usize(1), 9usize);
        set(&c, 10);
        assert_eq!(force(&c), 10);
    }

    #[test]
    fn generative_identity_never_collides() {
        init();
        manage::init_engine(Flags { generative_ids: true, ..Flags::default() });
        let m = mk_mfn(name_of_str("gen"), |_m, x: usize| {
            bump_calls();
            x + 1
        });
        assert_eq!(force(&m.art(5)), 6);
        assert_eq!(force(&m.art(5)), 6);
        assert_eq!(calls(), 2);
        assert_eq!(m.table_len(), 2);
    }

    #[test]
    fn disabled_names_degrade_to_generative() {
        init();
        manage::init_engine(Flags { disable_names: true, ..Flags::default() });
        let m = mk_mfn(name_of_str("dn"), |_m, x: usize| {
            bump_calls();
            x + 1
        });
        assert_eq!(force(&m.nart(name_of_usize(0), 5)), 6);
        assert_eq!(force(&m.nart(name_of_usize(0), 5)), 6);
        assert_eq!(calls(), 2);
        assert_eq!(m.table_len(), 2);
    }

    #[test]
    fn disabled_mfns_degrade_to_eager_cells() {
        init();
        manage::init_engine(Flags { disable_mfns: true, ..Flags::default() });
        let m = mk_mfn(name_of_str("dm"), |_m, x: usize| {
            bump_calls();
            x + 1
        });
        let a = m.art(5);
        assert_eq!(calls(), 1); // ran eagerly
        let (v, d) = cnt(|| force(&a));
        assert_eq!(v, 6);
        assert_eq!(d.eval, 0); // untracked
        assert_eq!(m.table_len(), 0); // and not memoized
    }

    #[test]
    fn fifo_eviction_applies_on_flush() {
        init();
        manage::init_engine(Flags {
            eviction_policy: EvictionPolicy::Fifo(2),
            ..Flags::default()
        });
        let m = mk_mfn(name_of_str("fifo"), |_m, x: usize| x + 1);
        for i in 0..5 {
            assert_eq!(force(&m.art(i)), i + 1);
        }
        assert_eq!(m.table_len(), 5);
        flush();
        assert_eq!(m.table_len(), 2);
        // evicted arguments recompute on demand
        assert_eq!(force(&m.art(0)), 1);
    }

    #[test]
    fn macros_cover_the_common_forms() {
        init();
        use grifola::{cell, get, memo, thunk};
        let c = cell!(5usize);
        let t = {
            let c = c.clone();
            thunk![name_of_str("t") =>> get!(c) * 2]
        };
        assert_eq!(get!(t), 10);
        let v: usize = memo![name_of_str("m") =>> 40 + 2];
        assert_eq!(v, 42);
    }
}
