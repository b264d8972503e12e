//! Property-based tests for the effect algebra laws.
//!
//! Verifies the monad laws (left identity, right identity, associativity)
//! and functor laws as observable equalities of run outcomes.

use filament::{Effect, EffectRuntime};
use proptest::prelude::*;

fn run(effect: Effect<String, i64>) -> i64 {
    EffectRuntime::create().run(effect).unwrap()
}

proptest! {
    /// Left identity: succeed(a).flat_map(k) == k(a)
    #[test]
    fn prop_monad_left_identity(value in any::<i32>()) {
        let value = i64::from(value);
        let k = |x: i64| Effect::<String, i64>::succeed(x.wrapping_mul(3));

        let left = Effect::<String, i64>::succeed(value).flat_map(k);
        let right = k(value);

        prop_assert_eq!(run(left), run(right));
    }

    /// Right identity: m.flat_map(succeed) == m
    #[test]
    fn prop_monad_right_identity(value in any::<i32>()) {
        let value = i64::from(value);
        let left = Effect::<String, i64>::succeed(value).flat_map(Effect::succeed);
        prop_assert_eq!(run(left), value);
    }

    /// Associativity:
    /// m.flat_map(k1).flat_map(k2) == m.flat_map(|x| k1(x).flat_map(k2))
    #[test]
    fn prop_monad_associativity(value in any::<i32>()) {
        fn k1(x: i64) -> Effect<String, i64> {
            Effect::succeed(x.wrapping_add(10))
        }
        fn k2(x: i64) -> Effect<String, i64> {
            Effect::succeed(x.wrapping_mul(2))
        }

        let value = i64::from(value);
        let left = Effect::<String, i64>::succeed(value).flat_map(k1).flat_map(k2);
        let right = Effect::<String, i64>::succeed(value).flat_map(|x| k1(x).flat_map(k2));

        prop_assert_eq!(run(left), run(right));
    }

    /// Associativity holds for error outcomes too.
    #[test]
    fn prop_monad_associativity_on_errors(message in "[a-z]{1,8}") {
        fn k1(x: i64) -> Effect<String, i64> {
            Effect::succeed(x + 1)
        }
        fn k2(x: i64) -> Effect<String, i64> {
            Effect::succeed(x * 2)
        }

        let runtime = EffectRuntime::create();
        let left = Effect::<String, i64>::fail(message.clone()).flat_map(k1).flat_map(k2);
        let right = Effect::<String, i64>::fail(message.clone()).flat_map(|x| k1(x).flat_map(k2));

        let left_error = runtime.run(left).unwrap_err().into_failed().unwrap();
        let right_error = runtime.run(right).unwrap_err().into_failed().unwrap();
        prop_assert_eq!(&left_error, &message);
        prop_assert_eq!(left_error, right_error);
    }

    /// Functor identity: m.map(id) == m
    #[test]
    fn prop_functor_identity(value in any::<i32>()) {
        let value = i64::from(value);
        let mapped = Effect::<String, i64>::succeed(value).map(|x| x);
        prop_assert_eq!(run(mapped), value);
    }

    /// Functor composition: m.map(f).map(g) == m.map(|x| g(f(x)))
    #[test]
    fn prop_functor_composition(value in any::<i32>()) {
        fn f(x: i64) -> i64 {
            x.wrapping_add(10)
        }
        fn g(x: i64) -> i64 {
            x.wrapping_mul(2)
        }

        let value = i64::from(value);
        let left = Effect::<String, i64>::succeed(value).map(f).map(g);
        let right = Effect::<String, i64>::succeed(value).map(|x| g(f(x)));

        prop_assert_eq!(run(left), run(right));
    }

    /// map is flat_map into succeed.
    #[test]
    fn prop_map_is_derived_from_flat_map(value in any::<i32>()) {
        let value = i64::from(value);
        let mapped = Effect::<String, i64>::succeed(value).map(|x| x.wrapping_sub(4));
        let bound = Effect::<String, i64>::succeed(value)
            .flat_map(|x| Effect::succeed(x.wrapping_sub(4)));

        prop_assert_eq!(run(mapped), run(bound));
    }

    /// attempt reifies exactly the outcome run would produce.
    #[test]
    fn prop_attempt_matches_run(fail in any::<bool>(), value in any::<i32>(), message in "[a-z]{1,8}") {
        let runtime = EffectRuntime::create();
        let effect = if fail {
            Effect::<String, i32>::fail(message.clone())
        } else {
            Effect::<String, i32>::succeed(value)
        };

        let reified = runtime.run(effect.attempt()).unwrap();
        if fail {
            prop_assert_eq!(reified, Err(message));
        } else {
            prop_assert_eq!(reified, Ok(value));
        }
    }
}
