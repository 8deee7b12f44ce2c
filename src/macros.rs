//! Macros to make the `engine` module's interface more ergonomic.

/// Convenience wrapper for `engine::force`.
#[macro_export]
macro_rules! get {
    ( $art:expr ) => {{
        $crate::engine::force(&($art))
    }};
}

/// Convenience wrapper for `engine::cell`.
///
/// Warning: uses a global counter to choose a unique name.  This _may_
/// be appropriate for the outer (editor) layer, but is never
/// appropriate inside a memoized body.
#[macro_export]
macro_rules! cell {
    ( $value:expr ) => {{
        $crate::engine::cell($crate::name::gensym(), $value)
    }};
}

/// Convenience wrapper for `engine::thunk`.
///
/// Warning: when not given a name, this macro draws one from a global
/// counter; see `cell!`.
#[macro_export]
macro_rules! thunk {
    [ $nm:expr =>> $body:expr ] => {{
        $crate::engine::thunk($nm, move || { $body })
    }};
    [ $body:expr ] => {{
        $crate::engine::thunk($crate::name::gensym(), move || { $body })
    }};
}

/// Convenience wrapper for `engine::thunk` and `engine::force`:
/// creates a suspension and immediately forces it.
#[macro_export]
macro_rules! memo {
    [ $nm:expr =>> $body:expr ] => {{
        let t = $crate::engine::thunk($nm, move || { $body });
        $crate::engine::force(&t)
    }};
    [ $body:expr ] => {{
        let t = $crate::engine::thunk($crate::name::gensym(), move || { $body });
        $crate::engine::force(&t)
    }};
}
