// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

pub use synallagma::*;

#[cfg(test)]
mod test;

// These scenarios live outside the library so they only see the public API:
// everything they need to wire up agents, queues and id generators has to
// be reachable without crate-level visibility.

#[test]
fn read_only_fast_path_test() {
    test::read_only_fast_path_test();
}

#[test]
fn read_only_refusal_and_timeout_test() {
    test::read_only_refusal_and_timeout_test();
}

#[test]
fn overload_shedding_test() {
    test::overload_shedding_test();
}

#[test]
fn explicit_abort_test() {
    test::explicit_abort_test();
}

#[test]
fn cascading_cancel_test() {
    test::cascading_cancel_test();
}

#[test]
fn tm_timeout_test() {
    test::tm_timeout_test();
}

#[test]
fn end_to_end_commit_test() {
    test::end_to_end_commit_test();
}

#[test]
fn lock_conflict_is_final_test() {
    test::lock_conflict_is_final_test();
}

#[test]
fn at_most_one_decision_test() {
    test::at_most_one_decision_test();
}

#[test]
fn ping_test() {
    test::ping_test();
}

#[test]
fn id_churn_test() {
    test::id_churn_test();
}

#[test]
fn abandoned_tm_unwinds_test() {
    test::abandoned_tm_unwinds_test();
}

#[test]
fn cascading_abort_test() {
    test::cascading_abort_test();
}

#[test]
fn remote_refusal_aborts_tm_test() {
    test::remote_refusal_aborts_tm_test();
}

#[test]
fn tm_cancels_prepared_writers_test() {
    test::tm_cancels_prepared_writers_test();
}

#[test]
fn dispose_releases_lease_test() {
    test::dispose_releases_lease_test();
}

pub fn main() {
    println!("please run `cargo test` instead");
}
