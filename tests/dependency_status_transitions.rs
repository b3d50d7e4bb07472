//! Property test for the dependency status monotonic transition table
//! (§8 invariant 3: `waiting -> ready -> processing -> {completed|failed}`,
//! never backwards, never skipping a state).

use orcd::engine::model::DependencyStatus;
use proptest::prelude::*;

fn all_statuses() -> Vec<DependencyStatus> {
    use DependencyStatus::*;
    vec![Waiting, Ready, Processing, Completed, Failed]
}

fn status_strategy() -> impl Strategy<Value = DependencyStatus> {
    prop_oneof![
        Just(DependencyStatus::Waiting),
        Just(DependencyStatus::Ready),
        Just(DependencyStatus::Processing),
        Just(DependencyStatus::Completed),
        Just(DependencyStatus::Failed),
    ]
}

fn rank(status: DependencyStatus) -> u8 {
    use DependencyStatus::*;
    match status {
        Waiting => 0,
        Ready => 1,
        Processing => 2,
        Completed => 3,
        Failed => 3,
    }
}

proptest! {
    #[test]
    fn allowed_transitions_never_move_rank_backwards(from in status_strategy(), to in status_strategy()) {
        if from.can_transition_to(to) {
            prop_assert!(rank(to) >= rank(from));
            prop_assert_ne!(from, to);
        }
    }

    #[test]
    fn no_status_can_transition_to_itself(status in status_strategy()) {
        prop_assert!(!status.can_transition_to(status));
    }

    #[test]
    fn terminal_statuses_accept_no_further_transition(status in status_strategy()) {
        use DependencyStatus::*;
        if matches!(status, Completed | Failed) {
            for next in all_statuses() {
                prop_assert!(!status.can_transition_to(next));
            }
        }
    }
}

#[test]
fn exhaustive_transition_table_matches_the_documented_edges() {
    use DependencyStatus::*;
    let allowed = [
        (Waiting, Ready),
        (Waiting, Failed),
        (Ready, Processing),
        (Processing, Completed),
        (Processing, Failed),
    ];
    for from in all_statuses() {
        for to in all_statuses() {
            let expected = allowed.contains(&(from, to));
            assert_eq!(from.can_transition_to(to), expected, "{from:?} -> {to:?}");
        }
    }
}
