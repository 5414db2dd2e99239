//! Integration tests for `StateTransitionGuard` across `Task` and
//! `BrowserInstance` lifecycles, including a multi-thread concurrency
//! sanity check for the shared transition counters.

use std::sync::Arc;
use std::thread;

use upload_engine::browser::BrowserStatus;
use upload_engine::state::{StateTransitionError, StateTransitionGuard};
use upload_engine::task::TaskStatus;

#[test]
fn task_happy_path_pending_to_active_to_completed() {
    let guard = StateTransitionGuard::new();
    assert!(guard
        .can_transition_task(TaskStatus::Pending, TaskStatus::Active)
        .is_ok());
    assert!(guard
        .can_transition_task(TaskStatus::Active, TaskStatus::Completed)
        .is_ok());
}

#[test]
fn task_retry_path_active_failed_pending() {
    let guard = StateTransitionGuard::new();
    assert!(guard
        .can_transition_task(TaskStatus::Active, TaskStatus::Failed)
        .is_ok());
    assert!(guard
        .can_transition_task(TaskStatus::Failed, TaskStatus::Pending)
        .is_ok());
}

#[test]
fn task_dead_letter_path_failed_to_dead() {
    let guard = StateTransitionGuard::new();
    assert!(guard
        .can_transition_task(TaskStatus::Failed, TaskStatus::Dead)
        .is_ok());
}

#[test]
fn task_invalid_transitions_blocked() {
    let guard = StateTransitionGuard::new();
    let invalid = vec![
        (TaskStatus::Pending, TaskStatus::Completed),
        (TaskStatus::Pending, TaskStatus::Dead),
        (TaskStatus::Dead, TaskStatus::Pending),
        (TaskStatus::Completed, TaskStatus::Active),
        (TaskStatus::Dead, TaskStatus::Active),
    ];
    for (from, to) in invalid {
        assert!(
            guard.can_transition_task(from, to).is_err(),
            "expected {from:?} -> {to:?} to be invalid"
        );
    }
}

#[test]
fn browser_lease_release_reuse_cycle() {
    let guard = StateTransitionGuard::new();
    assert!(guard
        .can_transition_browser(BrowserStatus::Idle, BrowserStatus::Busy)
        .is_ok());
    assert!(guard
        .can_transition_browser(BrowserStatus::Busy, BrowserStatus::Idle)
        .is_ok());
    assert!(guard
        .can_transition_browser(BrowserStatus::Idle, BrowserStatus::Busy)
        .is_ok());
    assert!(guard
        .can_transition_browser(BrowserStatus::Busy, BrowserStatus::Error)
        .is_ok());
    assert!(guard
        .can_transition_browser(BrowserStatus::Error, BrowserStatus::Idle)
        .is_ok());
}

#[test]
fn browser_idle_cannot_jump_to_error() {
    let guard = StateTransitionGuard::new();
    assert!(guard
        .can_transition_browser(BrowserStatus::Idle, BrowserStatus::Error)
        .is_err());
}

#[test]
fn self_transitions_are_noops_for_both_machines() {
    let guard = StateTransitionGuard::new();
    assert!(guard
        .can_transition_task(TaskStatus::Active, TaskStatus::Active)
        .is_ok());
    assert!(guard
        .can_transition_browser(BrowserStatus::Busy, BrowserStatus::Busy)
        .is_ok());
}

#[test]
fn error_message_names_from_and_to() {
    let guard = StateTransitionGuard::new();
    let result = guard.can_transition_task(TaskStatus::Pending, TaskStatus::Completed);
    match result {
        Err(StateTransitionError::InvalidTransition { from, to, .. }) => {
            assert_eq!(from, "pending");
            assert_eq!(to, "completed");
        }
        _ => panic!("expected InvalidTransition error"),
    }
}

#[test]
fn concurrent_transitions_are_tracked_accurately() {
    let guard = Arc::new(StateTransitionGuard::new());
    let mut handles = vec![];

    for i in 0..100 {
        let guard = guard.clone();
        handles.push(thread::spawn(move || {
            let _ = guard.can_transition_task(TaskStatus::Pending, TaskStatus::Active);
            let _ = guard.can_transition_task(TaskStatus::Active, TaskStatus::Completed);
            if i % 10 == 0 {
                let _ = guard.can_transition_task(TaskStatus::Pending, TaskStatus::Dead);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let metrics = guard.metrics();
    assert_eq!(metrics.valid_task_transitions, 200);
    assert_eq!(metrics.invalid_task_transitions, 10);
    assert!(metrics.last_invalid_transition.is_some());
}
