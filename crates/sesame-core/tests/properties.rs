//! Property tests for the status mirror and lock-state derivation.

use std::sync::Arc;

use proptest::prelude::*;

use sesame_core::lock_state::{LockStateTracker, derive};
use sesame_core::{
    EventBus, LockCommand, LockEvent, MechSettings, MechStatus, MemorySink, StatusMirror,
};

fn status_strategy() -> impl Strategy<Value = MechStatus> {
    (
        any::<u16>(),
        any::<i16>(),
        any::<i16>(),
        any::<[bool; 7]>(),
    )
        .prop_map(|(battery, target, position, flags)| MechStatus {
            battery,
            target,
            position,
            clutch_failed: flags[0],
            lock_range: flags[1],
            unlock_range: flags[2],
            critical: flags[3],
            stop: flags[4],
            low_battery: flags[5],
            clockwise: flags[6],
        })
}

fn settings_strategy() -> impl Strategy<Value = MechSettings> {
    (any::<i16>(), any::<i16>(), any::<u16>()).prop_map(|(lock, unlock, auto_lock_seconds)| {
        MechSettings {
            lock,
            unlock,
            auto_lock_seconds,
        }
    })
}

fn command_strategy() -> impl Strategy<Value = LockCommand> {
    prop_oneof![Just(LockCommand::Lock), Just(LockCommand::Unlock)]
}

proptest! {
    #[test]
    fn mirror_holds_last_status_exactly(statuses in prop::collection::vec(status_strategy(), 1..20)) {
        let bus = EventBus::new(8, Arc::new(MemorySink::new()));
        let mirror = Arc::new(StatusMirror::new());
        mirror.attach(&bus);

        for status in &statuses {
            bus.dispatch(LockEvent::MechStatus { status: *status });
        }
        prop_assert_eq!(mirror.status(), statuses.last().copied());
    }

    #[test]
    fn mirror_holds_last_settings_exactly(all in prop::collection::vec(settings_strategy(), 1..20)) {
        let bus = EventBus::new(8, Arc::new(MemorySink::new()));
        let mirror = Arc::new(StatusMirror::new());
        mirror.attach(&bus);

        for settings in &all {
            bus.dispatch(LockEvent::MechSettings { settings: *settings });
        }
        prop_assert_eq!(mirror.settings(), all.last().copied());
    }

    #[test]
    fn moving_direction_is_exclusive_with_settings(
        status in status_strategy(),
        settings in settings_strategy(),
    ) {
        let status = MechStatus { stop: false, ..status };
        let derived = derive(Some(&status), Some(&settings), None, None);

        prop_assert!(derived.is_locking.is_some());
        prop_assert!(derived.is_unlocking.is_some());
        prop_assert_eq!(derived.is_locking, derived.is_unlocking.map(|u| !u));
    }

    #[test]
    fn moving_direction_is_unknown_without_settings(status in status_strategy()) {
        let status = MechStatus { stop: false, ..status };
        let derived = derive(Some(&status), None, None, None);

        prop_assert_eq!(derived.is_locking, None);
        prop_assert_eq!(derived.is_unlocking, None);
        prop_assert_eq!(derived.is_locked, Some(status.lock_range));
    }

    #[test]
    fn stopped_mechanism_is_idle(status in status_strategy(), settings in proptest::option::of(settings_strategy())) {
        let status = MechStatus { stop: true, ..status };
        let derived = derive(Some(&status), settings.as_ref(), None, None);

        prop_assert_eq!(derived.is_locking, Some(false));
        prop_assert_eq!(derived.is_unlocking, Some(false));
    }

    #[test]
    fn first_status_clears_assumed_command(
        command in command_strategy(),
        status in status_strategy(),
        settings in proptest::option::of(settings_strategy()),
    ) {
        let tracker = LockStateTracker::new();
        tracker.begin_command(command);
        prop_assert!(tracker.derive(Some(&status), settings.as_ref()).assumed);

        tracker.on_status();
        let derived = tracker.derive(Some(&status), settings.as_ref());
        prop_assert!(!derived.assumed);
        prop_assert_eq!(derived, derive(Some(&status), settings.as_ref(), None, None));
        prop_assert!(!tracker.revert_command(command));
    }

    #[test]
    fn stale_history_result_is_dropped(statuses in 2u64..10) {
        let tracker = LockStateTracker::new();
        let first = tracker.on_status();
        for _ in 1..statuses {
            tracker.on_status();
        }
        prop_assert!(!tracker.resolve_history(first, Some(sesame_core::ChangedBy::Manual)));
        prop_assert_eq!(tracker.changed_by(), None);
    }
}
