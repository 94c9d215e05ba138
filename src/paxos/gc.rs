/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Checkpoint arithmetic used for garbage collection.
//!
//! Every replica checkpoints its application state every `checkpoint_interval` executed slots. A
//! replica reports the last slot it checkpointed on every [`AcceptReply`](super::messages::AcceptReply)
//! and coordinators piggyback the [median](median_checkpointed_slot) of these reports on every
//! [`Accept`](super::messages::Accept) and [`Decision`](super::messages::Decision). Accepted values
//! at or below the median can be discarded: a majority of the group has checkpointed past them, so no
//! future coordinator will need them to be carried over.

use crate::types::data_types::Slot;

/// Get the highest slot that at least a majority of `checkpointed_slots` are at or beyond.
///
/// `None` entries stand for members that have not reported a checkpoint yet, and sort below every
/// slot. The values are sorted and the element at the "median minus" index is returned: `n / 2` if
/// there are an odd number `n` of values, `n / 2 - 1` if there are an even number.
pub(crate) fn median_checkpointed_slot(checkpointed_slots: &[Option<Slot>]) -> Option<Slot> {
    if checkpointed_slots.is_empty() {
        return None;
    }
    let mut sorted = checkpointed_slots.to_vec();
    sorted.sort();
    let n = sorted.len();
    let index = if n % 2 == 0 { n / 2 - 1 } else { n / 2 };
    sorted[index]
}

/// Get the slot of the last checkpoint taken at or before `last_executed`.
pub(crate) fn last_checkpoint_slot(last_executed: Option<Slot>, checkpoint_interval: u64) -> Option<Slot> {
    let last_executed = last_executed?.int();
    let interval = checkpoint_interval.max(1);
    Some(Slot::new(last_executed - last_executed % interval))
}

/// Whether a checkpoint should be taken right after executing `slot`.
pub(crate) fn should_checkpoint(slot: Slot, is_stop: bool, checkpoint_interval: u64) -> bool {
    is_stop || slot.int() % checkpoint_interval.max(1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(values: &[u64]) -> Vec<Option<Slot>> {
        values.iter().map(|v| Some(Slot::new(*v))).collect()
    }

    #[test]
    fn median_of_five_reports() {
        assert_eq!(
            median_checkpointed_slot(&slots(&[10, 12, 15, 15, 20])),
            Some(Slot::new(15))
        );
        assert_eq!(
            median_checkpointed_slot(&slots(&[20, 15, 10, 15, 12])),
            Some(Slot::new(15))
        );
    }

    #[test]
    fn median_of_even_count_takes_lower_middle() {
        assert_eq!(
            median_checkpointed_slot(&slots(&[4, 1, 3, 2])),
            Some(Slot::new(2))
        );
    }

    #[test]
    fn unreported_members_hold_the_median_back() {
        let reports = vec![None, None, Some(Slot::new(30))];
        assert_eq!(median_checkpointed_slot(&reports), None);

        let reports = vec![None, Some(Slot::new(10)), Some(Slot::new(30))];
        assert_eq!(median_checkpointed_slot(&reports), Some(Slot::new(10)));
        assert_eq!(median_checkpointed_slot(&[]), None);
    }

    #[test]
    fn a_majority_is_always_at_or_beyond_the_median() {
        let cases: Vec<Vec<u64>> = vec![
            vec![10, 12, 15, 15, 20],
            vec![0, 100, 100],
            vec![7, 3],
            vec![1, 2, 3, 4, 5, 6, 7],
            vec![9, 9, 1, 1],
            vec![42],
        ];
        for case in cases {
            let reports = slots(&case);
            let median = median_checkpointed_slot(&reports).unwrap();
            let at_or_beyond = reports.iter().filter(|r| r.unwrap() >= median).count();
            assert!(at_or_beyond >= case.len() / 2 + 1, "case {:?}", case);
        }
    }

    #[test]
    fn checkpoint_slots() {
        assert_eq!(last_checkpoint_slot(None, 100), None);
        assert_eq!(last_checkpoint_slot(Some(Slot::new(0)), 100), Some(Slot::new(0)));
        assert_eq!(last_checkpoint_slot(Some(Slot::new(99)), 100), Some(Slot::new(0)));
        assert_eq!(last_checkpoint_slot(Some(Slot::new(250)), 100), Some(Slot::new(200)));

        assert!(should_checkpoint(Slot::new(0), false, 100));
        assert!(should_checkpoint(Slot::new(300), false, 100));
        assert!(!should_checkpoint(Slot::new(301), false, 100));
        assert!(should_checkpoint(Slot::new(301), true, 100));
    }
}
