//! Property-based test generators using proptest.

use kvsync_protocol::{DataItem, SecurityLabel, SecurityOption, SyncMode};
use proptest::prelude::*;

/// Strategy for generating device identifiers.
pub fn device_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9-]{0,15}").expect("Invalid regex")
}

/// Strategy for generating entry keys.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..32)
}

/// Strategy for generating entry values.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

/// Strategy for generating a single entry, live or deleted.
pub fn data_item_strategy() -> impl Strategy<Value = DataItem> {
    (
        key_strategy(),
        value_strategy(),
        1u64..u64::MAX / 2,
        any::<bool>(),
        prop::option::of(device_id_strategy()),
    )
        .prop_map(|(key, value, timestamp, deleted, origin)| {
            let mut item = if deleted {
                DataItem::delete(key, timestamp)
            } else {
                DataItem::put(key, value, timestamp)
            };
            item.write_timestamp = timestamp;
            item.origin_device = origin.unwrap_or_default();
            item
        })
}

/// Strategy for generating a batch of entries.
pub fn data_items_strategy(max: usize) -> impl Strategy<Value = Vec<DataItem>> {
    prop::collection::vec(data_item_strategy(), 0..max)
}

/// Strategy for modes a caller may request.
pub fn caller_mode_strategy() -> impl Strategy<Value = SyncMode> {
    prop_oneof![
        Just(SyncMode::Push),
        Just(SyncMode::Pull),
        Just(SyncMode::PushAndPull),
        Just(SyncMode::AutoPush),
        Just(SyncMode::AutoPull),
    ]
}

/// Strategy for security labels other than "not set".
pub fn security_label_strategy() -> impl Strategy<Value = SecurityLabel> {
    prop::sample::select(
        SecurityLabel::ALL
            .into_iter()
            .filter(|label| *label != SecurityLabel::NotSet)
            .collect::<Vec<_>>(),
    )
}

/// Strategy for security options with a set label.
pub fn security_option_strategy() -> impl Strategy<Value = SecurityOption> {
    (security_label_strategy(), 0i32..4).prop_map(|(label, flag)| SecurityOption::new(label, flag))
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn items_keep_their_shape(item in data_item_strategy()) {
            prop_assert!(!item.key.is_empty());
            prop_assert!(item.timestamp > 0);
            if item.is_deleted() {
                prop_assert!(item.value.is_empty());
            }
        }

        #[test]
        fn labels_are_set(label in security_label_strategy()) {
            prop_assert_ne!(label, SecurityLabel::NotSet);
        }
    }
}
