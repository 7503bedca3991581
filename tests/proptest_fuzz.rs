//! Property-based tests for the parsers that see untrusted input: display
//! ids from URLs and sync peers, and permission blobs from the users table.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use serde_json::{json, Map, Value};

use clinic_core::permissions::Action;
use clinic_core::{DisplayId, PermissionMap, RecordType, Section};

// =============================================================================
// Strategies
// =============================================================================

fn record_type() -> impl Strategy<Value = RecordType> {
    prop_oneof![Just(RecordType::Patient), Just(RecordType::Payment), Just(RecordType::Report)]
}

fn display_id() -> impl Strategy<Value = DisplayId> {
    (record_type(), 1000i32..=9999, 1u64..=9_999_999).prop_map(|(r, y, s)| DisplayId::new(r, y, s))
}

/// Arbitrary JSON, including shapes nothing expects
fn arbitrary_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];
    leaf.prop_recursive(4, 64, 10, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
            prop::collection::hash_map(".*", inner, 0..10).prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

/// Blobs shaped like stored permissions, with legacy and junk keys mixed in
fn permission_blob() -> impl Strategy<Value = Value> {
    let section = prop_oneof![
        Just("patients"),
        Just("billing"),
        Just("reports"),
        Just("users"),
        Just("clinic"),
        Just("settings"),
        Just("inventory"),
    ];
    let action = prop_oneof![Just("view"), Just("edit"), Just("delete"), Just("export")];
    let flag = prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        (0i64..3).prop_map(|n| json!(n)),
        Just(json!("true")),
    ];
    let actions = prop::collection::hash_map(action, flag, 0..5)
        .prop_map(|m| Value::Object(m.into_iter().map(|(k, v)| (k.to_string(), v)).collect::<Map<_, _>>()));
    prop::collection::hash_map(section, actions, 0..8)
        .prop_map(|m| Value::Object(m.into_iter().map(|(k, v)| (k.to_string(), v)).collect()))
}

// =============================================================================
// Display ids
// =============================================================================

proptest! {
    #[test]
    fn display_id_parse_accepts_what_it_prints(id in display_id()) {
        let text = id.to_string();
        prop_assert_eq!(DisplayId::parse(&text), Some(id));
        prop_assert!(text.starts_with(&DisplayId::stem(id.record, id.year)));
    }

    #[test]
    fn display_id_parse_never_panics(s in ".*") {
        if let Some(id) = DisplayId::parse(&s) {
            prop_assert_eq!(id.to_string(), s);
        }
    }

    #[test]
    fn display_id_rejects_unpadded_and_zero(r in record_type(), y in 1000i32..=9999, s in 1u64..10_000) {
        let short = format!("{}-{y}-{s}", r.prefix());
        prop_assert!(DisplayId::parse(&short).is_none());
        let zero = format!("{}-{y}-00000", r.prefix());
        prop_assert!(DisplayId::parse(&zero).is_none());
    }

    #[test]
    fn display_ids_order_by_sequence_within_a_year(r in record_type(), y in 1000i32..=9999, a in 1u64..99_999, b in 1u64..99_999) {
        let (x, z) = (DisplayId::new(r, y, a), DisplayId::new(r, y, b));
        prop_assert_eq!(x.cmp(&z), a.cmp(&b));
        prop_assert_eq!(x.to_string().cmp(&z.to_string()), a.cmp(&b));
    }
}

// =============================================================================
// Permission maps
// =============================================================================

proptest! {
    #[test]
    fn permission_decode_never_panics(value in arbitrary_json()) {
        let map = PermissionMap::from_json(&value);
        let canonical = map.to_json();
        prop_assert_eq!(PermissionMap::from_json(&canonical), map);
    }

    #[test]
    fn canonical_blob_only_names_known_sections(value in permission_blob()) {
        let canonical = PermissionMap::from_json(&value).to_json();
        for (key, actions) in canonical.as_object().unwrap() {
            prop_assert!(Section::ALL.iter().any(|s| s.as_str() == key));
            let actions = actions.as_object().unwrap();
            prop_assert_eq!(actions.len(), Action::ALL.len());
            prop_assert!(actions.values().any(|v| v == &Value::Bool(true)));
        }
    }

    #[test]
    fn edit_or_delete_implies_view(value in permission_blob()) {
        let map = PermissionMap::from_json(&value);
        for section in Section::ALL {
            if map.allows(section, Action::Edit) || map.allows(section, Action::Delete) {
                prop_assert!(map.allows(section, Action::View));
            }
        }
    }
}
