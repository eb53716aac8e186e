use super::*;
use std::ops::Bound;

fn events() -> TableDef {
    TableDef::new(
        "events",
        vec![
            Column::int("site"),
            Column::int("ts"),
            Column::string("path"),
            Column::int("hits"),
        ],
    )
    .with_sort_key(&["site", "ts"])
}

// -------------------- Values --------------------

#[test]
fn ints_sort_before_strings() {
    assert!(Value::Int(i64::MAX) < Value::Str(String::new()));
    assert!(Value::Int(-1) < Value::Int(0));
    assert!(Value::from("a") < Value::from("b"));
}

#[test]
fn row_macro_converts_literals() {
    let r = row![1, "x", -3i64];
    assert_eq!(r, vec![Value::Int(1), Value::Str("x".into()), Value::Int(-3)]);
    assert_eq!(row_size(&r), 8 + 5 + 8);
}

// -------------------- Table definitions --------------------

#[test]
fn new_defaults_to_first_column_key() {
    let def = TableDef::new("t", vec![Column::int("a"), Column::int("b")]);
    assert_eq!(def.sort_key, vec!["a".to_string()]);
    assert_eq!(def.partition_by, PartitionBy::Single);
    assert!(def.validate().is_ok());
}

#[test]
fn validate_rejects_unknown_sort_column() {
    let def = events().with_sort_key(&["nope"]);
    assert!(def.validate().is_err());
}

#[test]
fn validate_rejects_duplicate_columns() {
    let def = TableDef::new("t", vec![Column::int("a"), Column::int("a")]);
    assert!(def.validate().is_err());
}

#[test]
fn validate_rejects_bad_table_name() {
    let def = TableDef::new("a/b", vec![Column::int("a")]);
    assert!(def.validate().is_err());
}

#[test]
fn validate_rejects_version_in_sort_key() {
    let def = events().with_transform(Transform::Dedup {
        version: "ts".into(),
    });
    assert!(def.validate().is_err());
}

#[test]
fn validate_rejects_string_sum_column() {
    let def = events().with_transform(Transform::Sum {
        columns: vec!["path".into()],
    });
    assert!(def.validate().is_err());
}

#[test]
fn validate_row_checks_arity_and_types() {
    let def = events();
    assert!(def.validate_row(&row![1, 2, "/", 3]).is_ok());
    assert!(def.validate_row(&row![1, 2, "/"]).is_err());
    assert!(def.validate_row(&row![1, "2", "/", 3]).is_err());
}

#[test]
fn collapse_sign_must_be_unit() {
    let def = TableDef::new("c", vec![Column::int("k"), Column::int("sign")])
        .with_transform(Transform::Collapse {
            sign: "sign".into(),
        });
    assert!(def.validate().is_ok());
    assert!(def.validate_row(&row![1, 1]).is_ok());
    assert!(def.validate_row(&row![1, -1]).is_ok());
    assert!(def.validate_row(&row![1, 0]).is_err());
    assert!(def.validate_row(&row![1, 2]).is_err());
}

#[test]
fn partition_of_int_div_floors_negative_values() {
    let def = events().with_partition(PartitionBy::IntDiv {
        column: "ts".into(),
        width: 100,
    });
    assert_eq!(def.partition_of(&row![1, 250, "/", 0]).unwrap(), "2");
    assert_eq!(def.partition_of(&row![1, -1, "/", 0]).unwrap(), "-1");
}

#[test]
fn partition_of_string_column_is_path_safe() {
    let def = events().with_partition(PartitionBy::Column("path".into()));
    assert_eq!(def.partition_of(&row![1, 1, "a/b c", 0]).unwrap(), "a%2Fb%20c");
    assert_eq!(def.partition_of(&row![1, 1, "", 0]).unwrap(), "%");
}

#[test]
fn single_partition_is_all() {
    assert_eq!(events().partition_of(&row![1, 1, "/", 0]).unwrap(), "all");
}

#[test]
fn alter_may_change_transform_but_not_key() {
    let def = events();
    let summed = events().with_transform(Transform::Sum {
        columns: vec!["hits".into()],
    });
    assert!(def.check_alter(&summed).is_ok());

    let rekeyed = events().with_sort_key(&["ts"]);
    assert!(def.check_alter(&rekeyed).is_err());
}

#[test]
fn has_replica_defaults_to_everyone() {
    let def = events();
    assert!(def.has_replica("r9"));
    let def = def.with_replicas(&["r1", "r2"]);
    assert!(def.has_replica("r1"));
    assert!(!def.has_replica("r3"));
}

// -------------------- Sort key --------------------

#[test]
fn sort_is_stable_for_equal_keys() {
    let key = events().sort_key().unwrap();
    let mut rows = vec![
        row![2, 1, "b", 0],
        row![1, 5, "first", 0],
        row![1, 5, "second", 0],
        row![1, 3, "c", 0],
    ];
    key.sort(&mut rows);
    assert!(key.is_sorted(&rows));
    assert_eq!(rows[0][2], Value::from("c"));
    assert_eq!(rows[1][2], Value::from("first"));
    assert_eq!(rows[2][2], Value::from("second"));
    assert_eq!(key.extract(&rows[3]), vec![Value::Int(2), Value::Int(1)]);
}

#[test]
fn is_sorted_detects_disorder() {
    let key = events().sort_key().unwrap();
    assert!(!key.is_sorted(&[row![2, 0, "", 0], row![1, 0, "", 0]]));
    assert!(key.is_sorted(&[row![1, 0, "", 0], row![1, 0, "", 0]]));
}

// -------------------- Key ranges --------------------

#[test]
fn prefix_range_matches_leading_columns() {
    let r = KeyRange::prefix(vec![Value::Int(3)]);
    assert!(r.contains(&[Value::Int(3), Value::Int(-100)]));
    assert!(r.contains(&[Value::Int(3), Value::Int(100)]));
    assert!(r.before_start(&[Value::Int(2), Value::Int(100)]));
    assert!(r.after_end(&[Value::Int(4), Value::Int(0)]));
}

#[test]
fn excluded_bounds() {
    let r = KeyRange {
        start: Bound::Excluded(vec![Value::Int(1)]),
        end: Bound::Excluded(vec![Value::Int(5)]),
    };
    assert!(r.before_start(&[Value::Int(1)]));
    assert!(r.contains(&[Value::Int(2)]));
    assert!(r.after_end(&[Value::Int(5)]));
    assert!(KeyRange::all().contains(&[Value::from("anything")]));
}

// -------------------- Codec --------------------

#[test]
fn table_def_survives_encoding() {
    let def = events()
        .with_partition(PartitionBy::IntDiv {
            column: "ts".into(),
            width: 86_400,
        })
        .with_transform(Transform::Sum {
            columns: vec!["hits".into()],
        })
        .with_granule_rows(16)
        .with_replicas(&["r1", "r2"]);
    let bytes = codec::encode_table_def(&def).unwrap();
    assert_eq!(codec::decode_table_def(&bytes).unwrap(), def);
}

#[test]
fn decode_rejects_truncated_definition() {
    let bytes = codec::encode_table_def(&events()).unwrap();
    assert!(codec::decode_table_def(&bytes[..bytes.len() - 3]).is_err());
    assert!(codec::decode_table_def(b"nope").is_err());
}

#[test]
fn read_value_rejects_unknown_tag() {
    let bytes = [9u8, 0, 0];
    assert!(codec::read_value(&mut &bytes[..]).is_err());
}
