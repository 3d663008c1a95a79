//! End-to-end query set behaviour against the fake backend.

use std::sync::Arc;

use mailquery::{
    and_of, delete_items, or_of, q, Capabilities, Expr, FieldDef, FieldKind, FolderId, Item,
    ItemError, ItemId, Projection, QueryError, QuerySet, RawRecord, SchemaTable, TransportError,
    Value,
};
use mailquery_test::{
    at_minute, contact, event, inbox, message, numbered_messages, ranked_messages, Call,
    FakeMailbox,
};

fn setup(mailbox: FakeMailbox) -> (Arc<FakeMailbox>, QuerySet<FakeMailbox>) {
    let mailbox = Arc::new(mailbox);
    let qs = QuerySet::new(Arc::clone(&mailbox), inbox());
    (mailbox, qs)
}

fn ids(items: &[Item]) -> Vec<String> {
    items.iter().map(|i| i.id().id.clone()).collect()
}

// ============================================================================
// Chaining
// ============================================================================

#[test]
fn chained_filters_equal_a_conjunction() {
    let (_, qs) = setup(FakeMailbox::new(numbered_messages(30)));
    let big = q!(size__gte = 100i64).unwrap();
    let read = q!(is_read = true).unwrap();

    let chained = qs.filter(big.clone()).unwrap().filter(read.clone()).unwrap();
    let combined = qs.filter(and_of([big, read])).unwrap();

    let a = ids(&chained.to_vec().unwrap());
    let b = ids(&combined.to_vec().unwrap());
    assert_eq!(a, b);
    assert_eq!(a.first().map(String::as_str), Some("m010"));
    assert_eq!(a.len(), 10);
}

#[test]
fn repeated_filter_is_idempotent() {
    let (_, qs) = setup(FakeMailbox::new(numbered_messages(10)));
    let once = qs.filter(q!(subject = "message 003").unwrap()).unwrap();
    let twice = once.filter(q!(subject = "message 003").unwrap()).unwrap();

    assert_eq!(once.filter_expr(), twice.filter_expr());
    assert_eq!(ids(&once.to_vec().unwrap()), ids(&twice.to_vec().unwrap()));
}

#[test]
fn chaining_makes_no_calls() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(5)));
    let _derived = qs
        .filter(q!(is_read = false).unwrap())
        .unwrap()
        .exclude(q!(size__lt = 10i64).unwrap())
        .unwrap()
        .order_by(&["-datetime_received"])
        .unwrap()
        .only(&["subject"])
        .unwrap()
        .page_size(2)
        .unwrap();
    assert_eq!(mailbox.call_count(), 0);
}

#[test]
fn invalid_lookup_is_rejected_before_any_call() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(5)));
    let err = qs.filter(q!(subject__gt = 5i64).unwrap()).unwrap_err();
    assert!(matches!(err, QueryError::InvalidLookup { .. }), "{err}");
    assert!(err.is_construction_error());

    let err = qs.filter(q!(no_such_field = 1i64).unwrap()).unwrap_err();
    assert!(matches!(err, QueryError::InvalidField { .. }), "{err}");

    let err = qs.order_by(&["-bogus"]).unwrap_err();
    assert!(matches!(err, QueryError::InvalidField { .. }));
    assert_eq!(mailbox.call_count(), 0);
}

#[test]
fn exclude_negates() {
    let (_, qs) = setup(FakeMailbox::new(numbered_messages(6)));
    let unread = qs.exclude(q!(is_read = true).unwrap()).unwrap();
    assert_eq!(ids(&unread.to_vec().unwrap()), vec!["m001", "m003", "m005"]);
}

#[test]
fn reverse_needs_an_ordering() {
    let (_, qs) = setup(FakeMailbox::new(numbered_messages(3)));
    assert!(matches!(qs.reverse(), Err(QueryError::InvalidArgument(_))));

    let newest_first = qs.order_by(&["datetime_received"]).unwrap().reverse().unwrap();
    assert_eq!(ids(&newest_first.to_vec().unwrap()), vec!["m002", "m001", "m000"]);
}

#[test]
fn zero_page_size_is_rejected() {
    let (_, qs) = setup(FakeMailbox::new(Vec::new()));
    assert!(matches!(qs.page_size(0), Err(QueryError::InvalidArgument(_))));
}

#[test]
fn display_names_filter_and_folders() {
    let (_, qs) = setup(FakeMailbox::new(Vec::new()));
    let qs = qs.filter(q!(subject = "x").unwrap()).unwrap();
    assert_eq!(qs.to_string(), "QuerySet(q=subject == 'x', folders=[inbox])");
}

// ============================================================================
// Caching
// ============================================================================

#[test]
fn iterator_never_caches_but_iter_does() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(5)));

    let first: Vec<Item> = qs.iterator().collect::<Result<_, _>>().unwrap();
    let second: Vec<Item> = qs.iterator().collect::<Result<_, _>>().unwrap();
    assert_eq!(first, second);
    assert_eq!(mailbox.find_count(), 2);
    assert!(!qs.is_cached());

    mailbox.clear_calls();
    let third: Vec<Item> = qs.iter().collect::<Result<_, _>>().unwrap();
    let fourth: Vec<Item> = qs.iter().collect::<Result<_, _>>().unwrap();
    assert_eq!(third, fourth);
    assert_eq!(third, first);
    assert_eq!(mailbox.find_count(), 1);
    assert!(qs.is_cached());
}

#[test]
fn iterator_ignores_a_populated_cache() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(3)));
    qs.to_vec().unwrap();
    mailbox.clear_calls();
    assert_eq!(qs.iterator().count(), 3);
    assert_eq!(mailbox.find_count(), 1);
}

#[test]
fn cached_length_matches_count() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(42)));
    let all = qs.to_vec().unwrap();
    mailbox.clear_calls();
    assert_eq!(qs.count().unwrap(), all.len());
    assert!(qs.exists().unwrap());
    assert_eq!(mailbox.call_count(), 0);
}

#[test]
fn partial_iteration_does_not_cache() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(5)));
    let first = qs.iter().next().unwrap().unwrap();
    assert_eq!(first.id().id, "m000");
    assert!(!qs.is_cached());

    qs.to_vec().unwrap();
    assert!(qs.is_cached());
    assert_eq!(mailbox.find_count(), 2);
}

#[test]
fn clones_start_uncached() {
    let (_, qs) = setup(FakeMailbox::new(numbered_messages(2)));
    qs.to_vec().unwrap();
    assert!(qs.is_cached());
    assert!(!qs.clone().is_cached());
    assert!(!qs.all().is_cached());
}

#[test]
fn transport_failure_leaves_query_reusable() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(3)));
    mailbox.fail_next(TransportError::ServerBusy {
        retry_after_secs: Some(5),
    });

    let mut rows = qs.iter();
    let err = rows.next().unwrap().unwrap_err();
    assert!(matches!(
        err,
        QueryError::Transport(TransportError::ServerBusy { .. })
    ));
    assert!(rows.next().is_none());
    drop(rows);
    assert!(!qs.is_cached());

    assert_eq!(qs.to_vec().unwrap().len(), 3);
    assert!(qs.is_cached());
}

#[test]
fn unknown_folder_is_a_transport_error() {
    let mailbox = Arc::new(FakeMailbox::new(numbered_messages(1)));
    let qs = QuerySet::new(mailbox, mailquery::Collection::folder("archive"));
    let err = qs.count().unwrap_err();
    assert!(matches!(
        err,
        QueryError::Transport(TransportError::InvalidCollection(_))
    ));
}

// ============================================================================
// Paging and counting
// ============================================================================

#[test]
fn count_and_list_over_two_hundred_fifty_records() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(250)));
    let normal = qs.filter(q!(importance = "Normal").unwrap()).unwrap();

    assert_eq!(normal.count().unwrap(), 250);
    assert_eq!(mailbox.calls(), vec![Call::Count]);

    mailbox.clear_calls();
    let all = normal.to_vec().unwrap();
    assert_eq!(all.len(), 250);
    assert_eq!(mailbox.find_count(), 3);
    let offsets: Vec<usize> = mailbox
        .calls()
        .iter()
        .filter_map(|c| match c {
            Call::Find { offset, restricted, .. } => {
                assert!(*restricted);
                Some(*offset)
            }
            _ => None,
        })
        .collect();
    assert_eq!(offsets, vec![0, 100, 200]);

    let got = ids(&all);
    let mut sorted = got.clone();
    sorted.sort();
    assert_eq!(got, sorted);
}

#[test]
fn unsatisfiable_filters_never_call_the_service() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(5)));
    let excluded = qs.exclude(Expr::all()).unwrap();
    assert!(excluded.to_vec().unwrap().is_empty());
    assert_eq!(excluded.to_string(), "QuerySet(q=NONE, folders=[inbox])");

    let empty_or = qs.filter(or_of(Vec::new())).unwrap();
    assert_eq!(empty_or.count().unwrap(), 0);
    assert!(!empty_or.exists().unwrap());
    assert_eq!(mailbox.call_count(), 0);
}

#[test]
fn none_never_calls_the_service() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(5)));
    let empty = qs.none();
    assert!(empty.to_vec().unwrap().is_empty());
    assert_eq!(empty.count().unwrap(), 0);
    assert!(!empty.exists().unwrap());
    assert!(empty.slice(..3).unwrap().is_empty());
    assert_eq!(mailbox.call_count(), 0);
}

#[test]
fn exists_asks_for_one_record() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(50)));
    assert!(qs.filter(q!(is_read = true).unwrap()).unwrap().exists().unwrap());
    assert_eq!(mailbox.find_page_sizes(), vec![1]);
    assert!(matches!(
        &mailbox.calls()[0],
        Call::Find { projection: Projection::IdOnly, .. }
    ));

    assert!(!qs.filter(q!(size__gt = 10_000i64).unwrap()).unwrap().exists().unwrap());
}

// ============================================================================
// Indexing and slicing
// ============================================================================

#[test]
fn index_matches_list_position() {
    let (_, qs) = setup(FakeMailbox::new(numbered_messages(12)));
    let ordered = qs.order_by(&["-size"]).unwrap();
    let all = ordered.to_vec().unwrap();

    for i in [0usize, 1, 5, 11] {
        let fresh = ordered.all();
        assert_eq!(fresh.at(i as isize).unwrap(), all[i]);
    }
}

#[test]
fn index_out_of_range() {
    let (_, qs) = setup(FakeMailbox::new(numbered_messages(3)));
    let err = qs.at(7).unwrap_err();
    assert!(matches!(err, QueryError::IndexOutOfRange { index: 7, len: 3 }));
    let err = qs.at(-4).unwrap_err();
    assert!(matches!(err, QueryError::IndexOutOfRange { index: -4, len: 3 }));
}

#[test]
fn negative_index_counts_first() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(250)));
    let last = qs.at(-1).unwrap();
    assert_eq!(last.id().id, "m249");
    let calls = mailbox.calls();
    assert_eq!(calls[0], Call::Count);
    assert!(matches!(calls[1], Call::Find { offset: 249, page_size: 1, .. }));
    assert_eq!(
        calls[2],
        Call::Fetch {
            ids: vec!["m249".into()]
        }
    );
    assert_eq!(calls.len(), 3);
}

#[test]
fn leading_slice_is_page_bounded() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(250)));
    let newest = qs.order_by(&["-datetime_received"]).unwrap();

    let top = newest.slice(..5).unwrap();
    assert_eq!(ids(&top), vec!["m249", "m248", "m247", "m246", "m245"]);
    assert_eq!(mailbox.find_page_sizes(), vec![5]);

    mailbox.clear_calls();
    let window = newest.page_size(8).unwrap().slice(10..30).unwrap();
    assert_eq!(window.len(), 20);
    assert_eq!(window[0].id().id, "m239");
    assert_eq!(mailbox.find_page_sizes(), vec![8, 8, 4]);
}

#[test]
fn empty_slice_makes_no_calls() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(10)));
    assert!(qs.slice(4..4).unwrap().is_empty());
    assert!(qs.slice(6..2).unwrap().is_empty());
    assert_eq!(mailbox.call_count(), 0);
}

#[test]
fn negative_slice_bounds() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(20)));
    let tail = qs.slice(-3..).unwrap();
    assert_eq!(ids(&tail), vec!["m017", "m018", "m019"]);
    assert_eq!(mailbox.calls()[0], Call::Count);
    assert!(matches!(mailbox.calls()[1], Call::Find { offset: 17, .. }));
}

#[test]
fn stepped_slice_materializes_everything() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(7)));
    let evens = qs.slice(mailquery::Slice::from(..).with_step(2)).unwrap();
    assert_eq!(ids(&evens), vec!["m000", "m002", "m004", "m006"]);
    assert!(qs.is_cached());

    let backwards = qs.slice(mailquery::Slice::from(..3).with_step(-1)).unwrap();
    assert_eq!(ids(&backwards), vec!["m006", "m005", "m004"]);
    assert_eq!(mailbox.find_count(), 1);

    let err = qs.slice(mailquery::Slice::from(..).with_step(0)).unwrap_err();
    assert!(matches!(err, QueryError::InvalidArgument(_)));
}

// ============================================================================
// get()
// ============================================================================

#[test]
fn get_requires_exactly_one_match() {
    let (_, qs) = setup(FakeMailbox::new(numbered_messages(4)));

    let found = qs.get(q!(subject = "message 002").unwrap()).unwrap();
    assert_eq!(found.id().id, "m002");
    assert_eq!(found.subject(), Some("message 002"));

    let err = qs.get(q!(subject = "unique").unwrap()).unwrap_err();
    assert!(matches!(err, QueryError::DoesNotExist));

    let err = qs.get(q!(is_read = true).unwrap()).unwrap_err();
    assert!(matches!(err, QueryError::MultipleObjectsReturned { count: 2 }));
}

#[test]
fn get_without_lookups_reuses_the_cache() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(4)));
    let one = qs.filter(q!(subject = "message 002").unwrap()).unwrap();
    one.to_vec().unwrap();
    mailbox.clear_calls();
    assert_eq!(one.get(Expr::all()).unwrap().id().id, "m002");
    assert_eq!(mailbox.call_count(), 0);

    qs.to_vec().unwrap();
    mailbox.clear_calls();
    assert!(matches!(
        qs.get(Expr::all()),
        Err(QueryError::MultipleObjectsReturned { count: 4 })
    ));
    assert_eq!(mailbox.call_count(), 0);

    // A lookup always runs a fresh query.
    assert_eq!(qs.get(q!(size = 30i64).unwrap()).unwrap().id().id, "m003");
    assert_eq!(mailbox.find_count(), 1);
}

#[test]
fn get_by_id_fetches_one_record() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(3)));
    let item = qs.get_by_id(&ItemId::new("m001")).unwrap();
    let msg = item.as_message().unwrap();
    assert_eq!(msg.body(), Some("body of message 1"));
    assert_eq!(
        mailbox.calls(),
        vec![Call::Fetch {
            ids: vec!["m001".into()]
        }]
    );

    let err = qs.get_by_id(&ItemId::new("m404")).unwrap_err();
    assert!(matches!(
        err,
        QueryError::Item {
            source: ItemError::NotFound { .. },
            ..
        }
    ));
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn multi_field_order_sorts_on_the_client() {
    let records = ranked_messages(&[
        ("a", "High", 5),
        ("b", "Low", 1),
        ("c", "High", 2),
        ("d", "Low", 9),
        ("e", "Normal", 3),
    ]);
    let (mailbox, qs) = setup(FakeMailbox::new(records));
    let ordered = qs.order_by(&["importance", "size"]).unwrap().page_size(2).unwrap();

    let top = ordered.slice(..2).unwrap();
    assert_eq!(ids(&top), vec!["c", "a"]);
    // Every page is fetched even though only two results are wanted.
    assert_eq!(mailbox.find_page_sizes(), vec![2, 2, 2]);
    for call in mailbox.calls() {
        if let Call::Find { order, .. } = call {
            assert!(order.is_empty());
        }
    }

    let all = ordered.to_vec().unwrap();
    assert_eq!(ids(&all), vec!["c", "a", "b", "d", "e"]);
}

#[test]
fn multi_field_order_uses_the_server_when_it_can() {
    let records = ranked_messages(&[("a", "High", 5), ("b", "Low", 1), ("c", "High", 2)]);
    let caps = Capabilities {
        max_sort_fields: 2,
        ..Capabilities::default()
    };
    let (mailbox, qs) = setup(FakeMailbox::new(records).with_capabilities(caps));
    let ordered = qs.order_by(&["-size", "importance"]).unwrap();
    assert_eq!(ids(&ordered.slice(..1).unwrap()), vec!["a"]);
    assert_eq!(mailbox.find_page_sizes(), vec![1]);
}

// ============================================================================
// Residual filtering
// ============================================================================

#[test]
fn client_only_fields_filter_after_fetch() {
    let records: Vec<_> = numbered_messages(10)
        .into_iter()
        .enumerate()
        .map(|(i, r)| {
            let editor = if i % 4 == 0 { "alice" } else { "bob" };
            r.with_field("last_modified_name", serde_json::json!(editor))
        })
        .collect();
    let (mailbox, qs) = setup(FakeMailbox::new(records));
    let by_alice = qs.filter(q!(last_modified_name = "alice").unwrap()).unwrap();

    assert_eq!(ids(&by_alice.to_vec().unwrap()), vec!["m000", "m004", "m008"]);
    assert!(matches!(mailbox.calls()[0], Call::Find { restricted: false, .. }));

    mailbox.clear_calls();
    assert_eq!(by_alice.all().count().unwrap(), 3);
    assert!(!mailbox.calls().contains(&Call::Count));

    let second = by_alice.all().at(1).unwrap();
    assert_eq!(second.id().id, "m004");
}

#[test]
fn case_insensitive_match_falls_back_to_client() {
    let caps = Capabilities {
        case_insensitive_match: false,
        ..Capabilities::default()
    };
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(12)).with_capabilities(caps));
    let hits = qs
        .filter(q!(subject__icontains = "MESSAGE 01").unwrap())
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(ids(&hits), vec!["m010", "m011"]);
    assert!(matches!(mailbox.calls()[0], Call::Find { restricted: false, .. }));
}

#[test]
fn residual_on_a_complex_field_fetches_by_id() {
    let caps = Capabilities {
        case_insensitive_match: false,
        ..Capabilities::default()
    };
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(5)).with_capabilities(caps));
    let hits = qs
        .filter(q!(body__icontains = "BODY OF MESSAGE 3").unwrap())
        .unwrap();

    assert_eq!(ids(&hits.to_vec().unwrap()), vec!["m003"]);
    assert!(matches!(
        mailbox.calls()[0],
        Call::Find {
            restricted: false,
            projection: Projection::IdOnly,
            ..
        }
    ));
    assert_eq!(hits.all().count().unwrap(), 1);

    let subjects = hits.only(&["subject"]).unwrap().to_vec().unwrap();
    assert_eq!(ids(&subjects), vec!["m003"]);
    assert!(!subjects[0].fields().contains_key("body"));
}

#[test]
fn unsearchable_field_is_unsupported() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(3)));
    let qs = qs.filter(q!(status = "Completed").unwrap()).unwrap();
    let err = qs.count().unwrap_err();
    assert!(matches!(err, QueryError::UnsupportedFilter { .. }));
    assert_eq!(mailbox.call_count(), 0);
}

#[test]
fn query_strings_pass_through() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(30)));
    let hits = qs.filter_query_string("message 00").unwrap();
    assert_eq!(hits.count().unwrap(), 10);
    assert_eq!(mailbox.calls(), vec![Call::Count]);

    let err = hits.filter(q!(is_read = true).unwrap()).unwrap_err();
    assert!(matches!(err, QueryError::InvalidArgument(_)));
}

// ============================================================================
// Projections and shapes
// ============================================================================

#[test]
fn complex_fields_use_two_phase_fetch() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(5)));
    let bodies = qs.only(&["subject", "body"]).unwrap().page_size(2).unwrap();
    let items = bodies.to_vec().unwrap();

    assert_eq!(items.len(), 5);
    let msg = items[3].as_message().unwrap();
    assert_eq!(msg.body(), Some("body of message 3"));
    assert_eq!(msg.size(), None);

    let calls = mailbox.calls();
    assert!(matches!(calls[0], Call::Find { projection: Projection::IdOnly, .. }));
    assert_eq!(
        calls[1],
        Call::Fetch {
            ids: vec!["m000".into(), "m001".into()]
        }
    );
    assert_eq!(calls.iter().filter(|c| matches!(c, Call::Fetch { .. })).count(), 3);
}

#[test]
fn default_projection_fetches_complex_fields_by_id() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(3)));
    let items = qs.to_vec().unwrap();

    let msg = items[1].as_message().unwrap();
    assert_eq!(msg.body(), Some("body of message 1"));
    assert_eq!(msg.size().map(|n| n.to_f64()), Some(10.0));

    let calls = mailbox.calls();
    assert!(matches!(calls[0], Call::Find { projection: Projection::IdOnly, .. }));
    assert_eq!(
        calls[1],
        Call::Fetch {
            ids: vec!["m000".into(), "m001".into(), "m002".into()]
        }
    );
    assert_eq!(calls.len(), 2);
}

#[test]
fn schema_without_complex_fields_searches_once_per_page() {
    let schema = SchemaTable::new()
        .with_field(FieldDef::new("subject", "item:Subject", FieldKind::String))
        .with_item_type("Message", &["subject"]);
    let records = vec![message("a", "first"), message("b", "second")];
    let mailbox = Arc::new(FakeMailbox::new(records).with_schema(schema.clone()));
    let qs = QuerySet::with_schema(Arc::clone(&mailbox), Arc::new(schema), inbox());

    let items = qs.to_vec().unwrap();
    assert_eq!(items[1].subject(), Some("second"));
    assert_eq!(mailbox.calls().len(), 1);
    assert!(matches!(
        mailbox.calls()[0],
        Call::Find {
            projection: Projection::AllFields,
            ..
        }
    ));
}

#[test]
fn fetch_errors_surface_per_item() {
    let records = vec![message("ok1", "a"), message("!bad", "b"), message("ok2", "c")];
    let (_, qs) = setup(FakeMailbox::new(records));
    let with_body = qs.only(&["subject", "body"]).unwrap();

    let rows: Vec<_> = with_body.iter().collect();
    assert_eq!(rows.len(), 3);
    assert!(rows[0].is_ok());
    assert!(matches!(
        rows[1],
        Err(QueryError::Item {
            source: ItemError::InvalidId { .. },
            ..
        })
    ));
    assert!(rows[2].is_ok());
    assert!(!with_body.is_cached());
}

#[test]
fn only_strips_fields_fetched_for_sorting() {
    let records = ranked_messages(&[("a", "High", 5), ("b", "Low", 1), ("c", "High", 2)]);
    let (_, qs) = setup(FakeMailbox::new(records));
    let items = qs
        .only(&["subject"])
        .unwrap()
        .order_by(&["importance", "-size"])
        .unwrap()
        .to_vec()
        .unwrap();

    assert_eq!(ids(&items), vec!["a", "c", "b"]);
    let fields = items[0].fields();
    assert!(fields.contains_key("subject"));
    assert!(!fields.contains_key("importance"));
    assert!(!fields.contains_key("size"));
}

#[test]
fn value_shapes() {
    let (_, qs) = setup(FakeMailbox::new(numbered_messages(3)));

    let rows = qs.values(&["subject", "size"]).unwrap().to_vec().unwrap();
    assert_eq!(rows[1]["subject"], Value::from("message 001"));
    assert_eq!(rows[1]["size"], Value::from(10i64));

    let tuples = qs.values_list(&["size", "is_read"]).unwrap().to_vec().unwrap();
    assert_eq!(tuples[2], vec![Value::from(20i64), Value::Bool(true)]);

    let flat = qs.values_list_flat(&["subject"]).unwrap();
    assert_eq!(flat.at(0).unwrap(), Value::from("message 000"));
    assert!(matches!(
        qs.values_list_flat(&["subject", "size"]),
        Err(QueryError::InvalidArgument(_))
    ));

    let missing = qs.values(&["location"]).unwrap().to_vec().unwrap();
    assert_eq!(missing[0]["location"], Value::None);
}

#[test]
fn indexed_and_nested_lookups() {
    let records = vec![
        contact("c1", "Ada", "555-0100", "London"),
        contact("c2", "Grace", "555-0199", "Arlington"),
    ];
    let (_, qs) = setup(FakeMailbox::new(records));

    let ada = qs.get(q!("phone_numbers.MobilePhone" = "555-0100").unwrap()).unwrap();
    assert_eq!(ada.id().id, "c1");
    assert_eq!(ada.type_name(), "Contact");

    let grace = qs
        .get(q!("physical_addresses.Home.city__startswith" = "Arl").unwrap())
        .unwrap();
    assert_eq!(grace.id().id, "c2");

    let err = qs.filter(q!(phone_numbers = "555-0100").unwrap()).unwrap_err();
    assert!(matches!(err, QueryError::InvalidLookup { .. }));
}

#[test]
fn list_fields_take_contains_and_in() {
    let (_, qs) = setup(FakeMailbox::new(numbered_messages(7)));
    let work = qs
        .filter(Expr::lookup("categories__contains", vec!["work"]).unwrap())
        .unwrap();
    assert_eq!(ids(&work.to_vec().unwrap()), vec!["m000", "m003", "m006"]);

    let err = qs.filter(q!(categories = "work").unwrap()).unwrap_err();
    assert!(matches!(err, QueryError::InvalidLookup { .. }));

    let uncategorized = qs.filter(q!(categories__exists = false).unwrap()).unwrap();
    assert_eq!(uncategorized.count().unwrap(), 4);
}

// ============================================================================
// Calendar views
// ============================================================================

fn calendar() -> Vec<RawRecord> {
    vec![
        event("e1", "standup", 60, 75),
        event("e2", "lunch", 180, 240),
        event("e3", "review", 30, 60),
        event("e4", "offsite", 600, 900),
        event("e5", "planning", 90, 120),
    ]
}

#[test]
fn calendar_view_keeps_overlapping_items_and_sorts_on_the_client() {
    let (mailbox, qs) = setup(FakeMailbox::new(calendar()));
    let day = qs
        .view(at_minute(60), at_minute(300))
        .unwrap()
        .order_by(&["-start"])
        .unwrap();

    // e3 ends exactly when the view starts and is still included.
    assert_eq!(ids(&day.to_vec().unwrap()), vec!["e2", "e5", "e1", "e3"]);
    assert!(mailbox.find_count() > 0);
    for call in mailbox.calls() {
        if let Call::Find { order, .. } = call {
            assert!(order.is_empty());
        }
    }
    assert_eq!(day.at(0).unwrap().id().id, "e2");
}

#[test]
fn filters_inside_a_calendar_view_run_on_the_client() {
    let (mailbox, qs) = setup(FakeMailbox::new(calendar()));
    let day = qs.view(at_minute(60), at_minute(300)).unwrap();
    let lunch = day.filter(q!(subject__startswith = "l").unwrap()).unwrap();

    assert_eq!(ids(&lunch.to_vec().unwrap()), vec!["e2"]);
    assert!(matches!(mailbox.calls()[0], Call::Find { restricted: false, .. }));

    mailbox.clear_calls();
    assert_eq!(day.count().unwrap(), 4);
    assert!(!mailbox.calls().contains(&Call::Count));
}

#[test]
fn calendar_view_arguments_are_checked() {
    let (mailbox, qs) = setup(FakeMailbox::new(calendar()));
    assert!(matches!(
        qs.view(at_minute(10), at_minute(5)),
        Err(QueryError::InvalidArgument(_))
    ));

    let day = qs.view(at_minute(0), at_minute(60)).unwrap();
    assert!(day.calendar_view().is_some());
    assert!(matches!(
        day.filter_query_string("lunch"),
        Err(QueryError::InvalidArgument(_))
    ));

    let searched = qs.filter_query_string("lunch").unwrap();
    assert!(matches!(
        searched.view(at_minute(0), at_minute(60)),
        Err(QueryError::InvalidArgument(_))
    ));
    assert_eq!(mailbox.call_count(), 0);
}

// ============================================================================
// Bulk operations
// ============================================================================

#[test]
fn bulk_delete_reports_per_item_outcomes() {
    let mailbox = FakeMailbox::new(numbered_messages(5));
    let targets: Vec<ItemId> = ["m000", "m001", "m404", "m003", "m004"]
        .into_iter()
        .map(ItemId::new)
        .collect();

    let outcomes = delete_items(&mailbox, &targets, 100).unwrap();
    assert_eq!(outcomes.len(), 5);
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 4);
    assert_eq!(
        outcomes[2],
        Err(ItemError::NotFound {
            id: "m404".into()
        })
    );
    assert_eq!(mailbox.ids(), vec!["m002"]);
}

#[test]
fn queryset_delete_removes_matches_and_clears_cache() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(6)));
    let read = qs.filter(q!(is_read = true).unwrap()).unwrap();
    assert_eq!(read.to_vec().unwrap().len(), 3);

    let outcomes = read.delete().unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(Result::is_ok));
    assert!(!read.is_cached());
    assert_eq!(mailbox.ids(), vec!["m001", "m003", "m005"]);
    assert_eq!(read.count().unwrap(), 0);
}

#[test]
fn queryset_move_returns_new_ids() {
    let (mailbox, qs) = setup(FakeMailbox::new(numbered_messages(4)));
    let outcomes = qs
        .filter(q!(size__gte = 20i64).unwrap())
        .unwrap()
        .move_to(&FolderId::new("archive"))
        .unwrap();
    let moved: Vec<String> = outcomes.into_iter().map(|o| o.unwrap().id).collect();
    assert_eq!(moved, vec!["m002@archive", "m003@archive"]);
    assert_eq!(mailbox.ids(), vec!["m000", "m001"]);
    assert!(mailbox.calls().contains(&Call::Move {
        ids: vec!["m002".into(), "m003".into()],
        to: "archive".into(),
    }));
}
