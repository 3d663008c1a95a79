//! Process-wide configuration seen by new query sets.

use std::sync::Arc;

use mailquery::{QueryConfig, QuerySet};
use mailquery_test::{inbox, numbered_messages, FakeMailbox};
use serial_test::serial;

fn reset() {
    QueryConfig::set_global(QueryConfig::default());
}

#[test]
#[serial]
fn new_query_sets_snapshot_the_global_page_size() {
    let config = QueryConfig::from_yaml_str("page_size: 7\n").unwrap();
    QueryConfig::set_global(config);

    let mailbox = Arc::new(FakeMailbox::new(numbered_messages(20)));
    let qs = QuerySet::new(Arc::clone(&mailbox), inbox());
    reset();

    assert_eq!(qs.config().page_size, 7);
    assert_eq!(qs.to_vec().unwrap().len(), 20);
    assert_eq!(mailbox.find_page_sizes(), vec![7, 7, 7]);
}

#[test]
#[serial]
fn per_query_page_size_overrides_the_global() {
    QueryConfig::set_global(QueryConfig {
        page_size: 3,
        ..QueryConfig::default()
    });
    let mailbox = Arc::new(FakeMailbox::new(numbered_messages(10)));
    let qs = QuerySet::new(Arc::clone(&mailbox), inbox())
        .page_size(5)
        .unwrap();
    reset();

    qs.to_vec().unwrap();
    assert_eq!(mailbox.find_page_sizes(), vec![5, 5]);
}

#[test]
#[serial]
fn bulk_chunk_size_comes_from_config() {
    QueryConfig::set_global(
        QueryConfig::from_json_str(r#"{"bulk_chunk_size": 2, "count_page_size": 4}"#).unwrap(),
    );
    let mailbox = Arc::new(FakeMailbox::new(numbered_messages(5)));
    let qs = QuerySet::new(Arc::clone(&mailbox), inbox());
    reset();

    let outcomes = qs.delete().unwrap();
    assert_eq!(outcomes.len(), 5);
    let deletes: Vec<usize> = mailbox
        .calls()
        .iter()
        .filter_map(|c| match c {
            mailquery_test::Call::Delete { ids } => Some(ids.len()),
            _ => None,
        })
        .collect();
    assert_eq!(deletes, vec![2, 2, 1]);
    assert!(mailbox.ids().is_empty());
}
