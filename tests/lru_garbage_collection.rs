use std::collections::HashSet;

use firestore_local::core::Query;
use firestore_local::local::{
    LruGarbageCollector, LruParams, MemoryPersistence, TargetData, User,
};
use firestore_local::model::{DocumentKey, Mutation, ResourcePath, Timestamp};
use firestore_local::value::MapValue;

fn target(path: &str) -> firestore_local::core::Target {
    Query::at_path(ResourcePath::from_string(path).unwrap()).to_target()
}

fn collector(persistence: &std::rc::Rc<MemoryPersistence>) -> LruGarbageCollector<MemoryPersistence> {
    LruGarbageCollector::new(std::rc::Rc::clone(persistence), LruParams::default())
}

#[test]
fn percentile_selects_the_nth_lowest_sequence_number() {
    let persistence = MemoryPersistence::new();
    let collector = collector(&persistence);

    persistence
        .run_transaction("seed targets", |txn| {
            let cache = persistence.target_cache();
            for (index, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
                let sequence_number = index as i64 + 1;
                cache.add_target_data(
                    txn,
                    TargetData::new(target(name), (index as i32 + 1) * 2, sequence_number),
                );
            }
            firestore_local::local::PersistencePromise::resolve(())
        })
        .unwrap();

    let count = persistence
        .run_transaction("count", |txn| collector.calculate_target_count(txn, 40))
        .unwrap();
    assert_eq!(count, 2);

    let upper_bound = persistence
        .run_transaction("nth", |txn| collector.nth_sequence_number(txn, count))
        .unwrap();
    assert_eq!(upper_bound, 2);

    let removed = persistence
        .run_transaction("remove", |txn| {
            persistence
                .target_cache()
                .remove_targets(txn, upper_bound, &HashSet::new())
        })
        .unwrap();
    assert_eq!(removed, 2);

    let remaining = persistence
        .run_transaction("remaining", |txn| persistence.target_cache().get_target_count(txn))
        .unwrap();
    assert_eq!(remaining, 3);
}

#[test]
fn disabled_collection_does_not_run() {
    let persistence = MemoryPersistence::new();
    let collector = LruGarbageCollector::new(
        std::rc::Rc::clone(&persistence),
        LruParams::disabled(),
    );
    let results = persistence
        .run_transaction("collect", |txn| collector.collect(txn, &HashSet::new()))
        .unwrap();
    assert!(!results.did_run);
}

#[test]
fn collection_skips_while_cache_is_small() {
    let persistence = MemoryPersistence::new();
    let collector = collector(&persistence);
    let results = persistence
        .run_transaction("collect", |txn| collector.collect(txn, &HashSet::new()))
        .unwrap();
    // Default threshold is 40 MB; an empty cache never reaches it.
    assert!(!results.did_run);
}

#[test]
fn documents_pinned_by_mutations_are_not_collected() {
    let persistence = MemoryPersistence::new();
    let key = DocumentKey::from_string("coll/pinned").unwrap();

    persistence
        .run_transaction("pin by mutation", |txn| {
            let queue = persistence.mutation_queue(&User::unauthenticated());
            queue
                .add_mutation_batch(
                    txn,
                    Timestamp::new(0, 0),
                    vec![Mutation::set(key.clone(), MapValue::empty())],
                )
                .map(|_| ())
        })
        .unwrap();

    let collector = LruGarbageCollector::new(
        std::rc::Rc::clone(&persistence),
        LruParams {
            cache_size_collection_threshold: 0,
            percentile_to_collect: 100,
            maximum_sequence_numbers_to_collect: 1000,
        },
    );
    let results = persistence
        .run_transaction("collect", |txn| collector.collect(txn, &HashSet::new()))
        .unwrap();
    assert!(results.did_run);
    assert_eq!(results.documents_removed, 0);
}
