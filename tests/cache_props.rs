use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use arbiter::{
    Context, Controller, InMemoryStore, PatchOp, Path, PolicyManager, QueryRequest, Store,
    TransactionParams,
};

#[derive(Debug, Clone)]
enum Step {
    Prepare,
    Query,
    Commit(i64),
    Revision(u8),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Prepare),
        Just(Step::Query),
        (-1000i64..1000).prop_map(Step::Commit),
        any::<u8>().prop_map(Step::Revision),
    ]
}

const QUERY: &str = "x = data.limits.max";

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn queries_always_observe_the_last_commit(steps in prop::collection::vec(step_strategy(), 1..40)) {
        let ctx = Context::background();
        let store = Arc::new(InMemoryStore::from_value(json!({"limits": {"max": 0}})));
        let controller = Controller::builder()
            .with_store(store.clone())
            .with_manager(Arc::new(PolicyManager::new()))
            .build()
            .unwrap();
        controller.init(&ctx).unwrap();

        let mut expected = 0i64;
        let mut revision = String::new();
        for step in steps {
            match step {
                Step::Prepare => {
                    controller.prepare(&ctx, QUERY).unwrap();
                    prop_assert!(controller.cached_partial(QUERY).is_some());
                }
                Step::Query => {
                    let response = controller
                        .exec_query(&ctx, &QueryRequest::new(QUERY))
                        .into_result()
                        .unwrap();
                    prop_assert_eq!(&response.results[0].bindings["x"], &json!(expected));
                }
                Step::Commit(v) => {
                    let mut txn = store.new_transaction(&ctx, TransactionParams::WRITE).unwrap();
                    store
                        .write(&ctx, &mut txn, PatchOp::Replace, &Path::parse("/limits/max").unwrap(), Some(json!(v)))
                        .unwrap();
                    store.commit(&ctx, txn).unwrap();
                    expected = v;
                    prop_assert!(controller.cached_partial(QUERY).is_none());
                }
                Step::Revision(n) => {
                    revision = format!("r{n}");
                    let mut txn = store.new_transaction(&ctx, TransactionParams::WRITE).unwrap();
                    store
                        .write(
                            &ctx,
                            &mut txn,
                            PatchOp::Add,
                            &Path::parse("/system/bundle/manifest/revision").unwrap(),
                            Some(json!(revision.clone())),
                        )
                        .unwrap();
                    store.commit(&ctx, txn).unwrap();
                    prop_assert!(controller.cached_partial(QUERY).is_none());
                }
            }
            prop_assert_eq!(controller.revision(), revision.clone());
        }
    }
}
