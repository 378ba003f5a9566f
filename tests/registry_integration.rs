mod common;

use std::sync::Arc;

use common::{project_yaml, Fixture, MEMORY_BACKENDS};
use grox::backends::BackendFactory;
use grox::context;
use grox::project::{Project, ProjectKey};
use grox::registry::Registry;
use grox_core::error::classify;
use grox_core::retrieval::SearchOptions;
use grox_core::{GroxError, Metadata};

#[tokio::test]
async fn test_register_all_projects_isolates_failures() {
    let fx = Fixture::new();
    fx.support_project();
    fx.write(
        "broken.yaml",
        &project_yaml(
            "broken",
            "    vector:\n      backend: unsupported\n",
            &["faq.yaml"],
        ),
    );
    fx.write(
        "dup.yaml",
        "collections:\n  - name: faq\n    data:\n      - documents: [\"x\"]\n",
    );
    fx.write(
        "dupe.yaml",
        &project_yaml("dupe", MEMORY_BACKENDS, &["faq.yaml", "dup.yaml"]),
    );

    let registry = Registry::new(fx.app_config(&["support.yaml", "broken.yaml", "dupe.yaml"]));
    let report = registry.register_all_projects().await;

    assert_eq!(report.registered, vec![ProjectKey::new("acme", "support")]);
    assert_eq!(report.failed.len(), 2);
    assert!(!report.is_clean());
    let errors: Vec<&str> = report.failed.iter().map(|f| f.error.as_str()).collect();
    assert!(errors
        .iter()
        .any(|e| e.contains("unsupported backend: 'unsupported'")));
    assert!(errors.iter().any(|e| e.contains("duplicate collection 'faq'")));
    assert_eq!(registry.list_projects(), vec![ProjectKey::new("acme", "support")]);
}

#[tokio::test]
async fn test_unsupported_backend_is_classified() {
    let fx = Fixture::new();
    let path = fx.write(
        "broken.yaml",
        &project_yaml("broken", "    history:\n      backend: unsupported\n", &[]),
    );
    let err = Project::load("acme", &path, &BackendFactory::new(), 2)
        .await
        .unwrap_err();
    assert_eq!(
        classify(&err),
        Some(&GroxError::UnsupportedBackend("unsupported".into()))
    );
}

#[tokio::test]
async fn test_invalid_ttl_aborts_construction() {
    let fx = Fixture::new();
    let path = fx.write(
        "ttl.yaml",
        &project_yaml(
            "ttl",
            "    checkpoint:\n      backend: sqlite\n      url: \"sqlite::memory:\"\n      ttl: 3x\n",
            &[],
        ),
    );
    let err = Project::load("acme", &path, &BackendFactory::new(), 2)
        .await
        .unwrap_err();
    assert_eq!(classify(&err), Some(&GroxError::InvalidTtl("3x".into())));
}

#[tokio::test]
async fn test_missing_default_model_is_config_error() {
    let fx = Fixture::new();
    let yaml = project_yaml("bad", MEMORY_BACKENDS, &[]).replace("chat: chat", "chat: missing");
    let path = fx.write("bad.yaml", &yaml);
    let err = Project::load("acme", &path, &BackendFactory::new(), 2)
        .await
        .unwrap_err();
    assert!(matches!(
        classify(&err),
        Some(GroxError::ConfigValidation(msg)) if msg.contains("missing")
    ));
}

#[tokio::test]
async fn test_history_defaults_to_noop() {
    let fx = Fixture::new();
    let path = fx.write(
        "plain.yaml",
        &project_yaml("plain", "    checkpoint:\n      backend: memory\n", &[]),
    );
    let project = Project::load("acme", &path, &BackendFactory::new(), 2)
        .await
        .unwrap();
    assert_eq!(project.history().kind(), "noop");
    assert!(project.documents().is_none());
    assert!(project.indexing().is_none());

    for session in ["s-1", "s-2"] {
        let history = project.history().for_session(session);
        history
            .add_message(grox::backends::history::ChatMessage::new(
                grox::backends::history::Role::User,
                "hello",
            ))
            .await
            .unwrap();
        assert!(history.messages().await.unwrap().is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_background_indexing_is_idempotent() {
    let fx = Fixture::new();
    let path = fx.support_project();
    let project = Project::load("acme", &path, &BackendFactory::new(), 2)
        .await
        .unwrap();

    let report = project.wait_until_indexed().await.unwrap().unwrap();
    assert_eq!(report.total_indexed(), 5);
    assert_eq!(report.failures().count(), 0);
    assert!(project.indexing().unwrap().is_finished());

    let store = project.documents().unwrap();
    let faq = store.get_vector_store("faq").unwrap();
    assert_eq!(faq.count().await.unwrap(), 3);

    assert_eq!(store.index_documents("faq").await.unwrap(), 4);
    assert_eq!(faq.count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_search_after_indexing() {
    let fx = Fixture::new();
    let path = fx.support_project();
    let project = Project::load("acme", &path, &BackendFactory::new(), 2)
        .await
        .unwrap();
    project.wait_until_indexed().await.unwrap();

    let retrieval = project.documents().unwrap().as_retrieval("faq").unwrap();
    let options = SearchOptions {
        num_results: 1,
        ..SearchOptions::default()
    };
    let docs = retrieval
        .similarity_search("refund requests", "similarity", &options)
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert!(docs[0].text.starts_with("Refund requests"));
    assert_eq!(docs[0].metadata["id"], docs[0].id.as_str());

    let err = retrieval
        .similarity_search("refund", "fuzzy", &options)
        .await
        .unwrap_err();
    assert_eq!(
        classify(&err),
        Some(&GroxError::UnsupportedSearchType("fuzzy".into()))
    );

    let err = project.documents().unwrap().as_retrieval("nope").unwrap_err();
    assert_eq!(
        classify(&err),
        Some(&GroxError::CollectionNotFound("nope".into()))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_contexts_are_isolated() {
    let fx = Fixture::new();
    fx.support_project();
    let registry = Arc::new(Registry::new(fx.app_config(&["support.yaml"])));
    assert!(registry.register_all_projects().await.is_clean());

    let mut handles = Vec::new();
    for i in 0..64 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let ctx = registry
                .create_execution_context(
                    "acme",
                    "support",
                    Metadata::new(),
                    Some(format!("corr-{i}")),
                    None,
                )
                .unwrap();
            context::scope(ctx.clone(), async move {
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                    assert_eq!(context::current().as_ref(), Some(&ctx));
                }
                let inherited = context::spawn(async {
                    context::current().and_then(|c| c.correlation_id().map(str::to_string))
                })
                .await
                .unwrap();
                assert_eq!(inherited, Some(format!("corr-{i}")));
            })
            .await;
        }));
    }
    // Requests that never create a context see none.
    for _ in 0..16 {
        handles.push(tokio::spawn(async {
            tokio::task::yield_now().await;
            assert!(context::current().is_none());
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(context::current().is_none());
}

#[tokio::test]
async fn test_contexts_from_same_event_are_distinct() {
    let fx = Fixture::new();
    fx.support_project();
    let registry = Registry::new(fx.app_config(&["support.yaml"]));
    registry.register_all_projects().await;

    let a = registry
        .create_execution_context("acme", "support", Metadata::new(), None, None)
        .unwrap();
    let b = registry
        .create_execution_context("acme", "support", Metadata::new(), None, None)
        .unwrap();
    assert_ne!(a, b);
    assert_ne!(a.request_id(), b.request_id());
    assert!(Arc::ptr_eq(a.project(), b.project()));
}

#[tokio::test]
async fn test_sqlite_backends_share_one_pool() {
    let fx = Fixture::new();
    let url = format!("sqlite://{}", fx.path().join("data/grox.db").display());
    let backends = format!(
        "    checkpoint:\n      backend: sqlite\n      url: {url}\n      ttl: 1h\n    history:\n      backend: sqlite\n      url: {url}\n      ttl: 1d\n    vector:\n      backend: sqlite\n      url: {url}\n"
    );
    let path = fx.write("durable.yaml", &project_yaml("durable", &backends, &["faq.yaml"]));

    let factory = BackendFactory::new();
    let project = Project::load("acme", &path, &factory, 2).await.unwrap();
    assert_eq!(factory.connections().len(), 1);
    assert_eq!(project.history().kind(), "sqlite");
    assert!(project.indexing().is_none());

    let store = project.documents().unwrap();
    assert_eq!(store.index_documents("faq").await.unwrap(), 4);
    assert_eq!(store.index_documents("faq").await.unwrap(), 4);
    assert_eq!(store.get_vector_store("faq").unwrap().count().await.unwrap(), 3);

    let saver = project.checkpoint_saver().unwrap();
    saver
        .put("acme:durable:s-1", serde_json::json!({"step": 1}))
        .await
        .unwrap();
    let latest = saver.latest("acme:durable:s-1").await.unwrap().unwrap();
    assert_eq!(latest.state["step"], 1);
}
