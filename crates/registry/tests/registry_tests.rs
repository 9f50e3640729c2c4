// Registry contract, checked against the in-memory and SQLite implementations

mod common;

use common::{record, registries};
use spool_registry::{RegistryError, SqliteRegistry, UploadRegistry};
use time::{Duration, OffsetDateTime};

#[tokio::test]
async fn test_register_and_get() {
    let (_dir, registries) = registries().await;
    for registry in registries {
        let record = record(Some(100), None);
        registry.register(&record).await.unwrap();
        assert_eq!(registry.get(&record.id).await.unwrap(), record);
        assert_eq!(registry.count().await.unwrap(), 1);
    }
}

#[tokio::test]
async fn test_duplicate_id_rejected() {
    let (_dir, registries) = registries().await;
    for registry in registries {
        let record = record(Some(100), None);
        registry.register(&record).await.unwrap();
        assert!(
            matches!(
                registry.register(&record).await,
                Err(RegistryError::DuplicateId(_))
            ),
            "{} registry accepted a duplicate id",
            registry.kind()
        );
    }
}

#[tokio::test]
async fn test_unknown_id_not_found() {
    let (_dir, registries) = registries().await;
    for registry in registries {
        let record = record(Some(1), None);
        assert!(matches!(
            registry.get(&record.id).await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.remove(&record.id).await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.update_offset(&record.id, 1).await,
            Err(RegistryError::NotFound(_))
        ));
    }
}

#[tokio::test]
async fn test_offset_is_monotonic() {
    let (_dir, registries) = registries().await;
    for registry in registries {
        let record = record(Some(100), None);
        registry.register(&record).await.unwrap();

        let updated = registry.update_offset(&record.id, 40).await.unwrap();
        assert_eq!(updated.offset, 40);
        // Same offset is allowed (empty append)
        registry.update_offset(&record.id, 40).await.unwrap();

        match registry.update_offset(&record.id, 10).await {
            Err(RegistryError::OffsetRegression { current, requested }) => {
                assert_eq!(current, 40);
                assert_eq!(requested, 10);
            }
            other => panic!("expected offset regression, got {other:?}"),
        }
        assert_eq!(registry.get(&record.id).await.unwrap().offset, 40);
    }
}

#[tokio::test]
async fn test_length_set_once() {
    let (_dir, registries) = registries().await;
    for registry in registries {
        let record = record(None, None);
        registry.register(&record).await.unwrap();

        let updated = registry.set_length(&record.id, 500).await.unwrap();
        assert_eq!(updated.length, Some(500));
        assert!(matches!(
            registry.set_length(&record.id, 600).await,
            Err(RegistryError::LengthAlreadySet(_))
        ));
        assert_eq!(registry.get(&record.id).await.unwrap().length, Some(500));
    }
}

#[tokio::test]
async fn test_remove_then_get_is_not_found() {
    let (_dir, registries) = registries().await;
    for registry in registries {
        let record = record(Some(10), None);
        registry.register(&record).await.unwrap();
        registry.remove(&record.id).await.unwrap();
        assert!(matches!(
            registry.get(&record.id).await,
            Err(RegistryError::NotFound(_))
        ));
        assert_eq!(registry.count().await.unwrap(), 0);
    }
}

#[tokio::test]
async fn test_list_expired_skips_complete_and_fresh() {
    let (_dir, registries) = registries().await;
    for registry in registries {
        let expired = record(Some(10), Some(Duration::seconds(-60)));
        let fresh = record(Some(10), Some(Duration::hours(1)));
        let no_expiry = record(Some(10), None);
        let complete = record(Some(10), Some(Duration::seconds(-60)));

        for r in [&expired, &fresh, &no_expiry, &complete] {
            registry.register(r).await.unwrap();
        }
        registry.update_offset(&complete.id, 10).await.unwrap();

        let listed = registry
            .list_expired(OffsetDateTime::now_utc(), 100)
            .await
            .unwrap();
        let ids: Vec<_> = listed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![expired.id], "{} registry", registry.kind());
    }
}

#[tokio::test]
async fn test_list_expired_respects_limit() {
    let (_dir, registries) = registries().await;
    for registry in registries {
        for _ in 0..5 {
            registry
                .register(&record(None, Some(Duration::seconds(-5))))
                .await
                .unwrap();
        }
        let listed = registry
            .list_expired(OffsetDateTime::now_utc(), 3)
            .await
            .unwrap();
        assert_eq!(listed.len(), 3);
    }
}

#[tokio::test]
async fn test_set_expiry_extends() {
    let (_dir, registries) = registries().await;
    for registry in registries {
        let record = record(Some(10), Some(Duration::seconds(-5)));
        registry.register(&record).await.unwrap();

        let later = OffsetDateTime::now_utc() + Duration::hours(1);
        registry.set_expiry(&record.id, Some(later)).await.unwrap();
        assert!(
            registry
                .list_expired(OffsetDateTime::now_utc(), 10)
                .await
                .unwrap()
                .is_empty()
        );
    }
}

#[tokio::test]
async fn test_sqlite_records_survive_reopen() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("registry.db");
    let record = record(None, None);

    {
        let registry = SqliteRegistry::new(&path).await.unwrap();
        registry.register(&record).await.unwrap();
        registry.update_offset(&record.id, 7).await.unwrap();
    }

    let registry = SqliteRegistry::new(&path).await.unwrap();
    let stored = registry.get(&record.id).await.unwrap();
    assert_eq!(stored.offset, 7);
    assert_eq!(stored.metadata.get("filename"), Some("world.txt"));
    assert!(stored.is_deferred());
}
