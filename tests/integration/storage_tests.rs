//! Stages storage backends over in-memory runtime and registry

use crate::common::{FakeRegistry, FakeRuntime};
use std::sync::Arc;
use stevedore::error::{is_image_used_by_container_error, StevedoreError};
use stevedore::stage::naming::image_name_id;
use stevedore::stage::{ClientIdRecord, StageId};
use stevedore::storage::{
    create_stages_storage, ContainerImage, DeleteImageOptions,
    FilterStagesAndProcessRelatedDataOptions, LocalStagesStorage, RepoStagesStorage,
    StagesStorage,
};

const PROJECT: &str = "demo";
const REPO: &str = "registry.test/demo/stages";

fn add_local_stage(runtime: &FakeRuntime, project: &str, digest: &str, unique_id: i64) -> String {
    let name = format!("stevedore-stages-storage/{}:{}-{}", project, digest, unique_id);
    runtime.add_image(
        &name,
        &[
            ("stevedore", project),
            ("stevedore-cache-version", "1.2"),
            ("stevedore-stage-digest", digest),
        ],
    )
}

fn local() -> (Arc<FakeRuntime>, LocalStagesStorage) {
    let runtime = Arc::new(FakeRuntime::new());
    let storage = LocalStagesStorage::new(runtime.clone());
    (runtime, storage)
}

fn repo() -> (Arc<FakeRegistry>, Arc<FakeRuntime>, RepoStagesStorage) {
    let registry = Arc::new(FakeRegistry::new());
    let runtime = Arc::new(FakeRuntime::new());
    let storage = RepoStagesStorage::new(REPO, registry.clone(), runtime.clone());
    (registry, runtime, storage)
}

#[test]
fn factory_selects_backend_by_address() {
    let runtime = Arc::new(FakeRuntime::new());
    let registry = Arc::new(FakeRegistry::new());

    let storage = create_stages_storage(":local", runtime.clone(), registry.clone());
    assert_eq!(storage.address(), ":local");
    assert_eq!(storage.to_string(), ":local");

    let storage = create_stages_storage(REPO, runtime, registry);
    assert_eq!(storage.address(), REPO);
}

mod local_storage {
    use super::*;

    #[tokio::test]
    async fn stage_ids_from_labelled_images() {
        let (runtime, storage) = local();
        add_local_stage(&runtime, PROJECT, "abc", 100);
        add_local_stage(&runtime, PROJECT, "abc", 200);
        add_local_stage(&runtime, PROJECT, "def", 300);
        add_local_stage(&runtime, "other", "abc", 400);
        runtime.add_image(
            "stevedore-stages-storage/demo:abc-latest",
            &[("stevedore", PROJECT), ("stevedore-cache-version", "1.2")],
        );
        runtime.add_image("stevedore-stages-storage/demo:abc-500", &[]);

        let ids = storage.get_stages_ids(PROJECT).await.unwrap();
        assert_eq!(
            ids,
            vec![
                StageId::new("abc", 100),
                StageId::new("abc", 200),
                StageId::new("def", 300),
            ]
        );

        let ids = storage.get_stages_ids_by_digest(PROJECT, "abc").await.unwrap();
        assert_eq!(ids, vec![StageId::new("abc", 100), StageId::new("abc", 200)]);

        assert!(storage
            .get_stages_ids_by_digest(PROJECT, "zzz")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn stage_description_by_name() {
        let (runtime, storage) = local();
        let id = add_local_stage(&runtime, PROJECT, "abc", 100);

        assert_eq!(
            storage.construct_stage_image_name(PROJECT, "abc", 100),
            "stevedore-stages-storage/demo:abc-100"
        );

        let description = storage
            .get_stage_description(PROJECT, "abc", 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(description.stage_id, StageId::new("abc", 100));
        assert_eq!(description.info.id, id);

        assert!(storage
            .get_stage_description(PROJECT, "abc", 101)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delete_stage_removes_image() {
        let (runtime, storage) = local();
        add_local_stage(&runtime, PROJECT, "abc", 100);
        let description = storage
            .get_stage_description(PROJECT, "abc", 100)
            .await
            .unwrap()
            .unwrap();

        storage
            .delete_stage(&description, &DeleteImageOptions { rmi_force: true })
            .await
            .unwrap();
        assert!(storage.get_stages_ids(PROJECT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn used_image_is_an_error_by_default() {
        let (runtime, storage) = local();
        let id = add_local_stage(&runtime, PROJECT, "abc", 100);
        runtime.add_container("c1", "/builder", &id);
        let description = storage
            .get_stage_description(PROJECT, "abc", 100)
            .await
            .unwrap()
            .unwrap();

        let err = storage
            .filter_stages_and_process_related_data(
                vec![description],
                &FilterStagesAndProcessRelatedDataOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(is_image_used_by_container_error(&err));
        assert!(matches!(err, StevedoreError::ImageUsedByContainer { .. }));
    }

    #[tokio::test]
    async fn used_image_is_skipped_or_freed() {
        let (runtime, storage) = local();
        let used = add_local_stage(&runtime, PROJECT, "abc", 100);
        add_local_stage(&runtime, PROJECT, "abc", 200);
        runtime.add_container("c1", "/builder", &used);

        let mut descriptions = Vec::new();
        for unique_id in [100, 200] {
            descriptions.push(
                storage
                    .get_stage_description(PROJECT, "abc", unique_id)
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }

        let kept = storage
            .filter_stages_and_process_related_data(
                descriptions.clone(),
                &FilterStagesAndProcessRelatedDataOptions {
                    skip_used_image: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].stage_id.unique_id, 200);
        assert!(runtime.removed_containers.lock().unwrap().is_empty());

        let kept = storage
            .filter_stages_and_process_related_data(
                descriptions,
                &FilterStagesAndProcessRelatedDataOptions {
                    rm_containers_that_use_image: true,
                    rm_force: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(*runtime.removed_containers.lock().unwrap(), vec!["c1"]);
    }

    #[tokio::test]
    async fn managed_images_roundtrip() {
        let (runtime, storage) = local();
        storage.add_managed_image(PROJECT, "app/backend").await.unwrap();
        storage.add_managed_image(PROJECT, "").await.unwrap();
        storage.add_managed_image(PROJECT, "Upper").await.unwrap();
        storage.add_managed_image(PROJECT, "app/backend").await.unwrap();

        assert!(runtime
            .names()
            .contains(&"stevedore-managed-images/demo:app__slash__backend".to_string()));

        let mut images = storage.get_managed_images(PROJECT).await.unwrap();
        images.sort();
        assert_eq!(images, vec!["".to_string(), "app/backend".to_string()]);

        storage.rm_managed_image(PROJECT, "app/backend").await.unwrap();
        storage.rm_managed_image(PROJECT, "app/backend").await.unwrap();
        assert_eq!(storage.get_managed_images(PROJECT).await.unwrap(), vec![""]);
    }

    #[tokio::test]
    async fn image_metadata_by_name_and_id() {
        let (_runtime, storage) = local();
        storage
            .put_image_metadata(PROJECT, "app", "c0ffee", "abc-100")
            .await
            .unwrap();
        storage
            .put_image_metadata(PROJECT, "gone", "c0ffee", "abc-100")
            .await
            .unwrap();

        assert!(storage
            .is_image_metadata_exist(PROJECT, "app", "c0ffee", "abc-100")
            .await
            .unwrap());

        let (managed, foreign) = storage
            .get_all_and_group_image_metadata_by_image_name(PROJECT, &["app".to_string()])
            .await
            .unwrap();
        assert_eq!(managed["app"]["abc-100"], vec!["c0ffee"]);
        assert_eq!(foreign[&image_name_id("gone")]["abc-100"], vec!["c0ffee"]);

        storage
            .rm_image_metadata(PROJECT, "app", "c0ffee", "abc-100")
            .await
            .unwrap();
        storage
            .rm_image_metadata(PROJECT, &image_name_id("gone"), "c0ffee", "abc-100")
            .await
            .unwrap();

        assert!(!storage
            .is_image_metadata_exist(PROJECT, "app", "c0ffee", "abc-100")
            .await
            .unwrap());
        assert!(!storage
            .is_image_metadata_exist(PROJECT, "gone", "c0ffee", "abc-100")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn client_id_records() {
        let (_runtime, storage) = local();
        let record = ClientIdRecord {
            client_id: "host-a-1".to_string(),
            timestamp_millisec: 1_700_000_000_000,
        };
        storage.post_client_id_record(PROJECT, &record).await.unwrap();
        storage.post_client_id_record(PROJECT, &record).await.unwrap();

        assert_eq!(
            storage.get_client_id_records(PROJECT).await.unwrap(),
            vec![record]
        );
    }

    #[tokio::test]
    async fn store_tags_built_image() {
        let (runtime, storage) = local();
        let built = runtime.add_image("tmp:build", &[]);
        let image = ContainerImage::new("stevedore-stages-storage/demo:abc-1").with_built_id(&built);

        assert!(!storage.should_fetch_image(&image).await.unwrap());
        storage.store_image(&image).await.unwrap();
        assert!(runtime
            .names()
            .contains(&"stevedore-stages-storage/demo:abc-1".to_string()));
        assert!(runtime.pushed.lock().unwrap().is_empty());
    }
}

mod repo_storage {
    use super::*;

    #[tokio::test]
    async fn stage_ids_skip_records_and_foreign_tags() {
        let (registry, _runtime, storage) = repo();
        for tag in [
            "abc-100",
            "abc-200",
            "abcd-300",
            "latest",
            "abc-latest",
            "managed-image-app",
            "meta-ff_c0_abc-100",
            "client-id-host-1700000000000",
        ] {
            registry.add_tag(REPO, tag);
        }

        let mut ids = storage.get_stages_ids(PROJECT).await.unwrap();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                StageId::new("abc", 100),
                StageId::new("abc", 200),
                StageId::new("abcd", 300),
            ]
        );

        let ids = storage.get_stages_ids_by_digest(PROJECT, "abc").await.unwrap();
        assert_eq!(ids, vec![StageId::new("abc", 100), StageId::new("abc", 200)]);
    }

    #[tokio::test]
    async fn describe_and_delete_stage() {
        let (registry, _runtime, storage) = repo();
        registry.add_tag(REPO, "abc-100");

        assert_eq!(
            storage.construct_stage_image_name(PROJECT, "abc", 100),
            format!("{}:abc-100", REPO)
        );

        let description = storage
            .get_stage_description(PROJECT, "abc", 100)
            .await
            .unwrap()
            .unwrap();
        assert!(storage
            .get_stage_description(PROJECT, "abc", 1)
            .await
            .unwrap()
            .is_none());

        let kept = storage
            .filter_stages_and_process_related_data(
                vec![description.clone()],
                &FilterStagesAndProcessRelatedDataOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(kept.len(), 1);

        storage
            .delete_stage(&description, &DeleteImageOptions::default())
            .await
            .unwrap();
        assert!(registry.tag_list(REPO).is_empty());
    }

    #[tokio::test]
    async fn records_live_next_to_stages() {
        let (registry, _runtime, storage) = repo();
        storage.add_managed_image(PROJECT, "app").await.unwrap();
        storage.add_managed_image(PROJECT, "App").await.unwrap();
        storage
            .put_image_metadata(PROJECT, "app", "c0ffee", "abc-100")
            .await
            .unwrap();
        storage
            .post_client_id_record(
                PROJECT,
                &ClientIdRecord {
                    client_id: "host".to_string(),
                    timestamp_millisec: 42,
                },
            )
            .await
            .unwrap();

        let tags = registry.tag_list(REPO);
        assert!(tags.contains(&"managed-image-app".to_string()));
        assert!(tags.contains(&format!("meta-{}_c0ffee_abc-100", image_name_id("app"))));
        assert!(tags.contains(&"client-id-host-42".to_string()));
        assert!(storage.get_stages_ids(PROJECT).await.unwrap().is_empty());

        assert_eq!(storage.get_managed_images(PROJECT).await.unwrap(), vec!["app"]);
        let records = storage.get_client_id_records(PROJECT).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp_millisec, 42);

        let (managed, foreign) = storage
            .get_all_and_group_image_metadata_by_image_name(PROJECT, &["app".to_string()])
            .await
            .unwrap();
        assert_eq!(managed["app"]["abc-100"], vec!["c0ffee"]);
        assert!(foreign.is_empty());

        storage
            .rm_image_metadata(PROJECT, "app", "c0ffee", "abc-100")
            .await
            .unwrap();
        storage.rm_managed_image(PROJECT, "app").await.unwrap();
        storage.rm_managed_image(PROJECT, "app").await.unwrap();
        assert_eq!(registry.tag_list(REPO), vec!["client-id-host-42"]);
    }

    #[tokio::test]
    async fn fetch_and_store_through_runtime() {
        let (_registry, runtime, storage) = repo();
        let name = format!("{}:abc-100", REPO);
        let image = ContainerImage::new(&name);

        assert!(storage.should_fetch_image(&image).await.unwrap());
        storage.fetch_image(&image).await.unwrap();
        assert_eq!(*runtime.pulled.lock().unwrap(), vec![name.clone()]);

        let built = runtime.add_image("tmp:build", &[]);
        storage
            .store_image(&image.clone().with_built_id(&built))
            .await
            .unwrap();
        assert!(runtime.names().contains(&name));
        assert_eq!(*runtime.pushed.lock().unwrap(), vec![name.clone()]);
        assert!(!storage.should_fetch_image(&image).await.unwrap());
    }
}
