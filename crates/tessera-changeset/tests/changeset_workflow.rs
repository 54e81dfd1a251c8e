use std::collections::HashMap;
use std::sync::Arc;

use tessera_changeset::{
    AuthoringService, ChangesetOptions, ChangesetService, ConflictKind, NewFeatureRequest,
    NewKeyRequest, NewServiceRequest, SetValueRequest,
};
use tessera_common::{
    DEFAULT_VARIATION_CONTEXT_ID, PermissionLevel, StaticPermissions, TesseraError, UserContext,
};
use tessera_persistence::{
    ActionType, ChangeKind, ChangeType, ChangesetState, FeatureVersionRecord, MemoryPersistService,
    PersistenceService, ServiceVersionRecord,
};
use tessera_variation::{
    HierarchyCache, HierarchyOptions, NewPropertyRequest, NewPropertyValueRequest,
    NewServiceTypeRequest, VariationAdminService,
};

struct Fixture {
    persistence: Arc<MemoryPersistService>,
    changesets: ChangesetService,
    authoring: AuthoringService,
    variation: VariationAdminService,
}

fn fixture() -> Fixture {
    fixture_with(ChangesetOptions::default())
}

fn fixture_with(options: ChangesetOptions) -> Fixture {
    let persistence = Arc::new(MemoryPersistService::new());
    let shared: Arc<dyn PersistenceService> = persistence.clone();
    let cache = Arc::new(HierarchyCache::new(HierarchyOptions::default()));
    Fixture {
        persistence,
        changesets: ChangesetService::new(shared.clone(), options),
        authoring: AuthoringService::new(shared.clone(), cache.clone()),
        variation: VariationAdminService::new(shared, cache),
    }
}

fn admin() -> UserContext {
    UserContext::global_admin(1)
}

fn user(id: i64, permissions: StaticPermissions) -> UserContext {
    UserContext::new(id, Arc::new(permissions))
}

/// Live state built by one applied changeset
struct World {
    service_type_id: i64,
    service_version: ServiceVersionRecord,
    feature_version: FeatureVersionRecord,
}

async fn live_world(f: &Fixture) -> World {
    let admin = admin();
    let service_type = f
        .variation
        .create_service_type(
            &admin,
            NewServiceTypeRequest {
                name: "web".to_string(),
            },
        )
        .await
        .unwrap();
    let service_version = f
        .authoring
        .create_service(
            &admin,
            NewServiceRequest {
                name: "checkout".to_string(),
                service_type_id: service_type.id,
                description: String::new(),
            },
        )
        .await
        .unwrap();
    let feature_version = f
        .authoring
        .create_feature(
            &admin,
            NewFeatureRequest {
                name: "payments".to_string(),
                description: String::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(service_version.changeset_id, feature_version.changeset_id);

    f.authoring
        .link_feature(&admin, feature_version.record.id, service_version.record.id)
        .await
        .unwrap();
    f.changesets
        .apply(&admin, service_version.changeset_id, None)
        .await
        .unwrap();

    World {
        service_type_id: service_type.id,
        service_version: service_version.record,
        feature_version: feature_version.record,
    }
}

async fn add_service(f: &Fixture, world: &World, name: &str) -> ServiceVersionRecord {
    let admin = admin();
    let version = f
        .authoring
        .create_service(
            &admin,
            NewServiceRequest {
                name: name.to_string(),
                service_type_id: world.service_type_id,
                description: String::new(),
            },
        )
        .await
        .unwrap();
    f.changesets
        .apply(&admin, version.changeset_id, None)
        .await
        .unwrap();
    version.record
}

fn key_request(feature_version_id: i64, name: &str) -> NewKeyRequest {
    NewKeyRequest {
        feature_version_id,
        name: name.to_string(),
        description: String::new(),
        default_value: "30".to_string(),
    }
}

#[tokio::test]
async fn test_ensure_changeset_is_idempotent() {
    let f = fixture();
    let user = user(7, StaticPermissions::new());

    let first = f.changesets.ensure_changeset_for_user(&user).await.unwrap();
    let second = f.changesets.ensure_changeset_for_user(&user).await.unwrap();
    let again = f.changesets.ensure_changeset_for_user(&first).await.unwrap();

    assert!(first.open_changeset_id.is_some());
    assert_eq!(first.open_changeset_id, second.open_changeset_id);
    assert_eq!(first.open_changeset_id, again.open_changeset_id);
    assert_eq!(user.open_changeset_id, None);

    let id = first.open_changeset_id.unwrap();
    let actions = f.changesets.list_actions(id).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action_type, ActionType::Create);
}

#[tokio::test]
async fn test_apply_makes_pending_rows_live() {
    let f = fixture();
    let world = live_world(&f).await;

    let tx = f.persistence.begin().await.unwrap();
    let service_version = tx
        .service_version_find(world.service_version.id)
        .await
        .unwrap()
        .unwrap();
    let service = tx
        .service_find(service_version.service_id)
        .await
        .unwrap()
        .unwrap();
    let feature = tx
        .feature_find(world.feature_version.feature_id)
        .await
        .unwrap()
        .unwrap();
    let link = tx
        .link_find_live(feature.id, service_version.id)
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert!(service_version.validity.is_live());
    assert!(service.validity.is_live());
    assert!(feature.validity.is_live());
    assert!(link.is_some());

    let applied = f
        .changesets
        .list_changesets(Some(1), Some(ChangesetState::Applied))
        .await
        .unwrap();
    assert_eq!(applied.len(), 1);
    assert!(applied[0].applied_at.is_some());
    let actions = f.changesets.list_actions(applied[0].id).await.unwrap();
    let types: Vec<ActionType> = actions.iter().map(|a| a.action_type).collect();
    assert_eq!(types, vec![ActionType::Create, ActionType::Apply]);
}

#[tokio::test]
async fn test_apply_is_atomic() {
    let f = fixture();
    let world = live_world(&f).await;
    let admin = admin();

    let key = f
        .authoring
        .create_key(&admin, key_request(world.feature_version.id, "timeout"))
        .await
        .unwrap();

    // The key change succeeds, the default value change fails
    f.persistence.fail_after_validity_writes(1).await;
    let err = f
        .changesets
        .apply(&admin, key.changeset_id, Some("ship it"))
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::UnknownError(_)));

    let changeset = f.changesets.get_changeset(key.changeset_id).await.unwrap();
    assert_eq!(changeset.state, ChangesetState::Open);
    assert_eq!(changeset.applied_at, None);
    let actions = f.changesets.list_actions(key.changeset_id).await.unwrap();
    assert_eq!(actions.len(), 1);

    let tx = f.persistence.begin().await.unwrap();
    let stored = tx.key_find(key.record.id).await.unwrap().unwrap();
    let default_value = tx
        .value_find_live(key.record.id, DEFAULT_VARIATION_CONTEXT_ID)
        .await
        .unwrap();
    tx.rollback().await.unwrap();
    assert!(stored.validity.is_pending());
    assert!(default_value.is_none());

    let applied = f
        .changesets
        .apply(&admin, key.changeset_id, Some("ship it"))
        .await
        .unwrap();
    assert_eq!(applied.state, ChangesetState::Applied);

    let tx = f.persistence.begin().await.unwrap();
    assert!(
        tx.key_find(key.record.id)
            .await
            .unwrap()
            .unwrap()
            .validity
            .is_live()
    );
    assert!(
        tx.value_find_live(key.record.id, DEFAULT_VARIATION_CONTEXT_ID)
            .await
            .unwrap()
            .is_some()
    );
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_discard_removes_introduced_rows() {
    let f = fixture();
    let admin = admin();

    let version = f
        .authoring
        .create_feature(
            &admin,
            NewFeatureRequest {
                name: "search".to_string(),
                description: String::new(),
            },
        )
        .await
        .unwrap();
    let key = f
        .authoring
        .create_key(&admin, key_request(version.record.id, "page.size"))
        .await
        .unwrap();
    assert_eq!(key.changeset_id, version.changeset_id);
    assert_eq!(
        f.changesets
            .list_changes(version.changeset_id)
            .await
            .unwrap()
            .len(),
        3
    );

    let discarded = f
        .changesets
        .discard(&admin, version.changeset_id, None)
        .await
        .unwrap();
    assert_eq!(discarded.state, ChangesetState::Discarded);
    assert!(
        f.changesets
            .list_changes(version.changeset_id)
            .await
            .unwrap()
            .is_empty()
    );

    let tx = f.persistence.begin().await.unwrap();
    assert!(tx.feature_find(version.record.feature_id).await.unwrap().is_none());
    assert!(tx.feature_version_find(version.record.id).await.unwrap().is_none());
    assert!(tx.key_find(key.record.id).await.unwrap().is_none());
    assert!(tx.feature_find_by_name("search").await.unwrap().is_none());
    tx.rollback().await.unwrap();

    let err = f
        .changesets
        .discard(&admin, version.changeset_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::InvalidOperation(_)));

    // An update brings its own pending value row
    let world = live_world(&f).await;
    let key = f
        .authoring
        .create_key(&admin, key_request(world.feature_version.id, "page.size"))
        .await
        .unwrap();
    f.changesets.apply(&admin, key.changeset_id, None).await.unwrap();
    let update = f
        .authoring
        .set_value(
            &admin,
            SetValueRequest {
                key_id: key.record.id,
                service_type_id: world.service_type_id,
                variation: HashMap::new(),
                data: "50".to_string(),
            },
        )
        .await
        .unwrap();
    let changes = f.changesets.list_changes(update.changeset_id).await.unwrap();
    assert_eq!(changes[0].change_type, ChangeType::Update);

    f.changesets
        .discard(&admin, update.changeset_id, None)
        .await
        .unwrap();

    let tx = f.persistence.begin().await.unwrap();
    assert!(tx.value_find(update.record.id).await.unwrap().is_none());
    let live = tx
        .value_find_live(key.record.id, DEFAULT_VARIATION_CONTEXT_ID)
        .await
        .unwrap()
        .unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(live.data, "30");
}

#[tokio::test]
async fn test_discarding_key_removes_default_value() {
    let f = fixture();
    let world = live_world(&f).await;
    let author = user(
        2,
        StaticPermissions::new().grant_feature(world.feature_version.feature_id, PermissionLevel::Write),
    );

    let key = f
        .authoring
        .create_key(&author, key_request(world.feature_version.id, "retries"))
        .await
        .unwrap();
    let changes = f.changesets.list_changes(key.changeset_id).await.unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].kind, ChangeKind::Key { key_id: key.record.id });
    let ChangeKind::VariationValue {
        new_variation_value_id: Some(default_value_id),
        variation_context_id,
        ..
    } = changes[1].kind
    else {
        panic!("expected a value change, got {:?}", changes[1].kind);
    };
    assert_eq!(variation_context_id, DEFAULT_VARIATION_CONTEXT_ID);

    let err = f
        .changesets
        .discard_change(&author, changes[1].id)
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::InvalidOperation(_)));

    let stranger = user(3, StaticPermissions::new());
    let err = f
        .changesets
        .discard_change(&stranger, changes[0].id)
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::PermissionDenied(_)));

    f.changesets
        .discard_change(&author, changes[0].id)
        .await
        .unwrap();
    assert!(
        f.changesets
            .list_changes(key.changeset_id)
            .await
            .unwrap()
            .is_empty()
    );

    let tx = f.persistence.begin().await.unwrap();
    assert!(tx.key_find(key.record.id).await.unwrap().is_none());
    assert!(tx.value_find(default_value_id).await.unwrap().is_none());
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_discarding_feature_version_with_dependents_is_refused() {
    let f = fixture();
    let admin = admin();

    let version = f
        .authoring
        .create_feature(
            &admin,
            NewFeatureRequest {
                name: "inventory".to_string(),
                description: String::new(),
            },
        )
        .await
        .unwrap();
    f.authoring
        .create_key(&admin, key_request(version.record.id, "batch"))
        .await
        .unwrap();

    let changes = f.changesets.list_changes(version.changeset_id).await.unwrap();
    let err = f
        .changesets
        .discard_change(&admin, changes[0].id)
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::InvalidOperation(_)));
    assert_eq!(
        f.changesets
            .list_changes(version.changeset_id)
            .await
            .unwrap()
            .len(),
        3
    );
}

#[tokio::test]
async fn test_concurrent_link_is_reported_as_duplicate() {
    let f = fixture();
    let world = live_world(&f).await;
    let billing = add_service(&f, &world, "billing").await;
    let feature_id = world.feature_version.feature_id;

    let x = user(
        2,
        StaticPermissions::new()
            .grant_feature(feature_id, PermissionLevel::Write)
            .grant_service(billing.service_id, PermissionLevel::Write),
    );
    let y = user(
        3,
        StaticPermissions::new()
            .grant_feature(feature_id, PermissionLevel::Write)
            .grant_service(billing.service_id, PermissionLevel::Admin),
    );

    let x_link = f
        .authoring
        .link_feature(&x, world.feature_version.id, billing.id)
        .await
        .unwrap();
    let y_link = f
        .authoring
        .link_feature(&y, world.feature_version.id, billing.id)
        .await
        .unwrap();
    assert_ne!(x_link.changeset_id, y_link.changeset_id);

    let before = f
        .changesets
        .changes_with_conflicts(x_link.changeset_id)
        .await
        .unwrap();
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].conflict, None);

    f.changesets
        .apply(&y, y_link.changeset_id, None)
        .await
        .unwrap();

    let after = f
        .changesets
        .changes_with_conflicts(x_link.changeset_id)
        .await
        .unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].change.kind, ChangeKind::Link { link_id: x_link.record.id });
    assert_eq!(after[0].conflict, Some(ConflictKind::DuplicateLink));
}

#[tokio::test]
async fn test_state_machine_guards() {
    let f = fixture();
    let owner = user(2, StaticPermissions::new());
    let other = user(3, StaticPermissions::new());

    let feature = f
        .authoring
        .create_feature(
            &owner,
            NewFeatureRequest {
                name: "beta".to_string(),
                description: String::new(),
            },
        )
        .await
        .unwrap();
    let id = feature.changeset_id;

    let err = f.changesets.commit(&other, id, None).await.unwrap_err();
    assert!(matches!(err, TesseraError::PermissionDenied(_)));

    let committed = f.changesets.commit(&owner, id, Some("ready")).await.unwrap();
    assert_eq!(committed.state, ChangesetState::Committed);

    let err = f.changesets.commit(&owner, id, None).await.unwrap_err();
    assert!(matches!(err, TesseraError::InvalidOperation(_)));
    assert!(err.to_string().contains("COMMITTED"));
    let err = f.changesets.stash(&owner, id, None).await.unwrap_err();
    assert!(matches!(err, TesseraError::InvalidOperation(_)));

    // State is checked before ownership
    let err = f.changesets.stash(&other, id, None).await.unwrap_err();
    assert!(matches!(err, TesseraError::InvalidOperation(_)));

    f.changesets.reopen(&owner, id, None).await.unwrap();
    let stashed = f.changesets.stash(&owner, id, None).await.unwrap();
    assert_eq!(stashed.state, ChangesetState::Stashed);

    let err = f.changesets.apply(&owner, id, None).await.unwrap_err();
    assert!(matches!(err, TesseraError::InvalidOperation(_)));

    // A fresh open changeset blocks reopening the stashed one
    let fresh = f.changesets.ensure_changeset_for_user(&owner).await.unwrap();
    assert_ne!(fresh.open_changeset_id, Some(id));
    let err = f.changesets.reopen(&owner, id, None).await.unwrap_err();
    assert!(matches!(err, TesseraError::InvalidOperation(_)));

    f.changesets
        .discard(&owner, fresh.open_changeset_id.unwrap(), None)
        .await
        .unwrap();
    let reopened = f.changesets.reopen(&owner, id, None).await.unwrap();
    assert_eq!(reopened.state, ChangesetState::Open);

    let types: Vec<ActionType> = f
        .changesets
        .list_actions(id)
        .await
        .unwrap()
        .iter()
        .map(|a| a.action_type)
        .collect();
    assert_eq!(
        types,
        vec![
            ActionType::Create,
            ActionType::Commit,
            ActionType::Reopen,
            ActionType::Stash,
            ActionType::Reopen,
        ]
    );
}

#[tokio::test]
async fn test_can_be_applied_by() {
    let f = fixture();
    let world = live_world(&f).await;
    let service_id = world.service_version.service_id;

    let author = user(
        2,
        StaticPermissions::new()
            .grant_feature(world.feature_version.feature_id, PermissionLevel::Write),
    );
    let key = f
        .authoring
        .create_key(&author, key_request(world.feature_version.id, "limit"))
        .await
        .unwrap();
    let id = key.changeset_id;

    let service_admin = user(
        3,
        StaticPermissions::new().grant_service(service_id, PermissionLevel::Admin),
    );
    let service_writer = user(
        4,
        StaticPermissions::new().grant_service(service_id, PermissionLevel::Write),
    );

    // Open changesets can only be applied by their owner
    assert!(!f.changesets.can_be_applied_by(&service_admin, id).await.unwrap());
    assert!(!f.changesets.can_be_applied_by(&author, id).await.unwrap());
    let err = f.changesets.apply(&author, id, None).await.unwrap_err();
    assert!(matches!(err, TesseraError::PermissionDenied(_)));

    f.changesets.commit(&author, id, None).await.unwrap();
    assert!(f.changesets.can_be_applied_by(&service_admin, id).await.unwrap());
    assert!(!f.changesets.can_be_applied_by(&service_writer, id).await.unwrap());
    assert!(f.changesets.can_be_applied_by(&admin(), id).await.unwrap());

    f.changesets.apply(&service_admin, id, None).await.unwrap();
    assert!(!f.changesets.can_be_applied_by(&admin(), id).await.unwrap());
}

async fn env_property(f: &Fixture, world: &World) -> (i64, HashMap<&'static str, i64>) {
    let admin = admin();
    let env = f
        .variation
        .create_property(
            &admin,
            NewPropertyRequest {
                name: "env".to_string(),
                description: String::new(),
            },
        )
        .await
        .unwrap();
    let mut ids = HashMap::new();
    for (value, parent) in [("prod", None), ("qa", None), ("qa1", Some("qa"))] {
        let record = f
            .variation
            .create_property_value(
                &admin,
                NewPropertyValueRequest {
                    property_id: env.id,
                    value: value.to_string(),
                    parent_id: parent.map(|p| ids[p]),
                    sort_order: 0,
                },
            )
            .await
            .unwrap();
        ids.insert(value, record.id);
    }
    f.variation
        .set_service_type_property(&admin, world.service_type_id, env.id, 1)
        .await
        .unwrap();
    (env.id, ids)
}

fn set_value(world: &World, key_id: i64, env_id: i64, env: &str, data: &str) -> SetValueRequest {
    SetValueRequest {
        key_id,
        service_type_id: world.service_type_id,
        variation: HashMap::from([(env_id, env.to_string())]),
        data: data.to_string(),
    }
}

#[tokio::test]
async fn test_set_value_create_then_update() {
    let f = fixture();
    let world = live_world(&f).await;
    let (env_id, _) = env_property(&f, &world).await;
    let admin = admin();

    let key = f
        .authoring
        .create_key(&admin, key_request(world.feature_version.id, "timeout"))
        .await
        .unwrap();
    let qa1 = f
        .authoring
        .set_value(&admin, set_value(&world, key.record.id, env_id, "qa1", "10"))
        .await
        .unwrap();
    assert_ne!(qa1.record.variation_context_id, DEFAULT_VARIATION_CONTEXT_ID);

    let err = f
        .authoring
        .set_value(&admin, set_value(&world, key.record.id, env_id, "qa1", "11"))
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::DuplicateVariation(_)));

    let err = f
        .authoring
        .set_value(&admin, set_value(&world, key.record.id, env_id, "staging", "11"))
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::InvalidOperation(_)));

    f.changesets.apply(&admin, key.changeset_id, None).await.unwrap();

    let update = f
        .authoring
        .set_value(&admin, set_value(&world, key.record.id, env_id, "qa1", "12"))
        .await
        .unwrap();
    assert_eq!(
        update.record.variation_context_id,
        qa1.record.variation_context_id
    );
    let changes = f.changesets.list_changes(update.changeset_id).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].change_type, ChangeType::Update);
    assert_eq!(
        changes[0].kind,
        ChangeKind::VariationValue {
            key_id: key.record.id,
            variation_context_id: qa1.record.variation_context_id,
            old_variation_value_id: Some(qa1.record.id),
            new_variation_value_id: Some(update.record.id),
        }
    );

    f.changesets.apply(&admin, update.changeset_id, None).await.unwrap();
    let tx = f.persistence.begin().await.unwrap();
    let old = tx.value_find(qa1.record.id).await.unwrap().unwrap();
    let new = tx.value_find(update.record.id).await.unwrap().unwrap();
    tx.rollback().await.unwrap();
    assert!(old.validity.has_ended());
    assert!(new.validity.is_live());
    assert!(old.validity.valid_to.unwrap() < new.validity.valid_from.unwrap());
}

#[tokio::test]
async fn test_default_value_cannot_be_deleted() {
    let f = fixture();
    let world = live_world(&f).await;
    let admin = admin();

    let key = f
        .authoring
        .create_key(&admin, key_request(world.feature_version.id, "timeout"))
        .await
        .unwrap();
    f.changesets.apply(&admin, key.changeset_id, None).await.unwrap();

    let tx = f.persistence.begin().await.unwrap();
    let default_value = tx
        .value_find_live(key.record.id, DEFAULT_VARIATION_CONTEXT_ID)
        .await
        .unwrap()
        .unwrap();
    tx.rollback().await.unwrap();

    let err = f
        .authoring
        .delete_value(&admin, default_value.id)
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::InvalidOperation(_)));
}

#[tokio::test]
async fn test_concurrent_value_is_reported_as_duplicate_variation() {
    let f = fixture();
    let world = live_world(&f).await;
    let (env_id, _) = env_property(&f, &world).await;
    let admin = admin();

    let key = f
        .authoring
        .create_key(&admin, key_request(world.feature_version.id, "timeout"))
        .await
        .unwrap();
    f.changesets.apply(&admin, key.changeset_id, None).await.unwrap();

    let x = user(
        2,
        StaticPermissions::new().grant_key(key.record.id, PermissionLevel::Write),
    );
    let pending = f
        .authoring
        .set_value(&x, set_value(&world, key.record.id, env_id, "prod", "5"))
        .await
        .unwrap();
    let winner = f
        .authoring
        .set_value(&admin, set_value(&world, key.record.id, env_id, "prod", "6"))
        .await
        .unwrap();
    f.changesets.apply(&admin, winner.changeset_id, None).await.unwrap();

    let views = f
        .changesets
        .changes_with_conflicts(pending.changeset_id)
        .await
        .unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(
        views[0].conflict,
        Some(ConflictKind::NewValueDuplicateVariation)
    );
}

#[tokio::test]
async fn test_validator_edit_conflicts_with_earlier_value_change() {
    let f = fixture();
    let world = live_world(&f).await;
    let admin = admin();

    let key = f
        .authoring
        .create_key(&admin, key_request(world.feature_version.id, "timeout"))
        .await
        .unwrap();
    f.changesets.apply(&admin, key.changeset_id, None).await.unwrap();

    let tx = f.persistence.begin().await.unwrap();
    let default_value = tx
        .value_find_live(key.record.id, DEFAULT_VARIATION_CONTEXT_ID)
        .await
        .unwrap()
        .unwrap();
    tx.rollback().await.unwrap();

    let author = user(
        2,
        StaticPermissions::new().grant_key(key.record.id, PermissionLevel::Write),
    );
    let mut request = SetValueRequest {
        key_id: key.record.id,
        service_type_id: world.service_type_id,
        variation: HashMap::new(),
        data: "45".to_string(),
    };
    let pending = f.authoring.set_value(&author, request.clone()).await.unwrap();
    assert_eq!(pending.record.variation_context_id, default_value.variation_context_id);

    let err = f
        .authoring
        .update_key_validators(&admin, key.record.id, Some("not json"))
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::InvalidInput(_)));

    f.authoring
        .update_key_validators(&admin, key.record.id, Some(r#"[{"type":"range","min":1}]"#))
        .await
        .unwrap();

    let views = f
        .changesets
        .changes_with_conflicts(pending.changeset_id)
        .await
        .unwrap();
    assert_eq!(views[0].conflict, Some(ConflictKind::KeyValidatorsUpdated));

    request.data = "50".to_string();
    let err = f.authoring.set_value(&author, request).await.unwrap_err();
    assert!(matches!(err, TesseraError::DuplicateVariation(_)));
}

#[tokio::test]
async fn test_comment_validation() {
    let f = fixture_with(ChangesetOptions {
        max_comment_length: 10,
    });
    let user = user(2, StaticPermissions::new());
    let id = f
        .changesets
        .ensure_changeset_for_user(&user)
        .await
        .unwrap()
        .open_changeset_id
        .unwrap();

    let err = f.changesets.comment(&user, id, "   ").await.unwrap_err();
    assert!(matches!(err, TesseraError::InvalidInput(_)));
    let err = f
        .changesets
        .comment(&user, id, "far too long for the limit")
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::InvalidInput(_)));
    let err = f
        .changesets
        .commit(&user, id, Some("far too long for the limit"))
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::InvalidInput(_)));

    f.changesets.discard(&user, id, None).await.unwrap();
    let action = f.changesets.comment(&user, id, "oops").await.unwrap();
    assert_eq!(action.action_type, ActionType::Comment);
    assert_eq!(action.comment.as_deref(), Some("oops"));
    assert_eq!(
        f.changesets.get_changeset(id).await.unwrap().state,
        ChangesetState::Discarded
    );

    let err = f.changesets.comment(&user, 9_999, "hello").await.unwrap_err();
    assert!(matches!(err, TesseraError::RecordNotFound(_)));
}

#[tokio::test]
async fn test_version_numbers_follow_live_and_pending_versions() {
    let f = fixture();
    let world = live_world(&f).await;
    let admin = admin();
    let feature_id = world.feature_version.feature_id;

    let v2 = f.authoring.create_feature_version(&admin, feature_id).await.unwrap();
    let v3 = f.authoring.create_feature_version(&admin, feature_id).await.unwrap();
    assert_eq!(v2.record.version, 2);
    assert_eq!(v3.record.version, 3);

    let views = f.changesets.changes_with_conflicts(v2.changeset_id).await.unwrap();
    assert!(views.iter().all(|v| v.conflict.is_none()));

    let sv2 = f
        .authoring
        .create_service_version(&admin, world.service_version.service_id)
        .await
        .unwrap();
    assert_eq!(sv2.record.version, 2);
}

#[tokio::test]
async fn test_publish_requires_live_version_and_admin() {
    let f = fixture();
    let world = live_world(&f).await;
    let writer = user(
        2,
        StaticPermissions::new()
            .grant_service(world.service_version.service_id, PermissionLevel::Write),
    );

    let err = f
        .authoring
        .publish_service_version(&writer, world.service_version.id)
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::PermissionDenied(_)));

    let published = f
        .authoring
        .publish_service_version(&admin(), world.service_version.id)
        .await
        .unwrap();
    assert!(published.published);

    // Unlinking from a published version is flagged
    let tx = f.persistence.begin().await.unwrap();
    let link = tx
        .link_find_live(world.feature_version.feature_id, world.service_version.id)
        .await
        .unwrap()
        .unwrap();
    tx.rollback().await.unwrap();

    let unlink = f.authoring.unlink_feature(&admin(), link.id).await.unwrap();
    let views = f
        .changesets
        .changes_with_conflicts(unlink.changeset_id)
        .await
        .unwrap();
    assert_eq!(
        views[0].conflict,
        Some(ConflictKind::ChangeInPublishedServiceVersion)
    );
}

#[tokio::test]
async fn test_apply_refuses_conflicting_changeset() {
    let f = fixture();
    let world = live_world(&f).await;
    let (env_id, _) = env_property(&f, &world).await;
    let billing = add_service(&f, &world, "billing").await;
    let admin = admin();
    let feature_id = world.feature_version.feature_id;

    let key = f
        .authoring
        .create_key(&admin, key_request(world.feature_version.id, "timeout"))
        .await
        .unwrap();
    f.changesets.apply(&admin, key.changeset_id, None).await.unwrap();

    let x = user(
        2,
        StaticPermissions::new()
            .grant_key(key.record.id, PermissionLevel::Write)
            .grant_feature(feature_id, PermissionLevel::Write)
            .grant_service(billing.service_id, PermissionLevel::Write),
    );
    let y = user(
        3,
        StaticPermissions::new()
            .grant_feature(feature_id, PermissionLevel::Write)
            .grant_service(billing.service_id, PermissionLevel::Admin),
    );

    let x_value = f
        .authoring
        .set_value(&x, set_value(&world, key.record.id, env_id, "prod", "5"))
        .await
        .unwrap();
    let x_link = f
        .authoring
        .link_feature(&x, world.feature_version.id, billing.id)
        .await
        .unwrap();
    assert_eq!(x_value.changeset_id, x_link.changeset_id);
    let id = x_value.changeset_id;

    let y_link = f
        .authoring
        .link_feature(&y, world.feature_version.id, billing.id)
        .await
        .unwrap();
    f.changesets.apply(&y, y_link.changeset_id, None).await.unwrap();
    let winner = f
        .authoring
        .set_value(&admin, set_value(&world, key.record.id, env_id, "prod", "6"))
        .await
        .unwrap();
    f.changesets.apply(&admin, winner.changeset_id, None).await.unwrap();

    let conflicts: Vec<Option<ConflictKind>> = f
        .changesets
        .changes_with_conflicts(id)
        .await
        .unwrap()
        .iter()
        .map(|v| v.conflict)
        .collect();
    assert_eq!(
        conflicts,
        vec![
            Some(ConflictKind::NewValueDuplicateVariation),
            Some(ConflictKind::DuplicateLink),
        ]
    );

    f.changesets.commit(&x, id, None).await.unwrap();
    let err = f.changesets.apply(&admin, id, None).await.unwrap_err();
    assert!(matches!(err, TesseraError::InvalidOperation(_)));
    assert!(err.to_string().contains("NEW_VALUE_DUPLICATE_VARIATION"));

    let changeset = f.changesets.get_changeset(id).await.unwrap();
    assert_eq!(changeset.state, ChangesetState::Committed);
    assert_eq!(changeset.applied_at, None);

    let tx = f.persistence.begin().await.unwrap();
    let live = tx
        .value_find_live(key.record.id, winner.record.variation_context_id)
        .await
        .unwrap()
        .unwrap();
    let x_value_row = tx.value_find(x_value.record.id).await.unwrap().unwrap();
    let x_link_row = tx.link_find(x_link.record.id).await.unwrap().unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(live.id, winner.record.id);
    assert!(x_value_row.validity.is_pending());
    assert!(x_link_row.validity.is_pending());
}

#[tokio::test]
async fn test_apply_keeps_end_of_already_deleted_key() {
    let f = fixture();
    let world = live_world(&f).await;
    let admin = admin();

    let key = f
        .authoring
        .create_key(&admin, key_request(world.feature_version.id, "timeout"))
        .await
        .unwrap();
    f.changesets.apply(&admin, key.changeset_id, None).await.unwrap();

    let x = user(
        2,
        StaticPermissions::new().grant_key(key.record.id, PermissionLevel::Write),
    );
    let late = f.authoring.delete_key(&x, key.record.id).await.unwrap();
    let first = f.authoring.delete_key(&admin, key.record.id).await.unwrap();
    f.changesets.apply(&admin, first.changeset_id, None).await.unwrap();

    let tx = f.persistence.begin().await.unwrap();
    let ended = tx.key_find(key.record.id).await.unwrap().unwrap();
    tx.rollback().await.unwrap();
    assert!(ended.validity.has_ended());

    f.changesets.commit(&x, late.changeset_id, None).await.unwrap();
    let err = f
        .changesets
        .apply(&admin, late.changeset_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::InvalidOperation(_)));

    let tx = f.persistence.begin().await.unwrap();
    let after = tx.key_find(key.record.id).await.unwrap().unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(after.validity, ended.validity);
    assert_eq!(
        f.changesets.get_changeset(late.changeset_id).await.unwrap().state,
        ChangesetState::Committed
    );
}

#[tokio::test]
async fn test_variation_grant_allows_value_writes_in_its_context() {
    let f = fixture();
    let world = live_world(&f).await;
    let (env_id, _) = env_property(&f, &world).await;
    let admin = admin();

    let key = f
        .authoring
        .create_key(&admin, key_request(world.feature_version.id, "timeout"))
        .await
        .unwrap();
    let prod = f
        .authoring
        .set_value(&admin, set_value(&world, key.record.id, env_id, "prod", "5"))
        .await
        .unwrap();
    f.changesets.apply(&admin, key.changeset_id, None).await.unwrap();
    let prod_context_id = prod.record.variation_context_id;

    let operator = user(
        2,
        StaticPermissions::new().grant_variation(
            world.service_version.service_id,
            prod_context_id,
            PermissionLevel::Write,
        ),
    );

    let update = f
        .authoring
        .set_value(&operator, set_value(&world, key.record.id, env_id, "prod", "7"))
        .await
        .unwrap();
    assert_eq!(update.record.variation_context_id, prod_context_id);
    let changes = f.changesets.list_changes(update.changeset_id).await.unwrap();
    assert_eq!(changes[0].change_type, ChangeType::Update);

    // Only one pending change per context and changeset
    f.changesets
        .discard_change(&operator, changes[0].id)
        .await
        .unwrap();
    let tx = f.persistence.begin().await.unwrap();
    assert!(tx.value_find(update.record.id).await.unwrap().is_none());
    tx.rollback().await.unwrap();

    let deletion = f.authoring.delete_value(&operator, prod.record.id).await.unwrap();
    assert_eq!(deletion.changeset_id, update.changeset_id);

    let err = f
        .authoring
        .set_value(&operator, set_value(&world, key.record.id, env_id, "qa1", "9"))
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::PermissionDenied(_)));

    let tx = f.persistence.begin().await.unwrap();
    let default_value = tx
        .value_find_live(key.record.id, DEFAULT_VARIATION_CONTEXT_ID)
        .await
        .unwrap()
        .unwrap();
    tx.rollback().await.unwrap();
    let err = f
        .authoring
        .delete_value(&operator, default_value.id)
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::PermissionDenied(_)));
}
