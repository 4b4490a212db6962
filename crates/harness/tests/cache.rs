use unitwork_core::{EntityRecord, FieldValue, Identity, Key, Version};
use unitwork_harness::{BackendCall, TestDb, init_tracing};
use unitwork_session::{ProxyState, SessionError};

// ============================================================================
// Identity map
// ============================================================================

#[test]
fn get_twice_returns_same_instance() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let db = TestDb::memory();
    let id = db.seed_product(1, "phone", 100.0)?;
    let mut session = db.open_session();

    let first = session.get("Product", 1)?;
    let second = session.get("Product", 1)?;
    assert!(first.same_instance(&second));
    assert_eq!(db.storage.calls(), vec![BackendCall::Read(id)]);
    Ok(())
}

#[test]
fn get_after_modify_returns_modified_instance() -> Result<(), Box<dyn std::error::Error>> {
    let db = TestDb::memory();
    db.seed_product(1, "phone", 100.0)?;
    let mut session = db.open_session();

    let product = session.get("Product", 1)?;
    product.set("price", 1100.0)?;
    let again = session.get("Product", 1)?;
    assert_eq!(again.get("price")?, Some(FieldValue::Float(1100.0)));
    assert_eq!(db.storage.reads(), 1);
    Ok(())
}

#[test]
fn get_missing_row_caches_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let db = TestDb::memory();
    let mut session = db.open_session();

    let err = session.get("Product", 404).unwrap_err();
    assert!(matches!(err, SessionError::NotFound(ref id) if *id == Identity::new("Product", 404)));
    assert_eq!(session.cached_count(), 0);

    // A second attempt goes back to storage.
    assert!(session.get("Product", 404).is_err());
    assert_eq!(db.storage.reads(), 2);
    Ok(())
}

// ============================================================================
// Lazy references
// ============================================================================

#[test]
fn load_defers_the_read_to_first_access() -> Result<(), Box<dyn std::error::Error>> {
    let db = TestDb::memory();
    db.seed_product(1, "phone", 100.0)?;
    let mut session = db.open_session();

    let product = session.load("Product", 1)?;
    assert_eq!(product.state(), ProxyState::Unloaded);
    assert!(db.storage.calls().is_empty());

    assert_eq!(product.get("name")?, Some(FieldValue::Text("phone".into())));
    assert_eq!(product.state(), ProxyState::Loaded);
    product.get("price")?;
    assert_eq!(db.storage.reads(), 1);
    Ok(())
}

#[test]
fn load_of_missing_row_fails_on_access() -> Result<(), Box<dyn std::error::Error>> {
    let db = TestDb::memory();
    let mut session = db.open_session();

    let ghost = session.load("Product", 42)?;
    assert!(matches!(ghost.get("name"), Err(SessionError::NotFound(_))));
    assert!(!ghost.is_initialized());
    Ok(())
}

#[test]
fn load_and_get_share_one_instance() -> Result<(), Box<dyn std::error::Error>> {
    let db = TestDb::memory();
    db.seed_product(1, "phone", 100.0)?;
    let mut session = db.open_session();

    let proxy = session.load("Product", 1)?;
    let loaded = session.get("Product", 1)?;
    assert!(proxy.same_instance(&loaded));
    assert!(proxy.is_initialized());
    assert_eq!(db.storage.reads(), 1);
    Ok(())
}

// ============================================================================
// Save
// ============================================================================

#[test]
fn save_inserts_immediately_and_get_needs_no_io() -> Result<(), Box<dyn std::error::Error>> {
    let db = TestDb::memory();
    let mut session = db.open_session();

    let pen = session.save(
        EntityRecord::new("Product")
            .with("name", "pen")
            .with("price", 2.5),
    )?;
    assert_eq!(
        db.storage.take_calls(),
        vec![BackendCall::Insert {
            entity_type: "Product".into(),
            key: None
        }]
    );
    assert_eq!(pen.version()?, Version::INITIAL);

    let key: Key = pen.identity().key().clone();
    let again = session.get("Product", key)?;
    assert!(again.same_instance(&pen));
    assert!(db.storage.calls().is_empty());
    assert_eq!(db.stored_version(pen.identity())?, Some(Version::INITIAL));
    Ok(())
}

#[test]
fn saved_record_modified_later_is_updated_at_commit() -> Result<(), Box<dyn std::error::Error>> {
    let db = TestDb::memory();
    let mut session = db.open_session();

    let pen = session.save(EntityRecord::new("Product").with("price", 2.5))?;
    let id = pen.identity().clone();
    pen.set("price", 3.0)?;
    db.storage.clear();

    let summary = session.commit()?;
    assert_eq!(summary.updated, vec![(id.clone(), Version::new(1))]);
    assert_eq!(
        db.storage.writes(),
        vec![BackendCall::ConditionalUpdate {
            identity: id.clone(),
            expected: Version::INITIAL
        }]
    );
    assert_eq!(db.stored_field(&id, "price")?, Some(FieldValue::Float(3.0)));
    Ok(())
}

#[test]
fn client_keyed_save_is_inserted_at_commit() -> Result<(), Box<dyn std::error::Error>> {
    let db = TestDb::memory();
    let mut session = db.open_session();

    let mug = session.save(EntityRecord::with_key("Product", 7).with("name", "mug"))?;
    assert!(db.storage.calls().is_empty());
    assert!(session.is_dirty()?);

    // Later changes are folded into the insert.
    mug.set("price", 9.0)?;
    let summary = session.commit()?;
    assert_eq!(summary.inserted, vec![Identity::new("Product", 7)]);
    assert!(summary.updated.is_empty());
    assert_eq!(
        db.storage.writes(),
        vec![BackendCall::Insert {
            entity_type: "Product".into(),
            key: Some(Key::Int(7))
        }]
    );
    let id = Identity::new("Product", 7);
    assert_eq!(db.stored_version(&id)?, Some(Version::INITIAL));
    assert_eq!(db.stored_field(&id, "price")?, Some(FieldValue::Float(9.0)));
    Ok(())
}

#[test]
fn saving_a_cached_identity_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let db = TestDb::memory();
    db.seed_product(1, "phone", 100.0)?;
    let mut session = db.open_session();

    session.get("Product", 1)?;
    let err = session
        .save(EntityRecord::with_key("Product", 1).with("name", "clone"))
        .unwrap_err();
    assert!(matches!(err, SessionError::DuplicateIdentity(_)));
    assert!(db.storage.writes().is_empty());
    Ok(())
}

#[test]
fn client_key_taken_in_storage_fails_at_commit() -> Result<(), Box<dyn std::error::Error>> {
    let db = TestDb::memory();
    db.seed_product(1, "phone", 100.0)?;
    let mut session = db.open_session();

    session.save(EntityRecord::with_key("Product", 1).with("name", "clone"))?;
    let err = session.commit().unwrap_err();
    assert!(matches!(err, SessionError::Storage(_)));
    assert_eq!(db.stored_field(&Identity::new("Product", 1), "name")?, Some("phone".into()));
    Ok(())
}

#[test]
fn generated_key_skips_pending_client_key() -> Result<(), Box<dyn std::error::Error>> {
    let db = TestDb::memory();
    let mut session = db.open_session();

    session.save(EntityRecord::with_key("Order", 1).with("name", "car"))?;
    let bike = session.save(EntityRecord::new("Order").with("name", "bike"))?;
    assert_eq!(bike.identity(), &Identity::new("Order", 2));
    // The colliding insert was taken back before the key was redrawn.
    assert_eq!(db.stored(&Identity::new("Order", 1))?, None);

    let summary = session.commit()?;
    assert_eq!(summary.inserted, vec![Identity::new("Order", 1)]);
    assert_eq!(
        db.stored_field(&Identity::new("Order", 1), "name")?,
        Some("car".into())
    );
    assert_eq!(
        db.stored_field(&Identity::new("Order", 2), "name")?,
        Some("bike".into())
    );
    Ok(())
}

#[test]
fn generated_key_skips_unresolved_proxy() -> Result<(), Box<dyn std::error::Error>> {
    let db = TestDb::memory();
    let mut session = db.open_session();

    let ghost = session.load("Order", 1)?;
    let order = session.save(EntityRecord::new("Order").with("name", "car"))?;
    assert_eq!(order.identity(), &Identity::new("Order", 2));
    assert_eq!(db.stored(&Identity::new("Order", 1))?, None);
    assert!(matches!(ghost.get("name"), Err(SessionError::NotFound(_))));
    Ok(())
}
