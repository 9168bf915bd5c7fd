//! Scenario tests run against a seeded in-memory database.

mod access;
mod methods;
mod search;

use std::sync::Arc;

use openerp_core::{OrmError, RuntimeConfig};
use openerp_sql::{SQLStore, SqliteStore};

use crate::condition::Condition;
use crate::environment::Environment;
use crate::recordset::RecordSet;
use crate::registry::{Registry, RegistryBuilder};
use crate::value::{RecordData, RecordId};

pub const ADMIN: RecordId = 1;
pub const USER2: RecordId = 2;

pub struct Fixture {
    pub registry: Arc<Registry>,
    pub store: SqliteStore,
}

impl Fixture {
    /// Run `f` in a transaction that is rolled back afterwards.
    pub fn simulate<T>(
        &self,
        uid: RecordId,
        f: impl FnOnce(&Environment) -> Result<T, OrmError>,
    ) -> Result<T, OrmError> {
        Environment::simulate(&self.registry, &self.store, uid, f)
    }

    /// Run `f` in a transaction committed on success.
    pub fn execute<T>(
        &self,
        uid: RecordId,
        f: impl FnOnce(&Environment) -> Result<T, OrmError>,
    ) -> Result<T, OrmError> {
        Environment::execute(&self.registry, &self.store, uid, f)
    }
}

/// Fresh registry and database holding the seed records.
pub fn fixture() -> Fixture {
    let mut b = RegistryBuilder::new(RuntimeConfig::default());
    models::declare(&mut b).unwrap();
    let registry = b.finalize().unwrap();
    let store = SqliteStore::open_in_memory().unwrap();
    registry.sync_schema(&store).unwrap();
    store.exec(models::USER_VIEW_SQL, &[]).unwrap();
    let fx = Fixture { registry, store };
    fx.execute(ADMIN, seed).unwrap();
    fx
}

fn seed(env: &Environment) -> Result<(), OrmError> {
    let tags = env.pool("Tag")?;
    let trending = tags.create(RecordData::new().set("Name", "Trending"))?;
    let books = tags.create(
        RecordData::new()
            .set("Name", "Books")
            .set("ExternalID", "tag_books"),
    )?;
    let janes = tags.create(RecordData::new().set("Name", "Jane's"))?;

    let users = env.pool("User")?;
    users.create(
        RecordData::new()
            .set("Name", "John Smith")
            .set("Email", "jsmith@example.com")
            .set("IsStaff", true)
            .set("Nums", 1),
    )?;
    let jane = users.create(
        RecordData::new()
            .set("Name", "Jane Smith")
            .set("Email", "jane.smith@example.com")
            .set("Nums", 2)
            .create(
                "Profile",
                RecordData::new()
                    .set("Age", 23)
                    .set("Money", 12345)
                    .set("Street", "165 5th Avenue")
                    .set("City", "New York")
                    .set("Zip", "0305")
                    .set("Country", "USA"),
            )
            .create(
                "Posts",
                RecordData::new()
                    .set("Title", "1st Post")
                    .set("Content", "Content of first post")
                    .set("Tags", trending.union(&janes)?.ids().to_vec()),
            )
            .create(
                "Posts",
                RecordData::new()
                    .set("Title", "2nd Post")
                    .set("Content", "Content of second post")
                    .set("Tags", vec![books.id(), janes.id()]),
            ),
    )?;
    users.create(
        RecordData::new()
            .set("Name", "Will Smith")
            .set("Email", "will.smith@example.com")
            .set("IsStaff", true)
            .set("Nums", 3),
    )?;

    let post1 = find(env, "Post", "Title", "1st Post")?;
    jane.get_records("Profile")?.set("BestPost", post1.id())?;
    let comments = env.pool("Comment")?;
    for text in ["First Comment", "Another Comment", "Third Comment"] {
        comments.create(RecordData::new().set("Post", post1.id()).set("Text", text))?;
    }
    env.pool("Post")?.create(RecordData::new().set("Title", "Draft"))?;
    Ok(())
}

/// Records of `model` whose `field` equals `value`.
pub fn find(env: &Environment, model: &str, field: &str, value: &str) -> Result<RecordSet, OrmError> {
    env.pool(model)?.search(Condition::field(field).equals(value))
}

pub fn user(env: &Environment, name: &str) -> Result<RecordSet, OrmError> {
    find(env, "User", "Name", name)
}

#[test]
fn committed_work_survives_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let config = RuntimeConfig {
        sqlite_path: Some(dir.path().join("records.db")),
        ..RuntimeConfig::default()
    };
    let mut b = RegistryBuilder::new(config.clone());
    models::declare(&mut b).unwrap();
    let registry = b.finalize().unwrap();

    let store = crate::connect(&config).unwrap();
    registry.sync_schema(&store).unwrap();
    Environment::execute(&registry, &store, ADMIN, |env| {
        env.pool("Tag")?.create(RecordData::new().set("Name", "Kept"))?;
        Ok(())
    })
    .unwrap();
    let err = Environment::execute(&registry, &store, ADMIN, |env| {
        env.pool("Tag")?.create(RecordData::new().set("Name", "Dropped"))?;
        Err::<(), _>(OrmError::Validation("abort".into()))
    })
    .unwrap_err();
    assert!(err.is_validation());
    drop(store);

    let store = crate::connect(&config).unwrap();
    registry.sync_schema(&store).unwrap();
    Environment::simulate(&registry, &store, ADMIN, |env| {
        let tags = env.pool("Tag")?.search_all()?;
        assert_eq!(tags.len(), 1);
        assert_eq!(tags.name_get()?, "Kept");
        Ok(())
    })
    .unwrap();
}
