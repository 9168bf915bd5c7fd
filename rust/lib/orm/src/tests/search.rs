use std::sync::Arc;

use openerp_core::OrmError;
use openerp_sql::SqliteStore;

use crate::condition::{Condition, Operator};
use crate::environment::Environment;
use crate::i18n::StaticCatalog;
use crate::recordset::RecordSet;
use crate::registry::RegistryBuilder;
use crate::security::{Permission, RecordRule};
use crate::value::{RecordData, Value};

use super::models::GROUP1;
use super::{ADMIN, USER2, find, fixture, models, user};

fn names(rs: &RecordSet, field: &str) -> Result<Vec<String>, OrmError> {
    let mut out = Vec::new();
    for rec in rs.records() {
        out.push(rec.get(field)?.as_str().unwrap_or_default().to_string());
    }
    Ok(out)
}

#[test]
fn search_and_order() {
    let fx = fixture();
    fx.simulate(ADMIN, |env| {
        let users = env.pool("User")?;
        assert_eq!(users.search_all()?.len(), 3);
        assert_eq!(users.search(Condition::field("IsStaff").equals(true))?.len(), 2);
        assert_eq!(users.search_count(Condition::field("Name").icontains("SMITH"))?, 3);
        assert_eq!(users.search_count(Condition::field("Nums").greater(1))?, 2);

        let ordered = users.search_all()?.order_by(&["Name"])?;
        assert_eq!(names(&ordered, "Name")?, ["Jane Smith", "John Smith", "Will Smith"]);
        let reversed = ordered.order_by(&["Name desc"])?;
        assert_eq!(names(&reversed, "Name")?, ["Will Smith", "John Smith", "Jane Smith"]);
        assert_eq!(names(&ordered.limit(2)?, "Name")?, ["Jane Smith", "John Smith"]);
        assert_eq!(names(&ordered.limit(2)?.offset(1)?, "Name")?, ["John Smith", "Will Smith"]);

        let sorted = users.search_all()?.sorted_by_field("Nums", true)?;
        assert_eq!(names(&sorted, "Name")?, ["Will Smith", "Jane Smith", "John Smith"]);

        let fetched = users.search(Condition::field("IsStaff").equals(true))?;
        fetched.first().set("IsStaff", false)?;
        assert_eq!(fetched.fetch()?.len(), 1);
        Ok(())
    })
    .unwrap();
}

#[test]
fn grouped_queries() {
    let fx = fixture();
    fx.simulate(ADMIN, |env| {
        let users = env.pool("User")?;
        let grouped = users.search_all()?.group_by(&["IsStaff"])?;
        let rows = grouped.aggregates(&["IsStaff", "Nums"])?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].values.get("IsStaff"), Some(&Value::Bool(false)));
        assert_eq!(rows[0].values.get("Nums"), Some(&Value::Integer(2)));
        assert_eq!(rows[0].count, 1);
        assert_eq!(rows[1].values.get("IsStaff"), Some(&Value::Bool(true)));
        assert_eq!(rows[1].values.get("Nums"), Some(&Value::Integer(4)));
        assert_eq!(rows[1].count, 2);
        assert_eq!(users.search_count(rows[1].condition.clone())?, 2);

        // Grouping keeps the collection's own condition.
        let staff = users.search(Condition::field("Nums").greater(1))?;
        let rows = staff.group_by(&["IsStaff"])?.aggregates(&["Nums"])?;
        let counts: Vec<i64> = rows.iter().map(|r| r.count).collect();
        assert_eq!(counts, [1, 1]);

        let err = users.search_all()?.aggregates(&["Nums"]).unwrap_err();
        assert!(err.is_validation(), "{err}");
        let err = grouped.aggregates(&["Name"]).unwrap_err();
        assert!(err.is_validation(), "{err}");
        let err = users.search_all()?.group_by(&["Posts"]).unwrap_err();
        assert!(err.is_validation(), "{err}");
        Ok(())
    })
    .unwrap();
}

#[test]
fn grouped_queries_respect_record_rules() {
    let fx = fixture();
    fx.registry.security().add_membership(USER2, GROUP1).unwrap();
    fx.registry
        .add_record_rule(
            "User",
            RecordRule::new("jOnly", GROUP1, Condition::field("Name").icontains("j"), Permission::READ),
        )
        .unwrap();
    fx.simulate(USER2, |env| {
        let rows = env
            .pool("User")?
            .search_all()?
            .group_by(&["IsStaff"])?
            .aggregates(&["Nums"])?;
        let sums: Vec<(Value, Value, i64)> = rows
            .into_iter()
            .map(|r| {
                let staff = r.values.get("IsStaff").cloned().unwrap_or_default();
                let nums = r.values.get("Nums").cloned().unwrap_or_default();
                (staff, nums, r.count)
            })
            .collect();
        assert_eq!(
            sums,
            [
                (Value::Bool(false), Value::Integer(2), 1),
                (Value::Bool(true), Value::Integer(1), 1),
            ]
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn default_order_and_combinations() {
    let fx = fixture();
    fx.simulate(ADMIN, |env| {
        let users = env.pool("User")?;
        let by_name = users.search_all()?.order_by(&["Name desc"])?;
        assert_eq!(names(&by_name, "Name")?, ["Will Smith", "John Smith", "Jane Smith"]);
        let restored = by_name.sorted_default()?;
        assert_eq!(names(&restored, "Name")?, ["John Smith", "Jane Smith", "Will Smith"]);

        let jane = user(env, "Jane Smith")?;
        let john = user(env, "John Smith")?;
        let will = user(env, "Will Smith")?;
        let pairs = jane.union(&john)?.cartesian_product(&[will.union(&jane)?])?;
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs[0].ids(), [jane.id(), will.id()]);
        assert_eq!(pairs[1].ids(), [jane.id()]);
        assert_eq!(pairs[2].ids(), [john.id(), will.id()]);
        assert_eq!(pairs[3].ids(), [john.id(), jane.id()]);
        assert!(jane.cartesian_product(&[])?[0].equals(&jane));

        let tags = env.pool("Tag")?.search_all()?;
        let err = jane.cartesian_product(&[tags]).unwrap_err();
        assert!(err.is_validation(), "{err}");
        Ok(())
    })
    .unwrap();
}

#[test]
fn empty_collections_read_zero_values() {
    let fx = fixture();
    fx.simulate(ADMIN, |env| {
        let nobody = user(env, "Nobody")?;
        assert!(nobody.is_empty());
        assert_eq!(nobody.id(), 0);
        assert_eq!(nobody.get("Name")?, Value::from(""));
        assert_eq!(nobody.get("Nums")?, Value::Integer(0));
        assert_eq!(nobody.get("IsStaff")?, Value::Bool(false));
        assert!(nobody.get_records("Posts")?.is_empty());
        assert!(nobody.ensure_one().is_err());
        assert_eq!(nobody.name_get()?, "");
        Ok(())
    })
    .unwrap();
}

#[test]
fn relation_conditions() {
    let fx = fixture();
    fx.simulate(ADMIN, |env| {
        let posts = env.pool("Post")?;
        assert_eq!(posts.search_count(Condition::field("Tags").is_in(Vec::<i64>::new()))?, 0);
        assert_eq!(names(&posts.search(Condition::field("Tags").is_null())?, "Title")?, ["Draft"]);
        assert_eq!(names(&posts.search(Condition::field("User").is_null())?, "Title")?, ["Draft"]);
        assert_eq!(posts.search_count(Condition::field("Tags").is_not_null())?, 2);

        let books = find(env, "Tag", "Name", "Books")?;
        assert_eq!(
            names(&posts.search(Condition::field("Tags").equals(books.id()))?, "Title")?,
            ["2nd Post"]
        );
        assert_eq!(posts.search_count(Condition::field("Tags.Name").equals("Jane's"))?, 2);
        assert_eq!(posts.search_count(Condition::field("User.Profile.Age").greater(20))?, 2);
        assert_eq!(posts.search_count(Condition::field("WriterMoney").greater(100))?, 2);

        let comments = env.pool("Comment")?;
        assert_eq!(comments.search_count(Condition::field("Post.User.Name").equals("Jane Smith"))?, 3);

        let users = env.pool("User")?;
        let jane = user(env, "Jane Smith")?;
        assert!(users.search(Condition::field("Posts.Title").equals("2nd Post"))?.equals(&jane));
        let cond = Condition::field("Profile.City")
            .equals("New York")
            .or()
            .field("Name")
            .equals("Will Smith");
        assert_eq!(users.search_count(cond)?, 2);
        let not_john = Condition::field("IsStaff").equals(true).and_not().field("Name").equals("John Smith");
        assert_eq!(names(&users.search(not_john)?, "Name")?, ["Will Smith"]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn set_operations() {
    let fx = fixture();
    fx.simulate(ADMIN, |env| {
        let users = env.pool("User")?;
        let jane = user(env, "Jane Smith")?;
        let john = user(env, "John Smith")?;
        let will = user(env, "Will Smith")?;
        let all = users.search_all()?;

        let pair = jane.union(&john)?;
        assert_eq!(pair.ids(), [jane.id(), john.id()]);
        assert!(all.subtract(&pair)?.equals(&will));
        assert!(all.intersect(&pair)?.equals(&pair));
        assert!(pair.union(&john)?.len() == 2);
        assert!(!pair.equals(&jane));

        let staff = all.filtered(|rec| Ok(rec.get("IsStaff")?.as_bool() == Some(true)))?;
        assert!(staff.equals(&john.union(&will)?));

        let tags = env.pool("Tag")?.search_all()?;
        let err = pair.union(&tags).unwrap_err();
        assert!(err.is_validation(), "{err}");
        Ok(())
    })
    .unwrap();
}

#[test]
fn prefetching_reads_columns_once() {
    let fx = fixture();
    fx.simulate(ADMIN, |env| {
        let users = env.pool("User")?.search_all()?;
        let before = env.sql_query_count();
        for rec in users.records() {
            rec.get("Name")?;
            rec.get("Email")?;
        }
        assert_eq!(env.sql_query_count(), before);

        let records = users.records();
        records[0].get_records("Posts")?;
        let loaded = env.sql_query_count();
        assert!(loaded > before);
        for rec in &records[1..] {
            rec.get_records("Posts")?;
        }
        assert_eq!(env.sql_query_count(), loaded);

        env.invalidate_cache();
        users.get("Name")?;
        assert!(env.sql_query_count() > loaded);
        Ok(())
    })
    .unwrap();
}

#[test]
fn names_and_lookups() {
    let fx = fixture();
    fx.simulate(ADMIN, |env| {
        let jane = user(env, "Jane Smith")?;
        assert_eq!(jane.name_get()?, "Jane Smith");
        assert_eq!(jane.get("DisplayName")?, Value::from("Jane Smith"));

        let profile = jane.get_records("Profile")?;
        assert_eq!(profile.name_get()?, format!("Profile,{}", profile.id()));

        let users = env.pool("User")?;
        let found = users.search_by_name("smith", Operator::IContains, Condition::all(), 0)?;
        assert_eq!(found.len(), 3);
        let found = users.search_by_name("Jane", Operator::IContains, Condition::all(), 0)?;
        assert!(found.equals(&jane));
        let staff = Condition::field("IsStaff").equals(true);
        assert_eq!(users.search_by_name("smith", Operator::IContains, staff, 1)?.len(), 1);

        let tags = env.pool("Tag")?;
        let books = tags.get_record("tag_books")?;
        assert_eq!(books.get("Name")?, Value::from("Books"));
        assert!(tags.get_record("no_such_tag")?.is_empty());
        Ok(())
    })
    .unwrap();
}

#[test]
fn defaults_come_from_fields_and_context() {
    let fx = fixture();
    fx.simulate(ADMIN, |env| {
        let users = env.pool("User")?;
        let defaults = users.default_get()?;
        assert_eq!(defaults.get("Status"), Some(&Value::Integer(12)));
        assert!(defaults.has("ExternalID"));
        assert!(!defaults.has("Nums"));

        let defaults = users
            .with_context("default_nums", 5)
            .with_context("default_Name", "Anonymous")
            .default_get()?;
        assert_eq!(defaults.get("Nums"), Some(&Value::Integer(5)));
        assert_eq!(defaults.get("Name"), Some(&Value::from("Anonymous")));

        let created = users
            .with_context("default_nums", 9)
            .create(RecordData::new().set("Name", "Defaulted"))?;
        assert_eq!(created.get("Nums")?, Value::Integer(9));
        Ok(())
    })
    .unwrap();
}

#[test]
fn recursion_along_parent() {
    let fx = fixture();
    fx.simulate(ADMIN, |env| {
        let trending = find(env, "Tag", "Name", "Trending")?;
        let books = find(env, "Tag", "Name", "Books")?;
        let janes = find(env, "Tag", "Name", "Jane's")?;
        books.set("Parent", trending.id())?;
        janes.set("Parent", books.id())?;
        let tags = env.pool("Tag")?.search_all()?;
        assert!(tags.check_recursion()?);

        trending.set("Parent", janes.id())?;
        assert!(!tags.check_recursion()?);
        assert!(!books.check_recursion()?);

        // Models without a Parent field never loop.
        assert!(user(env, "Jane Smith")?.check_recursion()?);
        Ok(())
    })
    .unwrap();
}

#[test]
fn fields_get_describes_fields() {
    let fx = fixture();
    fx.simulate(ADMIN, |env| {
        let users = env.pool("User")?;
        let infos = users.fields_get(&["Name", "Profile", "Posts", "Age", "DecoratedName"])?;
        assert_eq!(infos.len(), 5);

        let name = &infos["Name"];
        assert_eq!(name.ftype, "char");
        assert_eq!(name.help, "The user's username");
        assert!(name.unique);
        assert!(name.stored);
        let wire = serde_json::to_value(name).unwrap();
        assert_eq!(wire["type"], "char");
        assert_eq!(wire["json"], "name");
        assert!(wire.get("relation").is_none());

        assert_eq!(infos["Profile"].relation.as_deref(), Some("Profile"));
        assert_eq!(infos["Posts"].reverse_fk.as_deref(), Some("User"));
        assert!(!infos["Posts"].stored);
        assert!(!infos["Age"].readonly);
        assert!(infos["DecoratedName"].readonly);
        assert_eq!(infos["DecoratedName"].depends, ["Name", "Email"]);

        let all = users.fields_get(&[])?;
        assert!(all.contains_key("ExternalID"));
        assert!(all.contains_key("Active"));
        assert_eq!(all["Education"].string, "Educational Background");

        let profile = env.pool("Profile")?.fields_get(&["Gender"])?;
        assert_eq!(profile["Gender"].selection.len(), 2);
        Ok(())
    })
    .unwrap();
}

#[test]
fn fields_get_is_translated() {
    let mut b = RegistryBuilder::default();
    models::declare(&mut b).unwrap();
    b.set_translator(Arc::new(
        StaticCatalog::new()
            .add("fr_FR", "User", "Name.string", "Nom")
            .add("fr_FR", "Profile", "Gender.selection.female", "Femme"),
    ));
    let registry = b.finalize().unwrap();
    let store = SqliteStore::open_in_memory().unwrap();
    Environment::simulate(&registry, &store, ADMIN, |env| {
        let fr = env.with_context("lang", "fr_FR");
        let infos = fr.pool("User")?.fields_get(&["Name", "Email"])?;
        assert_eq!(infos["Name"].string, "Nom");
        assert_eq!(infos["Email"].string, "Email");

        let gender = fr.pool("Profile")?.fields_get(&["Gender"])?;
        assert!(gender["Gender"].selection.contains(&("female".to_string(), "Femme".to_string())));

        let en = env.pool("User")?.fields_get(&["Name"])?;
        assert_eq!(en["Name"].string, "Name");
        Ok(())
    })
    .unwrap();
}
