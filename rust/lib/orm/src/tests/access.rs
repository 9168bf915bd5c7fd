use crate::condition::Condition;
use crate::security::{Permission, RecordRule};
use crate::value::{RecordData, Value};

use super::models::GROUP1;
use super::{ADMIN, USER2, fixture, user};

#[test]
fn create_needs_a_grant() {
    let fx = fixture();
    fx.registry.security().add_membership(USER2, GROUP1).unwrap();
    let peter = || RecordData::new().set("Name", "Peter Smith");

    let err = fx
        .simulate(USER2, |env| {
            env.pool("User")?.create(peter())?;
            Ok(())
        })
        .unwrap_err();
    assert!(err.is_permission(), "{err}");

    fx.registry.allow_group("User", "Create", GROUP1, None).unwrap();
    fx.simulate(USER2, |env| {
        let created = env.pool("User")?.create(peter())?;
        assert_eq!(created.get("CreateUID")?, Value::Integer(USER2));
        // Creating does not grant reading.
        let err = created.load(&[]).unwrap_err();
        assert!(err.is_permission(), "{err}");
        Ok(())
    })
    .unwrap();

    fx.registry.revoke_group("User", "Create", GROUP1).unwrap();
    let err = fx
        .simulate(USER2, |env| {
            env.pool("User")?.create(peter())?;
            Ok(())
        })
        .unwrap_err();
    assert!(err.is_permission(), "{err}");
}

#[test]
fn grants_can_be_limited_to_a_caller() {
    let fx = fixture();
    fx.registry.security().add_membership(USER2, GROUP1).unwrap();
    fx.registry.allow_group("User", "Create", GROUP1, None).unwrap();
    let with_resume = || {
        RecordData::new()
            .set("Name", "Peter Smith")
            .create("Resume", RecordData::new().set("Education", "MIT"))
    };

    fx.registry
        .allow_group("Resume", "Create", GROUP1, Some(("User", "Write")))
        .unwrap();
    let err = fx
        .simulate(USER2, |env| {
            env.pool("User")?.create(with_resume())?;
            Ok(())
        })
        .unwrap_err();
    assert!(err.is_permission(), "{err}");

    fx.registry
        .allow_group("Resume", "Create", GROUP1, Some(("User", "Create")))
        .unwrap();
    fx.simulate(USER2, |env| {
        let created = env.pool("User")?.create(with_resume())?;
        assert_eq!(created.get_records("Resume")?.len(), 1);
        // The delegated grant does not cover direct calls.
        let err = env
            .pool("Resume")?
            .create(RecordData::new().set("Education", "MIT"))
            .unwrap_err();
        assert!(err.is_permission(), "{err}");
        Ok(())
    })
    .unwrap();

    fx.registry.revoke_group("Resume", "Create", GROUP1).unwrap();
    let err = fx
        .simulate(USER2, |env| {
            env.pool("User")?.create(with_resume())?;
            Ok(())
        })
        .unwrap_err();
    assert!(err.is_permission(), "{err}");

    assert!(fx.registry.allow_group("User", "Create", "nobody", None).is_err());
    assert!(fx.registry.allow_group("User", "Fly", GROUP1, None).is_err());
}

#[test]
fn loading_needs_a_grant() {
    let fx = fixture();
    fx.registry.security().add_membership(USER2, GROUP1).unwrap();
    fx.simulate(USER2, |env| {
        // Searching is public and fills the cache.
        let users = env.pool("User")?.search_all()?;
        assert_eq!(users.len(), 3);
        assert_eq!(users.get("Name")?, Value::from("John Smith"));

        let err = users.load(&["Name"]).unwrap_err();
        assert!(err.is_permission(), "{err}");
        env.registry().allow_group("User", "Load", GROUP1, None)?;
        assert_eq!(users.load(&["Name"])?.len(), 3);

        let profile = user(env, "Jane Smith")?.get_records("Profile")?;
        let err = profile.get("City").unwrap_err();
        assert!(err.is_permission(), "{err}");
        Ok(())
    })
    .unwrap();
}

#[test]
fn writes_through_a_delegated_method() {
    let fx = fixture();
    fx.registry.security().add_membership(USER2, GROUP1).unwrap();
    let update_city = |city: &'static str| {
        fx.simulate(USER2, move |env| {
            let jane = user(env, "Jane Smith")?;
            jane.call("UpdateCity", vec![city.into()])?;
            let profile = jane.sudo().get_records("Profile")?.force_load(&[])?;
            Ok(profile.get("City")?)
        })
    };

    assert!(update_city("Paris").unwrap_err().is_permission());
    fx.registry.allow_group("User", "UpdateCity", GROUP1, None).unwrap();
    assert!(update_city("Paris").unwrap_err().is_permission());
    fx.registry
        .allow_group("Profile", "Write", GROUP1, Some(("User", "UpdateCity")))
        .unwrap();
    assert_eq!(update_city("Paris").unwrap(), Value::from("Paris"));

    let err = fx
        .simulate(USER2, |env| {
            let jane = user(env, "Jane Smith")?;
            jane.get_records("Profile")?.set("City", "London")?;
            Ok(())
        })
        .unwrap_err();
    assert!(err.is_permission(), "{err}");
}

#[test]
fn unlink_needs_a_grant() {
    let fx = fixture();
    fx.registry.security().add_membership(USER2, GROUP1).unwrap();
    let unlink_will = || {
        fx.simulate(USER2, |env| {
            let will = user(env, "Will Smith")?;
            will.unlink()
        })
    };
    assert!(unlink_will().unwrap_err().is_permission());
    fx.registry.allow_group("User", "Unlink", GROUP1, None).unwrap();
    assert_eq!(unlink_will().unwrap(), 1);
}

#[test]
fn sudo_bypasses_grants_and_rules() {
    let fx = fixture();
    fx.registry
        .add_record_rule(
            "User",
            RecordRule::global("nobody", Condition::field("Name").equals("Nobody"), Permission::ALL),
        )
        .unwrap();
    fx.simulate(USER2, |env| {
        assert!(env.pool("User")?.search_all()?.is_empty());
        let admin = env.sudo();
        assert!(admin.is_superuser());
        assert_eq!(admin.pool("User")?.search_all()?.len(), 3);
        admin.pool("Tag")?.create(RecordData::new().set("Name", "Sudo"))?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn record_rules_filter_and_guard_records() {
    let fx = fixture();
    let security = fx.registry.security();
    security.add_membership(USER2, GROUP1).unwrap();
    for method in ["Load", "Write", "Unlink"] {
        fx.registry.allow_group("User", method, GROUP1, None).unwrap();
    }
    fx.registry
        .add_record_rule(
            "User",
            RecordRule::new("jOnly", GROUP1, Condition::field("Name").icontains("j"), Permission::ALL),
        )
        .unwrap();

    let will_id = fx.simulate(ADMIN, |env| Ok(user(env, "Will Smith")?.id())).unwrap();
    fx.simulate(USER2, |env| {
        let users = env.pool("User")?;
        assert_eq!(users.search_all()?.len(), 2);
        assert_eq!(users.search_count(Condition::all())?, 2);
        assert!(user(env, "Will Smith")?.is_empty());

        let will = users.browse(&[will_id])?;
        assert!(will.load(&[])?.is_empty());
        let err = will.write(RecordData::new().set("Nums", 5)).unwrap_err();
        assert!(err.is_permission(), "{err}");
        let err = will.unlink().unwrap_err();
        assert!(err.is_permission(), "{err}");

        let jane = user(env, "Jane Smith")?;
        jane.set("Nums", 5)?;
        assert_eq!(jane.force_load(&[])?.get("Nums")?, Value::Integer(5));
        Ok(())
    })
    .unwrap();

    // Global rules restrict on top of group rules.
    fx.registry
        .add_record_rule(
            "User",
            RecordRule::global("staff", Condition::field("IsStaff").equals(true), Permission::READ),
        )
        .unwrap();
    fx.simulate(USER2, |env| {
        let visible = env.pool("User")?.search_all()?;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible.get("Name")?, Value::from("John Smith"));
        Ok(())
    })
    .unwrap();
    fx.simulate(ADMIN, |env| {
        assert_eq!(env.pool("User")?.search_all()?.len(), 3);
        Ok(())
    })
    .unwrap();

    fx.registry.remove_record_rule("User", "jOnly").unwrap();
    fx.registry.remove_record_rule("User", "staff").unwrap();
    fx.simulate(USER2, |env| {
        assert_eq!(env.pool("User")?.search_all()?.len(), 3);
        Ok(())
    })
    .unwrap();
}

#[test]
fn record_rules_hold_for_records_cached_by_sudo() {
    let fx = fixture();
    fx.registry.security().add_membership(USER2, GROUP1).unwrap();
    fx.registry.allow_group("User", "Load", GROUP1, None).unwrap();
    fx.registry
        .add_record_rule(
            "User",
            RecordRule::new("jOnly", GROUP1, Condition::field("Name").icontains("j"), Permission::READ),
        )
        .unwrap();

    let (will_id, jane_id) = fx
        .simulate(ADMIN, |env| Ok((user(env, "Will Smith")?.id(), user(env, "Jane Smith")?.id())))
        .unwrap();
    fx.simulate(USER2, |env| {
        // Fills the cache shared with the user's environment.
        assert_eq!(env.pool("User")?.sudo().search_all()?.len(), 3);

        let users = env.pool("User")?;
        let will = users.browse(&[will_id])?;
        assert_eq!(will.load(&["Name"])?.len(), 0);
        assert!(will.load(&[])?.is_empty());
        assert_eq!(will.get("Name")?, Value::from(""));
        assert_eq!(will.get("Nums")?, Value::Integer(0));
        assert!(will.read(&["Name"])?.is_empty());

        let both = users.browse(&[jane_id, will_id])?;
        assert_eq!(both.load(&["Name"])?.ids(), [jane_id]);
        let jane = users.browse(&[jane_id])?;
        assert_eq!(jane.get("Name")?, Value::from("Jane Smith"));

        // The superuser still sees everything.
        assert_eq!(will.sudo().get("Name")?, Value::from("Will Smith"));
        Ok(())
    })
    .unwrap();
}

#[test]
fn groups_imply_their_parents() {
    let fx = fixture();
    let security = fx.registry.security();
    security.register_group("group2", "Group 2", &[GROUP1]).unwrap();
    security.add_membership(3, "group2").unwrap();
    fx.registry.allow_group("User", "Load", GROUP1, None).unwrap();

    let load = || {
        fx.simulate(3, |env| {
            let users = env.pool("User")?.search_all()?;
            Ok(users.load(&[])?.len())
        })
    };
    assert_eq!(load().unwrap(), 3);
    security.remove_membership(3, "group2");
    assert!(load().unwrap_err().is_permission());
}
