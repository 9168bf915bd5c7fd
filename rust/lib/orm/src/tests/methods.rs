use openerp_sql::SqliteStore;

use crate::environment::Environment;
use crate::method::Payload;
use crate::registry::RegistryBuilder;
use crate::value::{RecordData, Value};

use super::{ADMIN, fixture, user};

#[test]
fn layers_run_outermost_first() {
    let mut b = RegistryBuilder::default();
    b.declare_model("Widget").unwrap();
    b.add_method("Widget", "Stack", "Stack reports its layers.", |_, _, _| Ok("base".into()))
        .unwrap();
    for marker in ["1", "2", "3"] {
        b.extend("Widget", "Stack", "", move |sup, rs, args| {
            let inner = sup.call(rs, args)?.into_string()?;
            Ok(format!("{marker}({inner})").into())
        })
        .unwrap();
    }
    b.add_method("Widget", "Lonely", "", |sup, rs, args| sup.call(rs, args))
        .unwrap();
    let registry = b.finalize().unwrap();

    let stack = registry.model("Widget").unwrap().method("Stack").unwrap();
    assert_eq!(stack.layers().len(), 4);
    assert_eq!(stack.doc(), "Stack reports its layers.");

    let store = SqliteStore::open_in_memory().unwrap();
    registry.sync_schema(&store).unwrap();
    Environment::simulate(&registry, &store, ADMIN, |env| {
        let widgets = env.pool("Widget")?;
        assert_eq!(widgets.call("Stack", Vec::new())?.into_string()?, "3(2(1(base)))");
        let err = widgets.call("Lonely", Vec::new()).unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION");
        Ok(())
    })
    .unwrap();
}

#[test]
fn extending_an_undeclared_method_fails() {
    let mut b = RegistryBuilder::default();
    b.declare_model("Widget").unwrap();
    b.extend("Widget", "Ghost", "", |sup, rs, args| sup.call(rs, args))
        .unwrap();
    let err = b.finalize().unwrap_err();
    assert_eq!(err.error_code(), "CONFIGURATION");
}

#[test]
fn declaring_a_method_twice_fails() {
    let mut b = RegistryBuilder::default();
    b.declare_model("Widget").unwrap();
    b.add_method("Widget", "Twice", "", |_, _, _| Ok(Payload::None))
        .unwrap();
    assert!(b.add_method("Widget", "Twice", "", |_, _, _| Ok(Payload::None)).is_err());
}

#[test]
fn user_methods() {
    let fx = fixture();
    fx.simulate(ADMIN, |env| {
        let jane = user(env, "Jane Smith")?;
        let decorated = jane.call("DecorateEmail", vec!["jane@example.com".into()])?;
        assert_eq!(decorated.into_string()?, "[<jane@example.com>]");

        let lines = jane.call("PrefixedUser", vec!["Prefix".into()])?.into_strings()?;
        assert_eq!(lines, ["Prefix: Jane Smith [<jane.smith@example.com>]"]);
        assert_eq!(
            jane.get("DecoratedName")?,
            Value::from("User: Jane Smith [<jane.smith@example.com>]")
        );

        let res = jane.call("RecursiveMethod", vec![2i64.into(), "Start".into()])?;
        assert_eq!(res.into_string()?, "> > > Start <, recursion 2 <, recursion 1 <");

        // The outer layer swaps the records before calling the base layer.
        let will = user(env, "Will Smith")?;
        let names = will.call("SubSetSuper", Vec::new())?.into_string()?;
        assert_eq!(names, "Jane SmithJohn Smith");
        Ok(())
    })
    .unwrap();
}

#[test]
fn mixin_methods_and_overrides() {
    let fx = fixture();
    let layers: Vec<String> = fx
        .registry
        .model("Profile")
        .unwrap()
        .method("PrintAddress")
        .unwrap()
        .layers()
        .iter()
        .map(|l| l.origin.clone())
        .collect();
    assert_eq!(layers, ["AddressMixIn", "AddressMixIn", "Profile", "Profile"]);

    fx.simulate(ADMIN, |env| {
        let jane = user(env, "Jane Smith")?;
        let profile = jane.get_records("Profile")?;
        let address = profile.call("PrintAddress", Vec::new())?.into_string()?;
        assert_eq!(address, "[<165 5th Avenue, 0305 New York>, USA]");
        assert_eq!(profile.call("SayHello", Vec::new())?.into_string()?, "Hello !");

        // Fields and methods of a mixin inherited by ModelMixin reach every model.
        assert!(!jane.call("IsActivated", Vec::new())?.into_bool()?);
        jane.set("Active", true)?;
        assert!(jane.call("IsActivated", Vec::new())?.into_bool()?);
        let tag = env.pool("Tag")?.create(RecordData::new().set("Name", "Active").set("Active", true))?;
        assert!(tag.call("IsActivated", Vec::new())?.into_bool()?);

        assert!(env.pool("AddressMixIn").is_err());
        Ok(())
    })
    .unwrap();
}
