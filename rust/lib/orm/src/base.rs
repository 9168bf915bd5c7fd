//! Built-in mixins every registry starts with.
//!
//! `CommonMixin` carries the CRUD, search and introspection methods,
//! `BaseMixin` adds audit fields and `ModelMixin` an external id. Regular
//! models inherit `ModelMixin`; manual and transient models `BaseMixin`.

use openerp_core::new_id;

use crate::condition::{Condition, Operator};
use crate::crud;
use crate::field::FieldDef;
use crate::method::{Payload, arg};
use crate::onchange;
use crate::registry::RegistryBuilder;
use crate::value::Value;

pub const COMMON_MIXIN: &str = "CommonMixin";
pub const BASE_MIXIN: &str = "BaseMixin";
pub const MODEL_MIXIN: &str = "ModelMixin";

/// Methods granted to the `everyone` group on every model.
pub(crate) const PUBLIC_METHODS: &[&str] = &[
    "Search",
    "SearchAll",
    "SearchCount",
    "Browse",
    "BrowseOne",
    "Fetch",
    "GroupBy",
    "Aggregates",
    "NameGet",
    "SearchByName",
    "FieldsGet",
    "DefaultGet",
    "New",
    "Onchange",
    "CheckRecursion",
    "GetRecord",
    "ComputeLastUpdate",
    "ComputeDisplayName",
];

/// Declare the built-in mixins. Nothing here can fail: the mixins are
/// created first and their members are plain constants.
pub(crate) fn declare_builtins(b: &mut RegistryBuilder) {
    b.declare_system_mixin(COMMON_MIXIN, &[]);
    b.declare_system_mixin(BASE_MIXIN, &[COMMON_MIXIN]);
    b.declare_system_mixin(MODEL_MIXIN, &[BASE_MIXIN]);
    declare_crud(b);
    declare_search(b);
    declare_misc(b);
    declare_base(b);
    declare_model(b);
}

// ── CRUD ────────────────────────────────────────────────────────────

fn declare_crud(b: &mut RegistryBuilder) {
    b.system_method(
        COMMON_MIXIN,
        "Create",
        "Create inserts a record from the given data and returns it.",
        |_, rs, args| Ok(crud::create(rs, arg(&args, 0).into_data()?)?.into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "Write",
        "Write updates every record of the collection with the given data.",
        |_, rs, args| Ok(crud::write(rs, arg(&args, 0).into_data()?)?.into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "Unlink",
        "Unlink deletes the records and returns how many were deleted.",
        |_, rs, _| Ok(crud::unlink(rs)?.into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "Load",
        "Load fetches the given fields, all stored ones when empty, into the cache.",
        |_, rs, args| Ok(rs.do_load(&arg(&args, 0).into_fields()?, false)?.into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "Read",
        "Read returns the given fields of every readable record.",
        |_, rs, args| Ok(Payload::DataList(rs.do_read(&arg(&args, 0).into_fields()?)?)),
    );
    b.system_method(
        COMMON_MIXIN,
        "New",
        "New creates an in-memory record that is never written to storage.",
        |_, rs, args| Ok(crud::new_record(rs, arg(&args, 0).into_data()?)?.into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "CopyData",
        "CopyData returns the data to create a copy of this record.",
        |_, rs, args| Ok(rs.do_copy_data(&arg(&args, 0).into_data()?)?.into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "Copy",
        "Copy duplicates this record, overriding values with the given data.",
        |_, rs, args| {
            let data = rs.do_copy_data(&arg(&args, 0).into_data()?)?;
            Ok(rs.do_browse(Vec::new()).create(data)?.into())
        },
    );
}

// ── Search ──────────────────────────────────────────────────────────

fn declare_search(b: &mut RegistryBuilder) {
    b.system_method(
        COMMON_MIXIN,
        "Search",
        "Search returns the records matching the condition.",
        |_, rs, args| Ok(rs.do_search(arg(&args, 0).into_condition()?)?.into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "SearchAll",
        "SearchAll returns every readable record.",
        |_, rs, _| Ok(rs.do_search(Condition::all())?.into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "SearchCount",
        "SearchCount counts the records matching the condition.",
        |_, rs, args| Ok(rs.do_search_count(arg(&args, 0).into_condition()?)?.into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "Browse",
        "Browse returns a collection of the given ids without reading them.",
        |_, rs, args| Ok(rs.do_browse(arg(&args, 0).into_value()?.ids()).into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "BrowseOne",
        "BrowseOne returns a collection of the given id without reading it.",
        |_, rs, args| Ok(rs.do_browse(vec![arg(&args, 0).into_i64()?]).into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "Fetch",
        "Fetch runs again the query of this collection.",
        |_, rs, _| Ok(rs.do_fetch()?.into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "GroupBy",
        "GroupBy returns this collection with its query grouped by the given fields.",
        |_, rs, args| Ok(rs.do_group_by(&arg(&args, 0).into_fields()?)?.into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "Aggregates",
        "Aggregates runs a grouped query and sums the given numeric fields per group.",
        |_, rs, args| Ok(Payload::Groups(rs.do_aggregates(&arg(&args, 0).into_fields()?)?)),
    );
    b.system_method(
        COMMON_MIXIN,
        "SearchByName",
        "SearchByName searches records by their name.",
        |_, rs, args| {
            let name = arg(&args, 0).into_string()?;
            let op = match arg(&args, 1).into_string()? {
                s if s.is_empty() => Operator::IContains,
                s => s.parse::<Operator>()?,
            };
            let cond = arg(&args, 2).into_condition()?;
            let limit = match arg(&args, 3) {
                Payload::None => 0,
                p => p.into_i64()?.max(0) as usize,
            };
            Ok(rs.do_search_by_name(&name, op, cond, limit)?.into())
        },
    );
}

// ── Introspection and forms ─────────────────────────────────────────

fn declare_misc(b: &mut RegistryBuilder) {
    b.system_method(
        COMMON_MIXIN,
        "NameGet",
        "NameGet returns the display name of the first record.",
        |_, rs, _| Ok(rs.do_name_get()?.into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "FieldsGet",
        "FieldsGet describes the given fields, all of them when empty.",
        |_, rs, args| {
            Ok(Payload::FieldInfos(
                rs.do_fields_get(&arg(&args, 0).into_fields()?)?,
            ))
        },
    );
    b.system_method(
        COMMON_MIXIN,
        "DefaultGet",
        "DefaultGet returns the default values of a new record.",
        |_, rs, _| Ok(rs.do_default_get()?.into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "CheckRecursion",
        "CheckRecursion returns false if following Parent loops.",
        |_, rs, _| Ok(rs.do_check_recursion()?.into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "GetRecord",
        "GetRecord returns the record with the given external id.",
        |_, rs, args| Ok(rs.do_get_record(&arg(&args, 0).into_string()?)?.into()),
    );
    b.system_method(
        COMMON_MIXIN,
        "Onchange",
        "Onchange returns the values modified by the onchange hooks of the changed fields.",
        |_, rs, args| {
            let params = arg(&args, 0).into_onchange_params()?;
            Ok(Payload::Onchange(onchange::onchange(rs, &params)?))
        },
    );
}

// ── BaseMixin and ModelMixin ────────────────────────────────────────

fn declare_base(b: &mut RegistryBuilder) {
    b.system_method(
        BASE_MIXIN,
        "ComputeLastUpdate",
        "ComputeLastUpdate returns the last write date, or the creation date.",
        |_, rs, _| {
            let written = rs.get("WriteDate")?;
            let value = match written {
                Value::Char(s) if !s.is_empty() => Value::Char(s),
                _ => rs.get("CreateDate")?,
            };
            Ok(value.into())
        },
    );
    b.system_method(
        BASE_MIXIN,
        "ComputeDisplayName",
        "ComputeDisplayName returns the record's NameGet.",
        |_, rs, _| Ok(rs.name_get()?.into()),
    );
    b.system_fields(
        BASE_MIXIN,
        [
            ("CreateDate", FieldDef::datetime().no_copy().readonly()),
            ("CreateUID", FieldDef::integer().no_copy().readonly()),
            ("WriteDate", FieldDef::datetime().no_copy().readonly()),
            ("WriteUID", FieldDef::integer().no_copy().readonly()),
            (
                "LastUpdate",
                FieldDef::datetime()
                    .string("Last Updated On")
                    .compute("ComputeLastUpdate")
                    .depends(&["WriteDate", "CreateDate"]),
            ),
            (
                "DisplayName",
                FieldDef::char().string("Name").compute("ComputeDisplayName"),
            ),
        ],
    );
}

fn declare_model(b: &mut RegistryBuilder) {
    b.system_fields(
        MODEL_MIXIN,
        [(
            "ExternalID",
            FieldDef::char()
                .string("Record External ID")
                .unique()
                .index()
                .no_copy()
                .default(|_| Value::Char(new_id())),
        )],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_mixins_are_declared() {
        let registry = RegistryBuilder::default().finalize().unwrap();
        let model = registry.model(MODEL_MIXIN).unwrap();
        assert!(model.is_mixin());
        assert_eq!(model.linearization, vec![COMMON_MIXIN, BASE_MIXIN, MODEL_MIXIN]);
        for name in ["ExternalID", "CreateDate", "WriteUID", "DisplayName"] {
            assert!(model.has_field(name), "missing {name}");
        }
        for name in ["Create", "Onchange", "ComputeLastUpdate"] {
            assert!(model.method(name).is_some(), "missing {name}");
        }
    }

    #[test]
    fn builtins_are_in_place_before_user_declarations() {
        let mut b = RegistryBuilder::default();
        let err = b
            .add_method(COMMON_MIXIN, "Create", "", |_, _, _| Ok(Payload::None))
            .unwrap_err();
        assert!(err.to_string().contains("CommonMixin.Create"), "{err}");
        let err = b
            .add_fields(MODEL_MIXIN, [("ExternalID", FieldDef::char())])
            .unwrap_err();
        assert!(err.to_string().contains("ExternalID"), "{err}");
        b.extend(COMMON_MIXIN, "Create", "", |sup, rs, args| sup.call(rs, args))
            .unwrap();
        let registry = b.finalize().unwrap();
        let common = registry.model(COMMON_MIXIN).unwrap();
        assert_eq!(common.method("Create").unwrap().layers().len(), 2);
    }

    #[test]
    fn public_methods_exist_on_models() {
        let registry = RegistryBuilder::default().finalize().unwrap();
        let model = registry.model(MODEL_MIXIN).unwrap();
        for name in PUBLIC_METHODS {
            assert!(model.method(name).is_some(), "missing {name}");
        }
    }
}
