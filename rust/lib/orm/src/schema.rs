use std::collections::BTreeSet;

use openerp_core::OrmError;
use openerp_sql::{SQLStore, quote_ident};
use tracing::{debug, info};

use crate::environment::sql_err;
use crate::field::{Field, FieldType};
use crate::model::Model;
use crate::query::Dialect;
use crate::registry::{ID_FIELD, Registry};

impl Registry {
    /// Create missing tables, link tables and indexes. Existing tables are
    /// left untouched.
    pub fn sync_schema(&self, store: &dyn SQLStore) -> Result<(), OrmError> {
        let statements = self.schema_statements(Dialect::from_driver(store.driver_name()));
        for sql in &statements {
            debug!(sql = %sql, "sync schema");
            store.exec(sql, &[]).map_err(sql_err)?;
        }
        info!(statements = statements.len(), "schema synchronized");
        Ok(())
    }

    /// DDL of every engine-managed table, in declaration order.
    pub fn schema_statements(&self, dialect: Dialect) -> Vec<String> {
        let mut tables = Vec::new();
        let mut links = Vec::new();
        let mut indexes = Vec::new();
        let mut seen_links = BTreeSet::new();
        for model in self.models().filter(|m| m.has_table()) {
            tables.push(self.create_table(model, dialect));
            for field in model.fields() {
                if field.def.index && field.is_stored() && field.name != ID_FIELD {
                    indexes.push(create_index(model, field));
                }
                if let Some(link) = &field.link {
                    if seen_links.insert(link.table.clone()) {
                        links.push(self.create_link(model, field));
                    }
                }
            }
        }
        tables.extend(links);
        tables.extend(indexes);
        tables
    }

    fn create_table(&self, model: &Model, dialect: Dialect) -> String {
        let mut defs = vec![match dialect {
            Dialect::Sqlite => "\"id\" INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
            Dialect::Postgres => "\"id\" SERIAL PRIMARY KEY".to_string(),
        }];
        for field in model.fields().filter(|f| f.is_stored() && f.name != ID_FIELD) {
            defs.push(self.column_def(field));
        }
        for c in &model.sql_constraints {
            defs.push(format!("CONSTRAINT {} CHECK ({})", quote_ident(&c.name), c.check));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&model.table),
            defs.join(", ")
        )
    }

    fn column_def(&self, field: &Field) -> String {
        let column = field.column.as_deref().unwrap_or_default();
        let mut def = format!("{} {}", quote_ident(column), field.ftype().sql_type());
        if field.unique() || field.ftype() == FieldType::One2One {
            def.push_str(" UNIQUE");
        }
        if let Some(target) = field.relation.filter(|_| field.ftype().is_fk()) {
            def.push_str(&format!(
                " REFERENCES {}(\"id\") ON DELETE {}",
                quote_ident(&self.model_by_id(target).table),
                field.def.on_delete.sql()
            ));
        }
        def
    }

    fn create_link(&self, model: &Model, field: &Field) -> String {
        let Some(link) = &field.link else {
            return String::new();
        };
        let target = field
            .relation
            .map(|id| self.model_by_id(id).table.as_str())
            .unwrap_or_default();
        format!(
            "CREATE TABLE IF NOT EXISTS {table} ({ours} INTEGER NOT NULL REFERENCES {own}(\"id\") ON DELETE CASCADE, \
             {theirs} INTEGER NOT NULL REFERENCES {target}(\"id\") ON DELETE CASCADE, PRIMARY KEY ({ours}, {theirs}))",
            table = quote_ident(&link.table),
            ours = quote_ident(&link.ours),
            theirs = quote_ident(&link.theirs),
            own = quote_ident(&model.table),
            target = quote_ident(target),
        )
    }
}

fn create_index(model: &Model, field: &Field) -> String {
    let column = field.column.as_deref().unwrap_or_default();
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&format!("{}_{}_index", model.table, column)),
        quote_ident(&model.table),
        quote_ident(column)
    )
}

#[cfg(test)]
mod tests {
    use openerp_core::RuntimeConfig;

    use crate::field::{FieldDef, OnDelete};
    use crate::registry::RegistryBuilder;
    use crate::query::Dialect;

    #[test]
    fn ddl_of_a_small_registry() {
        let mut b = RegistryBuilder::new(RuntimeConfig::default());
        b.declare_model("Tag").unwrap();
        b.declare_model("Post").unwrap();
        b.add_fields("Tag", [("Name", FieldDef::char().index()), ("Rate", FieldDef::float())])
            .unwrap();
        b.add_fields(
            "Post",
            [
                ("Title", FieldDef::char().required()),
                ("Parent", FieldDef::many2one("Post").on_delete(OnDelete::Cascade)),
                ("Tags", FieldDef::many2many("Tag")),
            ],
        )
        .unwrap();
        b.add_sql_constraint("Tag", "rate_range", "rate >= 0").unwrap();
        let registry = b.finalize().unwrap();
        let ddl = registry.schema_statements(Dialect::Sqlite);

        let tag = ddl.iter().find(|s| s.contains("EXISTS \"tag\" ")).unwrap();
        assert!(tag.contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(tag.contains("\"external_id\" TEXT UNIQUE"));
        assert!(tag.contains("\"rate\" REAL"));
        assert!(tag.contains("CONSTRAINT \"rate_range\" CHECK (rate >= 0)"));

        let post = ddl.iter().find(|s| s.contains("EXISTS \"post\" ")).unwrap();
        assert!(post.contains("\"parent_id\" INTEGER REFERENCES \"post\"(\"id\") ON DELETE CASCADE"));
        assert!(!post.contains("tags"));

        let links: Vec<_> = ddl.iter().filter(|s| s.contains("post_tag_rel")).collect();
        assert_eq!(links.len(), 1);
        assert!(links[0].contains("PRIMARY KEY (\"post_id\", \"tag_id\")"));
        assert!(ddl.iter().any(|s| s.contains("\"tag_name_index\"")));
    }
}
