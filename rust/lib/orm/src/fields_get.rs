use serde::Serialize;

use crate::field::Field;
use crate::i18n::Translator;
use crate::model::Model;

/// Field metadata for clients, localized at read time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldInfo {
    pub name: String,
    pub json: String,
    #[serde(rename = "type")]
    pub ftype: String,
    pub string: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub help: String,
    pub required: bool,
    pub readonly: bool,
    pub stored: bool,
    pub unique: bool,
    pub translate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse_fk: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub selection: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
}

impl FieldInfo {
    pub(crate) fn describe(
        model: &Model,
        field: &Field,
        relation: Option<&str>,
        lang: &str,
        translator: &dyn Translator,
    ) -> Self {
        let tr = |key: String, fallback: &str| translator.translate(lang, &model.name, &key, fallback);
        FieldInfo {
            name: field.name.clone(),
            json: field.json.clone(),
            ftype: field.ftype().to_string(),
            string: tr(format!("{}.string", field.name), field.label()),
            help: if field.help().is_empty() {
                String::new()
            } else {
                tr(format!("{}.help", field.name), field.help())
            },
            required: field.required(),
            readonly: field.readonly() || (field.is_computed() && field.inverse().is_none()),
            stored: field.is_stored(),
            unique: field.unique(),
            translate: field.translate(),
            relation: relation.map(str::to_string),
            reverse_fk: field.reverse_fk().map(str::to_string),
            selection: field
                .selection()
                .iter()
                .map(|(k, label)| (k.clone(), tr(format!("{}.selection.{k}", field.name), label)))
                .collect(),
            depends: field.depends().to_vec(),
        }
    }
}
