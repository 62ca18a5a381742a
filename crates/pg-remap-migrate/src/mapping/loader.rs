//! YAML mapping file parsing.

use super::{ColumnMapping, CustomRule, Mapping, MappingRule, TargetColumn};
use crate::error::{MigrateError, Result};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const COPY: &str = "__copy__";
const FORGET: &str = "__forget__";
const MOVED: &str = "__moved__";
const REF_PREFIX: &str = "__ref__";

/// Custom rules available to mapping files, referenced as `@name`.
#[derive(Default, Clone)]
pub struct CustomRules {
    rules: HashMap<String, Arc<dyn CustomRule>>,
}

impl CustomRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, rule: impl CustomRule + 'static) {
        self.rules.insert(name.into(), Arc::new(rule));
    }

    fn get(&self, name: &str) -> Option<Arc<dyn CustomRule>> {
        self.rules.get(name).cloned()
    }
}

#[derive(Debug, Default, Deserialize)]
struct MappingFile {
    #[serde(default)]
    rules: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    discriminators: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    deferred: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    stored_fields: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    foreign_keys: BTreeMap<String, String>,
}

impl Mapping {
    pub(super) fn merge_yaml(&mut self, yaml: &str, custom: &CustomRules) -> Result<()> {
        let file: MappingFile = serde_yaml::from_str(yaml)?;

        for (table, columns) in file.rules {
            for (column, value) in columns {
                let origin = format!("{}.{}", table, column);
                let mapping = parse_column(&origin, value, custom)?;
                self.set_rule(&table, &column, mapping);
            }
        }
        for (table, columns) in file.discriminators {
            self.set_discriminators(&table, columns);
        }
        for (table, columns) in file.deferred {
            self.set_deferred(&table, columns);
        }
        for (table, columns) in file.stored_fields {
            self.set_stored_fields(&table, columns);
        }
        for (field, target) in file.foreign_keys {
            self.declare_foreign_key(&field, &target);
        }
        Ok(())
    }
}

fn parse_column(origin: &str, value: Value, custom: &CustomRules) -> Result<Option<ColumnMapping>> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(false) => Ok(Some(ColumnMapping::Forget)),
        Value::String(s) if s == COPY => Ok(Some(ColumnMapping::Copy)),
        Value::String(s) if s == FORGET => Ok(Some(ColumnMapping::Forget)),
        Value::Mapping(targets) => {
            let mut parsed = Vec::with_capacity(targets.len());
            for (target, rule) in targets {
                let target = target.as_str().ok_or_else(|| {
                    MigrateError::Mapping(format!("{}: target keys must be strings", origin))
                })?;
                parsed.push((TargetColumn::parse(target)?, parse_rule(origin, rule, custom)?));
            }
            Ok(Some(ColumnMapping::Targets(parsed)))
        }
        other => Err(MigrateError::Mapping(format!(
            "{}: unsupported column mapping {:?}",
            origin, other
        ))),
    }
}

fn parse_rule(origin: &str, value: Value, custom: &CustomRules) -> Result<MappingRule> {
    let directive = match value {
        Value::Null => return Ok(MappingRule::Copy),
        Value::Bool(false) => return Ok(MappingRule::Forget),
        Value::String(s) => s,
        other => {
            return Err(MigrateError::Mapping(format!(
                "{}: unsupported rule {:?}",
                origin, other
            )))
        }
    };
    let directive = directive.trim();

    if directive == COPY {
        return Ok(MappingRule::Copy);
    }
    if directive == FORGET {
        return Ok(MappingRule::Forget);
    }
    if directive == MOVED {
        return Ok(MappingRule::Moved);
    }
    if let Some(rest) = directive.strip_prefix(REF_PREFIX) {
        let companion = rest.trim();
        if companion.is_empty() || rest.len() == companion.len() {
            return Err(MigrateError::Mapping(format!(
                "{}: '{}' must name its companion column",
                origin, REF_PREFIX
            )));
        }
        return Ok(MappingRule::Reference {
            companion: companion.to_string(),
        });
    }
    if let Some(name) = directive.strip_prefix('@') {
        let rule = custom.get(name).ok_or_else(|| {
            MigrateError::Mapping(format!("{}: custom rule '{}' is not registered", origin, name))
        })?;
        return Ok(MappingRule::Custom {
            name: name.to_string(),
            rule,
        });
    }

    Err(MigrateError::Mapping(format!(
        "{}: unknown directive '{}'",
        origin, directive
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{CustomOutcome, MappingLookup};
    use crate::record::{SourceRecord, TargetRows};

    const BASE: &str = r#"
rules:
  res_partner:
    id: __copy__
    name:
      res_partner.name: __copy__
    comment: __forget__
    notify_email: ~
    _:
      res_partner.display_name: "@display_name"
  res_partner_address:
    id:
      res_partner.id: __moved__
    active: false
  ir_property:
    res_id:
      ir_property.res_id: __ref__ res_id
  mail_message:
    res_id:
      mail_message.res_id: __ref__ model
      mail_message.model: ~
discriminators:
  res_partner: [name]
deferred:
  res_partner: [parent_id]
stored_fields:
  res_partner: [display_name]
foreign_keys:
  ir_property.company_id: res_company
"#;

    fn custom() -> CustomRules {
        let mut rules = CustomRules::new();
        rules.register("display_name", |source: &SourceRecord, _: &TargetRows| {
            CustomOutcome::Value(source.get("name").unwrap_or_default().to_uppercase())
        });
        rules
    }

    #[test]
    fn test_parse_directives() {
        let mapping = Mapping::from_yaml(BASE, &custom()).unwrap();

        assert!(matches!(
            mapping.resolve("res_partner", "id"),
            Some(ColumnMapping::Copy)
        ));
        assert!(matches!(
            mapping.resolve("res_partner", "comment"),
            Some(ColumnMapping::Forget)
        ));
        assert!(matches!(
            mapping.resolve("res_partner_address", "active"),
            Some(ColumnMapping::Forget)
        ));
        assert!(mapping.resolve("res_partner", "notify_email").is_none());
        assert!(mapping.resolve("res_partner", "missing").is_none());

        match mapping.resolve("mail_message", "res_id") {
            Some(ColumnMapping::Targets(targets)) => {
                assert_eq!(targets.len(), 2);
                assert!(targets.iter().any(|(t, r)| t.column == "res_id"
                    && matches!(r, MappingRule::Reference { companion } if companion == "model")));
                assert!(targets
                    .iter()
                    .any(|(t, r)| t.column == "model" && matches!(r, MappingRule::Copy)));
            }
            other => panic!("unexpected mapping {:?}", other),
        }

        match mapping.resolve("res_partner", "_") {
            Some(ColumnMapping::Targets(targets)) => {
                assert!(matches!(&targets[0].1, MappingRule::Custom { name, .. } if name == "display_name"));
            }
            other => panic!("unexpected mapping {:?}", other),
        }

        assert_eq!(mapping.discriminators("res_partner"), ["name".to_string()]);
        assert_eq!(mapping.deferred("res_partner"), ["parent_id".to_string()]);
        assert!(mapping.deferred("res_users").is_empty());
        assert_eq!(mapping.stored_columns()["res_partner"], vec!["display_name"]);
        assert_eq!(mapping.foreign_keys()["ir_property.company_id"], "res_company");
    }

    #[test]
    fn test_later_documents_override() {
        let mut mapping = Mapping::from_yaml(BASE, &custom()).unwrap();
        mapping
            .merge_yaml(
                r#"
rules:
  res_partner:
    comment: __copy__
    name: ~
discriminators:
  res_partner: [name, parent_id]
"#,
                &custom(),
            )
            .unwrap();

        assert!(matches!(
            mapping.resolve("res_partner", "comment"),
            Some(ColumnMapping::Copy)
        ));
        assert!(mapping.resolve("res_partner", "name").is_none());
        assert_eq!(mapping.discriminators("res_partner").len(), 2);
    }

    #[test]
    fn test_unregistered_custom_rule_rejected() {
        let err = Mapping::from_yaml(BASE, &CustomRules::new()).unwrap_err();
        assert!(err.to_string().contains("display_name"));
    }

    #[test]
    fn test_unknown_directive_rejected() {
        let yaml = r#"
rules:
  res_partner:
    name:
      res_partner.name: __rename__
"#;
        assert!(Mapping::from_yaml(yaml, &CustomRules::new()).is_err());

        let yaml = r#"
rules:
  res_partner:
    name:
      res_partner.name: __ref__
"#;
        assert!(Mapping::from_yaml(yaml, &CustomRules::new()).is_err());
    }
}
