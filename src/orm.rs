//! Composite-type object mapping.
//!
//! A model class is registered against a Postgres composite type. Once
//! registered, any result cell of that type decodes to a [`Model`] instead of
//! a plain value. Field metadata (attribute names and type oids) is captured
//! from the catalog at registration time; if the type is altered afterwards,
//! the caster re-fetches the metadata and retries the decode exactly once.

use crate::db::decode::CompositeValue;
use crate::error::{Error, Result};
use crate::rows::Cell;
use indexmap::IndexMap;
use sqlx::PgConnection;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// A class of models, registerable against a composite type.
///
/// Implementations describe themselves (name, optional default type name,
/// optional parent class for registration checks) and may override
/// [`construct`](ModelClass::construct) to customize instantiation.
pub trait ModelClass: Send + Sync {
    /// The class name, used in registration bookkeeping and error messages.
    fn class_name(&self) -> &'static str;

    /// The composite type this class binds to when registration does not
    /// name one explicitly.
    fn type_name(&self) -> Option<&str> {
        None
    }

    /// The parent class name, if any. Registration checks can match a class
    /// through its descendants.
    fn parent(&self) -> Option<&'static str> {
        None
    }

    /// Build a model instance from decoded composite fields.
    fn construct(&self, type_name: &str, fields: IndexMap<String, Cell>) -> Model {
        Model::new(self.class_name(), type_name, fields)
    }
}

/// A plain model class described by data, for callers that do not need a
/// custom type per composite.
#[derive(Debug, Clone)]
pub struct ModelDef {
    pub class_name: &'static str,
    pub type_name: Option<&'static str>,
    pub parent: Option<&'static str>,
}

impl ModelDef {
    pub fn new(class_name: &'static str) -> Self {
        Self {
            class_name,
            type_name: None,
            parent: None,
        }
    }

    pub fn with_type(mut self, type_name: &'static str) -> Self {
        self.type_name = Some(type_name);
        self
    }

    pub fn with_parent(mut self, parent: &'static str) -> Self {
        self.parent = Some(parent);
        self
    }
}

impl ModelClass for ModelDef {
    fn class_name(&self) -> &'static str {
        self.class_name
    }

    fn type_name(&self) -> Option<&str> {
        self.type_name
    }

    fn parent(&self) -> Option<&'static str> {
        self.parent
    }
}

/// One decoded composite value.
///
/// The fields that came from the database are read-only: model code is meant
/// to write to the database first and then sync local state through
/// [`set_attributes`](Model::set_attributes). Attributes with names the
/// database never produced can be attached freely.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    class_name: &'static str,
    type_name: String,
    fields: IndexMap<String, Cell>,
    extras: IndexMap<String, Cell>,
}

impl Model {
    pub fn new(
        class_name: &'static str,
        type_name: impl Into<String>,
        fields: IndexMap<String, Cell>,
    ) -> Self {
        Self {
            class_name,
            type_name: type_name.into(),
            fields,
            extras: IndexMap::new(),
        }
    }

    pub fn class_name(&self) -> &'static str {
        self.class_name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Look up an attribute: database fields first, then extras.
    pub fn get(&self, name: &str) -> Option<&Cell> {
        self.fields.get(name).or_else(|| self.extras.get(name))
    }

    /// Iterate over the database fields in column order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Cell)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Set a non-field attribute. Assigning to a database field is refused;
    /// use [`set_attributes`](Model::set_attributes) after writing to the
    /// database instead.
    pub fn set(&mut self, name: impl Into<String>, cell: Cell) -> Result<()> {
        let name = name.into();
        if self.fields.contains_key(&name) {
            return Err(Error::read_only(name));
        }
        self.extras.insert(name, cell);
        Ok(())
    }

    /// Sync database fields after a write. Every name must be an existing
    /// field; unknown names are collected and reported together.
    pub fn set_attributes(&mut self, updates: IndexMap<String, Cell>) -> Result<()> {
        let unknown: Vec<String> = updates
            .keys()
            .filter(|k| !self.fields.contains_key(*k))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(Error::UnknownAttributes { names: unknown });
        }
        for (name, cell) in updates {
            self.fields.insert(name, cell);
        }
        Ok(())
    }
}

/// Attribute metadata for a composite type, captured from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasterMeta {
    pub attnames: Vec<String>,
    pub atttypes: Vec<u32>,
}

const ATTRIBUTE_QUERY: &str = "\
SELECT a.attname, a.atttypid
FROM pg_type t
JOIN pg_attribute a ON a.attrelid = t.typrelid
WHERE t.typname = $1 AND a.attnum > 0 AND NOT a.attisdropped
ORDER BY a.attnum";

/// Fetch attribute metadata for a composite type. Returns None when the type
/// has no attributes in the catalog, which covers both missing types and
/// non-composite ones.
pub(crate) async fn fetch_composite_meta(
    conn: &mut PgConnection,
    type_name: &str,
) -> Result<Option<CasterMeta>> {
    use sqlx::Row as _;

    let rows = sqlx::query(ATTRIBUTE_QUERY)
        .bind(type_name)
        .fetch_all(&mut *conn)
        .await?;
    if rows.is_empty() {
        return Ok(None);
    }
    let mut attnames = Vec::with_capacity(rows.len());
    let mut atttypes = Vec::with_capacity(rows.len());
    for row in &rows {
        let name: String = row.try_get(0)?;
        let oid: sqlx::postgres::types::Oid = row.try_get(1)?;
        attnames.push(name);
        atttypes.push(oid.0);
    }
    Ok(Some(CasterMeta { attnames, atttypes }))
}

/// Decodes composite values of one type into models.
pub struct Caster {
    type_name: String,
    model: Arc<dyn ModelClass>,
    meta: RwLock<Arc<CasterMeta>>,
    /// Serializes metadata re-fetches so concurrent decode failures refresh
    /// the catalog once.
    refresh: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Caster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caster")
            .field("type_name", &self.type_name)
            .field("class_name", &self.model.class_name())
            .finish_non_exhaustive()
    }
}

impl Caster {
    fn new(type_name: &str, model: Arc<dyn ModelClass>, meta: CasterMeta) -> Self {
        Self {
            type_name: type_name.to_string(),
            model,
            meta: RwLock::new(Arc::new(meta)),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    fn meta(&self) -> Arc<CasterMeta> {
        match self.meta.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Decode a raw composite value into a model cell. On a shape mismatch
    /// the catalog metadata is re-fetched and the decode retried exactly
    /// once; a second failure surfaces the original error.
    pub(crate) async fn decode(
        &self,
        conn: &mut PgConnection,
        value: CompositeValue<'_>,
    ) -> Result<Cell> {
        let meta = self.meta();
        let first_err = match self.decode_with(&meta, value) {
            Ok(cell) => return Ok(cell),
            Err(err) => err,
        };

        let _guard = self.refresh.lock().await;
        let current = self.meta();
        let meta = if Arc::ptr_eq(&current, &meta) {
            warn!(
                type_name = %self.type_name,
                "composite decode failed; re-fetching type metadata"
            );
            let fresh = fetch_composite_meta(conn, &self.type_name)
                .await?
                .ok_or_else(|| Error::NoSuchType {
                    type_name: self.type_name.clone(),
                })?;
            let fresh = Arc::new(fresh);
            match self.meta.write() {
                Ok(mut guard) => *guard = fresh.clone(),
                Err(poisoned) => *poisoned.into_inner() = fresh.clone(),
            }
            fresh
        } else {
            // Another task already refreshed while we waited.
            current
        };

        self.decode_with(&meta, value).map_err(|_| first_err)
    }

    fn decode_with(&self, meta: &CasterMeta, value: CompositeValue<'_>) -> Result<Cell> {
        let raw_fields = value.fields().map_err(Error::Decode)?;
        if raw_fields.len() != meta.attnames.len() {
            return Err(Error::Decode(format!(
                "composite value for {:?} has {} fields, catalog metadata has {}",
                self.type_name,
                raw_fields.len(),
                meta.attnames.len()
            )));
        }
        let fields: IndexMap<String, Cell> = meta
            .attnames
            .iter()
            .zip(raw_fields.iter())
            .zip(meta.atttypes.iter())
            .map(|((name, field), declared_oid)| {
                (name.clone(), Cell::Value(field.decode(*declared_oid)))
            })
            .collect();
        Ok(Cell::Model(self.model.construct(&self.type_name, fields)))
    }
}

/// Registry mapping composite type names to casters. Owned by a database
/// facade; registrations are scoped to it, not global.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    casters: RwLock<HashMap<String, Arc<Caster>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Caster>>> {
        match self.casters.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Find the caster for a result column's type name.
    pub(crate) fn caster(&self, type_name: &str) -> Option<Arc<Caster>> {
        self.read().get(type_name).cloned()
    }

    /// Register a model for a composite type. Each type admits one model.
    pub(crate) fn register(
        &self,
        model: Arc<dyn ModelClass>,
        type_name: &str,
        meta: CasterMeta,
    ) -> Result<()> {
        let mut casters = match self.casters.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = casters.get(type_name) {
            return Err(Error::AlreadyRegistered {
                class_name: existing.model.class_name().to_string(),
                type_name: type_name.to_string(),
            });
        }
        let class_name = model.class_name();
        casters.insert(
            type_name.to_string(),
            Arc::new(Caster::new(type_name, model, meta)),
        );
        info!(type_name = %type_name, class_name = %class_name, "registered model");
        Ok(())
    }

    /// Drop every registration held by a model class.
    pub fn unregister(&self, model: &dyn ModelClass) -> Result<()> {
        let target = model.class_name();
        let mut casters = match self.casters.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let keys: Vec<String> = casters
            .iter()
            .filter(|(_, c)| c.model.class_name() == target)
            .map(|(k, _)| k.clone())
            .collect();
        if keys.is_empty() {
            return Err(Error::NotRegistered {
                class_name: target.to_string(),
            });
        }
        for key in keys {
            casters.remove(&key);
            info!(type_name = %key, class_name = %target, "unregistered model");
        }
        Ok(())
    }

    /// The composite type names a model class is registered for, sorted.
    /// With `include_subclasses`, registrations held by descendants (via
    /// their declared parents) count too.
    pub fn check_registration(
        &self,
        model: &dyn ModelClass,
        include_subclasses: bool,
    ) -> Result<Vec<String>> {
        let target = model.class_name();
        let casters = self.read();

        let parent_of: HashMap<&str, Option<&'static str>> = casters
            .values()
            .map(|c| (c.model.class_name(), c.model.parent()))
            .collect();

        let matches = |caster: &Caster| -> bool {
            let name = caster.model.class_name();
            if name == target {
                return true;
            }
            if !include_subclasses {
                return false;
            }
            let mut ancestor = caster.model.parent();
            while let Some(parent) = ancestor {
                if parent == target {
                    return true;
                }
                ancestor = parent_of.get(parent).copied().flatten();
            }
            false
        };

        let mut names: Vec<String> = casters
            .iter()
            .filter(|(_, c)| matches(c))
            .map(|(k, _)| k.clone())
            .collect();
        if names.is_empty() {
            return Err(Error::NotRegistered {
                class_name: target.to_string(),
            });
        }
        names.sort_unstable();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(names: &[&str], oids: &[u32]) -> CasterMeta {
        CasterMeta {
            attnames: names.iter().map(|n| n.to_string()).collect(),
            atttypes: oids.to_vec(),
        }
    }

    fn sample_model() -> Model {
        let mut fields = IndexMap::new();
        fields.insert("id".to_string(), Cell::from(json!(1)));
        fields.insert("name".to_string(), Cell::from(json!("alice")));
        Model::new("Participant", "participant", fields)
    }

    #[test]
    fn test_model_get() {
        let model = sample_model();
        assert_eq!(model.get("id"), Some(&Cell::from(json!(1))));
        assert_eq!(model.get("nope"), None);
    }

    #[test]
    fn test_model_fields_are_read_only() {
        let mut model = sample_model();
        let err = model.set("name", Cell::from(json!("bob"))).unwrap_err();
        assert!(matches!(err, Error::ReadOnlyAttribute { name } if name == "name"));
        // Unchanged.
        assert_eq!(model.get("name"), Some(&Cell::from(json!("alice"))));
    }

    #[test]
    fn test_model_extras_are_writable() {
        let mut model = sample_model();
        model.set("session", Cell::from(json!("abc"))).unwrap();
        assert_eq!(model.get("session"), Some(&Cell::from(json!("abc"))));
        model.set("session", Cell::from(json!("def"))).unwrap();
        assert_eq!(model.get("session"), Some(&Cell::from(json!("def"))));
    }

    #[test]
    fn test_set_attributes_updates_fields() {
        let mut model = sample_model();
        let mut updates = IndexMap::new();
        updates.insert("name".to_string(), Cell::from(json!("bob")));
        model.set_attributes(updates).unwrap();
        assert_eq!(model.get("name"), Some(&Cell::from(json!("bob"))));
    }

    #[test]
    fn test_set_attributes_rejects_unknown_names() {
        let mut model = sample_model();
        let mut updates = IndexMap::new();
        updates.insert("name".to_string(), Cell::from(json!("bob")));
        updates.insert("age".to_string(), Cell::from(json!(30)));
        let err = model.set_attributes(updates).unwrap_err();
        assert!(matches!(err, Error::UnknownAttributes { names } if names == vec!["age"]));
        // Nothing applied on failure.
        assert_eq!(model.get("name"), Some(&Cell::from(json!("alice"))));
    }

    #[test]
    fn test_registry_exclusive_per_type() {
        let registry = ModelRegistry::new();
        registry
            .register(
                Arc::new(ModelDef::new("Participant")),
                "participant",
                meta(&["id"], &[23]),
            )
            .unwrap();
        let err = registry
            .register(
                Arc::new(ModelDef::new("Other")),
                "participant",
                meta(&["id"], &[23]),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::AlreadyRegistered { class_name, type_name }
                if class_name == "Participant" && type_name == "participant"
        ));
    }

    #[test]
    fn test_unregister_drops_all_registrations() {
        let registry = ModelRegistry::new();
        let model = Arc::new(ModelDef::new("Thing"));
        registry
            .register(model.clone(), "thing_a", meta(&["id"], &[23]))
            .unwrap();
        registry
            .register(model.clone(), "thing_b", meta(&["id"], &[23]))
            .unwrap();
        registry.unregister(model.as_ref()).unwrap();
        let err = registry.unregister(model.as_ref()).unwrap_err();
        assert!(matches!(err, Error::NotRegistered { .. }));
        assert!(registry.caster("thing_a").is_none());
    }

    #[test]
    fn test_check_registration_direct() {
        let registry = ModelRegistry::new();
        let model = Arc::new(ModelDef::new("Thing"));
        registry
            .register(model.clone(), "thing_b", meta(&["id"], &[23]))
            .unwrap();
        registry
            .register(model.clone(), "thing_a", meta(&["id"], &[23]))
            .unwrap();
        let names = registry.check_registration(model.as_ref(), false).unwrap();
        assert_eq!(names, vec!["thing_a", "thing_b"]);
    }

    #[test]
    fn test_check_registration_through_descendants() {
        let registry = ModelRegistry::new();
        let base = ModelDef::new("Base");
        let child = Arc::new(ModelDef::new("Child").with_parent("Base"));
        let grandchild = Arc::new(ModelDef::new("Grandchild").with_parent("Child"));
        registry
            .register(child, "child_t", meta(&["id"], &[23]))
            .unwrap();
        registry
            .register(grandchild, "grandchild_t", meta(&["id"], &[23]))
            .unwrap();

        let err = registry.check_registration(&base, false).unwrap_err();
        assert!(matches!(err, Error::NotRegistered { .. }));

        let names = registry.check_registration(&base, true).unwrap();
        assert_eq!(names, vec!["child_t", "grandchild_t"]);
    }

    #[test]
    fn test_caster_decode_with_matching_meta() {
        let caster = Caster::new(
            "participant",
            Arc::new(ModelDef::new("Participant")),
            meta(&["id", "name"], &[23, 25]),
        );
        let cell = caster
            .decode_with(&caster.meta(), CompositeValue::Text("(1,alice)"))
            .unwrap();
        let model = cell.into_model().unwrap();
        assert_eq!(model.get("id"), Some(&Cell::from(json!(1))));
        assert_eq!(model.get("name"), Some(&Cell::from(json!("alice"))));
    }

    #[test]
    fn test_caster_decode_arity_mismatch_errors() {
        let caster = Caster::new(
            "participant",
            Arc::new(ModelDef::new("Participant")),
            meta(&["id"], &[23]),
        );
        let err = caster
            .decode_with(&caster.meta(), CompositeValue::Text("(1,alice)"))
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
