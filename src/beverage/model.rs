use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::Document;
use crate::firestore::value::{FirestoreValue, MapValue};

pub const BASES_COLLECTION: &str = "bases";
pub const CREAMERS_COLLECTION: &str = "creamers";
pub const SYRUPS_COLLECTION: &str = "syrups";
pub const BEVERAGES_COLLECTION: &str = "beverages";

/// A catalog entry: a base, creamer or syrup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ingredient {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl Ingredient {
    pub fn new(id: impl Into<String>, name: impl Into<String>, color: Option<&str>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: color.map(str::to_string),
        }
    }

    /// Reads a catalog document. Its id comes from the document key.
    pub fn from_document(document: &Document) -> FirestoreResult<Self> {
        let data = document.data();
        Ok(Self {
            id: document.key().id().to_string(),
            name: required_string(data, "name")?,
            color: optional_string(data, "color"),
        })
    }

    fn from_map(map: &MapValue) -> FirestoreResult<Self> {
        Ok(Self {
            id: optional_string(map, "id").unwrap_or_default(),
            name: required_string(map, "name")?,
            color: optional_string(map, "color"),
        })
    }

    fn to_value(&self) -> FirestoreValue {
        let mut fields = BTreeMap::new();
        if !self.id.is_empty() {
            fields.insert("id".to_string(), FirestoreValue::from_string(&self.id));
        }
        fields.insert("name".to_string(), FirestoreValue::from_string(&self.name));
        if let Some(color) = &self.color {
            fields.insert("color".to_string(), FirestoreValue::from_string(color));
        }
        FirestoreValue::from_map(fields)
    }
}

/// A drink a user made, stored at `beverages/{id}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beverage {
    pub id: String,
    pub uid: String,
    pub name: String,
    pub temperature: String,
    pub base: Option<Ingredient>,
    pub creamer: Option<Ingredient>,
    pub syrup: Option<Ingredient>,
}

impl Beverage {
    pub fn to_map(&self) -> MapValue {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), FirestoreValue::from_string(&self.id));
        fields.insert("uid".to_string(), FirestoreValue::from_string(&self.uid));
        fields.insert("name".to_string(), FirestoreValue::from_string(&self.name));
        fields.insert(
            "temperature".to_string(),
            FirestoreValue::from_string(&self.temperature),
        );
        for (field, ingredient) in [
            ("base", &self.base),
            ("creamer", &self.creamer),
            ("syrup", &self.syrup),
        ] {
            let value = ingredient
                .as_ref()
                .map_or_else(FirestoreValue::null, Ingredient::to_value);
            fields.insert(field.to_string(), value);
        }
        MapValue::new(fields)
    }

    pub fn from_document(document: &Document) -> FirestoreResult<Self> {
        let data = document.data();
        Ok(Self {
            id: document.key().id().to_string(),
            uid: required_string(data, "uid")?,
            name: optional_string(data, "name").unwrap_or_default(),
            temperature: optional_string(data, "temperature").unwrap_or_default(),
            base: optional_ingredient(data, "base")?,
            creamer: optional_ingredient(data, "creamer")?,
            syrup: optional_ingredient(data, "syrup")?,
        })
    }
}

fn optional_string(map: &MapValue, field: &str) -> Option<String> {
    map.fields()
        .get(field)
        .and_then(FirestoreValue::as_str)
        .map(str::to_string)
}

fn required_string(map: &MapValue, field: &str) -> FirestoreResult<String> {
    optional_string(map, field)
        .ok_or_else(|| invalid_argument(format!("document is missing string field '{field}'")))
}

fn optional_ingredient(map: &MapValue, field: &str) -> FirestoreResult<Option<Ingredient>> {
    match map.fields().get(field).and_then(FirestoreValue::as_map) {
        Some(value) => Ingredient::from_map(value).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion, Timestamp};

    #[test]
    fn beverage_documents_keep_their_ingredients() {
        let beverage = Beverage {
            id: "u1-1700000000000".to_string(),
            uid: "u1".to_string(),
            name: "Morning Brew".to_string(),
            temperature: "Hot".to_string(),
            base: Some(Ingredient::new("coffee", "Coffee", Some("#6F4E37"))),
            creamer: Some(Ingredient::new("whole-milk", "Whole Milk", None)),
            syrup: None,
        };
        let key = DocumentKey::from_string("beverages/u1-1700000000000").unwrap();
        let document = MutableDocument::new_found_document(
            key,
            SnapshotVersion::new(Timestamp::new(1, 0)),
            beverage.to_map(),
        );

        let decoded = Beverage::from_document(&document).unwrap();
        assert_eq!(decoded, beverage);
        assert!(beverage.to_map().fields()["syrup"].is_null());
    }

    #[test]
    fn catalog_entries_need_a_name() {
        let key = DocumentKey::from_string("bases/coffee").unwrap();
        let document = MutableDocument::new_found_document(
            key,
            SnapshotVersion::new(Timestamp::new(1, 0)),
            MapValue::empty(),
        );
        assert!(Ingredient::from_document(&document).is_err());
    }
}
