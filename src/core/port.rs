//! Purpose: Port domain record, partial updates, and conversion from decoded entities.
//! Exports: `Port`, `Coordinates`, `PortPatch`, `PortId`.
//! Role: Typed view of an `EntityRecord` as stored and served by the gateway.
//! Invariants: Conversion matches each JSON variant explicitly; null and missing become defaults.
//! Invariants: Unknown entity fields are ignored; type mismatches are `Invalid` naming key and field.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::batch::EntityRecord;
use super::error::{Error, ErrorKind};
use crate::json::parse::value_kind;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Coordinates {
    pub lng: f64,
    pub lat: f64,
}

impl From<[f64; 2]> for Coordinates {
    fn from([lng, lat]: [f64; 2]) -> Self {
        Self { lng, lat }
    }
}

impl From<Coordinates> for [f64; 2] {
    fn from(coordinates: Coordinates) -> Self {
        [coordinates.lng, coordinates.lat]
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Port {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub city: String,
    pub province: String,
    pub country: String,
    pub alias: Vec<String>,
    pub regions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    pub timezone: String,
    #[serde(alias = "unlocs")]
    pub unlocks: Vec<String>,
    pub code: String,
}

impl Port {
    /// Builds a port from one top-level entry; `slug` is the entry's key.
    pub fn from_entity(slug: &str, record: EntityRecord) -> Result<Self, Error> {
        let mut port = Port {
            slug: slug.to_string(),
            ..Port::default()
        };
        for (field, value) in record.into_map() {
            let at = FieldRef {
                slug,
                field: &field,
            };
            match field.as_str() {
                "name" => port.name = at.string(value)?,
                "city" => port.city = at.string(value)?,
                "province" => port.province = at.string(value)?,
                "country" => port.country = at.string(value)?,
                "timezone" => port.timezone = at.string(value)?,
                "code" => port.code = at.string(value)?,
                "alias" => port.alias = at.strings(value)?,
                "regions" => port.regions = at.strings(value)?,
                "unlocks" | "unlocs" => port.unlocks = at.strings(value)?,
                "coordinates" => port.coordinates = at.coordinates(value)?,
                _ => {}
            }
        }
        Ok(port)
    }

    /// Copies the updatable columns from `other`, keeping id and slug.
    pub(crate) fn overwrite_from(&mut self, other: Port) {
        self.name = other.name;
        self.city = other.city;
        self.province = other.province;
        self.country = other.country;
        self.alias = other.alias;
        self.regions = other.regions;
        self.coordinates = other.coordinates;
        self.timezone = other.timezone;
        self.unlocks = other.unlocks;
        self.code = other.code;
    }
}

struct FieldRef<'a> {
    slug: &'a str,
    field: &'a str,
}

impl FieldRef<'_> {
    fn mismatch(&self, expected: &str, found: &Value) -> Error {
        Error::new(ErrorKind::Invalid)
            .with_message(format!(
                "field '{}' must be {expected}, found {}",
                self.field,
                value_kind(found)
            ))
            .with_key(self.slug)
    }

    fn string(&self, value: Value) -> Result<String, Error> {
        match value {
            Value::String(text) => Ok(text),
            Value::Null => Ok(String::new()),
            other => Err(self.mismatch("a string", &other)),
        }
    }

    fn strings(&self, value: Value) -> Result<Vec<String>, Error> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(text) => Ok(text),
                    other => Err(self.mismatch("an array of strings", &other)),
                })
                .collect(),
            Value::Null => Ok(Vec::new()),
            other => Err(self.mismatch("an array of strings", &other)),
        }
    }

    fn coordinates(&self, value: Value) -> Result<Option<Coordinates>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Array(items) if items.is_empty() => Ok(None),
            Value::Array(items) => match items.as_slice() {
                [Value::Number(lng), Value::Number(lat)] => match (lng.as_f64(), lat.as_f64()) {
                    (Some(lng), Some(lat)) => Ok(Some(Coordinates { lng, lat })),
                    _ => Err(self.invalid_coordinates()),
                },
                _ => Err(self.invalid_coordinates()),
            },
            other => Err(self.mismatch("an array of two numbers", &other)),
        }
    }

    fn invalid_coordinates(&self) -> Error {
        Error::new(ErrorKind::Invalid)
            .with_message(format!(
                "field '{}' must be [longitude, latitude]",
                self.field
            ))
            .with_key(self.slug)
    }
}

/// Partial update; absent fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlocks: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl PortPatch {
    pub fn is_empty(&self) -> bool {
        *self == PortPatch::default()
    }

    pub fn apply(self, port: &mut Port) {
        if let Some(name) = self.name {
            port.name = name;
        }
        if let Some(city) = self.city {
            port.city = city;
        }
        if let Some(province) = self.province {
            port.province = province;
        }
        if let Some(country) = self.country {
            port.country = country;
        }
        if let Some(alias) = self.alias {
            port.alias = alias;
        }
        if let Some(regions) = self.regions {
            port.regions = regions;
        }
        if let Some(coordinates) = self.coordinates {
            port.coordinates = Some(coordinates);
        }
        if let Some(timezone) = self.timezone {
            port.timezone = timezone;
        }
        if let Some(unlocks) = self.unlocks {
            port.unlocks = unlocks;
        }
        if let Some(code) = self.code {
            port.code = code;
        }
    }
}

/// Lookup key for a stored port.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum PortId {
    Id(i64),
    Slug(String),
}

impl PortId {
    /// All-digit input is an id; anything else is a slug.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("port id or slug is empty")
                .with_hint("Pass a numeric id or a slug such as AEAJM."));
        }
        if input.bytes().all(|byte| byte.is_ascii_digit()) {
            if let Ok(id) = input.parse::<i64>() {
                return Ok(PortId::Id(id));
            }
        }
        Ok(PortId::Slug(input.to_string()))
    }
}

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortId::Id(id) => write!(f, "{id}"),
            PortId::Slug(slug) => f.write_str(slug),
        }
    }
}
