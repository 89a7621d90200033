//! Request and response rewrites for older clients.
//!
//! A migration registered at version `V` translates between the shape used by
//! clients at or before `V` and the shape that replaced it. Requests from old
//! clients are upgraded oldest migration first; responses are downgraded
//! newest first.

use serde_json::{Map, Value};

use super::version::{ClientVersion, Version};

pub type Rewrite = fn(Value) -> Value;

#[derive(Clone)]
pub struct Migration {
    pub version: Version,
    pub request: Option<Rewrite>,
    pub response: Option<Rewrite>,
}

impl Migration {
    pub fn request(version: Version, rewrite: Rewrite) -> Self {
        Self {
            version,
            request: Some(rewrite),
            response: None,
        }
    }

    pub fn response(version: Version, rewrite: Rewrite) -> Self {
        Self {
            version,
            request: None,
            response: Some(rewrite),
        }
    }
}

#[derive(Clone, Default)]
pub struct Migrations(Vec<Migration>);

impl Migrations {
    pub fn push(&mut self, migration: Migration) {
        self.0.push(migration);
        self.0.sort_by(|a, b| a.version.cmp(&b.version));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn upgrade_request(&self, client: &ClientVersion, mut value: Value) -> Value {
        for m in self.0.iter().filter(|m| client.at_or_before(&m.version)) {
            if let Some(rewrite) = m.request {
                value = rewrite(value);
            }
        }
        value
    }

    pub fn downgrade_response(&self, client: &ClientVersion, mut value: Value) -> Value {
        for m in self.0.iter().rev().filter(|m| client.at_or_before(&m.version)) {
            if let Some(rewrite) = m.response {
                value = rewrite(value);
            }
        }
        value
    }
}

/// Renames `from` to `to` in an object, leaving other values alone.
pub fn rename_key(object: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(v) = object.remove(from) {
        object.insert(to.to_string(), v);
    }
}

/// Applies `f` to every element of a list response's `items`.
pub fn map_items(mut value: Value, f: impl Fn(&mut Map<String, Value>)) -> Value {
    if let Some(Value::Array(items)) = value.get_mut("items") {
        for item in items.iter_mut() {
            if let Value::Object(object) = item {
                f(object);
            }
        }
    }
    value
}

/// Clients up to 0.12.3 expect list endpoints to answer with the bare array.
pub fn bare_list() -> Migration {
    Migration::response(Version::new(0, 12, 3), |value| match value {
        Value::Object(mut object) => object.remove("items").unwrap_or(Value::Array(Vec::new())),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rename_a_to_b() -> Migration {
        Migration {
            version: Version::new(0, 2, 0),
            request: Some(|mut v| {
                if let Value::Object(o) = &mut v {
                    rename_key(o, "a", "b");
                }
                v
            }),
            response: Some(|mut v| {
                if let Value::Object(o) = &mut v {
                    rename_key(o, "b", "a");
                }
                v
            }),
        }
    }

    fn rename_b_to_c() -> Migration {
        Migration {
            version: Version::new(0, 5, 0),
            request: Some(|mut v| {
                if let Value::Object(o) = &mut v {
                    rename_key(o, "b", "c");
                }
                v
            }),
            response: Some(|mut v| {
                if let Value::Object(o) = &mut v {
                    rename_key(o, "c", "b");
                }
                v
            }),
        }
    }

    #[test]
    fn chains_in_version_order() {
        let mut migrations = Migrations::default();
        migrations.push(rename_b_to_c());
        migrations.push(rename_a_to_b());

        let oldest = ClientVersion::Exact(Version::new(0, 1, 0));
        assert_eq!(migrations.upgrade_request(&oldest, json!({"a": 1})), json!({"c": 1}));
        assert_eq!(migrations.downgrade_response(&oldest, json!({"c": 1})), json!({"a": 1}));

        let middle = ClientVersion::Exact(Version::new(0, 3, 0));
        assert_eq!(migrations.upgrade_request(&middle, json!({"b": 1})), json!({"c": 1}));
        assert_eq!(migrations.downgrade_response(&middle, json!({"c": 1})), json!({"b": 1}));

        assert_eq!(
            migrations.downgrade_response(&ClientVersion::Latest, json!({"c": 1})),
            json!({"c": 1})
        );
    }

    #[test]
    fn bare_list_unwraps_items() {
        let mut migrations = Migrations::default();
        migrations.push(bare_list());
        let client = ClientVersion::Exact(Version::new(0, 12, 3));
        let body = json!({"count": 1, "items": [{"id": "x"}]});
        assert_eq!(migrations.downgrade_response(&client, body), json!([{"id": "x"}]));
    }
}
