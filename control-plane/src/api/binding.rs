//! Turns path parameters, query strings and JSON bodies into one object that
//! request types deserialize from.
//!
//! Path and query values arrive as strings, so numeric and boolean request
//! fields use the lenient deserializers below.

use axum::http::Method;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};
use service_core::error::{AppError, FieldErrors};
use std::collections::HashMap;
use validator::Validate;

/// Collects the raw request fields. Path parameters win over body fields,
/// which win over query parameters. Repeated query keys become arrays.
pub fn raw_fields(
    method: &Method,
    path_params: HashMap<String, String>,
    query: Option<&str>,
    body: &[u8],
) -> Result<Map<String, Value>, AppError> {
    let mut fields = Map::new();

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query)
            .map_err(|e| AppError::bad_request(format!("invalid query string: {}", e)))?;
        for (key, value) in pairs {
            match fields.get_mut(&key) {
                Some(Value::Array(values)) => values.push(Value::String(value)),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, Value::String(value)]);
                }
                None => {
                    fields.insert(key, Value::String(value));
                }
            }
        }
    }

    let has_body = !matches!(*method, Method::GET | Method::DELETE | Method::HEAD);
    if has_body && !body.iter().all(u8::is_ascii_whitespace) {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(object)) => fields.extend(object),
            Ok(_) => return Err(AppError::bad_request("request body must be a JSON object")),
            Err(e) => return Err(AppError::bad_request(format!("invalid JSON body: {}", e))),
        }
    }

    for (key, value) in path_params {
        fields.insert(key, Value::String(value));
    }
    Ok(fields)
}

/// Deserializes and validates the request.
pub fn bind<T: DeserializeOwned + Validate>(fields: Value) -> Result<T, AppError> {
    let request: T = serde_json::from_value(fields)
        .map_err(|e| AppError::bad_request(format!("invalid request: {}", e)))?;
    request
        .validate()
        .map_err(|e| AppError::ValidationError(FieldErrors::from(e)))?;
    Ok(request)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Flexible<T> {
    Native(T),
    Text(String),
}

fn flexible<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match Option::<Flexible<T>>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Flexible::Native(v)) => Ok(Some(v)),
        Some(Flexible::Text(s)) if s.is_empty() => Ok(None),
        Some(Flexible::Text(s)) => s.parse().map(Some).map_err(de::Error::custom),
    }
}

/// A number that may arrive as a JSON number or a query string.
pub fn number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + std::str::FromStr + Default,
    T::Err: std::fmt::Display,
{
    Ok(flexible(deserializer)?.unwrap_or_default())
}

/// A boolean that may arrive as `true`, `"true"` or `"1"`.
pub fn boolean<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Option::<Flexible<bool>>::deserialize(deserializer)? {
        None => Ok(false),
        Some(Flexible::Native(v)) => Ok(v),
        Some(Flexible::Text(s)) => match s.as_str() {
            "" | "0" | "false" => Ok(false),
            "1" | "true" => Ok(true),
            other => Err(de::Error::custom(format!("invalid boolean {:?}", other))),
        },
    }
}

/// A single string or a list of strings, as repeated query keys produce.
pub fn strings<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) if s.is_empty() => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Rules;
    use serde_json::json;
    use validator::ValidationErrors;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Query {
        #[serde(default)]
        name: String,
        #[serde(default, deserialize_with = "number")]
        page: u32,
        #[serde(default, deserialize_with = "boolean")]
        show_expired: bool,
        #[serde(default, deserialize_with = "strings")]
        ids: Vec<String>,
    }

    impl Validate for Query {
        fn validate(&self) -> Result<(), ValidationErrors> {
            Rules::new().name("name", &self.name).finish()
        }
    }

    #[test]
    fn merges_sources_with_path_params_last() {
        let mut params = HashMap::new();
        params.insert("id".to_string(), "abc".to_string());
        let fields = raw_fields(
            &Method::PUT,
            params,
            Some("id=query&page=2"),
            br#"{"id": "body", "name": "n"}"#,
        )
        .unwrap();
        assert_eq!(fields["id"], json!("abc"));
        assert_eq!(fields["page"], json!("2"));
        assert_eq!(fields["name"], json!("n"));
    }

    #[test]
    fn query_strings_bind_to_typed_fields() {
        let fields = raw_fields(
            &Method::GET,
            HashMap::new(),
            Some("name=ab&page=3&showExpired=true&ids=a&ids=b"),
            b"ignored",
        )
        .unwrap();
        let query: Query = bind(Value::Object(fields)).unwrap();
        assert_eq!(query.page, 3);
        assert!(query.show_expired);
        assert_eq!(query.ids, vec!["a", "b"]);
    }

    #[test]
    fn validation_failures_name_the_field() {
        let err = bind::<Query>(json!({"name": "a/"})).unwrap_err();
        match err {
            AppError::ValidationError(errors) => {
                assert!(errors.get("name").is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn non_object_bodies_are_rejected() {
        assert!(raw_fields(&Method::POST, HashMap::new(), None, b"[1]").is_err());
    }
}
