pub mod access_keys;
pub mod auth;
pub mod credentials;
pub mod destinations;
pub mod device;
pub mod grants;
pub mod groups;
pub mod organizations;
pub mod providers;
pub mod scim;
pub mod users;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::data::{Paged, Pagination};
use crate::utils::Rules;

pub const MAX_PAGE_LIMIT: u32 = 1000;

/// RFC 3339 at second precision with a `Z` suffix.
pub mod time {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }

    /// `None` renders as `null`; empty strings read as `None`.
    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(t: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => super::serialize(t, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                None => Ok(None),
                Some(s) if s.is_empty() => Ok(None),
                Some(s) => DateTime::parse_from_rfc3339(&s)
                    .map(|t| Some(t.with_timezone(&Utc)))
                    .map_err(serde::de::Error::custom),
            }
        }
    }
}

/// `page` and `limit` as accepted by every list endpoint.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    #[serde(default, deserialize_with = "crate::api::binding::number")]
    pub page: u32,
    #[serde(default, deserialize_with = "crate::api::binding::number")]
    pub limit: u32,
}

impl PageRequest {
    pub fn check(&self, rules: &mut Rules) {
        if self.limit != 0 {
            rules.range("limit", i64::from(self.limit), 1, i64::from(MAX_PAGE_LIMIT));
        }
    }

    pub fn pagination(&self) -> Pagination {
        let defaults = Pagination::default();
        Pagination {
            page: if self.page == 0 { defaults.page } else { self.page },
            limit: if self.limit == 0 { defaults.limit } else { self.limit },
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[aliases(
    AccessKeyList = ListResponse<access_keys::AccessKeyView>,
    UserList = ListResponse<users::User>,
    GroupList = ListResponse<groups::Group>,
    GrantList = ListResponse<grants::Grant>,
    DestinationList = ListResponse<destinations::Destination>,
    ProviderList = ListResponse<providers::Provider>
)]
pub struct ListResponse<T> {
    pub count: usize,
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total_pages: i64,
    pub total_count: i64,
}

impl<T> ListResponse<T> {
    pub fn new<M>(paged: Paged<M>, pagination: Pagination, f: impl FnMut(M) -> T) -> Self {
        let items: Vec<T> = paged.items.into_iter().map(f).collect();
        let limit = i64::from(pagination.limit.max(1));
        Self {
            count: items.len(),
            items,
            page: pagination.page,
            limit: pagination.limit,
            total_pages: (paged.total_count + limit - 1) / limit,
            total_count: paged.total_count,
        }
    }
}

/// Body of every error response.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    #[schema(example = 400)]
    pub code: u16,
    #[schema(example = "validation failed")]
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub field_errors: Vec<FieldError>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    #[schema(example = "name")]
    pub field_name: String,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VersionResponse {
    #[schema(example = "0.21.0")]
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[derive(Serialize)]
    struct Stamp {
        #[serde(with = "time")]
        at: chrono::DateTime<Utc>,
        #[serde(with = "time::option")]
        seen: Option<chrono::DateTime<Utc>>,
    }

    #[test]
    fn times_render_at_second_precision() {
        let at = Utc.with_ymd_and_hms(2022, 3, 14, 9, 48, 0).unwrap() + chrono::Duration::milliseconds(250);
        let json = serde_json::to_value(Stamp { at, seen: None }).unwrap();
        assert_eq!(json["at"], "2022-03-14T09:48:00Z");
        assert!(json["seen"].is_null());
    }

    #[test]
    fn list_response_counts_pages() {
        let paged = Paged {
            items: vec![1, 2],
            total_count: 5,
        };
        let list = ListResponse::new(paged, Pagination { page: 1, limit: 2 }, |n| n * 10);
        assert_eq!(list.items, vec![10, 20]);
        assert_eq!(list.count, 2);
        assert_eq!(list.total_pages, 3);
    }

    #[test]
    fn zero_page_values_use_defaults() {
        let p = PageRequest::default().pagination();
        assert_eq!((p.page, p.limit), (1, 100));
    }
}
