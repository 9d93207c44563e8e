/// Declares a string-valued enum stored in a text column.
///
/// The wire (JSON) and database spellings are the same lowercase literal.
macro_rules! text_enum {
    ($(#[$meta:meta])* pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash,
            serde::Serialize, serde::Deserialize,
            diesel::expression::AsExpression, diesel::deserialize::FromSqlRow,
        )]
        #[diesel(sql_type = diesel::sql_types::Text)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("Unrecognized {}: {}", stringify!($name), other)),
                }
            }
        }

        impl diesel::serialize::ToSql<diesel::sql_types::Text, diesel::pg::Pg> for $name {
            fn to_sql<'b>(
                &'b self,
                out: &mut diesel::serialize::Output<'b, '_, diesel::pg::Pg>,
            ) -> diesel::serialize::Result {
                <str as diesel::serialize::ToSql<diesel::sql_types::Text, diesel::pg::Pg>>::to_sql(self.as_str(), out)
            }
        }

        impl diesel::deserialize::FromSql<diesel::sql_types::Text, diesel::pg::Pg> for $name {
            fn from_sql(bytes: diesel::pg::PgValue<'_>) -> diesel::deserialize::Result<Self> {
                let raw = <String as diesel::deserialize::FromSql<diesel::sql_types::Text, diesel::pg::Pg>>::from_sql(bytes)?;
                raw.parse::<$name>().map_err(Into::into)
            }
        }
    };
}

pub mod event;
pub mod feedback;
pub mod payment;
pub mod registration;
pub mod stats;
pub mod user;
pub mod waitlist;

pub use event::*;
pub use feedback::*;
pub use payment::*;
pub use registration::*;
pub use stats::*;
pub use user::*;
pub use waitlist::*;

/// Paging parameters shared by list endpoints.
#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub struct Page {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

impl Page {
    pub const DEFAULT_LIMIT: i64 = 20;
    pub const MAX_LIMIT: i64 = 100;

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, Self::MAX_LIMIT)
    }

    pub fn offset(&self) -> i64 {
        (self.page.unwrap_or(1).max(1) - 1) * self.limit()
    }
}

#[derive(Debug, serde::Serialize)]
pub struct Paged<T: serde::Serialize> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

impl<T: serde::Serialize> Paged<T> {
    pub fn new(items: Vec<T>, total: i64, page: &Page) -> Self {
        Self { items, total, page: page.page.unwrap_or(1).max(1), limit: page.limit() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_clamps_limit_and_offset() {
        let p = Page { page: Some(3), limit: Some(500) };
        assert_eq!(p.limit(), Page::MAX_LIMIT);
        assert_eq!(p.offset(), 2 * Page::MAX_LIMIT);

        let p = Page { page: Some(0), limit: None };
        assert_eq!(p.limit(), Page::DEFAULT_LIMIT);
        assert_eq!(p.offset(), 0);
    }

    #[test]
    fn text_enums_round_trip_their_spelling() {
        for status in RegistrationStatus::ALL {
            assert_eq!(status.as_str().parse::<RegistrationStatus>().unwrap(), *status);
        }
        assert!("REGISTERED".parse::<RegistrationStatus>().is_err());
        assert_eq!(serde_json::to_string(&WaitlistStatus::Offered).unwrap(), "\"offered\"");
    }
}
