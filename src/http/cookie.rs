//! Cookie model and the HTTP date format used across response headers.

use chrono::{DateTime, Utc};
use std::time::{Duration, SystemTime};

/// `SameSite` cookie attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    /// Attribute not emitted.
    #[default]
    NotSet,
    Strict,
    Lax,
    /// Emitted as `SameSite=None`; forces the `Secure` attribute.
    None,
}

impl SameSite {
    fn as_str(&self) -> &'static str {
        match self {
            SameSite::NotSet => "",
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// A response cookie.
///
/// Expiry is either absolute (`expires_at`) or relative (`max_age`); setting
/// one clears the other. A cookie built without a name is invalid and is
/// rejected by [`Output::set_cookie`](crate::Output::set_cookie).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cookie {
    pub(crate) name: String,
    pub(crate) value: String,
    path: Option<String>,
    domain: Option<String>,
    secure: bool,
    http_only: bool,
    expire: Option<DateTime<Utc>>,
    max_age: Option<i64>,
    same_site: SameSite,
    valid: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let valid = !name.is_empty();
        Self {
            name,
            value: value.into(),
            valid,
            ..Self::default()
        }
    }

    /// Whether the cookie can be emitted at all.
    #[inline(always)]
    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        self
    }

    /// Absolute expiry. Clears any relative `max_age`.
    pub fn expires_at(mut self, when: SystemTime) -> Self {
        self.expire = Some(DateTime::<Utc>::from(when));
        self.max_age = None;
        self
    }

    /// Relative expiry in whole seconds. Clears any absolute expiry.
    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age = Some(age.as_secs() as i64);
        self.expire = None;
        self
    }

    /// Turns this cookie into a deletion instruction for the client:
    /// empty value, negative max-age.
    pub fn invalidate(mut self) -> Self {
        self.value = String::new();
        self.expire = None;
        self.max_age = Some(-1);
        self
    }

    /// Assembles the `set-cookie` header value. Attribute order is fixed:
    /// name=value, Max-Age/Expires, path, domain, SameSite, Secure, HttpOnly.
    pub(crate) fn header_value(&self) -> String {
        let mut out = String::with_capacity(64);
        out.push_str(&self.name);
        out.push('=');
        out.push_str(&self.value);

        if let Some(age) = self.max_age {
            out.push_str("; Max-Age=");
            out.push_str(&age.to_string());
        } else if let Some(when) = self.expire {
            out.push_str("; Expires=");
            out.push_str(&format_http_date(when));
        }

        if let Some(path) = &self.path {
            out.push_str("; path=");
            out.push_str(path);
        }
        if let Some(domain) = &self.domain {
            out.push_str("; domain=");
            out.push_str(domain);
        }
        if self.same_site != SameSite::NotSet {
            out.push_str("; SameSite=");
            out.push_str(self.same_site.as_str());
        }

        // SameSite=None is only honored by clients together with Secure.
        if self.secure || self.same_site == SameSite::None {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }

        out
    }
}

/// Formats `Day, DD Mon YYYY HH:MM:SS GMT` with English abbreviations, UTC.
pub(crate) fn format_http_date(when: DateTime<Utc>) -> String {
    when.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// HTTP date for `now + offset`, used by duration-valued headers.
pub(crate) fn http_date_after(offset: Duration) -> String {
    let when = SystemTime::now() + offset;
    format_http_date(DateTime::<Utc>::from(when))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn plain_cookie() {
        let c = Cookie::new("sid", "abc123");
        assert!(c.valid());
        assert_eq!(c.header_value(), "sid=abc123");
    }

    #[test]
    fn nameless_is_invalid() {
        assert!(!Cookie::new("", "v").valid());
        assert!(!Cookie::default().valid());
    }

    #[test]
    fn attribute_order() {
        let c = Cookie::new("a", "b")
            .max_age(Duration::from_secs(3600))
            .path("/app")
            .domain("example.com")
            .same_site(SameSite::Lax)
            .secure(true)
            .http_only(true);

        assert_eq!(
            c.header_value(),
            "a=b; Max-Age=3600; path=/app; domain=example.com; SameSite=Lax; Secure; HttpOnly"
        );
    }

    #[test]
    fn expire_and_max_age_exclusive() {
        let epoch = Cookie::new("a", "b").expires_at(UNIX_EPOCH);
        assert_eq!(
            epoch.header_value(),
            "a=b; Expires=Thu, 01 Jan 1970 00:00:00 GMT"
        );

        // max_age after expires_at replaces it
        let relative = epoch.max_age(Duration::from_secs(60));
        assert_eq!(relative.header_value(), "a=b; Max-Age=60");

        // and the other way around
        let absolute = relative.expires_at(UNIX_EPOCH);
        assert_eq!(
            absolute.header_value(),
            "a=b; Expires=Thu, 01 Jan 1970 00:00:00 GMT"
        );
    }

    #[test]
    fn same_site_none_implies_secure() {
        let c = Cookie::new("a", "b").same_site(SameSite::None);
        assert_eq!(c.header_value(), "a=b; SameSite=None; Secure");

        // no double Secure when both are set
        let c = Cookie::new("a", "b").same_site(SameSite::None).secure(true);
        assert_eq!(c.header_value(), "a=b; SameSite=None; Secure");
    }

    #[test]
    fn invalidate_deletes() {
        let c = Cookie::new("sid", "abc123")
            .max_age(Duration::from_secs(10))
            .invalidate();
        assert_eq!(c.header_value(), "sid=; Max-Age=-1");
        assert!(c.valid());
    }

    #[test]
    fn http_date_format() {
        let date = format_http_date(DateTime::<Utc>::from(UNIX_EPOCH));
        assert_eq!(date, "Thu, 01 Jan 1970 00:00:00 GMT");

        // 2021-03-14 01:59:26 UTC
        let when = UNIX_EPOCH + Duration::from_secs(1_615_687_166);
        assert_eq!(
            format_http_date(DateTime::<Utc>::from(when)),
            "Sun, 14 Mar 2021 01:59:26 GMT"
        );
    }
}
