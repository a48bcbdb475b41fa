//! Services that tickets are issued for.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A downstream application identified by its service URL.
///
/// Two services *match* when their URLs agree after discarding the query
/// string, the fragment and any `;jsessionid=` path parameter. Matching is
/// used when a session only keeps the most recent ticket per service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Service {
    id: String,
}

impl Service {
    /// Creates a service from its URL or identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Returns the service identifier as given at issuance.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the identifier with query, fragment and session parameters removed.
    ///
    /// ```
    /// use sso_common_tickets::Service;
    ///
    /// let service = Service::new("https://app.example.com/home;jsessionid=A1B2?ticket=ST-1#top");
    /// assert_eq!(service.normalized(), "https://app.example.com/home");
    /// ```
    #[must_use]
    pub fn normalized(&self) -> &str {
        let end = self.id.find(['?', '#']).unwrap_or(self.id.len());
        let trimmed = &self.id[..end];
        match find_ignore_ascii_case(trimmed, ";jsessionid=") {
            Some(pos) => &trimmed[..pos],
            None => trimmed,
        }
    }

    /// Returns `true` if both services refer to the same application.
    #[must_use]
    pub fn matches(&self, other: &Service) -> bool {
        self.normalized() == other.normalized()
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl From<&str> for Service {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for Service {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_and_fragment_are_ignored() {
        let a = Service::new("https://app.example.com/?x=1");
        let b = Service::new("https://app.example.com/#frag");
        assert!(a.matches(&b));
    }

    #[test]
    fn session_parameter_is_case_insensitive() {
        let a = Service::new("https://app.example.com/p;JSESSIONID=123");
        assert_eq!(a.normalized(), "https://app.example.com/p");
    }

    #[test]
    fn different_paths_do_not_match() {
        let a = Service::new("https://app.example.com/a");
        let b = Service::new("https://app.example.com/b");
        assert!(!a.matches(&b));
    }
}
