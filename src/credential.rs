//! Caller identity used to partition the pool into sub-pools.
//!
//! A [`Credential`] is built per request and never mutated. The pool's
//! [`PoolStrategy`] reduces it to a [`PoolKey`]; listeners sharing a key
//! share a sub-pool.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Security principal the connection is opened for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subject {
    pub principal: String,
    /// Opaque secret passed through to the factory. Not shown by `Display`.
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,
}

impl Subject {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            secret: None,
        }
    }

    pub fn with_secret(principal: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            secret: Some(secret.into()),
        }
    }
}

/// Connection-request parameters (database name, client info, ...).
///
/// Backed by an ordered map so equal parameter sets hash identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestInfo {
    params: BTreeMap<String, String>,
}

impl RequestInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Immutable request identity: security subject plus request parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credential {
    subject: Option<Subject>,
    request_info: Option<RequestInfo>,
}

impl Credential {
    /// Credential with neither subject nor request info (container-managed sign-on).
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn new(subject: Option<Subject>, request_info: Option<RequestInfo>) -> Self {
        Self {
            subject,
            request_info,
        }
    }

    pub fn for_subject(subject: Subject) -> Self {
        Self::new(Some(subject), None)
    }

    pub fn for_request(request_info: RequestInfo) -> Self {
        Self::new(None, Some(request_info))
    }

    pub fn subject(&self) -> Option<&Subject> {
        self.subject.as_ref()
    }

    pub fn request_info(&self) -> Option<&RequestInfo> {
        self.request_info.as_ref()
    }
}

/// How credentials are reduced to sub-pool keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    /// Every caller shares one sub-pool.
    OnePool,
    /// Partition by request parameters only.
    ByRequestInfo,
    /// Partition by security subject only.
    BySubject,
    /// Partition by subject and request parameters.
    #[default]
    BySubjectAndRequestInfo,
}

impl PoolStrategy {
    /// Reduce a credential to the key of the sub-pool serving it.
    pub fn key_for(&self, credential: &Credential) -> PoolKey {
        let (subject, request_info) = match self {
            Self::OnePool => (None, None),
            Self::ByRequestInfo => (None, credential.request_info.clone()),
            Self::BySubject => (credential.subject.clone(), None),
            Self::BySubjectAndRequestInfo => {
                (credential.subject.clone(), credential.request_info.clone())
            }
        };
        PoolKey {
            subject,
            request_info,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OnePool => "one_pool",
            Self::ByRequestInfo => "by_request_info",
            Self::BySubject => "by_subject",
            Self::BySubjectAndRequestInfo => "by_subject_and_request_info",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "one_pool" | "one" => Some(Self::OnePool),
            "by_request_info" | "by_cri" => Some(Self::ByRequestInfo),
            "by_subject" => Some(Self::BySubject),
            "by_subject_and_request_info" | "by_subject_and_cri" => {
                Some(Self::BySubjectAndRequestInfo)
            }
            _ => None,
        }
    }
}

/// Sub-pool partition key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PoolKey {
    subject: Option<Subject>,
    request_info: Option<RequestInfo>,
}

impl PoolKey {
    /// Key of the sub-pool used for credential-less requests and prefill.
    pub fn default_key() -> Self {
        Self::default()
    }

    pub fn is_default(&self) -> bool {
        self.subject.is_none() && self.request_info.is_none()
    }

    /// Credential equivalent to this key, used when the pool itself creates
    /// connections (prefill, capacity increase).
    pub fn to_credential(&self) -> Credential {
        Credential::new(self.subject.clone(), self.request_info.clone())
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subject {
            Some(subject) => write!(f, "{}", subject.principal)?,
            None => write!(f, "*")?,
        }
        if let Some(info) = &self.request_info {
            let params: Vec<String> = info.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "[{}]", params.join(","))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice_orders() -> Credential {
        Credential::new(
            Some(Subject::with_secret("alice", "s3cret")),
            Some(RequestInfo::new().with("db", "orders")),
        )
    }

    #[test]
    fn test_strategy_partitions() {
        let cred = alice_orders();
        assert!(PoolStrategy::OnePool.key_for(&cred).is_default());

        let by_subject = PoolStrategy::BySubject.key_for(&cred);
        let bob = Credential::new(
            Some(Subject::new("bob")),
            Some(RequestInfo::new().with("db", "orders")),
        );
        assert_ne!(by_subject, PoolStrategy::BySubject.key_for(&bob));
        assert_eq!(
            PoolStrategy::ByRequestInfo.key_for(&cred),
            PoolStrategy::ByRequestInfo.key_for(&bob)
        );
    }

    #[test]
    fn test_request_info_order_independent() {
        let a = RequestInfo::new().with("db", "x").with("schema", "y");
        let b = RequestInfo::new().with("schema", "y").with("db", "x");
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_display_hides_secret() {
        let key = PoolStrategy::default().key_for(&alice_orders());
        let shown = key.to_string();
        assert_eq!(shown, "alice[db=orders]");
        assert!(!shown.contains("s3cret"));
    }

    #[test]
    fn test_parse_strategy_names() {
        assert_eq!(PoolStrategy::parse("one-pool"), Some(PoolStrategy::OnePool));
        assert_eq!(PoolStrategy::parse("BY_CRI"), Some(PoolStrategy::ByRequestInfo));
        assert_eq!(PoolStrategy::parse("nope"), None);
    }
}
