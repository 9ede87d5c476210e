//! Opaque cache keys for invalidation

use std::fmt;

use serde::{Deserialize, Serialize};

/// One segment of a query key path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryKeySegment {
    Num(i64),
    Str(String),
}

impl From<&str> for QueryKeySegment {
    fn from(s: &str) -> Self {
        QueryKeySegment::Str(s.to_string())
    }
}

impl From<String> for QueryKeySegment {
    fn from(s: String) -> Self {
        QueryKeySegment::Str(s)
    }
}

impl From<i64> for QueryKeySegment {
    fn from(n: i64) -> Self {
        QueryKeySegment::Num(n)
    }
}

impl From<i32> for QueryKeySegment {
    fn from(n: i32) -> Self {
        QueryKeySegment::Num(n.into())
    }
}

/// Identifier of a cached view, e.g. `["tickets", "board", 42]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(pub Vec<QueryKeySegment>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<QueryKeySegment>,
    {
        QueryKey(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[QueryKeySegment] {
        &self.0
    }

    /// Append a segment, returning the longer key
    pub fn push(mut self, segment: impl Into<QueryKeySegment>) -> Self {
        self.0.push(segment.into());
        self
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

#[macro_export]
/// Build a [`QueryKey`](crate::QueryKey) from mixed string/integer segments
///
/// ```
/// use realtime_sync::query_key;
/// let key = query_key!["tickets", 42];
/// assert_eq!(key.to_string(), r#"["tickets",42]"#);
/// ```
macro_rules! query_key {
    ($($segment:expr),* $(,)?) => {
        $crate::QueryKey(vec![$($crate::QueryKeySegment::from($segment)),*])
    };
}
