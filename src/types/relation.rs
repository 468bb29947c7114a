use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// 节点之间连线的关系标签, 组件可以上报任意标签
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationType(Cow<'static, str>);

impl RelationType {
    pub const SUCCESS: RelationType = RelationType(Cow::Borrowed("Success"));
    pub const FAILURE: RelationType = RelationType(Cow::Borrowed("Failure"));
    pub const TRUE: RelationType = RelationType(Cow::Borrowed("True"));
    pub const FALSE: RelationType = RelationType(Cow::Borrowed("False"));

    pub fn new(label: impl Into<String>) -> Self {
        RelationType(Cow::Owned(label.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_failure(&self) -> bool {
        *self == Self::FAILURE
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RelationType {
    fn from(label: &str) -> Self {
        RelationType::new(label)
    }
}

impl From<String> for RelationType {
    fn from(label: String) -> Self {
        RelationType::new(label)
    }
}

impl From<&RelationType> for RelationType {
    fn from(relation: &RelationType) -> Self {
        relation.clone()
    }
}

impl PartialEq<str> for RelationType {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for RelationType {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
