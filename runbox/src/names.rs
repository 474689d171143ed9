use nutype::nutype;
use uuid::Uuid;

/// Opaque per-request token, e.g. `3e0c0f9e-5f1e-4a9e-b1d6-0c8a4f3b2a10`.
///
/// Prefixes every published store filename, so two concurrent requests can
/// never collide on a store path.
#[nutype(
    validate(predicate = execution_token),
    derive(Clone, Debug, Display, Deref, Eq, PartialEq, Hash))
]
pub(crate) struct ExecutionId(String);

#[inline]
#[must_use]
fn execution_token(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

impl ExecutionId {
    #[must_use]
    pub(crate) fn random() -> Self {
        Self::try_new(Uuid::new_v4().to_string()).expect("PROOF: UUIDs are hex and dashes")
    }
}

/// A file name reduced to its final path segment.
///
/// Rejects the empty name and the dot dirs, so a `SafeName` can be joined
/// under a store or workspace directory without escaping it.
#[nutype(
    sanitize(with = base_name),
    validate(predicate = plain_name),
    derive(Clone, Debug, Display, Deref, TryFrom, Eq, PartialEq, Hash))
]
pub(crate) struct SafeName(String);

#[inline]
#[must_use]
fn base_name(name: String) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or_default().to_owned()
}

#[inline]
#[must_use]
fn plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".."
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::{ExecutionId, SafeName};

    #[test]
    fn random_ids_validate_and_differ() {
        let a = ExecutionId::random();
        let b = ExecutionId::random();
        assert_ne!(a, b);
        assert!(ExecutionId::try_new(a.to_string()).is_ok());
    }

    #[test]
    fn ids_reject_separators() {
        assert!(ExecutionId::try_new("").is_err());
        assert!(ExecutionId::try_new("../etc").is_err());
        assert!(ExecutionId::try_new("a/b").is_err());
    }

    #[test_case("data.csv", "data.csv"; "plain")]
    #[test_case("/etc/passwd", "passwd"; "absolute")]
    #[test_case("a/b/../c.txt", "c.txt"; "relative")]
    #[test_case("dir\\note.md", "note.md"; "backslashes")]
    #[test_case("工作簿1_副本.csv", "工作簿1_副本.csv"; "non ascii")]
    fn safe_names(raw: &str, expected: &str) {
        pretty_assertions::assert_eq!(SafeName::try_new(raw).unwrap().to_string(), expected);
    }

    #[test_case(""; "empty")]
    #[test_case("."; "dot")]
    #[test_case(".."; "dotdot")]
    #[test_case("uploads/"; "trailing separator")]
    fn unsafe_names(raw: &str) {
        assert!(SafeName::try_new(raw).is_err());
    }
}
