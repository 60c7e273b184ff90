use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// ULIDs sort by creation time, so ids minted by one client for its own
/// messages compare in send order.
///
/// # Examples
/// ```
/// let id = tandem_common::id::prefixed_ulid("msg");
/// assert!(id.starts_with("msg_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Returns true if `id` looks like an id minted by [`prefixed_ulid`] with `prefix`.
pub fn has_prefix(id: &str, prefix: &str) -> bool {
    id.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|ulid| Ulid::from_string(ulid).is_ok())
}

/// Marker trait for types that represent a prefixed ID.
pub trait PrefixedId {
    const PREFIX: &'static str;

    fn generate() -> String {
        prefixed_ulid(Self::PREFIX)
    }
}

/// Well-known ID prefixes.
pub mod prefix {
    /// Client-generated correlation id of an optimistic message.
    pub const MSG: &str = "msg";
    /// Server-assigned message id.
    pub const SRV: &str = "srv";
    pub const OPERATION: &str = "op";
    pub const USER: &str = "usr";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_ulid_format() {
        let id = prefixed_ulid("msg");
        assert!(id.starts_with("msg_"));
        // ULID is 26 chars, plus prefix + underscore
        assert_eq!(id.len(), 4 + 26);
    }

    #[test]
    fn test_uniqueness() {
        let a = prefixed_ulid("msg");
        let b = prefixed_ulid("msg");
        assert_ne!(a, b);
    }

    #[test]
    fn has_prefix_accepts_generated_ids() {
        let id = prefixed_ulid(prefix::MSG);
        assert!(has_prefix(&id, prefix::MSG));
        assert!(!has_prefix(&id, prefix::SRV));
    }

    #[test]
    fn has_prefix_rejects_malformed_ids() {
        assert!(!has_prefix("msg_", prefix::MSG));
        assert!(!has_prefix("msg-01ARZ3NDEKTSV4RRFFQ69G5FAV", prefix::MSG));
        assert!(!has_prefix("msg_not-a-ulid", prefix::MSG));
    }

    #[test]
    fn marker_trait_uses_prefix() {
        struct LocalMessageId;
        impl PrefixedId for LocalMessageId {
            const PREFIX: &'static str = prefix::MSG;
        }
        assert!(LocalMessageId::generate().starts_with("msg_"));
    }
}
