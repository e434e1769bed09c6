use nostr::Event;

/// Kind ranges from NIP-01.
const REPLACEABLE_RANGE: std::ops::Range<u16> = 10_000..20_000;
const EPHEMERAL_RANGE: std::ops::Range<u16> = 20_000..30_000;
const ADDRESSABLE_RANGE: std::ops::Range<u16> = 30_000..40_000;

/// Derived, read-only views over an event's immutable fields.
pub trait EventExt {
    fn is_ephemeral(&self) -> bool;
    fn is_replaceable(&self) -> bool;
    /// Parameterized replaceable events (NIP-33).
    fn is_addressable(&self) -> bool;
    /// Value of the first `d` tag, if any.
    fn identifier(&self) -> Option<&str>;
    /// First values of every tag named `name`.
    fn tag_values<'a>(&'a self, name: &'a str) -> Box<dyn Iterator<Item = &'a str> + 'a>;
    /// Identity used to collapse repeated delivery of the same logical event.
    ///
    /// `kind:pubkey:d` for addressable events, `kind:pubkey` for replaceable
    /// events and the event id otherwise.
    fn dedup_key(&self) -> String;
}

impl EventExt for Event {
    fn is_ephemeral(&self) -> bool {
        EPHEMERAL_RANGE.contains(&self.kind.as_u16())
    }

    fn is_replaceable(&self) -> bool {
        let kind = self.kind.as_u16();
        kind == 0 || kind == 3 || REPLACEABLE_RANGE.contains(&kind)
    }

    fn is_addressable(&self) -> bool {
        ADDRESSABLE_RANGE.contains(&self.kind.as_u16())
    }

    fn identifier(&self) -> Option<&str> {
        self.tag_values("d").next()
    }

    fn tag_values<'a>(&'a self, name: &'a str) -> Box<dyn Iterator<Item = &'a str> + 'a> {
        Box::new(self.tags.iter().filter_map(move |tag| {
            let parts = tag.as_slice();
            match parts.first() {
                Some(tag_name) if tag_name == name => parts.get(1).map(String::as_str),
                _ => None,
            }
        }))
    }

    fn dedup_key(&self) -> String {
        if self.is_addressable() {
            format!(
                "{}:{}:{}",
                self.kind.as_u16(),
                self.pubkey.to_hex(),
                self.identifier().unwrap_or_default()
            )
        } else if self.is_replaceable() {
            format!("{}:{}", self.kind.as_u16(), self.pubkey.to_hex())
        } else {
            self.id.to_hex()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_event;
    use nostr::{Keys, Tag};

    #[test]
    fn test_regular_event_dedup_key_is_event_id() {
        let keys = Keys::generate();
        let event = create_test_event(&keys, 1, vec![], "hello");

        assert_eq!(event.dedup_key(), event.id.to_hex());
        assert_eq!(event.dedup_key(), event.dedup_key());
    }

    #[test]
    fn test_regular_events_with_different_ids_have_different_keys() {
        let keys = Keys::generate();
        let first = create_test_event(&keys, 1, vec![], "first");
        let second = create_test_event(&keys, 1, vec![], "second");

        assert_ne!(first.dedup_key(), second.dedup_key());
    }

    #[test]
    fn test_replaceable_event_dedup_key() {
        let keys = Keys::generate();
        let profile = create_test_event(&keys, 0, vec![], "{}");
        let newer_profile = create_test_event(&keys, 0, vec![], "{\"name\":\"x\"}");
        let contacts = create_test_event(&keys, 3, vec![], "");

        assert!(profile.is_replaceable());
        assert_eq!(
            profile.dedup_key(),
            format!("0:{}", keys.public_key().to_hex())
        );
        assert_eq!(profile.dedup_key(), newer_profile.dedup_key());
        assert_ne!(profile.dedup_key(), contacts.dedup_key());

        let other_keys = Keys::generate();
        let other_profile = create_test_event(&other_keys, 0, vec![], "{}");
        assert_ne!(profile.dedup_key(), other_profile.dedup_key());
    }

    #[test]
    fn test_addressable_event_dedup_key_includes_identifier() {
        let keys = Keys::generate();
        let article = create_test_event(&keys, 30023, vec![Tag::identifier("post")], "");
        let other_article = create_test_event(&keys, 30023, vec![Tag::identifier("other")], "");
        let untagged = create_test_event(&keys, 30023, vec![], "");

        assert!(article.is_addressable());
        assert!(!article.is_replaceable());
        assert_eq!(
            article.dedup_key(),
            format!("30023:{}:post", keys.public_key().to_hex())
        );
        assert_ne!(article.dedup_key(), other_article.dedup_key());
        assert_eq!(
            untagged.dedup_key(),
            format!("30023:{}:", keys.public_key().to_hex())
        );
    }

    #[test]
    fn test_ephemeral_range() {
        let keys = Keys::generate();
        assert!(create_test_event(&keys, 20001, vec![], "").is_ephemeral());
        assert!(!create_test_event(&keys, 1, vec![], "").is_ephemeral());
        assert!(!create_test_event(&keys, 30000, vec![], "").is_ephemeral());
    }

    #[test]
    fn test_tag_values_reads_first_value_of_matching_tags() {
        let keys = Keys::generate();
        let event = create_test_event(
            &keys,
            1,
            vec![Tag::hashtag("nostr"), Tag::hashtag("rust")],
            "",
        );

        let values: Vec<&str> = event.tag_values("t").collect();
        assert_eq!(values, vec!["nostr", "rust"]);
        assert_eq!(event.tag_values("p").count(), 0);
    }
}
