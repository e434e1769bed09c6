//! Consumer-declared predicates over events.
//!
//! A [`Filter`] is built once and never mutated afterwards. Besides matching it
//! provides a canonical [`Filter::fingerprint`] that ignores time bounds and the
//! result limit, which is the key used to group equivalent subscriptions.

use crate::error::Error;
use crate::event::EventExt;
use nostr::{Event, EventId, Kind, PublicKey, Timestamp};
use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::cmp::{max, min};
use std::collections::{BTreeMap, BTreeSet};

const FINGERPRINT_SEPARATOR: &str = "|";

/// Characters with structural meaning in a subscription key.
const RESERVED: [char; 5] = ['\\', ',', '|', ';', ':'];

/// Backslash-escapes `value` so it cannot be mistaken for key structure.
fn escape(value: &str) -> Cow<'_, str> {
    if !value.contains(RESERVED) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 4);
    for c in value.chars() {
        if RESERVED.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    Cow::Owned(escaped)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    ids: Option<BTreeSet<EventId>>,
    authors: Option<BTreeSet<PublicKey>>,
    kinds: Option<BTreeSet<Kind>>,
    tags: BTreeMap<String, BTreeSet<String>>,
    since: Option<Timestamp>,
    until: Option<Timestamp>,
    limit: Option<usize>,
    search: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: EventId) -> Self {
        self.ids.get_or_insert_with(BTreeSet::new).insert(id);
        self
    }

    pub fn ids<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = EventId>,
    {
        self.ids.get_or_insert_with(BTreeSet::new).extend(ids);
        self
    }

    pub fn author(mut self, author: PublicKey) -> Self {
        self.authors.get_or_insert_with(BTreeSet::new).insert(author);
        self
    }

    pub fn authors<I>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = PublicKey>,
    {
        self.authors.get_or_insert_with(BTreeSet::new).extend(authors);
        self
    }

    pub fn kind(mut self, kind: Kind) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).insert(kind);
        self
    }

    pub fn kinds<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = Kind>,
    {
        self.kinds.get_or_insert_with(BTreeSet::new).extend(kinds);
        self
    }

    /// Constrains tag `name` (without the leading `#`) to any of `values`.
    pub fn tag<N, I, S>(mut self, name: N, values: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(name.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn search<S: Into<String>>(mut self, search: S) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn get_ids(&self) -> Option<&BTreeSet<EventId>> {
        self.ids.as_ref()
    }

    pub fn get_authors(&self) -> Option<&BTreeSet<PublicKey>> {
        self.authors.as_ref()
    }

    pub fn get_kinds(&self) -> Option<&BTreeSet<Kind>> {
        self.kinds.as_ref()
    }

    pub fn get_tags(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.tags
    }

    pub fn get_since(&self) -> Option<Timestamp> {
        self.since
    }

    pub fn get_until(&self) -> Option<Timestamp> {
        self.until
    }

    pub fn get_limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn get_search(&self) -> Option<&str> {
        self.search.as_deref()
    }

    /// Rejects filters that can never be sent to a relay or never match.
    pub fn validate(&self) -> Result<(), Error> {
        if self.ids.as_ref().is_some_and(BTreeSet::is_empty) {
            return Err(Error::invalid_filter("ids must not be empty when present"));
        }
        if self.authors.as_ref().is_some_and(BTreeSet::is_empty) {
            return Err(Error::invalid_filter(
                "authors must not be empty when present",
            ));
        }
        if self.kinds.as_ref().is_some_and(BTreeSet::is_empty) {
            return Err(Error::invalid_filter("kinds must not be empty when present"));
        }

        for (name, values) in &self.tags {
            let mut chars = name.chars();
            let single_letter = matches!(
                (chars.next(), chars.next()),
                (Some(c), None) if c.is_ascii_alphabetic()
            );
            if !single_letter {
                return Err(Error::invalid_filter(format!(
                    "tag name '{}' must be a single letter",
                    name
                )));
            }
            if values.is_empty() {
                return Err(Error::invalid_filter(format!(
                    "tag '#{}' must have at least one value",
                    name
                )));
            }
        }

        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err(Error::invalid_filter(format!(
                    "since ({}) is after until ({})",
                    since.as_u64(),
                    until.as_u64()
                )));
            }
        }

        Ok(())
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }

        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }

        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }

        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }

        self.tags.iter().all(|(name, values)| {
            event
                .tag_values(name)
                .any(|value| values.contains(value))
        })
    }

    /// Canonical selection criteria, excluding since, until, limit and search.
    pub fn fingerprint(&self) -> String {
        let mut segments = Vec::new();

        if let Some(ids) = &self.ids {
            let ids: Vec<String> = ids.iter().map(EventId::to_hex).collect();
            segments.push(format!("i:{}", ids.join(",")));
        }

        if let Some(authors) = &self.authors {
            let authors: Vec<String> = authors.iter().map(PublicKey::to_hex).collect();
            segments.push(format!("a:{}", authors.join(",")));
        }

        if let Some(kinds) = &self.kinds {
            let mut kinds: Vec<u16> = kinds.iter().map(|kind| kind.as_u16()).collect();
            kinds.sort_unstable();
            let kinds: Vec<String> = kinds.iter().map(u16::to_string).collect();
            segments.push(format!("k:{}", kinds.join(",")));
        }

        for (name, values) in &self.tags {
            let values: Vec<Cow<'_, str>> = values.iter().map(|value| escape(value)).collect();
            segments.push(format!("#{}:{}", escape(name), values.join(",")));
        }

        segments.join(FINGERPRINT_SEPARATOR)
    }

    /// Everything a relay selects on, with since, until and limit cleared.
    /// Filters that share a group must agree on this exactly.
    pub(crate) fn selection(&self) -> Self {
        Self {
            since: None,
            until: None,
            limit: None,
            ..self.clone()
        }
    }

    /// Copy without since/until, used when querying the local cache.
    pub fn without_time_bounds(&self) -> Self {
        Self {
            since: None,
            until: None,
            ..self.clone()
        }
    }

    /// Widens this filter's bounds so it also covers `other`.
    ///
    /// An absent bound is unbounded, so it always wins.
    pub(crate) fn widen_bounds(&mut self, other: &Filter) {
        self.since = self.since.zip(other.since).map(|(a, b)| min(a, b));
        self.until = self.until.zip(other.until).map(|(a, b)| max(a, b));
        self.limit = self.limit.zip(other.limit).map(|(a, b)| max(a, b));
    }

    pub fn to_value(&self) -> Value {
        // Serializing into a Value cannot fail for this shape
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn as_json(&self) -> String {
        self.to_value().to_string()
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| Error::invalid_filter(format!("malformed JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, Error> {
        let Value::Object(object) = value else {
            return Err(Error::invalid_filter("filter must be a JSON object"));
        };

        let mut filter = Filter::new();
        for (key, value) in object {
            match key.as_str() {
                "ids" => {
                    let ids = string_array(&key, value)?
                        .iter()
                        .map(|hex| {
                            EventId::from_hex(hex).map_err(|e| {
                                Error::invalid_filter(format!("invalid id '{}': {}", hex, e))
                            })
                        })
                        .collect::<Result<BTreeSet<_>, _>>()?;
                    filter.ids = Some(ids);
                }
                "authors" => {
                    let authors = string_array(&key, value)?
                        .iter()
                        .map(|hex| {
                            PublicKey::from_hex(hex).map_err(|e| {
                                Error::invalid_filter(format!("invalid author '{}': {}", hex, e))
                            })
                        })
                        .collect::<Result<BTreeSet<_>, _>>()?;
                    filter.authors = Some(authors);
                }
                "kinds" => {
                    let Value::Array(items) = value else {
                        return Err(Error::invalid_filter("kinds must be an array"));
                    };
                    let kinds = items
                        .iter()
                        .map(|item| {
                            item.as_u64()
                                .and_then(|kind| u16::try_from(kind).ok())
                                .map(Kind::from)
                                .ok_or_else(|| {
                                    Error::invalid_filter(format!("invalid kind {}", item))
                                })
                        })
                        .collect::<Result<BTreeSet<_>, _>>()?;
                    filter.kinds = Some(kinds);
                }
                "since" => filter.since = Some(Timestamp::from(unsigned(&key, &value)?)),
                "until" => filter.until = Some(Timestamp::from(unsigned(&key, &value)?)),
                "limit" => {
                    let limit = usize::try_from(unsigned(&key, &value)?)
                        .map_err(|_| Error::invalid_filter("limit out of range"))?;
                    filter.limit = Some(limit);
                }
                "search" => {
                    let Value::String(search) = value else {
                        return Err(Error::invalid_filter("search must be a string"));
                    };
                    filter.search = Some(search);
                }
                _ => {
                    if let Some(name) = key.strip_prefix('#') {
                        let values = string_array(&key, value)?;
                        filter.tags.insert(name.to_string(), values.into_iter().collect());
                    }
                }
            }
        }

        filter.validate()?;
        Ok(filter)
    }
}

fn string_array(key: &str, value: Value) -> Result<Vec<String>, Error> {
    let Value::Array(items) = value else {
        return Err(Error::invalid_filter(format!("{} must be an array", key)));
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::String(s) => Ok(s),
            other => Err(Error::invalid_filter(format!(
                "{} must contain strings, found {}",
                key, other
            ))),
        })
        .collect()
}

fn unsigned(key: &str, value: &Value) -> Result<u64, Error> {
    value
        .as_u64()
        .ok_or_else(|| Error::invalid_filter(format!("{} must be a non-negative integer", key)))
}

impl Serialize for Filter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        if let Some(ids) = &self.ids {
            let ids: Vec<String> = ids.iter().map(EventId::to_hex).collect();
            map.serialize_entry("ids", &ids)?;
        }
        if let Some(authors) = &self.authors {
            let authors: Vec<String> = authors.iter().map(PublicKey::to_hex).collect();
            map.serialize_entry("authors", &authors)?;
        }
        if let Some(kinds) = &self.kinds {
            let kinds: Vec<u16> = kinds.iter().map(|kind| kind.as_u16()).collect();
            map.serialize_entry("kinds", &kinds)?;
        }
        for (name, values) in &self.tags {
            map.serialize_entry(&format!("#{}", name), values)?;
        }
        if let Some(since) = self.since {
            map.serialize_entry("since", &since.as_u64())?;
        }
        if let Some(until) = self.until {
            map.serialize_entry("until", &until.as_u64())?;
        }
        if let Some(limit) = self.limit {
            map.serialize_entry("limit", &limit)?;
        }
        if let Some(search) = &self.search {
            map.serialize_entry("search", search)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let object = Map::<String, Value>::deserialize(deserializer)?;
        Filter::from_value(Value::Object(object)).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_event, create_test_event_at, kind};
    use nostr::{Keys, Tag};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_filter_matches_everything_and_has_empty_fingerprint() {
        let keys = Keys::generate();
        let filter = Filter::new();

        assert!(filter.matches(&create_test_event(&keys, 1, vec![], "a")));
        assert!(filter.matches(&create_test_event(&keys, 30023, vec![], "b")));
        assert_eq!(filter.fingerprint(), "");
    }

    #[test]
    fn test_kind_fingerprint_ignores_limit() {
        let narrow = Filter::new().kind(kind(1)).limit(10);
        let wide = Filter::new().kind(kind(1)).limit(50);

        assert_eq!(narrow.fingerprint(), "k:1");
        assert_eq!(wide.fingerprint(), "k:1");
    }

    #[test]
    fn test_fingerprint_ignores_time_bounds_and_search() {
        let keys = Keys::generate();
        let base = Filter::new()
            .author(keys.public_key())
            .kinds([kind(7), kind(1)])
            .tag("t", ["rust", "nostr"]);
        let bounded = base
            .clone()
            .since(Timestamp::from(100_u64))
            .until(Timestamp::from(200_u64))
            .limit(5)
            .search("hello");

        assert_eq!(base.fingerprint(), bounded.fingerprint());
        assert_eq!(
            base.fingerprint(),
            format!("a:{}|k:1,7|#t:nostr,rust", keys.public_key().to_hex())
        );
    }

    #[test]
    fn test_fingerprint_is_independent_of_insertion_order() {
        let first = Filter::new()
            .kinds([kind(30023), kind(1), kind(6)])
            .tag("p", ["b", "a"])
            .tag("e", ["z"]);
        let second = Filter::new()
            .tag("e", ["z"])
            .tag("p", ["a", "b"])
            .kinds([kind(6), kind(30023), kind(1)]);

        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.fingerprint(), "k:1,6,30023|#e:z|#p:a,b");
    }

    #[test]
    fn test_fingerprint_escapes_separators_in_tag_values() {
        let joined = Filter::new().tag("t", ["x,y"]);
        let split = Filter::new().tag("t", ["x", "y"]);
        assert_ne!(joined.fingerprint(), split.fingerprint());
        assert_eq!(joined.fingerprint(), "#t:x\\,y");
        assert_eq!(split.fingerprint(), "#t:x,y");

        let smuggled = Filter::new().tag("t", ["a;k:1"]);
        assert_eq!(smuggled.fingerprint(), "#t:a\\;k\\:1");
        assert_eq!(
            Filter::new().tag("t", ["a|b\\"]).fingerprint(),
            "#t:a\\|b\\\\"
        );
    }

    #[test]
    fn test_selection_drops_bounds_but_keeps_search() {
        let filter = Filter::new()
            .kind(kind(1))
            .search("nostr")
            .since(Timestamp::from(1_u64))
            .until(Timestamp::from(2_u64))
            .limit(3);
        let selection = filter.selection();

        assert_eq!(selection, Filter::new().kind(kind(1)).search("nostr"));
        assert_ne!(selection, Filter::new().kind(kind(1)).search("other"));
    }

    #[test]
    fn test_matches_ids_authors_and_kinds() {
        let keys = Keys::generate();
        let other_keys = Keys::generate();
        let event = create_test_event(&keys, 1, vec![], "hello");

        assert!(Filter::new().id(event.id).matches(&event));
        assert!(Filter::new().author(keys.public_key()).matches(&event));
        assert!(!Filter::new().author(other_keys.public_key()).matches(&event));
        assert!(Filter::new().kinds([kind(1), kind(7)]).matches(&event));
        assert!(!Filter::new().kind(kind(7)).matches(&event));
        assert!(!Filter::new()
            .author(keys.public_key())
            .kind(kind(7))
            .matches(&event));
    }

    #[test]
    fn test_matches_time_bounds_inclusive() {
        let keys = Keys::generate();
        let event = create_test_event_at(&keys, 1, 1_000);

        assert!(Filter::new().since(Timestamp::from(1_000_u64)).matches(&event));
        assert!(Filter::new().until(Timestamp::from(1_000_u64)).matches(&event));
        assert!(!Filter::new().since(Timestamp::from(1_001_u64)).matches(&event));
        assert!(!Filter::new().until(Timestamp::from(999_u64)).matches(&event));
    }

    #[test]
    fn test_tag_matching_is_or_within_name_and_across_names() {
        let keys = Keys::generate();
        let event = create_test_event(
            &keys,
            1,
            vec![
                Tag::hashtag("nostr"),
                Tag::hashtag("rust"),
                Tag::identifier("slug"),
            ],
            "",
        );

        assert!(Filter::new().tag("t", ["rust", "go"]).matches(&event));
        assert!(!Filter::new().tag("t", ["go"]).matches(&event));
        assert!(Filter::new()
            .tag("t", ["nostr"])
            .tag("d", ["slug"])
            .matches(&event));
        assert!(!Filter::new()
            .tag("t", ["nostr"])
            .tag("d", ["other"])
            .matches(&event));
        assert!(!Filter::new().tag("p", ["anything"]).matches(&event));
    }

    #[test]
    fn test_validate_rejects_impossible_filters() {
        assert!(matches!(
            Filter::new().kinds(Vec::<Kind>::new()).validate(),
            Err(Error::InvalidFilter { .. })
        ));
        assert!(matches!(
            Filter::new().tag("topic", ["x"]).validate(),
            Err(Error::InvalidFilter { .. })
        ));
        assert!(matches!(
            Filter::new().tag("t", Vec::<String>::new()).validate(),
            Err(Error::InvalidFilter { .. })
        ));
        assert!(matches!(
            Filter::new()
                .since(Timestamp::from(10_u64))
                .until(Timestamp::from(5_u64))
                .validate(),
            Err(Error::InvalidFilter { .. })
        ));
        assert!(Filter::new()
            .kind(kind(1))
            .tag("t", ["x"])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_without_time_bounds_keeps_criteria() {
        let filter = Filter::new()
            .kind(kind(1))
            .since(Timestamp::from(1_u64))
            .until(Timestamp::from(2_u64))
            .limit(3);
        let stripped = filter.without_time_bounds();

        assert_eq!(stripped.get_since(), None);
        assert_eq!(stripped.get_until(), None);
        assert_eq!(stripped.get_limit(), Some(3));
        assert_eq!(stripped.fingerprint(), filter.fingerprint());
    }

    #[test]
    fn test_widen_bounds_takes_the_broadest_window() {
        let mut merged = Filter::new()
            .kind(kind(1))
            .since(Timestamp::from(200_u64))
            .until(Timestamp::from(300_u64))
            .limit(10);
        merged.widen_bounds(
            &Filter::new()
                .kind(kind(1))
                .since(Timestamp::from(100_u64))
                .until(Timestamp::from(250_u64))
                .limit(50),
        );

        assert_eq!(merged.get_since(), Some(Timestamp::from(100_u64)));
        assert_eq!(merged.get_until(), Some(Timestamp::from(300_u64)));
        assert_eq!(merged.get_limit(), Some(50));

        merged.widen_bounds(&Filter::new().kind(kind(1)));
        assert_eq!(merged.get_since(), None);
        assert_eq!(merged.get_until(), None);
        assert_eq!(merged.get_limit(), None);
    }

    #[test]
    fn test_parse_nip01_filter_object() {
        let keys = Keys::generate();
        let json = format!(
            r##"{{"authors":["{}"],"kinds":[1,6],"#t":["nostr"],"since":10,"limit":20,"extra":true}}"##,
            keys.public_key().to_hex()
        );
        let filter = Filter::from_json(&json).unwrap();

        assert_eq!(
            filter,
            Filter::new()
                .author(keys.public_key())
                .kinds([kind(1), kind(6)])
                .tag("t", ["nostr"])
                .since(Timestamp::from(10_u64))
                .limit(20)
        );
        assert_eq!(Filter::from_value(filter.to_value()).unwrap(), filter);
    }

    #[test]
    fn test_parse_rejects_malformed_filters() {
        assert!(Filter::from_json("[1]").is_err());
        assert!(Filter::from_json(r#"{"ids":["not-hex"]}"#).is_err());
        assert!(Filter::from_json(r#"{"kinds":[70000]}"#).is_err());
        assert!(Filter::from_json(r#"{"kinds":"1"}"#).is_err());
        assert!(Filter::from_json(r##"{"#t":[1]}"##).is_err());
        assert!(Filter::from_json(r#"{"since":-1}"#).is_err());
    }
}
