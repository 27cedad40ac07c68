//! Active-feed resolution for consumers.
//!
//! Two feed representations coexist in stored data: legacy feeds carry a
//! single NORMAL/RESERVE marker, current feeds carry a named role and a
//! priority with optional per-consumer mode rules. Both are normalized to a
//! [`ResolvedFeed`] before aggregation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::{
    BusSectionId, Consumer, ConsumerId, Feed, FeedId, FeedRoleId, LegacyFeedRole, Mode, ModeRule,
};
use crate::error::{CalcError, CalcResult};

/// How the active feed was picked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedSelection {
    /// Legacy marker matched the mode
    LegacyRole,
    /// Feed with the role named by the mode rule (or its default)
    ModeRole,
    /// Rule role absent, first MAIN feed taken
    PrimaryFallback,
    /// Neither present, first feed by priority taken
    AnyFeedFallback,
}

/// The single feed a consumer draws through in a given mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFeed {
    pub consumer_id: ConsumerId,
    pub feed_id: FeedId,
    pub bus_section_id: BusSectionId,
    pub selection: FeedSelection,
}

/// Feeds and mode rules of one panel, grouped by consumer
#[derive(Debug, Clone, Default)]
pub struct FeedIndex {
    feeds: HashMap<ConsumerId, Vec<Feed>>,
    rules: HashMap<(ConsumerId, Mode), FeedRoleId>,
}

impl FeedIndex {
    pub fn new(feeds: impl IntoIterator<Item = Feed>, rules: impl IntoIterator<Item = ModeRule>) -> Self {
        let mut by_consumer: HashMap<ConsumerId, Vec<Feed>> = HashMap::new();
        for feed in feeds {
            by_consumer.entry(feed.consumer_id).or_default().push(feed);
        }
        for list in by_consumer.values_mut() {
            list.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        }
        let rules = rules
            .into_iter()
            .map(|r| ((r.consumer_id, r.mode), r.active_role))
            .collect();
        Self {
            feeds: by_consumer,
            rules,
        }
    }

    /// Role that is live for a consumer in `mode`
    pub fn active_role(&self, consumer_id: ConsumerId, mode: Mode) -> FeedRoleId {
        self.rules
            .get(&(consumer_id, mode))
            .cloned()
            .unwrap_or_else(|| ModeRule::default_role(mode))
    }

    /// Resolve the active feed of `consumer` in `mode`.
    ///
    /// `Ok(None)` when the consumer has no usable feed. Consumers whose
    /// feeds carry named roles use the current strategy; the rest fall
    /// back to legacy markers.
    pub fn resolve(&self, consumer: &Consumer, mode: Mode) -> CalcResult<Option<ResolvedFeed>> {
        let feeds = match self.feeds.get(&consumer.id) {
            Some(feeds) if !feeds.is_empty() => feeds,
            _ => return Ok(None),
        };

        if feeds.iter().any(|f| f.role_id.is_some()) {
            Ok(self.resolve_by_role(consumer, feeds, mode))
        } else {
            resolve_legacy(consumer, feeds, mode)
        }
    }

    fn resolve_by_role(&self, consumer: &Consumer, feeds: &[Feed], mode: Mode) -> Option<ResolvedFeed> {
        let role = self.active_role(consumer.id, mode);
        let (feed, selection) = if let Some(feed) = first_with_role(feeds, &role) {
            (feed, FeedSelection::ModeRole)
        } else if let Some(feed) = first_with_role(feeds, &FeedRoleId::primary()) {
            (feed, FeedSelection::PrimaryFallback)
        } else {
            (feeds.first()?, FeedSelection::AnyFeedFallback)
        };

        Some(ResolvedFeed {
            consumer_id: consumer.id,
            feed_id: feed.id,
            bus_section_id: feed.bus_section_id,
            selection,
        })
    }
}

fn first_with_role<'f>(feeds: &'f [Feed], role: &FeedRoleId) -> Option<&'f Feed> {
    feeds.iter().find(|f| f.role_id.as_ref() == Some(role))
}

fn resolve_legacy(consumer: &Consumer, feeds: &[Feed], mode: Mode) -> CalcResult<Option<ResolvedFeed>> {
    let wanted = LegacyFeedRole::for_mode(mode);
    let mut matching = feeds.iter().filter(|f| f.legacy_role == Some(wanted));
    let Some(feed) = matching.next() else {
        return Ok(None);
    };
    if matching.next().is_some() {
        return Err(CalcError::validation(format!(
            "Consumer {} has more than one {} feed",
            consumer.name, wanted
        )));
    }
    Ok(Some(ResolvedFeed {
        consumer_id: consumer.id,
        feed_id: feed.id,
        bus_section_id: feed.bus_section_id,
        selection: FeedSelection::LegacyRole,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LoadReference, ManualLoad, PanelId};
    use crate::error::ErrorKind;

    fn consumer() -> Consumer {
        Consumer::new(PanelId::new(), "pump", LoadReference::Manual(ManualLoad::new(1.0, 0.0, 1.0, 2.0)))
    }

    #[test]
    fn test_default_roles_per_mode() {
        let c = consumer();
        let main_section = BusSectionId::new();
        let reserve_section = BusSectionId::new();
        let index = FeedIndex::new(
            [
                Feed::with_role(c.id, main_section, FeedRoleId::primary(), 1),
                Feed::with_role(c.id, reserve_section, FeedRoleId::reserve(), 1),
            ],
            [],
        );

        let normal = index.resolve(&c, Mode::Normal).unwrap().unwrap();
        assert_eq!(normal.bus_section_id, main_section);
        assert_eq!(normal.selection, FeedSelection::ModeRole);

        let emergency = index.resolve(&c, Mode::Emergency).unwrap().unwrap();
        assert_eq!(emergency.bus_section_id, reserve_section);
    }

    #[test]
    fn test_mode_rule_overrides_default() {
        let c = consumer();
        let main_section = BusSectionId::new();
        let index = FeedIndex::new(
            [
                Feed::with_role(c.id, main_section, FeedRoleId::primary(), 1),
                Feed::with_role(c.id, BusSectionId::new(), FeedRoleId::reserve(), 1),
            ],
            [ModeRule {
                consumer_id: c.id,
                mode: Mode::Emergency,
                active_role: FeedRoleId::primary(),
            }],
        );
        let resolved = index.resolve(&c, Mode::Emergency).unwrap().unwrap();
        assert_eq!(resolved.bus_section_id, main_section);
    }

    #[test]
    fn test_priority_orders_same_role() {
        let c = consumer();
        let preferred = BusSectionId::new();
        let index = FeedIndex::new(
            [
                Feed::with_role(c.id, BusSectionId::new(), FeedRoleId::primary(), 5),
                Feed::with_role(c.id, preferred, FeedRoleId::primary(), 1),
            ],
            [],
        );
        let resolved = index.resolve(&c, Mode::Normal).unwrap().unwrap();
        assert_eq!(resolved.bus_section_id, preferred);
    }

    #[test]
    fn test_fallbacks() {
        let c = consumer();
        let main_section = BusSectionId::new();
        let index = FeedIndex::new([Feed::with_role(c.id, main_section, FeedRoleId::primary(), 1)], []);
        let resolved = index.resolve(&c, Mode::Emergency).unwrap().unwrap();
        assert_eq!(resolved.selection, FeedSelection::PrimaryFallback);
        assert_eq!(resolved.bus_section_id, main_section);

        let other = BusSectionId::new();
        let index = FeedIndex::new([Feed::with_role(c.id, other, FeedRoleId::new("GENERATOR"), 1)], []);
        let resolved = index.resolve(&c, Mode::Normal).unwrap().unwrap();
        assert_eq!(resolved.selection, FeedSelection::AnyFeedFallback);
        assert_eq!(resolved.bus_section_id, other);
    }

    #[test]
    fn test_legacy_roles() {
        let c = consumer();
        let normal_section = BusSectionId::new();
        let index = FeedIndex::new([Feed::legacy(c.id, normal_section, LegacyFeedRole::Normal)], []);

        let resolved = index.resolve(&c, Mode::Normal).unwrap().unwrap();
        assert_eq!(resolved.bus_section_id, normal_section);
        assert_eq!(resolved.selection, FeedSelection::LegacyRole);
        assert!(index.resolve(&c, Mode::Emergency).unwrap().is_none());
    }

    #[test]
    fn test_legacy_duplicate_role_rejected() {
        let c = consumer();
        let index = FeedIndex::new(
            [
                Feed::legacy(c.id, BusSectionId::new(), LegacyFeedRole::Reserve),
                Feed::legacy(c.id, BusSectionId::new(), LegacyFeedRole::Reserve),
            ],
            [],
        );
        let err = index.resolve(&c, Mode::Emergency).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[test]
    fn test_consumer_without_feeds() {
        let index = FeedIndex::default();
        assert!(index.resolve(&consumer(), Mode::Normal).unwrap().is_none());
    }
}
