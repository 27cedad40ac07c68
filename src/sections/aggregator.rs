use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::feeds::{FeedIndex, ResolvedFeed};
use crate::domain::{
    BusSection, BusSectionId, Consumer, Feed, LoadReference, ManualLoad, Mode, ModeRule, PanelCalc,
    PanelId, SectionCalc, SectionLoad,
};
use crate::error::{CalcError, CalcResult, CalcWarning};

/// Inputs of one aggregation run, read in a single transaction
#[derive(Debug, Clone, Default)]
pub struct SectionInputs {
    pub bus_sections: Vec<BusSection>,
    pub consumers: Vec<Consumer>,
    pub feeds: Vec<Feed>,
    pub mode_rules: Vec<ModeRule>,
    /// Demand results of every panel a consumer references
    pub referenced_calcs: HashMap<PanelId, PanelCalc>,
}

/// Totals of one bus section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionTotal {
    pub bus_section_id: BusSectionId,
    pub name: String,
    pub order: i32,
    pub load: SectionLoad,
}

/// Per-section totals of a panel in one mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionAggregation {
    pub panel_id: PanelId,
    pub mode: Mode,
    /// Every section of the panel in display order, zero where nothing is fed
    pub sections: Vec<SectionTotal>,
    pub feeds: Vec<ResolvedFeed>,
    pub warnings: Vec<CalcWarning>,
}

impl SectionAggregation {
    pub fn section(&self, id: BusSectionId) -> Option<&SectionTotal> {
        self.sections.iter().find(|s| s.bus_section_id == id)
    }

    pub fn load_of(&self, id: BusSectionId) -> SectionLoad {
        self.section(id).map(|s| s.load).unwrap_or_default()
    }

    pub fn to_calcs(&self, computed_at: DateTime<Utc>) -> Vec<SectionCalc> {
        self.sections
            .iter()
            .map(|s| SectionCalc {
                panel_id: self.panel_id,
                bus_section_id: s.bus_section_id,
                mode: self.mode,
                load: s.load,
                updated_at: computed_at,
            })
            .collect()
    }
}

fn manual_load(consumer: &Consumer, manual: &ManualLoad) -> CalcResult<SectionLoad> {
    let field = |value: Option<f64>, name: &str| {
        value.ok_or_else(|| {
            CalcError::validation(format!("Consumer {}: manual {} is missing", consumer.name, name))
        })
    };
    Ok(SectionLoad {
        p_kw: field(manual.p_kw, "p_kw")?,
        q_kvar: field(manual.q_kvar, "q_kvar")?,
        s_kva: field(manual.s_kva, "s_kva")?,
        i_a: field(manual.i_a, "i_a")?,
    })
}

/// Load contributed by one consumer
pub fn consumer_load(consumer: &Consumer, calcs: &HashMap<PanelId, PanelCalc>) -> CalcResult<SectionLoad> {
    match &consumer.load {
        LoadReference::RtmPanel { panel_id } => calcs
            .get(panel_id)
            .map(SectionLoad::from)
            .ok_or_else(|| {
                CalcError::state(format!(
                    "Consumer {}: panel {} has no demand calculation",
                    consumer.name, panel_id
                ))
            }),
        LoadReference::RtmRow { row_id } => Err(CalcError::unsupported(format!(
            "Consumer {}: row-level load reference {} is not supported",
            consumer.name, row_id
        ))),
        LoadReference::Manual(manual) => manual_load(consumer, manual),
    }
}

/// Sum consumer loads onto the bus section each consumer is fed from in
/// `mode`. Consumers with no active feed are skipped with a warning.
pub fn aggregate(panel_id: PanelId, mode: Mode, inputs: &SectionInputs) -> CalcResult<SectionAggregation> {
    let mut sections: Vec<SectionTotal> = inputs
        .bus_sections
        .iter()
        .map(|s| SectionTotal {
            bus_section_id: s.id,
            name: s.name.clone(),
            order: s.order,
            load: SectionLoad::default(),
        })
        .collect();
    sections.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));

    let index = FeedIndex::new(inputs.feeds.iter().cloned(), inputs.mode_rules.iter().cloned());
    let mut resolved_feeds = Vec::new();
    let mut warnings = Vec::new();

    for consumer in &inputs.consumers {
        let Some(feed) = index.resolve(consumer, mode)? else {
            warn!(consumer = %consumer.name, mode = %mode, "Consumer has no active feed, skipped");
            warnings.push(CalcWarning::ConsumerWithoutFeed {
                consumer_id: consumer.id,
                name: consumer.name.clone(),
                mode,
            });
            continue;
        };

        let load = consumer_load(consumer, &inputs.referenced_calcs)?;
        let target = sections
            .iter_mut()
            .find(|s| s.bus_section_id == feed.bus_section_id)
            .ok_or_else(|| {
                CalcError::state(format!(
                    "Consumer {}: feed points at bus section {} outside the panel",
                    consumer.name, feed.bus_section_id
                ))
            })?;
        target.load += load;
        resolved_feeds.push(feed);
    }

    debug!(
        panel_id = %panel_id,
        mode = %mode,
        sections = sections.len(),
        consumers = resolved_feeds.len(),
        "Sections aggregated"
    );

    Ok(SectionAggregation {
        panel_id,
        mode,
        sections,
        feeds: resolved_feeds,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FeedRoleId, LegacyFeedRole, LoadRowId};
    use crate::error::ErrorKind;

    struct Fixture {
        panel_id: PanelId,
        s1: BusSection,
        s2: BusSection,
        inputs: SectionInputs,
    }

    fn fixture() -> Fixture {
        let panel_id = PanelId::new();
        let s1 = BusSection::new(panel_id, "S1", 1);
        let s2 = BusSection::new(panel_id, "S2", 2);
        let inputs = SectionInputs {
            bus_sections: vec![s2.clone(), s1.clone()],
            ..Default::default()
        };
        Fixture {
            panel_id,
            s1,
            s2,
            inputs,
        }
    }

    fn demand_calc(panel_id: PanelId, pp_kw: f64) -> PanelCalc {
        PanelCalc {
            panel_id,
            sum_pn_kw: pp_kw,
            sum_ki_pn_kw: pp_kw,
            sum_ki_pn_tg_kvar: 0.0,
            sum_n_pn2: pp_kw * pp_kw,
            ne: 1.0,
            ne_tab: 1,
            ki_group: 1.0,
            kr: 1.0,
            pp_kw,
            qp_kvar: 0.5 * pp_kw,
            sp_kva: 1.2 * pp_kw,
            ip_a: 2.0 * pp_kw,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_consumer_lands_on_mode_specific_section() {
        let mut f = fixture();
        let source = PanelId::new();
        let consumer = Consumer::new(f.panel_id, "lift", LoadReference::RtmPanel { panel_id: source });
        f.inputs.feeds = vec![
            Feed::with_role(consumer.id, f.s1.id, FeedRoleId::primary(), 1),
            Feed::with_role(consumer.id, f.s2.id, FeedRoleId::reserve(), 1),
        ];
        f.inputs.consumers = vec![consumer];
        f.inputs.referenced_calcs.insert(source, demand_calc(source, 10.0));

        let normal = aggregate(f.panel_id, Mode::Normal, &f.inputs).unwrap();
        assert_eq!(normal.load_of(f.s1.id).p_kw, 10.0);
        assert!(normal.load_of(f.s2.id).is_zero());

        let emergency = aggregate(f.panel_id, Mode::Emergency, &f.inputs).unwrap();
        assert!(emergency.load_of(f.s1.id).is_zero());
        assert_eq!(emergency.load_of(f.s2.id).p_kw, 10.0);
        assert_eq!(emergency.load_of(f.s2.id).i_a, 20.0);
    }

    #[test]
    fn test_sections_ordered_and_complete() {
        let f = fixture();
        let result = aggregate(f.panel_id, Mode::Normal, &f.inputs).unwrap();
        let names: Vec<&str> = result.sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["S1", "S2"]);
        assert!(result.sections.iter().all(|s| s.load.is_zero()));
        assert_eq!(result.to_calcs(Utc::now()).len(), 2);
    }

    #[test]
    fn test_manual_loads_accumulate() {
        let mut f = fixture();
        let a = Consumer::new(f.panel_id, "a", LoadReference::Manual(ManualLoad::new(1.0, 0.5, 1.2, 2.0)));
        let b = Consumer::new(f.panel_id, "b", LoadReference::Manual(ManualLoad::new(2.0, 1.0, 2.4, 4.0)));
        f.inputs.feeds = vec![
            Feed::legacy(a.id, f.s1.id, LegacyFeedRole::Normal),
            Feed::legacy(b.id, f.s1.id, LegacyFeedRole::Normal),
        ];
        f.inputs.consumers = vec![a, b];

        let result = aggregate(f.panel_id, Mode::Normal, &f.inputs).unwrap();
        let load = result.load_of(f.s1.id);
        assert!((load.p_kw - 3.0).abs() < 1e-12);
        assert!((load.i_a - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_feed_warns_and_skips() {
        let mut f = fixture();
        let consumer = Consumer::new(f.panel_id, "orphan", LoadReference::Manual(ManualLoad::new(1.0, 0.0, 1.0, 1.0)));
        f.inputs.feeds = vec![Feed::legacy(consumer.id, f.s1.id, LegacyFeedRole::Normal)];
        f.inputs.consumers = vec![consumer];

        let result = aggregate(f.panel_id, Mode::Emergency, &f.inputs).unwrap();
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].reason(), "CONSUMER_WITHOUT_FEED");
        assert!(result.sections.iter().all(|s| s.load.is_zero()));
    }

    #[test]
    fn test_missing_source_calc_is_state_error() {
        let mut f = fixture();
        let consumer = Consumer::new(f.panel_id, "lift", LoadReference::RtmPanel { panel_id: PanelId::new() });
        f.inputs.feeds = vec![Feed::with_role(consumer.id, f.s1.id, FeedRoleId::primary(), 1)];
        f.inputs.consumers = vec![consumer];

        let err = aggregate(f.panel_id, Mode::Normal, &f.inputs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateError);
    }

    #[test]
    fn test_incomplete_manual_load_rejected() {
        let mut f = fixture();
        let mut manual = ManualLoad::new(1.0, 0.0, 1.0, 1.0);
        manual.i_a = None;
        let consumer = Consumer::new(f.panel_id, "half", LoadReference::Manual(manual));
        f.inputs.feeds = vec![Feed::with_role(consumer.id, f.s1.id, FeedRoleId::primary(), 1)];
        f.inputs.consumers = vec![consumer];

        let err = aggregate(f.panel_id, Mode::Normal, &f.inputs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[test]
    fn test_row_reference_unsupported() {
        let mut f = fixture();
        let consumer = Consumer::new(f.panel_id, "row", LoadReference::RtmRow { row_id: LoadRowId::new() });
        f.inputs.feeds = vec![Feed::with_role(consumer.id, f.s1.id, FeedRoleId::primary(), 1)];
        f.inputs.consumers = vec![consumer];

        let err = aggregate(f.panel_id, Mode::Normal, &f.inputs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedError);
    }

    #[test]
    fn test_feed_outside_panel_is_state_error() {
        let mut f = fixture();
        let consumer = Consumer::new(f.panel_id, "stray", LoadReference::Manual(ManualLoad::new(1.0, 0.0, 1.0, 1.0)));
        f.inputs.feeds = vec![Feed::with_role(consumer.id, BusSectionId::new(), FeedRoleId::primary(), 1)];
        f.inputs.consumers = vec![consumer];

        let err = aggregate(f.panel_id, Mode::Normal, &f.inputs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateError);
    }
}
