//! End-to-end runs of the calculation engine over the in-memory store.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use switchboard_calc::domain::{
    BusSection, CableCatalog, Circuit, Consumer, Feed, FeedRoleId, LoadKind, LoadReference, LoadRow, ManualLoad,
    Mode, Panel, Phase, SelectionMethod, Subsystem, TouchScope,
};
use switchboard_calc::engine::Clock;
use switchboard_calc::repo::MemoryStore;
use switchboard_calc::staleness::{CalcStatus, ChangeMonitor, UnknownReason};
use switchboard_calc::{CalcEngine, CalcWarning, ErrorKind};

fn clock_at(hour: u32) -> Clock {
    Arc::new(move || Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap())
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

fn seeded_panel(store: &MemoryStore) -> Panel {
    let panel = Panel::new("ShP-1");
    store.insert_panel(panel.clone());
    panel
}

#[tokio::test]
async fn test_demand_matches_hand_calculation() {
    let store = MemoryStore::new();
    let panel = seeded_panel(&store);
    store.insert_load_row(LoadRow::new(panel.id, "Sockets A", 2, 1.0, 0.725));
    store.insert_load_row(LoadRow::new(panel.id, "Sockets B", 2, 1.0, 0.750));

    let engine = CalcEngine::new(store.clone()).with_clock(clock_at(9));
    let outcome = engine.compute_demand(panel.id).await.unwrap();
    let calc = &outcome.panel;

    assert!(approx(calc.sum_pn_kw, 4.0));
    assert!(approx(calc.ne, 4.0));
    assert_eq!(calc.ne_tab, 4);
    assert!(approx(calc.ki_group, 0.7375));
    // between 0.70 -> 1.06 and 0.80 -> 1.00 on the ne = 4 row
    assert!(approx(calc.kr, 1.0375));
    assert!(approx(calc.pp_kw, 1.0375 * 2.95));
    assert!(approx(calc.qp_kvar, 0.0));
    assert!(approx(calc.sp_kva, calc.pp_kw));
    assert!(approx(calc.ip_a, calc.sp_kva * 1000.0 / (3f64.sqrt() * 400.0)));
    assert!(outcome.warnings.is_empty());

    assert_eq!(store.stored_panel_calc(panel.id).as_ref(), Some(calc));
    for row in &outcome.rows {
        assert_eq!(store.stored_row_calc(row.row_id).as_ref(), Some(row));
    }
}

#[tokio::test]
async fn test_demand_rerun_is_idempotent() {
    let store = MemoryStore::new();
    let panel = seeded_panel(&store);
    store.insert_load_row(LoadRow::new(panel.id, "Pumps", 3, 7.5, 0.6));
    let engine = CalcEngine::new(store.clone()).with_clock(clock_at(9));

    let first = engine.compute_demand(panel.id).await.unwrap();
    let version = engine.data_version().await.unwrap();
    let second = engine.compute_demand(panel.id).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(store.stored_panel_calc(panel.id), Some(second.panel));
    assert!(engine.data_version().await.unwrap() > version);
}

#[tokio::test]
async fn test_clamped_load_factor_reports_warning() {
    let store = MemoryStore::new();
    let panel = seeded_panel(&store);
    store.insert_load_row(LoadRow::new(panel.id, "Heaters", 4, 2.0, 0.95));
    let engine = CalcEngine::new(store);

    let outcome = engine.compute_demand(panel.id).await.unwrap();
    assert!(matches!(
        outcome.warnings.as_slice(),
        [CalcWarning::LoadFactorClamped { ki_clamped, .. }] if approx(*ki_clamped, 0.80)
    ));
}

#[tokio::test]
async fn test_phase_rerun_clears_fixed_manual_warning() {
    let store = MemoryStore::new();
    let panel = seeded_panel(&store);
    let manual = Circuit::new(panel.id, "Gr-1", 1, 10.0);
    let big = Circuit::new(panel.id, "Gr-2", 1, 6.0);
    let small = Circuit::new(panel.id, "Gr-3", 1, 4.0);
    for circuit in [&manual, &big, &small] {
        store.insert_circuit(circuit.clone());
    }
    store.pin_circuit_phase(manual.id, Some("L4"));
    let engine = CalcEngine::new(store.clone());

    let first = engine.balance_phases(panel.id, Mode::Normal).await.unwrap();
    assert_eq!(first.balance.invalid_manual_count, 1);
    assert_eq!(first.balance.warnings.len(), 1);
    assert_eq!(first.balance.warnings[0].circuit_id(), Some(manual.id));
    assert_eq!(store.circuit(big.id).unwrap().phase.as_deref(), Some("L1"));
    assert_eq!(store.circuit(small.id).unwrap().phase.as_deref(), Some("L2"));
    // the invalid label is left as entered
    assert_eq!(store.circuit(manual.id).unwrap().phase.as_deref(), Some("L4"));

    store.pin_circuit_phase(manual.id, Some("L2"));
    let second = engine.balance_phases(panel.id, Mode::Normal).await.unwrap();
    assert_eq!(second.balance.invalid_manual_count, 0);
    assert!(second.balance.warnings.is_empty());
    assert!(approx(second.balance.totals.get(Phase::L1), 6.0));
    assert!(approx(second.balance.totals.get(Phase::L2), 10.0));
    assert!(approx(second.balance.totals.get(Phase::L3), 4.0));

    let stored = store.stored_phase_balance(panel.id, Mode::Normal).unwrap();
    assert!(stored.warnings.is_empty());
    assert!(store.stored_phase_balance(panel.id, Mode::Emergency).is_none());
}

struct TwoSectionPanel {
    store: MemoryStore,
    panel: Panel,
    s1: BusSection,
    s2: BusSection,
}

/// One consumer fed from S1 normally and from S2 in emergency
fn two_section_panel() -> TwoSectionPanel {
    let store = MemoryStore::new();
    let panel = seeded_panel(&store);
    let s1 = BusSection::new(panel.id, "S1", 1);
    let s2 = BusSection::new(panel.id, "S2", 2);
    store.insert_bus_section(s1.clone());
    store.insert_bus_section(s2.clone());

    let consumer = Consumer::new(
        panel.id,
        "Fire pump",
        LoadReference::Manual(ManualLoad::new(15.0, 5.0, 15.8, 24.0)),
    );
    store.insert_consumer(consumer.clone());
    store.insert_feed(Feed::with_role(consumer.id, s1.id, FeedRoleId::primary(), 0));
    store.insert_feed(Feed::with_role(consumer.id, s2.id, FeedRoleId::reserve(), 0));

    TwoSectionPanel { store, panel, s1, s2 }
}

#[tokio::test]
async fn test_section_results_are_kept_per_mode() {
    let TwoSectionPanel { store, panel, s1, s2 } = two_section_panel();
    let engine = CalcEngine::new(store.clone());

    let normal = engine.aggregate_sections(panel.id, Mode::Normal, true).await.unwrap();
    let emergency = engine.aggregate_sections(panel.id, Mode::Emergency, true).await.unwrap();

    assert!(approx(normal.load_of(s1.id).p_kw, 15.0));
    assert!(normal.load_of(s2.id).is_zero());
    assert!(emergency.load_of(s1.id).is_zero());
    assert!(approx(emergency.load_of(s2.id).p_kw, 15.0));

    let stored_normal = store.stored_section_calcs(panel.id, Mode::Normal);
    let stored_emergency = store.stored_section_calcs(panel.id, Mode::Emergency);
    assert_eq!(stored_normal.len(), 2);
    assert_eq!(stored_emergency.len(), 2);
    assert!(stored_normal.iter().all(|c| c.mode == Mode::Normal));
    assert!(stored_emergency.iter().all(|c| c.mode == Mode::Emergency));
}

#[tokio::test]
async fn test_preview_aggregation_writes_nothing() {
    let TwoSectionPanel { store, panel, .. } = two_section_panel();
    let engine = CalcEngine::new(store.clone());
    let version = engine.data_version().await.unwrap();

    let preview = engine.aggregate_sections(panel.id, Mode::Normal, false).await.unwrap();
    assert_eq!(preview.sections.len(), 2);
    assert!(store.stored_section_calcs(panel.id, Mode::Normal).is_empty());
    assert_eq!(engine.data_version().await.unwrap(), version);
}

#[tokio::test]
async fn test_emergency_balance_uses_live_sections() {
    let TwoSectionPanel { store, panel, s1, s2 } = two_section_panel();
    let mut on_s1 = Circuit::new(panel.id, "Gr-1", 1, 8.0);
    on_s1.bus_section_id = Some(s1.id);
    let mut on_s2 = Circuit::new(panel.id, "Gr-2", 1, 5.0);
    on_s2.bus_section_id = Some(s2.id);
    store.insert_circuit(on_s1.clone());
    store.insert_circuit(on_s2.clone());
    let engine = CalcEngine::new(store.clone());

    // before emergency sections exist every circuit is balanced
    let unfiltered = engine.balance_phases(panel.id, Mode::Emergency).await.unwrap();
    assert_eq!(unfiltered.circuits_considered, 2);
    assert!(matches!(
        unfiltered.balance.warnings.as_slice(),
        [CalcWarning::EmergencySectionsNotComputed { .. }]
    ));

    engine.aggregate_sections(panel.id, Mode::Emergency, true).await.unwrap();
    let filtered = engine.balance_phases(panel.id, Mode::Emergency).await.unwrap();
    assert_eq!(filtered.circuits_considered, 1);
    assert_eq!(filtered.assignments.len(), 1);
    assert_eq!(filtered.assignments[0].circuit_id, on_s2.id);
    assert!(approx(filtered.balance.totals.get(Phase::L1), 5.0));
    assert!(filtered.balance.warnings.is_empty());
}

#[tokio::test]
async fn test_panel_drops_roll_back_on_bad_circuit() {
    let store = MemoryStore::new();
    let panel = seeded_panel(&store);
    let mut good = Circuit::new(panel.id, "A-lighting", 1, 10.0);
    good.length_m = 20.0;
    good.load_kind = LoadKind::Lighting;
    let mut bad = Circuit::new(panel.id, "B-socket", 1, 16.0);
    bad.current_a = None;
    store.insert_circuit(good.clone());
    store.insert_circuit(bad.clone());
    let engine = CalcEngine::new(store.clone());

    let err = engine.compute_panel_drops(panel.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert!(store.stored_circuit_calc(good.id).is_none());

    // the single-circuit entry point still works for the valid one
    let drop = engine.compute_circuit_drop(good.id).await.unwrap();
    // 2 * 0.0225 * 20 / 1.5 * 10 = 6.0 V on 230 V is under the 3 % lighting limit
    assert!(approx(drop.calc.s_mm2_selected, 1.5));
    assert!(approx(drop.calc.du_v, 6.0));
    assert_eq!(drop.calc.method, SelectionMethod::Standard);
    assert_eq!(store.stored_circuit_calc(good.id), Some(drop.calc));
}

#[tokio::test]
async fn test_undersized_catalog_falls_back_to_largest() {
    let store = MemoryStore::new();
    let panel = seeded_panel(&store);
    let mut long_run = Circuit::new(panel.id, "Feeder", 1, 60.0);
    long_run.length_m = 150.0;
    store.insert_circuit(long_run.clone());
    store.set_cable_catalog(CableCatalog::new([1.5, 2.5]).unwrap());
    let engine = CalcEngine::new(store);

    let drops = engine.compute_panel_drops(panel.id).await.unwrap();
    assert_eq!(drops.processed, 1);
    let drop = &drops.circuits[0];
    assert_eq!(drop.calc.method, SelectionMethod::MaxSectionFallback);
    assert!(approx(drop.calc.s_mm2_selected, 2.5));
    // 5 % plus the long-run allowance for 50 m beyond 100 m
    assert!(approx(drop.calc.du_limit_pct, 5.25));
    assert!(matches!(drop.warning, Some(CalcWarning::MaxSectionFallback { .. })));
}

#[tokio::test]
async fn test_catalog_edit_makes_voltage_drop_stale() {
    let store = MemoryStore::new();
    let panel = seeded_panel(&store);
    store.insert_circuit(Circuit::new(panel.id, "Gr-1", 1, 10.0));
    let engine = CalcEngine::new(store.clone()).with_clock(clock_at(12));

    engine.compute_panel_drops(panel.id).await.unwrap();
    store.touch_input(TouchScope::Panel(panel.id), Subsystem::VoltageDrop, "2024-03-01 11:00:00");
    let status = engine
        .status(panel.id, Subsystem::VoltageDrop, Mode::Normal, false)
        .await
        .unwrap();
    assert_eq!(status.code, CalcStatus::Ok);

    store.touch_input(TouchScope::Global, Subsystem::VoltageDrop, "2024-03-01 13:00:00");
    let status = engine
        .status(panel.id, Subsystem::VoltageDrop, Mode::Normal, false)
        .await
        .unwrap();
    assert_eq!(status.code, CalcStatus::Stale);
    assert_eq!(status.effective_input_at.as_deref(), Some("2024-03-01 13:00:00"));
}

#[tokio::test]
async fn test_sections_stale_after_upstream_demand_rerun() {
    let store = MemoryStore::new();
    let panel = seeded_panel(&store);
    let section = BusSection::new(panel.id, "S1", 1);
    store.insert_bus_section(section.clone());

    let upstream = Panel::new("ShR-2");
    store.insert_panel(upstream.clone());
    store.insert_load_row(LoadRow::new(upstream.id, "Lighting", 10, 0.1, 0.8));
    let consumer = Consumer::new(
        panel.id,
        "ShR-2 feeder",
        LoadReference::RtmPanel { panel_id: upstream.id },
    );
    store.insert_consumer(consumer.clone());
    store.insert_feed(Feed::with_role(consumer.id, section.id, FeedRoleId::primary(), 0));
    store.touch_input(TouchScope::Panel(panel.id), Subsystem::Sections, "2024-03-01 08:00:00");

    let early = CalcEngine::new(store.clone()).with_clock(clock_at(9));
    early.compute_demand(upstream.id).await.unwrap();
    let aggregation = early.aggregate_sections(panel.id, Mode::Normal, true).await.unwrap();
    let upstream_calc = store.stored_panel_calc(upstream.id).unwrap();
    assert!(approx(aggregation.load_of(section.id).p_kw, upstream_calc.pp_kw));

    let status = early.status(panel.id, Subsystem::Sections, Mode::Normal, false).await.unwrap();
    assert_eq!(status.code, CalcStatus::Ok);

    let later = CalcEngine::new(store.clone()).with_clock(clock_at(10));
    later.compute_demand(upstream.id).await.unwrap();
    let status = later.status(panel.id, Subsystem::Sections, Mode::Normal, false).await.unwrap();
    assert_eq!(status.code, CalcStatus::Stale);
}

#[tokio::test]
async fn test_external_write_turns_statuses_unknown() {
    let store = MemoryStore::new();
    let panel = seeded_panel(&store);
    store.insert_load_row(LoadRow::new(panel.id, "Row", 2, 3.0, 0.5));
    store.touch_input(TouchScope::Panel(panel.id), Subsystem::Demand, "2024-03-01 08:00:00");
    let engine = CalcEngine::new(store.clone()).with_clock(clock_at(9));
    let mut monitor = ChangeMonitor::new();

    engine.compute_demand(panel.id).await.unwrap();
    monitor.record_own_write(engine.data_version().await.unwrap());

    let statuses = engine.panel_statuses(panel.id, Mode::Normal, &monitor).await.unwrap();
    assert_eq!(statuses[&Subsystem::Demand].code, CalcStatus::Ok);
    // no single-phase circuits
    assert_eq!(statuses[&Subsystem::Phase].code, CalcStatus::Hidden);

    store.insert_load_row(LoadRow::new(panel.id, "Added elsewhere", 1, 1.0, 0.5));
    let statuses = engine.panel_statuses(panel.id, Mode::Normal, &monitor).await.unwrap();
    let demand = &statuses[&Subsystem::Demand];
    // two rows now, only one row result stored
    assert_eq!(demand.code, CalcStatus::NoCalc);

    engine.compute_demand(panel.id).await.unwrap();
    let statuses = engine.panel_statuses(panel.id, Mode::Normal, &monitor).await.unwrap();
    let demand = &statuses[&Subsystem::Demand];
    assert_eq!(demand.code, CalcStatus::Unknown);
    assert_eq!(demand.reason, Some(UnknownReason::ExternalChange));

    monitor.record_own_write(engine.data_version().await.unwrap());
    let statuses = engine.panel_statuses(panel.id, Mode::Normal, &monitor).await.unwrap();
    assert_eq!(statuses[&Subsystem::Demand].code, CalcStatus::Ok);
}

#[tokio::test]
async fn test_missing_touch_log_reports_unknown() {
    let store = MemoryStore::new();
    let panel = seeded_panel(&store);
    store.insert_load_row(LoadRow::new(panel.id, "Row", 2, 3.0, 0.5));
    store.disable_touch_log();
    let engine = CalcEngine::new(store);

    engine.compute_demand(panel.id).await.unwrap();
    let status = engine.status(panel.id, Subsystem::Demand, Mode::Normal, false).await.unwrap();
    assert_eq!(status.code, CalcStatus::Unknown);
    assert_eq!(status.reason, Some(UnknownReason::NoInputLog));
}
